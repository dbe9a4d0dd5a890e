use crate::{acker::Acker, types::ShortString, BasicProperties};
use amq_protocol::{
    frame::{AMQPContentHeader, AMQPFrame},
    protocol::AMQPClass,
};

/// A message pushed by the broker through `basic.deliver`.
///
/// The payload is `data`, the typed AMQP properties are `properties`, and
/// `acker` settles the message (`ack`/`nack`/`reject`) by its delivery-tag.
/// Messages left unacked when their channel closes are redelivered by the
/// broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Acker,
}

/// The answer to a successful `basic.get`.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicGetMessage {
    pub delivery: Delivery,
    /// Number of messages still sitting in the queue.
    pub message_count: u32,
}

/// A mandatory or immediate publish the broker could not route.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicReturnMessage {
    pub reply_code: u16,
    pub reply_text: ShortString,
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Frames an outbound content-bearing method.
///
/// The body is split at `frame_max - 8`, the per-frame overhead of type,
/// channel, size and frame-end.
pub(crate) fn content_frames(
    channel_id: u16,
    method: AMQPClass,
    payload: &[u8],
    frame_max: u32,
    properties: BasicProperties,
) -> Vec<AMQPFrame> {
    let class_id = method.get_amqp_class_id();
    let chunk_size = frame_max.saturating_sub(8).max(1) as usize;
    let mut frames = Vec::with_capacity(2 + payload.len() / chunk_size);
    frames.push(AMQPFrame::Method(channel_id, method));
    frames.push(AMQPFrame::Header(
        channel_id,
        class_id,
        Box::new(AMQPContentHeader {
            class_id,
            body_size: payload.len() as u64,
            properties,
        }),
    ));
    frames.extend(
        payload
            .chunks(chunk_size)
            .map(|chunk| AMQPFrame::Body(channel_id, chunk.into())),
    );
    frames
}
