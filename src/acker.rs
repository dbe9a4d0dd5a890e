use crate::{
    channel_status::ChannelStatus,
    frames::Frames,
    io_loop::IoWaker,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    Result,
};
use amq_protocol::{
    frame::AMQPFrame,
    protocol::{basic, AMQPClass},
};
use std::fmt;

/// Acknowledges one received message.
///
/// Carried by every [`Delivery`](crate::message::Delivery) so a message can
/// be settled without holding on to its [`Channel`](crate::Channel).
#[derive(Clone, Default)]
pub struct Acker {
    channel_id: u16,
    delivery_tag: u64,
    frames: Frames,
    waker: IoWaker,
    status: ChannelStatus,
}

impl Acker {
    pub(crate) fn new(
        channel_id: u16,
        delivery_tag: u64,
        frames: Frames,
        waker: IoWaker,
        status: ChannelStatus,
    ) -> Self {
        Self {
            channel_id,
            delivery_tag,
            frames,
            waker,
            status,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn ack(&self, options: BasicAckOptions) -> Result<()> {
        self.send(AMQPClass::Basic(basic::AMQPMethod::Ack(basic::Ack {
            delivery_tag: self.delivery_tag,
            multiple: options.multiple,
        })))
    }

    pub fn nack(&self, options: BasicNackOptions) -> Result<()> {
        self.send(AMQPClass::Basic(basic::AMQPMethod::Nack(basic::Nack {
            delivery_tag: self.delivery_tag,
            multiple: options.multiple,
            requeue: options.requeue,
        })))
    }

    pub fn reject(&self, options: BasicRejectOptions) -> Result<()> {
        self.send(AMQPClass::Basic(basic::AMQPMethod::Reject(basic::Reject {
            delivery_tag: self.delivery_tag,
            requeue: options.requeue,
        })))
    }

    fn send(&self, method: AMQPClass) -> Result<()> {
        self.status.check_open()?;
        self.frames.push(AMQPFrame::Method(self.channel_id, method));
        self.waker.wake()
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("channel_id", &self.channel_id)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

impl PartialEq for Acker {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id && self.delivery_tag == other.delivery_tag
    }
}
