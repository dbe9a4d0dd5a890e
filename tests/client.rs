mod common;

use amq_protocol::protocol::{basic, channel, connection, queue, tx, AMQPClass};
use amq_protocol::types::FieldTable;
use common::{init_logging, MockBroker};
use std::time::Duration;
use warren::{
    options::{BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions},
    BasicProperties, Connection, Error,
};

#[test]
fn handshake_tuning_and_graceful_close() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        broker.expect_channel_open();
        let declare = broker.expect_queue_declare(3);
        assert_eq!(declare.queue, "q3".into());
        assert!(declare.durable);
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    // negotiated down to the server's channel_max
    assert_eq!(connection.configuration().channel_max(), 2047);
    assert_eq!(connection.configuration().frame_max(), 131072);

    let channel = connection.channel().unwrap();
    let queue = channel
        .queue_declare(
            "q3",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .unwrap();
    assert_eq!(queue.name(), "q3");
    assert_eq!(queue.declared_message_count(), 3);

    connection.close(200, "Normal shutdown").unwrap();
    // second close is a no-op
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn publish_with_confirms_acked() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        match broker.expect_method() {
            (_, AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::Select(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::SelectOk(
                        amq_protocol::protocol::confirm::SelectOk {},
                    )),
                );
            }
            (id, method) => panic!("expected confirm.select, got {:?} on {}", method, id),
        }
        let (id, publish, properties, payload) = broker.expect_publish();
        assert_eq!(publish.exchange, "amq.direct".into());
        assert_eq!(publish.routing_key, "k".into());
        assert_eq!(payload, b"hello");
        assert_eq!(properties.content_type(), &Some("text/plain".into()));
        broker.send_ack(id, 1);
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    channel.confirm_select().unwrap();
    let confirmed = channel
        .basic_publish(
            "amq.direct",
            "k",
            BasicPublishOptions::default(),
            b"hello",
            BasicProperties::default().with_content_type("text/plain".into()),
        )
        .unwrap();
    assert!(confirmed);
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn publish_with_confirms_nacked() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        match broker.expect_method() {
            (_, AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::Select(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::SelectOk(
                        amq_protocol::protocol::confirm::SelectOk {},
                    )),
                );
            }
            (id, method) => panic!("expected confirm.select, got {:?} on {}", method, id),
        }
        let (id, _, _, _) = broker.expect_publish();
        broker.send_method(
            id,
            AMQPClass::Basic(basic::AMQPMethod::Nack(basic::Nack {
                delivery_tag: 1,
                multiple: false,
                requeue: false,
            })),
        );
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    channel.confirm_select().unwrap();
    let confirmed = channel
        .basic_publish(
            "amq.direct",
            "k",
            BasicPublishOptions::default(),
            b"hello",
            BasicProperties::default(),
        )
        .unwrap();
    assert!(!confirmed);
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn mandatory_publish_with_no_route_is_returned() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        match broker.expect_method() {
            (_, AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::Select(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Confirm(amq_protocol::protocol::confirm::AMQPMethod::SelectOk(
                        amq_protocol::protocol::confirm::SelectOk {},
                    )),
                );
            }
            (id, method) => panic!("expected confirm.select, got {:?} on {}", method, id),
        }
        let (id, publish, _, payload) = broker.expect_publish();
        assert!(publish.mandatory);
        // the broker returns the message, then still acks the publish
        broker.send_method(
            id,
            AMQPClass::Basic(basic::AMQPMethod::Return(basic::Return {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
                exchange: publish.exchange,
                routing_key: publish.routing_key,
            })),
        );
        broker.send_content(id, &payload, BasicProperties::default());
        broker.send_ack(id, 1);
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    channel.confirm_select().unwrap();
    match channel.basic_publish(
        "amq.direct",
        "nosuch",
        BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        },
        b"hello",
        BasicProperties::default(),
    ) {
        Err(Error::MessageReturned(message)) => {
            assert_eq!(message.reply_code, 312);
            assert_eq!(message.reply_text, "NO_ROUTE".into());
            assert_eq!(message.data, b"hello");
        }
        other => panic!("expected MessageReturned, got {:?}", other),
    }
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn precondition_failed_closes_the_channel_not_the_connection() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let first = broker.expect_channel_open();
        broker.expect_queue_declare(0);
        // second declare with different flags: soft error, channel closed
        match broker.expect_method() {
            (id, AMQPClass::Queue(queue::AMQPMethod::Declare(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Channel(channel::AMQPMethod::Close(channel::Close {
                        reply_code: 406,
                        reply_text: "PRECONDITION_FAILED - inequivalent arg 'durable'".into(),
                        class_id: 50,
                        method_id: 10,
                    })),
                );
            }
            (id, method) => panic!("expected queue.declare, got {:?} on {}", method, id),
        }
        match broker.expect_method() {
            (id, AMQPClass::Channel(channel::AMQPMethod::CloseOk(_))) => assert_eq!(id, first),
            (id, method) => panic!("expected channel.close-ok, got {:?} on {}", method, id),
        }
        broker.expect_channel_open();
        broker.expect_queue_declare(0);
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    channel
        .queue_declare(
            "q2",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .unwrap();
    match channel.queue_declare("q2", QueueDeclareOptions::default(), FieldTable::default()) {
        Err(Error::ChannelClosedByServer(reason)) => {
            assert_eq!(reason.reply_code(), 406);
            assert!(reason.is_soft_error());
        }
        other => panic!("expected a 406 channel close, got {:?}", other.map(|_| ())),
    }
    // the channel is sealed with its close reason
    assert!(matches!(
        channel.queue_purge("q2"),
        Err(Error::ChannelClosedByServer(_))
    ));
    // the connection survives and hands out a fresh channel
    let channel = connection.channel().unwrap();
    channel
        .queue_declare("q2", QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn get_loop_drains_the_queue_in_order() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        broker.expect_queue_declare(3);
        // passive re-declare behind message_count()
        broker.expect_queue_declare(3);
        for tag in 1..=3u64 {
            match broker.expect_method() {
                (_, AMQPClass::Basic(basic::AMQPMethod::Get(get))) => {
                    assert_eq!(get.queue, "q3".into());
                    assert!(!get.no_ack);
                }
                (id, method) => panic!("expected basic.get, got {:?} on {}", method, id),
            }
            broker.send_method(
                id,
                AMQPClass::Basic(basic::AMQPMethod::GetOk(basic::GetOk {
                    delivery_tag: tag,
                    redelivered: false,
                    exchange: "".into(),
                    routing_key: "q3".into(),
                    message_count: 3 - tag as u32,
                })),
            );
            broker.send_content(id, format!("m{}", tag).as_bytes(), BasicProperties::default());
            match broker.expect_method() {
                (_, AMQPClass::Basic(basic::AMQPMethod::Ack(ack))) => {
                    assert_eq!(ack.delivery_tag, tag);
                }
                (id, method) => panic!("expected basic.ack, got {:?} on {}", method, id),
            }
        }
        match broker.expect_method() {
            (_, AMQPClass::Basic(basic::AMQPMethod::Get(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Basic(basic::AMQPMethod::GetEmpty(basic::GetEmpty {})),
                );
            }
            (id, method) => panic!("expected basic.get, got {:?} on {}", method, id),
        }
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    let queue = channel
        .queue_declare("q3", QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();
    assert_eq!(queue.message_count().unwrap(), 3);
    for tag in 1..=3u64 {
        let message = queue.get(BasicGetOptions::default()).unwrap().unwrap();
        assert_eq!(message.delivery.delivery_tag, tag);
        assert_eq!(message.delivery.data, format!("m{}", tag).as_bytes());
        assert_eq!(message.message_count, 3 - tag as u32);
        message.delivery.acker.ack(Default::default()).unwrap();
    }
    assert!(queue.get(BasicGetOptions::default()).unwrap().is_none());
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn transactional_publish_can_roll_back() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        match broker.expect_method() {
            (_, AMQPClass::Tx(tx::AMQPMethod::Select(_))) => {
                broker.send_method(id, AMQPClass::Tx(tx::AMQPMethod::SelectOk(tx::SelectOk {})));
            }
            (id, method) => panic!("expected tx.select, got {:?} on {}", method, id),
        }
        broker.expect_publish();
        match broker.expect_method() {
            (_, AMQPClass::Tx(tx::AMQPMethod::Rollback(_))) => {
                broker.send_method(
                    id,
                    AMQPClass::Tx(tx::AMQPMethod::RollbackOk(tx::RollbackOk {})),
                );
            }
            (id, method) => panic!("expected tx.rollback, got {:?} on {}", method, id),
        }
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    let tx = warren::Tx::select(&channel).unwrap();
    // confirms are refused while the channel is transactional
    assert!(matches!(
        channel.confirm_select(),
        Err(Error::NotSupported(_))
    ));
    // transactional publishes do not block on a confirm
    assert!(channel
        .basic_publish(
            "amq.direct",
            "k",
            BasicPublishOptions::default(),
            b"staged",
            BasicProperties::default(),
        )
        .unwrap());
    tx.rollback().unwrap();
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn broker_cancel_ends_the_consumer_cleanly() {
    init_logging();
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_correlation_id("corr-1".into());
    let script_properties = properties.clone();
    let (uri, broker) = MockBroker::start("?heartbeat=0", move |broker| {
        broker.handshake();
        let id = broker.expect_channel_open();
        match broker.expect_method() {
            (_, AMQPClass::Basic(basic::AMQPMethod::Consume(consume))) => {
                assert_eq!(consume.queue, "q".into());
                assert!(consume.no_ack);
                broker.send_method(
                    id,
                    AMQPClass::Basic(basic::AMQPMethod::ConsumeOk(basic::ConsumeOk {
                        consumer_tag: "ctag-1".into(),
                    })),
                );
            }
            (id, method) => panic!("expected basic.consume, got {:?} on {}", method, id),
        }
        for tag in 1..=2u64 {
            broker.send_method(
                id,
                AMQPClass::Basic(basic::AMQPMethod::Deliver(basic::Deliver {
                    consumer_tag: "ctag-1".into(),
                    delivery_tag: tag,
                    redelivered: false,
                    exchange: "amq.direct".into(),
                    routing_key: "k".into(),
                })),
            );
            broker.send_content(
                id,
                format!("payload-{}", tag).as_bytes(),
                script_properties.clone(),
            );
        }
        broker.send_method(
            id,
            AMQPClass::Basic(basic::AMQPMethod::Cancel(basic::Cancel {
                consumer_tag: "ctag-1".into(),
                nowait: false,
            })),
        );
        match broker.expect_method() {
            (_, AMQPClass::Basic(basic::AMQPMethod::CancelOk(cancel_ok))) => {
                assert_eq!(cancel_ok.consumer_tag, "ctag-1".into());
            }
            (id, method) => panic!("expected basic.cancel-ok, got {:?} on {}", method, id),
        }
        // channel survives the cancel
        broker.expect_queue_declare(0);
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    let consumer = channel
        .basic_consume(
            "q",
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .unwrap();
    assert_eq!(consumer.tag(), &"ctag-1".into());

    let deliveries: Vec<_> = consumer.clone().collect();
    assert_eq!(deliveries.len(), 2);
    for (i, delivery) in deliveries.iter().enumerate() {
        assert_eq!(delivery.delivery_tag, i as u64 + 1);
        assert_eq!(delivery.data, format!("payload-{}", i + 1).as_bytes());
        // round-trip of the typed properties
        assert_eq!(delivery.properties, properties);
    }
    assert!(consumer.is_cancelled());

    channel
        .queue_declare("q4", QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn authentication_failure_surfaces_during_open() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.expect_protocol_header();
        broker.send_method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::Start(connection::Start {
                version_major: 0,
                version_minor: 9,
                server_properties: FieldTable::default(),
                mechanisms: "PLAIN".into(),
                locales: "en_US".into(),
            })),
        );
        let _ = broker.expect_method(); // start-ok
        broker.send_method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::Close(connection::Close {
                reply_code: 403,
                reply_text: "ACCESS_REFUSED - bad credentials".into(),
                class_id: 10,
                method_id: 11,
            })),
        );
        match broker.expect_method() {
            (0, AMQPClass::Connection(connection::AMQPMethod::CloseOk(_))) => {}
            (id, method) => panic!("expected connection.close-ok, got {:?} on {}", method, id),
        }
    });

    match Connection::open(&uri) {
        Err(Error::AuthenticationFailure(reason)) => {
            assert_eq!(reason.reply_code(), 403);
        }
        other => panic!("expected AuthenticationFailure, got {:?}", other.map(|_| ())),
    }
    broker.join().unwrap();
}

#[test]
fn rpc_timeout_leaves_the_channel_usable() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=0", |broker| {
        broker.handshake();
        broker.expect_channel_open();
        // swallow the declare without answering: the client times out
        match broker.expect_method() {
            (_, AMQPClass::Queue(queue::AMQPMethod::Declare(_))) => {}
            (id, method) => panic!("expected queue.declare, got {:?} on {}", method, id),
        }
        broker.expect_clean_shutdown(1);
    });

    let connection = Connection::open(&uri).unwrap();
    let channel = connection.channel().unwrap();
    channel.set_rpc_timeout(Some(Duration::from_millis(50)));
    assert!(matches!(
        channel.queue_declare("q", QueueDeclareOptions::default(), FieldTable::default()),
        Err(Error::RpcTimeout)
    ));
    connection.close(200, "Normal shutdown").unwrap();
    broker.join().unwrap();
}

#[test]
fn heartbeats_are_emitted_and_supervised() {
    init_logging();
    let (uri, broker) = MockBroker::start("?heartbeat=1", |broker| {
        broker.handshake_with_heartbeat(1);
        // the client owes us a heartbeat within the interval; stay silent
        // ourselves so it also gives up on us after two intervals
        loop {
            match broker.read_frame() {
                amq_protocol::frame::AMQPFrame::Heartbeat(_) => break,
                frame => panic!("expected a heartbeat, got {:?}", frame),
            }
        }
    });

    let connection = Connection::open(&uri).unwrap();
    assert!(connection.status().connected());
    // the broker never talks again: after 2 intervals the connection dies
    for _ in 0..100 {
        if !connection.status().connected() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(!connection.status().connected());
    assert!(matches!(
        connection.channel(),
        Err(Error::ConnectionReset(_))
    ));
    broker.join().unwrap();
}
