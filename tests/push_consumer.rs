// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{FakeQueue, RecordingSink, Settled, TestHandler};
use queue_interop::{
    dispatcher::{run_all, PushConsumer},
    errors::MessagingError,
    pipeline::Pipeline,
    tag::StaticTag,
    tick::ConsumerStoppedReason,
};
use std::{sync::Arc, time::Duration};

#[tokio::test(start_paused = true)]
async fn processes_deliveries_until_stopped() {
    let queue = Arc::new(FakeQueue::with_messages("orders", 3));
    let sink = Arc::new(RecordingSink::default());
    let handler = TestHandler {
        failing: vec![2],
        ..TestHandler::default()
    };

    let consumer = PushConsumer::new(queue.clone(), Pipeline::acknowledging(Arc::new(handler)))
        .sink(sink.clone())
        .tags(Arc::new(StaticTag::new("orders-push")));

    let stop = consumer.stop_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });

    let stopped = consumer.run().await.unwrap();

    assert_eq!(stopped.reason, ConsumerStoppedReason::ByUser);
    assert_eq!(stopped.consumer_tag, "orders-push");
    assert_eq!(
        queue.acker.calls(),
        vec![Settled::Ack(1), Settled::Nack(2, true), Settled::Ack(3)]
    );
    assert_eq!(*queue.cancelled.lock().unwrap(), vec!["orders-push"]);
    assert_eq!(sink.processed(), 2);
    assert_eq!(sink.stopped(), 1);
}

#[tokio::test]
async fn closed_delivery_stream_stops_with_error() {
    let mut queue = FakeQueue::with_messages("orders", 1);
    queue.close_stream = true;
    let queue = Arc::new(queue);
    let sink = Arc::new(RecordingSink::default());

    let consumer = PushConsumer::new(
        queue.clone(),
        Pipeline::acknowledging(Arc::new(TestHandler::default())),
    )
    .sink(sink.clone());
    let err = consumer.run().await.unwrap_err();

    assert!(matches!(err, MessagingError::TransportError(_)));
    assert_eq!(queue.acker.acked(), 1);
    assert_eq!(sink.stopped(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_all_waits_for_every_consumer() {
    let queues = [
        Arc::new(FakeQueue::with_messages("orders", 2)),
        Arc::new(FakeQueue::with_messages("invoices", 1)),
    ];

    let consumers: Vec<_> = queues
        .iter()
        .map(|queue| {
            Arc::new(
                PushConsumer::new(
                    queue.clone(),
                    Pipeline::acknowledging(Arc::new(TestHandler::default())),
                )
                .sink(Arc::new(RecordingSink::default())),
            )
        })
        .collect();

    let tokens: Vec<_> = consumers.iter().map(|c| c.stop_token()).collect();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for token in tokens {
            token.cancel();
        }
    });

    let stopped = run_all(consumers).await.unwrap();

    assert_eq!(stopped.len(), 2);
    assert!(stopped
        .iter()
        .all(|s| s.reason == ConsumerStoppedReason::ByUser));
    assert_eq!(stopped[0].queue, "orders");
    assert_eq!(queues[0].acker.acked(), 2);
    assert_eq!(queues[1].acker.acked(), 1);
}
