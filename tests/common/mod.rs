// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use queue_interop::{
    errors::MessagingError,
    events::{ConsumerEvent, EventSink, MessageOutcome},
    message::{Acknowledger, DeliveryInfo, Message, ReceivedMessage},
    pipeline::Handler,
    queue::{DeliveryStream, Queue},
    spool::MemoryProbe,
    tick::{ConsumerStoppedReason, TickDecision, TickStrategy},
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Ack(u64),
    Nack(u64, bool),
}

#[derive(Default)]
pub struct RecordingAcker {
    pub calls: Mutex<Vec<Settled>>,
}

impl RecordingAcker {
    pub fn calls(&self) -> Vec<Settled> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acked(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Settled::Ack(_)))
            .count()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.calls.lock().unwrap().push(Settled::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.calls
            .lock()
            .unwrap()
            .push(Settled::Nack(delivery_tag, requeue));
        Ok(())
    }
}

/// In-memory queue handing out numbered messages.
pub struct FakeQueue {
    name: String,
    pending: Mutex<VecDeque<ReceivedMessage>>,
    next_tag: AtomicUsize,
    pub acker: Arc<RecordingAcker>,
    pub get_delay: Option<Duration>,
    pub broken: bool,
    pub close_stream: bool,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakeQueue {
    pub fn new(name: &str) -> FakeQueue {
        FakeQueue {
            name: name.to_owned(),
            pending: Mutex::new(VecDeque::new()),
            next_tag: AtomicUsize::new(1),
            acker: Arc::new(RecordingAcker::default()),
            get_delay: None,
            broken: false,
            close_stream: false,
            cancelled: Mutex::new(vec![]),
        }
    }

    pub fn with_messages(name: &str, count: usize) -> FakeQueue {
        let queue = FakeQueue::new(name);
        queue.push(count);
        queue
    }

    pub fn push(&self, count: usize) {
        let mut pending = self.pending.lock().unwrap();
        for _ in 0..count {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) as u64;
            let info = DeliveryInfo {
                delivery_tag: tag,
                exchange: "events".to_owned(),
                routing_key: self.name.clone(),
                redelivered: false,
            };
            pending.push_back(ReceivedMessage::new(
                Message::new(format!("message {tag}")),
                info,
                self.acker.clone(),
            ));
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait]
impl Queue for FakeQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<ReceivedMessage>, MessagingError> {
        if self.broken {
            return Err(MessagingError::TransportError("channel closed".to_owned()));
        }
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self.pending.lock().unwrap().pop_front())
    }

    async fn count_messages(&self) -> Result<u32, MessagingError> {
        Ok(self.remaining() as u32)
    }

    async fn purge(&self) -> Result<u32, MessagingError> {
        let purged: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for msg in &purged {
            msg.nack(false).await?;
        }
        Ok(purged.len() as u32)
    }

    async fn consume(&self, _: &str) -> Result<DeliveryStream, MessagingError> {
        let messages: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        let delivered = stream::iter(messages.into_iter().map(Ok));

        if self.close_stream {
            Ok(delivered.boxed())
        } else {
            Ok(delivered.chain(stream::pending()).boxed())
        }
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.cancelled.lock().unwrap().push(consumer_tag.to_owned());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ConsumerEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ConsumerEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    pub fn stopped(&self) -> usize {
        self.count(|event| matches!(event, ConsumerEvent::Stopped(_)))
    }

    pub fn processed(&self) -> usize {
        self.count(|event| {
            matches!(
                event,
                ConsumerEvent::MessageProcessed {
                    outcome: MessageOutcome::Processed,
                    ..
                }
            )
        })
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: &ConsumerEvent) -> Result<(), MessagingError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Counts ticks and asks the loop to stop once `stop_at` ticks happened.
pub struct StopAfterTicks {
    pub ticks: AtomicUsize,
    stop_at: Option<usize>,
    reason: ConsumerStoppedReason,
    queue: Option<Arc<FakeQueue>>,
    pub remaining_at_tick: Mutex<Vec<usize>>,
}

impl StopAfterTicks {
    pub fn never() -> StopAfterTicks {
        StopAfterTicks {
            ticks: AtomicUsize::new(0),
            stop_at: None,
            reason: ConsumerStoppedReason::ByUser,
            queue: None,
            remaining_at_tick: Mutex::new(vec![]),
        }
    }

    pub fn at(ticks: usize) -> StopAfterTicks {
        StopAfterTicks {
            stop_at: Some(ticks),
            ..StopAfterTicks::never()
        }
    }

    pub fn watching(mut self, queue: Arc<FakeQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn count(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TickStrategy for StopAfterTicks {
    async fn tick(&self, _: &str, _: &str) -> TickDecision {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(queue) = &self.queue {
            self.remaining_at_tick.lock().unwrap().push(queue.remaining());
        }

        match self.stop_at {
            Some(stop_at) if ticks >= stop_at => TickDecision::Stop(self.reason),
            _ => TickDecision::Continue,
        }
    }
}

/// Succeeds, except for the delivery tags listed in `failing`.
#[derive(Default)]
pub struct TestHandler {
    pub failing: Vec<u64>,
    pub handled: AtomicUsize,
}

#[async_trait]
impl Handler<ReceivedMessage> for TestHandler {
    async fn handle(&self, msg: &ReceivedMessage) -> Result<(), MessagingError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&msg.delivery_tag()) {
            return Err(MessagingError::HandlerError(format!(
                "cannot handle {}",
                msg.delivery_tag()
            )));
        }
        Ok(())
    }
}

pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn resident_bytes(&self) -> u64 {
        self.0
    }
}
