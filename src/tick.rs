// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tick Strategies and Stop Reasons
//!
//! A tick is one iteration of a consumer loop, whether or not it received
//! messages. The [`TickStrategy`] runs once per tick and may ask the loop to
//! stop. [`ConsumerStoppedReason`] is the closed set of reasons a loop ends.

use crate::events::{emit, ConsumerEvent, EventSink};
use async_trait::async_trait;
use std::{fmt, sync::Arc};

/// Why a consumer loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerStoppedReason {
    /// A stop was requested by the caller
    ByUser,
    /// The configured message count was reached
    ByLimitMessages,
    /// The process exceeded the configured memory ceiling
    ByLimitMemory,
    /// The configured wall-clock limit was reached
    ByLimitTime,
    /// A fatal error made the queue or a resource unusable
    ByError,
    /// The broker did not answer a receive in time
    ByTimeoutExceeded,
}

impl fmt::Display for ConsumerStoppedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerStoppedReason::ByUser => "by user",
            ConsumerStoppedReason::ByLimitMessages => "by messages limit",
            ConsumerStoppedReason::ByLimitMemory => "by memory limit",
            ConsumerStoppedReason::ByLimitTime => "by time limit",
            ConsumerStoppedReason::ByError => "by error",
            ConsumerStoppedReason::ByTimeoutExceeded => "by timeout exceeded",
        };
        f.write_str(name)
    }
}

/// What happens after a consumer stopped, in chained scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Hand off to the consumer registered under this key
    Next(String),
    /// These sibling consumers are still active
    Remaining(Vec<String>),
}

/// The single stop event of a consumer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStopped {
    pub queue: String,
    pub consumer_tag: String,
    pub reason: ConsumerStoppedReason,
    pub continuation: Option<Continuation>,
}

/// The outcome of a tick strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Continue,
    Stop(ConsumerStoppedReason),
}

/// Hook invoked once per loop iteration.
#[async_trait]
pub trait TickStrategy: Send + Sync {
    async fn tick(&self, queue: &str, consumer_tag: &str) -> TickDecision;
}

/// Does nothing, the loop keeps going.
pub struct NoopTickStrategy;

#[async_trait]
impl TickStrategy for NoopTickStrategy {
    async fn tick(&self, _: &str, _: &str) -> TickDecision {
        TickDecision::Continue
    }
}

/// Reports every tick to an event sink, for liveness checks.
pub struct NotifyTickStrategy {
    sink: Arc<dyn EventSink>,
}

impl NotifyTickStrategy {
    pub fn new(sink: Arc<dyn EventSink>) -> NotifyTickStrategy {
        NotifyTickStrategy { sink }
    }
}

#[async_trait]
impl TickStrategy for NotifyTickStrategy {
    async fn tick(&self, queue: &str, consumer_tag: &str) -> TickDecision {
        emit(
            self.sink.as_ref(),
            ConsumerEvent::Tick {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.to_owned(),
            },
        );

        TickDecision::Continue
    }
}
