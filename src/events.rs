// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Lifecycle Events
//!
//! Consumers report what they do to an injected [`EventSink`]. Notification is
//! fire-and-forget: a sink error is logged by the caller and never changes the
//! control flow of the consumer.

use crate::{errors::MessagingError, tick::ConsumerStopped};
use tracing::{debug, error, info, warn};

/// How the pipeline dealt with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The pipeline succeeded
    Processed,
    /// The handler failed and the message was rejected
    Failed { error: String, requeued: bool },
}

/// A lifecycle event emitted by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Started {
        queue: String,
        consumer_tag: String,
    },
    Tick {
        queue: String,
        consumer_tag: String,
    },
    MessageProcessed {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
        message_id: Option<String>,
        outcome: MessageOutcome,
    },
    Stopped(ConsumerStopped),
}

/// Receives consumer lifecycle events.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &ConsumerEvent) -> Result<(), MessagingError>;
}

/// Delivers `event`, logging a sink failure instead of returning it.
pub(crate) fn emit(sink: &dyn EventSink, event: ConsumerEvent) {
    if let Err(err) = sink.notify(&event) {
        error!(error = err.to_string(), "failure to notify consumer event");
    }
}

/// Discards every event.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn notify(&self, _: &ConsumerEvent) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// Forwards events to `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: &ConsumerEvent) -> Result<(), MessagingError> {
        match event {
            ConsumerEvent::Started {
                queue,
                consumer_tag,
            } => info!(queue = queue, consumer_tag = consumer_tag, "consumer started"),
            ConsumerEvent::Tick {
                queue,
                consumer_tag,
            } => debug!(queue = queue, consumer_tag = consumer_tag, "consumer tick"),
            ConsumerEvent::MessageProcessed {
                delivery_tag,
                outcome: MessageOutcome::Processed,
                ..
            } => debug!(delivery_tag = delivery_tag, "message processed"),
            ConsumerEvent::MessageProcessed {
                delivery_tag,
                outcome: MessageOutcome::Failed { error, requeued },
                ..
            } => warn!(
                delivery_tag = delivery_tag,
                error = error,
                requeued = requeued,
                "message failed"
            ),
            ConsumerEvent::Stopped(stopped) => info!(
                queue = stopped.queue,
                consumer_tag = stopped.consumer_tag,
                reason = %stopped.reason,
                "consumer stopped"
            ),
        }

        Ok(())
    }
}
