// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Built-in Middleware
//!
//! Cross-cutting steps shipped with the crate:
//! - [`LoggingMiddleware`]: logs each message and failures
//! - [`DeduplicationMiddleware`]: acks and drops messages already processed
//! - [`TransactionMiddleware`]: wraps the rest of the chain in a transaction
//! - [`OtelMiddleware`]: opens a consumer span per message

use crate::{
    errors::MessagingError,
    message::ReceivedMessage,
    otel,
    pipeline::{Middleware, Next},
    transaction::Transactional,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::{HashSet, VecDeque},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

pub struct LoggingMiddleware;

#[async_trait]
impl Middleware<ReceivedMessage> for LoggingMiddleware {
    async fn handle(
        &self,
        msg: &ReceivedMessage,
        next: Next<'_, ReceivedMessage>,
    ) -> Result<(), MessagingError> {
        debug!(
            delivery_tag = msg.delivery_tag(),
            routing_key = msg.routing_key(),
            redelivered = msg.redelivered(),
            "handling message"
        );

        let result = next.run(msg).await;
        match &result {
            Ok(()) => debug!(delivery_tag = msg.delivery_tag(), "message handled"),
            Err(err) => warn!(
                delivery_tag = msg.delivery_tag(),
                error = err.to_string(),
                "message handling failed"
            ),
        }

        result
    }
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

/// Skips messages whose id was already processed successfully.
///
/// Duplicates are acked and the chain is not run. Only the last `capacity`
/// ids are remembered. Messages without an id always pass through.
pub struct DeduplicationMiddleware {
    capacity: usize,
    seen: Mutex<SeenIds>,
}

impl DeduplicationMiddleware {
    pub fn new(capacity: usize) -> DeduplicationMiddleware {
        DeduplicationMiddleware {
            capacity,
            seen: Mutex::new(SeenIds::default()),
        }
    }

    async fn remember(&self, id: &str) {
        let mut seen = self.seen.lock().await;
        if !seen.ids.insert(id.to_owned()) {
            return;
        }

        seen.order.push_back(id.to_owned());
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl Middleware<ReceivedMessage> for DeduplicationMiddleware {
    async fn handle(
        &self,
        msg: &ReceivedMessage,
        next: Next<'_, ReceivedMessage>,
    ) -> Result<(), MessagingError> {
        let Some(id) = msg.get_message_id() else {
            return next.run(msg).await;
        };

        if self.seen.lock().await.ids.contains(id) {
            debug!(message_id = id, "duplicated message, skipping");
            return msg.ack().await;
        }

        next.run(msg).await?;
        self.remember(id).await;
        Ok(())
    }
}

/// Runs the rest of the chain inside a transaction.
///
/// Commits when the chain succeeds. When the chain or the commit fails the
/// scope is rolled back and that error is returned. A failed rollback is
/// returned in its place.
pub struct TransactionMiddleware<T> {
    tx: Arc<Mutex<T>>,
}

impl<T: Transactional> TransactionMiddleware<T> {
    pub fn new(tx: Arc<Mutex<T>>) -> TransactionMiddleware<T> {
        TransactionMiddleware { tx }
    }
}

#[async_trait]
impl<T, M> Middleware<M> for TransactionMiddleware<T>
where
    T: Transactional,
    M: Send + Sync,
{
    async fn handle(&self, msg: &M, next: Next<'_, M>) -> Result<(), MessagingError> {
        self.tx.lock().await.begin().await?;

        let err = match next.run(msg).await {
            Ok(()) => match self.tx.lock().await.commit().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(error = err.to_string(), "failure to commit, rolling back");
                    err
                }
            },
            Err(err) => err,
        };

        if let Err(rollback_err) = self.tx.lock().await.rollback().await {
            error!(error = rollback_err.to_string(), "failure to rollback");
            return Err(rollback_err);
        }
        Err(err)
    }
}

/// Opens a consumer span per message, parented by the trace context the
/// publisher injected into the headers.
pub struct OtelMiddleware {
    tracer: BoxedTracer,
}

impl OtelMiddleware {
    pub fn new(tracer_name: &'static str) -> OtelMiddleware {
        OtelMiddleware {
            tracer: global::tracer(tracer_name),
        }
    }
}

#[async_trait]
impl Middleware<ReceivedMessage> for OtelMiddleware {
    async fn handle(
        &self,
        msg: &ReceivedMessage,
        next: Next<'_, ReceivedMessage>,
    ) -> Result<(), MessagingError> {
        let (_ctx, mut span) = otel::new_span(msg.message(), &self.tracer, msg.routing_key());

        let result = next.run(msg).await;
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        result
    }
}
