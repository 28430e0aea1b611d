// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Push Consumer
//!
//! The broker-push alternative to the spool consumer: a [`PushConsumer`]
//! subscribes a broker consumer on its queue and runs every delivered message
//! through the same middleware pipeline and settlement boundary. Several push
//! consumers can be driven concurrently with [`run_all`].

use crate::{
    consumer::{consume, ConsumerScope},
    errors::MessagingError,
    events::{emit, ConsumerEvent, EventSink, TracingSink},
    message::ReceivedMessage,
    pipeline::Pipeline,
    queue::Queue,
    tag::{ConsumerTagGenerator, EmptyTag},
    tick::{ConsumerStopped, ConsumerStoppedReason},
};
use futures_util::{future::join_all, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Consumes messages the broker pushes to a subscribed consumer.
pub struct PushConsumer {
    queue: Arc<dyn Queue>,
    pipeline: Pipeline<ReceivedMessage>,
    sink: Arc<dyn EventSink>,
    tags: Arc<dyn ConsumerTagGenerator>,
    cancel: CancellationToken,
}

impl PushConsumer {
    /// Creates a push consumer.
    ///
    /// # Parameters
    /// * `queue` - Queue to subscribe to
    /// * `pipeline` - Chain every delivery runs through
    ///
    /// # Returns
    /// A consumer with an empty tag, letting the broker assign one, and
    /// events forwarded to `tracing`
    pub fn new(queue: Arc<dyn Queue>, pipeline: Pipeline<ReceivedMessage>) -> PushConsumer {
        PushConsumer {
            queue,
            pipeline,
            sink: Arc::new(TracingSink),
            tags: Arc::new(EmptyTag),
            cancel: CancellationToken::new(),
        }
    }

    /// Receives lifecycle, per-message and stop events.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the generator asked for a tag each time the consumer subscribes.
    ///
    /// # Parameters
    /// * `tags` - Tag generator, e.g. a static or prefixed tag
    pub fn tags(mut self, tags: Arc<dyn ConsumerTagGenerator>) -> Self {
        self.tags = tags;
        self
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Subscribes and processes deliveries until stopped.
    ///
    /// On a stop request the broker consumer is cancelled and the loop ends
    /// with `ByUser`. A closed delivery stream or a fatal error ends it with
    /// `ByError`.
    pub async fn run(&self) -> Result<ConsumerStopped, MessagingError> {
        let tag = self.tags.generate();
        let mut deliveries = self.queue.consume(&tag).await?;

        let scope = ConsumerScope {
            queue: self.queue.name(),
            consumer_tag: &tag,
            sink: self.sink.as_ref(),
        };

        emit(
            self.sink.as_ref(),
            ConsumerEvent::Started {
                queue: self.queue.name().to_owned(),
                consumer_tag: tag.clone(),
            },
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(queue = self.queue.name(), "cancelling consumer");
                    let stopped = self.stopped(&tag, ConsumerStoppedReason::ByUser);
                    self.queue.cancel_consumer(&tag).await?;
                    return Ok(stopped);
                }
                delivery = deliveries.next() => {
                    let result = match delivery {
                        Some(Ok(msg)) => consume(&scope, &self.pipeline, msg).await.map(|_| ()),
                        Some(Err(err)) => Err(err),
                        None => Err(MessagingError::TransportError(
                            "delivery stream closed".to_owned(),
                        )),
                    };

                    if let Err(err) = result {
                        error!(error = err.to_string(), "error consume msg");
                        self.stopped(&tag, ConsumerStoppedReason::ByError);
                        return Err(err);
                    }
                }
            }
        }
    }

    fn stopped(&self, tag: &str, reason: ConsumerStoppedReason) -> ConsumerStopped {
        let stopped = ConsumerStopped {
            queue: self.queue.name().to_owned(),
            consumer_tag: tag.to_owned(),
            reason,
            continuation: None,
        };
        emit(self.sink.as_ref(), ConsumerEvent::Stopped(stopped.clone()));
        stopped
    }
}

/// Runs every consumer on its own task until all of them stopped.
///
/// # Returns
/// The stop events in the order the consumers were given, or the first
/// error any of them ended with
pub async fn run_all(
    consumers: Vec<Arc<PushConsumer>>,
) -> Result<Vec<ConsumerStopped>, MessagingError> {
    let spawns = consumers
        .into_iter()
        .map(|consumer| tokio::spawn(async move { consumer.run().await }));

    let mut stopped = vec![];
    for res in join_all(spawns).await {
        match res {
            Ok(result) => stopped.push(result?),
            Err(err) => {
                error!(error = err.to_string(), "tokio process error");
                return Err(MessagingError::InternalError);
            }
        }
    }

    Ok(stopped)
}
