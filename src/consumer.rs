// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption Boundary
//!
//! Both consumer loops hand every received message to [`consume`]. It runs
//! the middleware pipeline and makes sure the message ends up settled:
//!
//! 1. The pipeline succeeds: the message is acked, unless a stage already
//!    settled it
//! 2. The pipeline fails with a handler error: the message is nacked, with
//!    requeue unless the error is `Rejected`, and the loop carries on
//! 3. The pipeline fails with a fatal error: the message is requeued and the
//!    error is returned so the loop stops
//!
//! A message a middleware already settled is left alone in every case.

use crate::{
    errors::MessagingError,
    events::{emit, ConsumerEvent, EventSink, MessageOutcome},
    message::{ReceivedMessage, Settlement},
    pipeline::Pipeline,
};
use tracing::{debug, error, warn};

/// Where a message was consumed from.
pub(crate) struct ConsumerScope<'a> {
    pub(crate) queue: &'a str,
    pub(crate) consumer_tag: &'a str,
    pub(crate) sink: &'a dyn EventSink,
}

/// Runs `msg` through `pipeline` and settles it.
///
/// # Returns
/// The outcome reported to the sink, or the fatal error that must stop the
/// consumer loop
pub(crate) async fn consume(
    scope: &ConsumerScope<'_>,
    pipeline: &Pipeline<ReceivedMessage>,
    msg: ReceivedMessage,
) -> Result<MessageOutcome, MessagingError> {
    debug!(
        delivery_tag = msg.delivery_tag(),
        exchange = msg.exchange(),
        routing_key = msg.routing_key(),
        "received message"
    );

    let result = pipeline.run(&msg).await;

    let outcome = match result {
        Ok(()) => {
            if !msg.is_settled() {
                debug!(
                    delivery_tag = msg.delivery_tag(),
                    "pipeline left the message unsettled, acking"
                );
                msg.ack().await?;
            }
            MessageOutcome::Processed
        }
        Err(err) if err.is_fatal() => {
            error!(error = err.to_string(), "fatal error while handling msg");
            if !msg.is_settled() {
                if let Err(nack_err) = msg.nack(true).await {
                    error!(error = nack_err.to_string(), "error whiling requeuing");
                }
            }
            report(scope, &msg, failed(&err, &msg));
            return Err(err);
        }
        Err(err) => {
            warn!(error = err.to_string(), "error whiling handling msg");
            if !msg.is_settled() {
                let requeue = !matches!(err, MessagingError::Rejected(_));
                msg.nack(requeue).await?;
            }
            failed(&err, &msg)
        }
    };

    report(scope, &msg, outcome.clone());
    Ok(outcome)
}

fn failed(err: &MessagingError, msg: &ReceivedMessage) -> MessageOutcome {
    MessageOutcome::Failed {
        error: err.to_string(),
        requeued: msg.settlement() == Settlement::Nacked { requeue: true },
    }
}

fn report(scope: &ConsumerScope<'_>, msg: &ReceivedMessage, outcome: MessageOutcome) {
    emit(
        scope.sink,
        ConsumerEvent::MessageProcessed {
            queue: scope.queue.to_owned(),
            consumer_tag: scope.consumer_tag.to_owned(),
            delivery_tag: msg.delivery_tag(),
            message_id: msg.get_message_id().map(str::to_owned),
            outcome,
        },
    );
}
