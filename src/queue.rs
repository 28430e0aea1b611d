// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module defines the [`Queue`] capability consumers are driven by and
//! its RabbitMQ implementation. A queue supports pull-style retrieval, one
//! message at a time, used by the spool consumer, and push-style delivery
//! through a broker consumer, used by the push consumer.

use crate::{
    errors::MessagingError,
    message::{Acknowledger, DeliveryInfo, DeliveryMode, HeaderValue, Headers, Message, ReceivedMessage},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// How long [`Queue::ready`] waits by default before reporting the queue
/// may hold messages again.
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_millis(100);

/// Messages pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<ReceivedMessage, MessagingError>>;

/// A broker queue.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Fetches one message without blocking. `None` when the queue is empty.
    async fn get(&self) -> Result<Option<ReceivedMessage>, MessagingError>;

    /// Number of messages ready for delivery.
    async fn count_messages(&self) -> Result<u32, MessagingError>;

    /// Removes every ready message, returning how many were removed.
    async fn purge(&self) -> Result<u32, MessagingError>;

    /// Subscribes a broker consumer tagged `consumer_tag`.
    async fn consume(&self, consumer_tag: &str) -> Result<DeliveryStream, MessagingError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    /// Resolves when the queue may hold messages again.
    ///
    /// Used by consumers that wait without a timeout. Adapters able to learn
    /// about new messages should resolve as soon as one arrives. The default
    /// sleeps for [`DEFAULT_READY_INTERVAL`], so a consumer without a timeout
    /// polls the queue at that interval rather than blocking on the broker.
    async fn ready(&self) {
        tokio::time::sleep(DEFAULT_READY_INTERVAL).await
    }
}

/// Settles lapin deliveries.
struct AmqpAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self, _: u64) -> Result<(), MessagingError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                MessagingError::AckMessageError
            })
    }

    async fn nack(&self, _: u64, requeue: bool) -> Result<(), MessagingError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                MessagingError::NackMessageError
            })
    }
}

/// RabbitMQ implementation of the Queue trait.
///
/// AMQP has no notification for messages arriving on a queue that nobody
/// consumes, so `ready` keeps the default: an idle spool consumer without a
/// timeout issues a `basic.get` every [`DEFAULT_READY_INTERVAL`]. Use
/// [`Queue::consume`] for delivery without polling.
pub struct AmqpQueue {
    channel: Arc<lapin::Channel>,
    name: String,
}

impl AmqpQueue {
    pub fn new(channel: Arc<lapin::Channel>, name: &str) -> AmqpQueue {
        AmqpQueue {
            channel,
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<ReceivedMessage>, MessagingError> {
        match self
            .channel
            .basic_get(&self.name, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(Some(msg)) => Ok(Some(received_message(msg.delivery))),
            Ok(None) => Ok(None),
            Err(err) => {
                error!(error = err.to_string(), queue = self.name, "failure to get message");
                Err(MessagingError::TransportError(err.to_string()))
            }
        }
    }

    async fn count_messages(&self) -> Result<u32, MessagingError> {
        match self
            .channel
            .queue_declare(
                &self.name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(queue.message_count()),
            Err(err) => {
                error!(error = err.to_string(), queue = self.name, "failure to count messages");
                Err(MessagingError::TransportError(err.to_string()))
            }
        }
    }

    async fn purge(&self) -> Result<u32, MessagingError> {
        match self
            .channel
            .queue_purge(&self.name, QueuePurgeOptions::default())
            .await
        {
            Ok(count) => {
                debug!(queue = self.name, count = count, "queue purged");
                Ok(count)
            }
            Err(err) => {
                error!(error = err.to_string(), queue = self.name, "failure to purge queue");
                Err(MessagingError::TransportError(err.to_string()))
            }
        }
    }

    async fn consume(&self, consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        let consumer = match self
            .channel
            .basic_consume(
                &self.name,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(MessagingError::ConsumerDeclarationError(
                    consumer_tag.to_owned(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(received_message(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(MessagingError::TransportError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                MessagingError::ConsumerDeclarationError(consumer_tag.to_owned())
            })
    }
}

fn received_message(delivery: Delivery) -> ReceivedMessage {
    let info = DeliveryInfo {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
    };

    let message = message_from(&delivery.properties, delivery.data);
    let acker = Arc::new(AmqpAcknowledger {
        acker: delivery.acker,
    });

    ReceivedMessage::new(message, info, acker)
}

fn message_from(props: &BasicProperties, data: Vec<u8>) -> Message {
    let mut msg = Message::new(data).message_id(props.message_id().as_ref().map(|id| id.as_str()));

    if let Some(value) = props.content_type() {
        msg = msg.content_type(value.as_str());
    }
    if let Some(value) = props.content_encoding() {
        msg = msg.content_encoding(value.as_str());
    }
    if let Some(value) = props.app_id() {
        msg = msg.app_id(value.as_str());
    }
    if let Some(value) = props.user_id() {
        msg = msg.user_id(value.as_str());
    }
    if let Some(value) = props.expiration() {
        msg = msg.expiration(value.as_str());
    }
    if let Some(mode) = props.delivery_mode() {
        match DeliveryMode::try_from(*mode) {
            Ok(mode) => msg = msg.delivery_mode(mode),
            Err(err) => debug!(error = err.to_string(), "ignoring delivery mode"),
        }
    }
    if let Some(table) = props.headers() {
        msg = msg.headers(headers_from(table));
    }

    msg
}

/// Converts scalar AMQP header values. Nested tables and arrays are dropped.
fn headers_from(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Uint(u64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Uint(u64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Uint(u64::from(*v)),
                AMQPValue::Timestamp(v) => HeaderValue::Uint(*v),
                AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
                AMQPValue::Double(v) => HeaderValue::Float(*v),
                AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
                AMQPValue::LongString(v) => {
                    HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };

            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, LongString, ShortString};
    use std::collections::BTreeMap;

    #[test]
    fn scalar_headers_survive_conversion() {
        let mut table = BTreeMap::new();
        table.insert(ShortString::from("attempt"), AMQPValue::LongInt(2));
        table.insert(ShortString::from("persisted"), AMQPValue::Boolean(true));
        table.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-01")),
        );
        table.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldArray(FieldArray::default()),
        );

        let headers = headers_from(&FieldTable::from(table));

        assert_eq!(headers.get("attempt"), Some(&HeaderValue::Int(2)));
        assert_eq!(headers.get("persisted"), Some(&HeaderValue::Bool(true)));
        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc-01"))
        );
        assert!(!headers.contains_key("x-death"));
    }

    #[test]
    fn properties_map_onto_message() {
        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from("m-1"))
            .with_delivery_mode(2);

        let msg = message_from(&props, b"{}".to_vec());

        assert_eq!(msg.get_content_type(), Some("application/json"));
        assert_eq!(msg.get_message_id(), Some("m-1"));
        assert_eq!(msg.get_delivery_mode(), DeliveryMode::Persistent);
        assert_eq!(msg.payload(), b"{}");
    }
}
