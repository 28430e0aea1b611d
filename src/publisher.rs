// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishers
//!
//! This module defines the [`Publisher`] seam, the RabbitMQ publisher built on
//! `lapin`, and [`PipelinePublisher`], which runs outgoing messages through a
//! middleware [`Pipeline`] before handing them to another publisher.
//! Buffered publishing under savepoints lives in [`crate::savepoint`].

use crate::{
    errors::MessagingError,
    message::{HeaderValue, Headers, Message},
    otel,
    pipeline::{Handler, Pipeline},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, error};

/// A message addressed to an exchange with a routing key.
///
/// The trace context active when the message was created travels with it,
/// so a message buffered under a savepoint is still published in its
/// original trace.
#[derive(Clone)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
    ctx: Context,
}

impl OutgoingMessage {
    pub fn new(exchange: &str, routing_key: &str, message: Message) -> OutgoingMessage {
        OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message,
            ctx: Context::current(),
        }
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("message", &self.message)
            .finish()
    }
}

/// Sends messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, outgoing: &OutgoingMessage) -> Result<(), MessagingError>;
}

/// RabbitMQ implementation of the Publisher trait.
///
/// Message metadata maps onto the AMQP basic properties and the trace
/// context is injected into the headers.
pub struct AmqpPublisher {
    channel: Arc<lapin::Channel>,
}

impl AmqpPublisher {
    pub fn new(channel: Arc<lapin::Channel>) -> Arc<AmqpPublisher> {
        Arc::new(AmqpPublisher { channel })
    }

    fn properties(outgoing: &OutgoingMessage) -> BasicProperties {
        let msg = &outgoing.message;
        let headers = otel::inject_context(outgoing.context(), msg.get_headers());

        let mut props = BasicProperties::default()
            .with_delivery_mode(u8::from(msg.get_delivery_mode()))
            .with_headers(FieldTable::from(amqp_headers(&headers)));

        if let Some(value) = msg.get_content_type() {
            props = props.with_content_type(ShortString::from(value));
        }
        if let Some(value) = msg.get_content_encoding() {
            props = props.with_content_encoding(ShortString::from(value));
        }
        if let Some(value) = msg.get_message_id() {
            props = props.with_message_id(ShortString::from(value));
        }
        if let Some(value) = msg.get_app_id() {
            props = props.with_app_id(ShortString::from(value));
        }
        if let Some(value) = msg.get_user_id() {
            props = props.with_user_id(ShortString::from(value));
        }
        if let Some(value) = msg.get_expiration() {
            props = props.with_expiration(ShortString::from(value));
        }

        props
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, outgoing: &OutgoingMessage) -> Result<(), MessagingError> {
        match self
            .channel
            .basic_publish(
                &outgoing.exchange,
                &outgoing.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                outgoing.message.payload(),
                AmqpPublisher::properties(outgoing),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(MessagingError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

/// Converts message headers to the AMQP field table representation.
pub(crate) fn amqp_headers(headers: &Headers) -> BTreeMap<ShortString, AMQPValue> {
    headers
        .iter()
        .map(|(key, value)| {
            let amqp_value = match value {
                HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
                HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
                HeaderValue::Uint(v) => match u32::try_from(*v) {
                    Ok(small) => AMQPValue::LongUInt(LongUInt::from(small)),
                    Err(_) => AMQPValue::LongLongInt(*v as LongLongInt),
                },
                HeaderValue::Float(v) => AMQPValue::Double(*v),
                HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            };

            (ShortString::from(key.clone()), amqp_value)
        })
        .collect()
}

/// Terminal stage of a publishing pipeline.
struct Publish {
    publisher: Arc<dyn Publisher>,
}

#[async_trait]
impl Handler<OutgoingMessage> for Publish {
    async fn handle(&self, outgoing: &OutgoingMessage) -> Result<(), MessagingError> {
        self.publisher.publish(outgoing).await
    }
}

/// Runs every outgoing message through a middleware pipeline before
/// publishing it with the wrapped publisher.
pub struct PipelinePublisher {
    pipeline: Pipeline<OutgoingMessage>,
}

impl PipelinePublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> PipelinePublisher {
        PipelinePublisher {
            pipeline: Pipeline::new(Arc::new(Publish { publisher })),
        }
    }

    pub fn with(
        mut self,
        middleware: Arc<dyn crate::pipeline::Middleware<OutgoingMessage>>,
    ) -> Self {
        self.pipeline = self.pipeline.with(middleware);
        self
    }
}

#[async_trait]
impl Publisher for PipelinePublisher {
    async fn publish(&self, outgoing: &OutgoingMessage) -> Result<(), MessagingError> {
        debug!(
            exchange = outgoing.exchange,
            routing_key = outgoing.routing_key,
            "publishing message"
        );
        self.pipeline.run(outgoing).await
    }
}
