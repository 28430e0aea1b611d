// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! This module defines the payload-plus-metadata value that flows between the
//! publisher and consumer sides. A [`Message`] is built once and never mutated
//! afterwards. A [`ReceivedMessage`] adds the delivery information the broker
//! attached to it and the two exclusive terminal operations, `ack` and `nack`.

use crate::errors::MessagingError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tracing::{error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Scalar values allowed in message headers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::Uint(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Message headers, ordered by key.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Whether the broker should persist the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    NonPersistent,
    Persistent,
}

impl TryFrom<u8> for DeliveryMode {
    type Error = MessagingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeliveryMode::NonPersistent),
            2 => Ok(DeliveryMode::Persistent),
            other => Err(MessagingError::InvalidEnumValue {
                kind: "delivery mode",
                value: other.to_string(),
            }),
        }
    }
}

impl From<DeliveryMode> for u8 {
    fn from(mode: DeliveryMode) -> u8 {
        match mode {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// An immutable message payload plus its metadata.
///
/// The builder methods consume the value, so a message can only be shaped
/// while it is being constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Vec<u8>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: Headers,
    message_id: Option<String>,
    app_id: Option<String>,
    user_id: Option<String>,
    expiration: Option<String>,
    delivery_mode: DeliveryMode,
}

impl Message {
    /// Creates a new message carrying `payload`, with a random message id.
    ///
    /// # Parameters
    /// * `payload` - Body bytes, sent as is
    ///
    /// # Returns
    /// A non-persistent message with no content type and no headers
    pub fn new(payload: impl Into<Vec<u8>>) -> Message {
        Message {
            payload: payload.into(),
            content_type: None,
            content_encoding: None,
            headers: Headers::default(),
            message_id: Some(Uuid::new_v4().to_string()),
            app_id: None,
            user_id: None,
            expiration: None,
            delivery_mode: DeliveryMode::default(),
        }
    }

    /// Creates a JSON message from any serializable value.
    ///
    /// # Returns
    /// The message with the `application/json` content type, or
    /// `ParsePayloadError` if the value cannot be serialized
    pub fn json<T: Serialize>(value: &T) -> Result<Message, MessagingError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            MessagingError::ParsePayloadError
        })?;

        Ok(Message::new(payload).content_type(JSON_CONTENT_TYPE))
    }

    /// Sets the MIME type of the payload, e.g. `application/json`.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn content_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_owned());
        self
    }

    /// Adds one header, replacing a previous value under `key`.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Anything convertible to a [`HeaderValue`]
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Replaces every header set so far.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Replaces the generated message id. `None` leaves the id unset.
    pub fn message_id(mut self, id: Option<&str>) -> Self {
        self.message_id = id.map(str::to_owned);
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    /// Sets the per-message TTL, in milliseconds as the broker expects it.
    pub fn expiration(mut self, expiration: &str) -> Self {
        self.expiration = Some(expiration.to_owned());
        self
    }

    /// Chooses whether the broker writes the message to disk.
    ///
    /// # Parameters
    /// * `mode` - `NonPersistent` (the default) or `Persistent`
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn get_content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn get_content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn get_headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn get_message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn get_app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn get_user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn get_expiration(&self) -> Option<&str> {
        self.expiration.as_deref()
    }

    pub fn get_delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Deserializes a JSON payload.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            MessagingError::ParsePayloadError
        })
    }
}

/// Settles deliveries with the broker.
///
/// Implemented by each transport adapter. A [`ReceivedMessage`] guarantees
/// that exactly one of the two calls is made for its delivery tag.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;
}

/// Routing information the broker attached to a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// How a received message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    Acked,
    Nacked { requeue: bool },
}

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const NACKED: u8 = 2;
const NACKED_REQUEUE: u8 = 3;

/// A message delivered by the broker, awaiting exactly one `ack` or `nack`.
pub struct ReceivedMessage {
    message: Message,
    delivery: DeliveryInfo,
    acker: Arc<dyn Acknowledger>,
    state: AtomicU8,
}

impl ReceivedMessage {
    /// Wraps a delivery.
    ///
    /// # Parameters
    /// * `message` - Decoded body and properties
    /// * `delivery` - Broker metadata, including the delivery tag
    /// * `acker` - Settles the delivery on the channel it came from
    ///
    /// # Returns
    /// A pending message, settled by its first `ack` or `nack`
    pub fn new(
        message: Message,
        delivery: DeliveryInfo,
        acker: Arc<dyn Acknowledger>,
    ) -> ReceivedMessage {
        ReceivedMessage {
            message,
            delivery,
            acker,
            state: AtomicU8::new(PENDING),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn delivery(&self) -> &DeliveryInfo {
        &self.delivery
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn settlement(&self) -> Settlement {
        match self.state.load(Ordering::Acquire) {
            ACKED => Settlement::Acked,
            NACKED => Settlement::Nacked { requeue: false },
            NACKED_REQUEUE => Settlement::Nacked { requeue: true },
            _ => Settlement::Pending,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settlement() != Settlement::Pending
    }

    /// Acknowledges the message.
    ///
    /// # Returns
    /// `AlreadySettled` if the message was acked or nacked before, otherwise
    /// the outcome of the broker call
    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.claim(ACKED)?;
        self.acker.ack(self.delivery.delivery_tag).await
    }

    /// Rejects the message, optionally asking the broker to requeue it.
    pub async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.claim(if requeue { NACKED_REQUEUE } else { NACKED })?;
        self.acker.nack(self.delivery.delivery_tag, requeue).await
    }

    fn claim(&self, next: u8) -> Result<(), MessagingError> {
        self.state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                error!(
                    delivery_tag = self.delivery.delivery_tag,
                    "message settled more than once"
                );
                MessagingError::AlreadySettled(self.delivery.delivery_tag)
            })
    }
}

impl Deref for ReceivedMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message", &self.message)
            .field("delivery", &self.delivery)
            .field("settlement", &self.settlement())
            .finish()
    }
}

impl Drop for ReceivedMessage {
    fn drop(&mut self) {
        if !self.is_settled() {
            warn!(
                delivery_tag = self.delivery.delivery_tag,
                routing_key = self.delivery.routing_key,
                "message dropped without ack or nack"
            );
        }
    }
}
