// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Queue Interop
//!
//! This module provides the error type shared by every layer of the crate.
//! The `MessagingError` enum covers configuration problems detected at
//! construction, per-message handler failures, transport failures raised by
//! the broker adapters, misuse of transactions and savepoints, and failed
//! registry lookups.

use thiserror::Error;

/// Represents errors that can occur while consuming or publishing messages.
///
/// Variants are grouped by the error taxonomy the consumer loop relies on:
/// configuration errors are raised eagerly, handler errors stay local to one
/// message, and transport or resource errors are fatal to the loop that hit
/// them (see [`MessagingError::is_fatal`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A configuration value was rejected at construction
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A value outside of a closed enumeration was supplied
    #[error("invalid `{kind}` value `{value}`")]
    InvalidEnumValue { kind: &'static str, value: String },

    /// A keyed lookup found nothing registered under the key
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or using a channel
    #[error("failure to use the channel: {0}")]
    ChannelError(String),

    /// The broker rejected a transaction operation
    #[error("transaction failure: {0}")]
    TransactionError(String),

    /// `commit` or `rollback` was called with no open savepoint
    #[error("no active savepoint to {0}")]
    NoActiveSavepoint(&'static str),

    /// The publisher refused to operate on a savepoint buffer
    #[error("savepoint failure `{0}`")]
    SavepointError(String),

    /// The queue collaborator can no longer be used
    #[error("transport failure: {0}")]
    TransportError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A message was acked or nacked more than once
    #[error("message `{0}` was already settled")]
    AlreadySettled(u64),

    /// Error declaring or cancelling a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The handler failed while processing a message
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// The handler refused the message, it must not be requeued
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl MessagingError {
    /// Reports whether the error means the resource that raised it can no
    /// longer be trusted.
    ///
    /// Fatal errors stop the consumer loop with
    /// [`ConsumerStoppedReason::ByError`](crate::tick::ConsumerStoppedReason::ByError);
    /// every other error stays local to the message being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionError
                | MessagingError::ChannelError(_)
                | MessagingError::TransactionError(_)
                | MessagingError::NoActiveSavepoint(_)
                | MessagingError::SavepointError(_)
                | MessagingError::TransportError(_)
                | MessagingError::AckMessageError
                | MessagingError::NackMessageError
                | MessagingError::AlreadySettled(_)
        )
    }
}
