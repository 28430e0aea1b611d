// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod message;
pub mod middleware;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod savepoint;
pub mod spool;
pub mod tag;
pub mod tick;
pub mod transaction;

pub use otel::new_span;
