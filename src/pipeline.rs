// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Middleware Pipeline
//!
//! A [`Pipeline`] wraps a terminal [`Handler`] in an ordered chain of
//! [`Middleware`]. Each middleware receives the message and a single-use
//! [`Next`] continuation standing for the rest of the chain. It may call
//! `next.run(message)` to continue, skip it to short-circuit, or inspect the
//! result of the inner chain and fail afterwards.
//!
//! Middleware run in the order they were added, outermost first. A pipeline
//! is built once and reused for every message.

use crate::{errors::MessagingError, message::ReceivedMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// The innermost link of a pipeline.
#[async_trait]
pub trait Handler<M: Send + Sync>: Send + Sync {
    async fn handle(&self, message: &M) -> Result<(), MessagingError>;
}

/// A cross-cutting step wrapped around the rest of the pipeline.
#[async_trait]
pub trait Middleware<M: Send + Sync>: Send + Sync {
    async fn handle(&self, message: &M, next: Next<'_, M>) -> Result<(), MessagingError>;
}

/// The remainder of a pipeline, consumed by running it.
pub struct Next<'a, M: Send + Sync> {
    middlewares: &'a [Arc<dyn Middleware<M>>],
    handler: &'a dyn Handler<M>,
}

impl<M: Send + Sync> Next<'_, M> {
    pub async fn run(self, message: &M) -> Result<(), MessagingError> {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    middlewares: rest,
                    handler: self.handler,
                };
                current.handle(message, next).await
            }
            None => self.handler.handle(message).await,
        }
    }
}

/// An ordered middleware chain around a terminal handler.
pub struct Pipeline<M: Send + Sync> {
    middlewares: Vec<Arc<dyn Middleware<M>>>,
    handler: Arc<dyn Handler<M>>,
}

impl<M: Send + Sync> Clone for Pipeline<M> {
    fn clone(&self) -> Self {
        Pipeline {
            middlewares: self.middlewares.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<M: Send + Sync> Pipeline<M> {
    pub fn new(handler: Arc<dyn Handler<M>>) -> Pipeline<M> {
        Pipeline {
            middlewares: vec![],
            handler,
        }
    }

    /// Appends a middleware. Earlier middleware wrap later ones.
    pub fn with(mut self, middleware: Arc<dyn Middleware<M>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run(&self, message: &M) -> Result<(), MessagingError> {
        Next {
            middlewares: &self.middlewares,
            handler: self.handler.as_ref(),
        }
        .run(message)
        .await
    }
}

impl Pipeline<ReceivedMessage> {
    /// Builds a consumer pipeline whose terminal stage acknowledges the
    /// message once the handler succeeded.
    ///
    /// Messages the handler already settled itself are left alone. Failed
    /// messages are left pending for the consumer boundary to reject.
    pub fn acknowledging(handler: Arc<dyn Handler<ReceivedMessage>>) -> Self {
        Pipeline::new(Arc::new(Acknowledge { inner: handler }))
    }
}

struct Acknowledge {
    inner: Arc<dyn Handler<ReceivedMessage>>,
}

#[async_trait]
impl Handler<ReceivedMessage> for Acknowledge {
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), MessagingError> {
        self.inner.handle(message).await?;

        if !message.is_settled() {
            message.ack().await?;
            debug!(delivery_tag = message.delivery_tag(), "message acked");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        journal: Journal,
    }

    #[async_trait]
    impl Middleware<String> for Recording {
        async fn handle(&self, message: &String, next: Next<'_, String>) -> Result<(), MessagingError> {
            self.journal.lock().unwrap().push(format!("{}-before", self.name));
            let result = next.run(message).await;
            self.journal.lock().unwrap().push(format!("{}-after", self.name));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware<String> for ShortCircuit {
        async fn handle(&self, _: &String, _: Next<'_, String>) -> Result<(), MessagingError> {
            Ok(())
        }
    }

    struct FailAfter;

    #[async_trait]
    impl Middleware<String> for FailAfter {
        async fn handle(&self, message: &String, next: Next<'_, String>) -> Result<(), MessagingError> {
            next.run(message).await?;
            Err(MessagingError::HandlerError("post-check failed".to_owned()))
        }
    }

    struct Terminal {
        journal: Journal,
    }

    #[async_trait]
    impl Handler<String> for Terminal {
        async fn handle(&self, message: &String) -> Result<(), MessagingError> {
            self.journal.lock().unwrap().push(format!("H:{message}"));
            Ok(())
        }
    }

    fn recording(name: &'static str, journal: &Journal) -> Arc<dyn Middleware<String>> {
        Arc::new(Recording {
            name,
            journal: journal.clone(),
        })
    }

    #[tokio::test]
    async fn middleware_wrap_in_declaration_order() {
        let journal = Journal::default();
        let pipeline = Pipeline::<String>::new(Arc::new(Terminal {
            journal: journal.clone(),
        }))
        .with(recording("A", &journal))
        .with(recording("B", &journal));

        pipeline.run(&"m".to_owned()).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A-before", "B-before", "H:m", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn pipeline_is_reusable() {
        let journal = Journal::default();
        let pipeline = Pipeline::<String>::new(Arc::new(Terminal {
            journal: journal.clone(),
        }))
        .with(recording("A", &journal));

        pipeline.run(&"1".to_owned()).await.unwrap();
        pipeline.run(&"2".to_owned()).await.unwrap();

        assert_eq!(journal.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_chain() {
        let journal = Journal::default();
        let pipeline = Pipeline::<String>::new(Arc::new(Terminal {
            journal: journal.clone(),
        }))
        .with(recording("A", &journal))
        .with(Arc::new(ShortCircuit))
        .with(recording("B", &journal));

        pipeline.run(&"m".to_owned()).await.unwrap();

        assert_eq!(*journal.lock().unwrap(), vec!["A-before", "A-after"]);
    }

    #[tokio::test]
    async fn middleware_may_fail_after_the_handler_ran() {
        let journal = Journal::default();
        let pipeline = Pipeline::<String>::new(Arc::new(Terminal {
            journal: journal.clone(),
        }))
        .with(Arc::new(FailAfter));

        let result = pipeline.run(&"m".to_owned()).await;

        assert!(matches!(result, Err(MessagingError::HandlerError(_))));
        assert_eq!(*journal.lock().unwrap(), vec!["H:m"]);
    }
}
