// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Savepoint Publishing
//!
//! Publishers without broker transactions get transaction-like behavior by
//! buffering outgoing messages under named savepoints. Every `begin` opens a
//! new savepoint; committing an inner savepoint folds its buffer into its
//! parent, committing the outermost one flushes everything to the broker, and
//! rolling back discards only the savepoint being closed.
//!
//! [`SavepointCoordinator`] owns the stack of savepoint keys.
//! [`BufferedPublisher`] owns the buffers behind those keys.

use crate::{
    errors::MessagingError,
    publisher::{OutgoingMessage, Publisher},
    transaction::Transactional,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// Buffer operations a publisher exposes to the savepoint coordinator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SavepointPublisher: Send + Sync {
    /// Opens an empty buffer tagged `key`.
    async fn start(&self, key: &str) -> Result<(), MessagingError>;

    /// Moves the pending messages of `child` into `parent` without sending.
    async fn commit(&self, child: &str, parent: &str) -> Result<(), MessagingError>;

    /// Discards the pending messages of `key`.
    async fn rollback(&self, key: &str) -> Result<(), MessagingError>;

    /// Sends every pending message and clears all buffers.
    async fn flush(&self) -> Result<(), MessagingError>;
}

#[async_trait]
impl<T: SavepointPublisher + ?Sized> SavepointPublisher for Arc<T> {
    async fn start(&self, key: &str) -> Result<(), MessagingError> {
        (**self).start(key).await
    }

    async fn commit(&self, child: &str, parent: &str) -> Result<(), MessagingError> {
        (**self).commit(child, parent).await
    }

    async fn rollback(&self, key: &str) -> Result<(), MessagingError> {
        (**self).rollback(key).await
    }

    async fn flush(&self) -> Result<(), MessagingError> {
        (**self).flush().await
    }
}

/// Keeps the stack of open savepoints for one publisher.
///
/// Keys are `savepoint_<n>`; `n` grows with every `begin` and restarts once
/// the stack is empty again. The stack length is the nesting level.
pub struct SavepointCoordinator<S> {
    publisher: S,
    stack: Vec<String>,
    sequence: u64,
}

impl<S: SavepointPublisher> SavepointCoordinator<S> {
    pub fn new(publisher: S) -> SavepointCoordinator<S> {
        SavepointCoordinator {
            publisher,
            stack: vec![],
            sequence: 0,
        }
    }

    /// The innermost open savepoint.
    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    fn top(&self, operation: &'static str) -> Result<String, MessagingError> {
        self.stack.last().cloned().ok_or_else(|| {
            error!("{} called without an open savepoint", operation);
            MessagingError::NoActiveSavepoint(operation)
        })
    }

    fn pop(&mut self) {
        self.stack.pop();
        if self.stack.is_empty() {
            self.sequence = 0;
        }
    }
}

#[async_trait]
impl<S: SavepointPublisher> Transactional for SavepointCoordinator<S> {
    async fn begin(&mut self) -> Result<(), MessagingError> {
        let key = format!("savepoint_{}", self.sequence + 1);
        self.publisher.start(&key).await?;

        debug!(savepoint = key, "savepoint opened");
        self.sequence += 1;
        self.stack.push(key);
        Ok(())
    }

    /// Closes the innermost savepoint, folding it into its parent or, for the
    /// outermost one, flushing every buffered message.
    ///
    /// The savepoint stays open when the publisher fails, so the caller can
    /// retry the commit or roll it back.
    ///
    /// # Returns
    /// `NoActiveSavepoint` when nothing was begun, or the publisher error
    async fn commit(&mut self) -> Result<(), MessagingError> {
        let key = self.top("commit")?;

        match self.stack.len().checked_sub(2).map(|at| self.stack[at].clone()) {
            Some(parent) => {
                self.publisher.commit(&key, &parent).await?;
                debug!(savepoint = key, parent = parent, "savepoint merged");
            }
            None => {
                self.publisher.flush().await?;
                debug!(savepoint = key, "savepoints flushed");
            }
        }

        self.pop();
        Ok(())
    }

    /// Discards the innermost savepoint. Never transmits.
    async fn rollback(&mut self) -> Result<(), MessagingError> {
        let key = self.top("rollback")?;
        self.publisher.rollback(&key).await?;

        debug!(savepoint = key, "savepoint rolled back");
        self.pop();
        Ok(())
    }

    fn nesting_level(&self) -> usize {
        self.stack.len()
    }
}

/// A publisher that holds messages back while a savepoint is open.
///
/// Messages published with no open savepoint go straight to the wrapped
/// publisher. Otherwise they are appended to the innermost buffer.
pub struct BufferedPublisher {
    publisher: Arc<dyn Publisher>,
    buffers: Mutex<Vec<(String, Vec<OutgoingMessage>)>>,
}

impl BufferedPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Arc<BufferedPublisher> {
        Arc::new(BufferedPublisher {
            publisher,
            buffers: Mutex::new(vec![]),
        })
    }

    /// Number of messages waiting in all buffers.
    pub async fn pending(&self) -> usize {
        self.buffers
            .lock()
            .await
            .iter()
            .map(|(_, messages)| messages.len())
            .sum()
    }
}

fn position(buffers: &[(String, Vec<OutgoingMessage>)], key: &str) -> Result<usize, MessagingError> {
    buffers
        .iter()
        .position(|(name, _)| name == key)
        .ok_or_else(|| {
            error!(savepoint = key, "unknown savepoint");
            MessagingError::SavepointError(key.to_owned())
        })
}

#[async_trait]
impl SavepointPublisher for BufferedPublisher {
    async fn start(&self, key: &str) -> Result<(), MessagingError> {
        let mut buffers = self.buffers.lock().await;
        if buffers.iter().any(|(name, _)| name == key) {
            error!(savepoint = key, "savepoint already open");
            return Err(MessagingError::SavepointError(key.to_owned()));
        }

        buffers.push((key.to_owned(), vec![]));
        Ok(())
    }

    async fn commit(&self, child: &str, parent: &str) -> Result<(), MessagingError> {
        let mut buffers = self.buffers.lock().await;

        let child_at = position(&buffers, child)?;
        position(&buffers, parent)?;
        let (_, messages) = buffers.remove(child_at);

        let parent_at = position(&buffers, parent)?;
        buffers[parent_at].1.extend(messages);
        Ok(())
    }

    async fn rollback(&self, key: &str) -> Result<(), MessagingError> {
        let mut buffers = self.buffers.lock().await;

        let at = position(&buffers, key)?;
        let (_, discarded) = buffers.remove(at);
        debug!(savepoint = key, discarded = discarded.len(), "buffer discarded");
        Ok(())
    }

    /// Sends buffered messages oldest first, dropping each one only once
    /// the wrapped publisher accepted it. On failure the unsent messages,
    /// the failed one included, stay buffered under their savepoints.
    async fn flush(&self) -> Result<(), MessagingError> {
        let mut buffers = self.buffers.lock().await;
        debug!(
            count = buffers.iter().map(|(_, messages)| messages.len()).sum::<usize>(),
            "flushing buffered messages"
        );

        while let Some((key, messages)) = buffers.first_mut() {
            while let Some(outgoing) = messages.first() {
                if let Err(err) = self.publisher.publish(outgoing).await {
                    error!(
                        error = err.to_string(),
                        savepoint = key.as_str(),
                        unsent = messages.len(),
                        "flush interrupted"
                    );
                    return Err(err);
                }
                messages.remove(0);
            }
            buffers.remove(0);
        }

        Ok(())
    }
}

#[async_trait]
impl Publisher for BufferedPublisher {
    async fn publish(&self, outgoing: &OutgoingMessage) -> Result<(), MessagingError> {
        {
            let mut buffers = self.buffers.lock().await;
            if let Some((_, messages)) = buffers.last_mut() {
                messages.push(outgoing.clone());
                return Ok(());
            }
        }

        self.publisher.publish(outgoing).await
    }
}
