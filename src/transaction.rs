// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Nested Transactions
//!
//! A broker channel runs at most one transaction at a time, yet application
//! code naturally nests units of work. [`TransactionCoordinator`] keeps a
//! nesting counter over a [`ChannelProvider`] so that only the outermost
//! `begin`/`commit` (or `rollback`) pair reaches the channel.

use crate::{channel::ChannelProvider, errors::MessagingError};
use async_trait::async_trait;
use tracing::debug;

/// Reentrant begin/commit/rollback.
///
/// Implemented by both the channel transaction coordinator and the savepoint
/// coordinator, so middleware can scope a message handler in either.
#[async_trait]
pub trait Transactional: Send + Sync {
    async fn begin(&mut self) -> Result<(), MessagingError>;

    async fn commit(&mut self) -> Result<(), MessagingError>;

    async fn rollback(&mut self) -> Result<(), MessagingError>;

    fn nesting_level(&self) -> usize;
}

/// Collapses nested transactions into one physical channel transaction.
///
/// The physical transaction starts when the level moves from 0 to 1 and ends
/// when it moves from 1 to 0. Extra commits or rollbacks are absorbed by
/// keeping the level at 0.
pub struct TransactionCoordinator<P> {
    provider: P,
    level: usize,
}

impl<P: ChannelProvider> TransactionCoordinator<P> {
    pub fn new(provider: P) -> TransactionCoordinator<P> {
        TransactionCoordinator { provider, level: 0 }
    }

    /// Clamped decrement. Returns true when the outermost scope just closed.
    fn close_level(&mut self) -> bool {
        if self.level == 0 {
            return false;
        }

        self.level -= 1;
        self.level == 0
    }
}

#[async_trait]
impl<P: ChannelProvider> Transactional for TransactionCoordinator<P> {
    /// Opens a scope, starting the physical transaction for the outermost one.
    ///
    /// The level only moves once the channel accepted the transaction, so a
    /// failure leaves the coordinator as it was.
    async fn begin(&mut self) -> Result<(), MessagingError> {
        if self.level == 0 {
            let channel = self.provider.channel().await?;
            channel.start_transaction().await?;
            debug!("transaction started");
        }

        self.level += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MessagingError> {
        if !self.close_level() {
            return Ok(());
        }

        let channel = self.provider.channel().await?;
        channel.commit_transaction().await?;
        debug!("transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MessagingError> {
        if !self.close_level() {
            return Ok(());
        }

        let channel = self.provider.channel().await?;
        channel.rollback_transaction().await?;
        debug!("transaction rolled back");
        Ok(())
    }

    fn nesting_level(&self) -> usize {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, MockChannel, MockChannelProvider};
    use mockall::Sequence;
    use std::sync::Arc;

    fn provider_for(channel: MockChannel, fetches: usize) -> MockChannelProvider {
        let channel: Arc<dyn Channel> = Arc::new(channel);
        let mut provider = MockChannelProvider::new();
        provider
            .expect_channel()
            .times(fetches)
            .returning(move || Ok(channel.clone()));
        provider
    }

    #[tokio::test]
    async fn nested_scopes_use_one_physical_transaction() {
        let mut seq = Sequence::new();
        let mut channel = MockChannel::new();
        channel
            .expect_start_transaction()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        channel
            .expect_commit_transaction()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        channel.expect_rollback_transaction().never();

        let mut tx = TransactionCoordinator::new(provider_for(channel, 2));

        for _ in 0..3 {
            tx.begin().await.unwrap();
        }
        assert_eq!(tx.nesting_level(), 3);

        // inner pair
        tx.begin().await.unwrap();
        tx.commit().await.unwrap();

        for _ in 0..3 {
            tx.commit().await.unwrap();
        }
        assert_eq!(tx.nesting_level(), 0);
    }

    #[tokio::test]
    async fn over_rollback_clamps_at_zero() {
        let mut channel = MockChannel::new();
        channel
            .expect_start_transaction()
            .times(1)
            .returning(|| Ok(()));
        channel
            .expect_rollback_transaction()
            .times(1)
            .returning(|| Ok(()));
        channel.expect_commit_transaction().never();

        let mut tx = TransactionCoordinator::new(provider_for(channel, 2));

        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        for _ in 0..5 {
            tx.rollback().await.unwrap();
        }

        assert_eq!(tx.nesting_level(), 0);
    }

    #[tokio::test]
    async fn commit_without_begin_is_a_noop() {
        let mut provider = MockChannelProvider::new();
        provider.expect_channel().never();

        let mut tx = TransactionCoordinator::new(provider);
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(tx.nesting_level(), 0);
    }

    #[tokio::test]
    async fn failed_start_leaves_level_untouched() {
        let mut channel = MockChannel::new();
        channel
            .expect_start_transaction()
            .times(1)
            .returning(|| Err(MessagingError::TransactionError("tx.select".to_owned())));

        let mut tx = TransactionCoordinator::new(provider_for(channel, 1));

        let err = tx.begin().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tx.nesting_level(), 0);
    }

    #[tokio::test]
    async fn handle_is_fetched_for_every_physical_action() {
        let mut provider = MockChannelProvider::new();
        provider.expect_channel().times(2).returning(|| {
            let mut channel = MockChannel::new();
            channel.expect_start_transaction().returning(|| Ok(()));
            channel.expect_commit_transaction().returning(|| Ok(()));
            Ok(Arc::new(channel) as Arc<dyn Channel>)
        });

        let mut tx = TransactionCoordinator::new(provider);
        tx.begin().await.unwrap();
        tx.commit().await.unwrap();
    }
}
