// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! This module defines the transactional resource the [`TransactionCoordinator`]
//! drives, and the provider it asks for a fresh handle each time it needs to
//! act. It also provides the RabbitMQ implementations built on `lapin`: the
//! connection helper, a channel adapter and a provider that reopens a channel
//! once the previous one was closed.
//!
//! [`TransactionCoordinator`]: crate::transaction::TransactionCoordinator

use crate::{configs::AmqpConfigs, errors::MessagingError};
use async_trait::async_trait;
use lapin::{options::BasicQosOptions, types::LongString, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// A broker channel able to run a physical transaction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    async fn start_transaction(&self) -> Result<(), MessagingError>;

    async fn commit_transaction(&self) -> Result<(), MessagingError>;

    async fn rollback_transaction(&self) -> Result<(), MessagingError>;

    fn prefetch_count(&self) -> u16;

    async fn set_prefetch_count(&self, count: u16) -> Result<(), MessagingError>;
}

/// Hands out the channel to act on.
///
/// Callers must not keep the returned handle between operations: the
/// provider may pool channels or reopen them after a disconnect.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn channel(&self) -> Result<Arc<dyn Channel>, MessagingError>;
}

/// A provider that always returns the same channel.
#[derive(Clone)]
pub struct SharedChannel(Arc<dyn Channel>);

impl SharedChannel {
    pub fn new(channel: Arc<dyn Channel>) -> SharedChannel {
        SharedChannel(channel)
    }
}

#[async_trait]
impl ChannelProvider for SharedChannel {
    async fn channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        Ok(self.0.clone())
    }
}

/// Opens a connection to RabbitMQ and creates a channel on it.
///
/// Both the connection and channel are wrapped in Arc for thread-safe sharing.
///
/// # Parameters
/// * `cfg` - Broker address, credentials and the connection name
///
/// # Returns
/// A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &AmqpConfigs,
) -> Result<(Arc<Connection>, Arc<lapin::Channel>), MessagingError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(MessagingError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    let channel = open_channel(&conn).await?;
    Ok((Arc::new(conn), channel))
}

async fn open_channel(conn: &Connection) -> Result<Arc<lapin::Channel>, MessagingError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(MessagingError::ChannelError(err.to_string()))
        }
    }
}

/// RabbitMQ implementation of the Channel trait.
///
/// Transactions map onto `tx.select`, `tx.commit` and `tx.rollback`. The
/// broker does not report the prefetch count back, so the last value set
/// through this adapter is remembered.
pub struct AmqpChannel {
    channel: Arc<lapin::Channel>,
    prefetch: AtomicU16,
}

impl AmqpChannel {
    pub fn new(channel: Arc<lapin::Channel>) -> AmqpChannel {
        AmqpChannel {
            channel,
            prefetch: AtomicU16::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<lapin::Channel> {
        &self.channel
    }

    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn start_transaction(&self) -> Result<(), MessagingError> {
        self.channel.tx_select().await.map_err(|err| {
            error!(error = err.to_string(), "failure to start transaction");
            MessagingError::TransactionError(err.to_string())
        })
    }

    async fn commit_transaction(&self) -> Result<(), MessagingError> {
        self.channel.tx_commit().await.map_err(|err| {
            error!(error = err.to_string(), "failure to commit transaction");
            MessagingError::TransactionError(err.to_string())
        })
    }

    async fn rollback_transaction(&self) -> Result<(), MessagingError> {
        self.channel.tx_rollback().await.map_err(|err| {
            error!(error = err.to_string(), "failure to rollback transaction");
            MessagingError::TransactionError(err.to_string())
        })
    }

    fn prefetch_count(&self) -> u16 {
        self.prefetch.load(Ordering::Acquire)
    }

    async fn set_prefetch_count(&self, count: u16) -> Result<(), MessagingError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(MessagingError::ChannelError(err.to_string()))
            }
            _ => {
                self.prefetch.store(count, Ordering::Release);
                Ok(())
            }
        }
    }
}

/// A provider that reopens the channel when the broker closed it.
pub struct AmqpChannelProvider {
    conn: Arc<Connection>,
    current: Mutex<Option<Arc<AmqpChannel>>>,
}

impl AmqpChannelProvider {
    pub fn new(conn: Arc<Connection>) -> AmqpChannelProvider {
        AmqpChannelProvider {
            conn,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelProvider for AmqpChannelProvider {
    async fn channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        let mut current = self.current.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.is_connected() {
                return Ok(channel.clone());
            }
            debug!("channel closed, reopening");
        }

        let channel = Arc::new(AmqpChannel::new(open_channel(&self.conn).await?));
        *current = Some(channel.clone());
        Ok(channel)
    }
}
