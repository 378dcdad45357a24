//! Standalone client facade.
//!
//! Wraps a [`Pool`] for plain single-node deployments and adds the one
//! dedicated pub/sub sibling connection. Subscriptions must not share a
//! pooled connection (pushes would interleave with other callers'
//! replies), so the first subscribe lazily opens the sibling, and `quit`
//! is the only operation that issues a command on both physical
//! connections.

use tracing::debug;

use crate::command::Command;
use crate::config::{ConnectionConfig, PoolConfig};
use crate::connection::{ConnState, Connection, PushReceiver};
use crate::error::{DriverError, ServerError};
use crate::pool::Pool;
use crate::resp::RespValue;

/// Pool-backed client for a single node.
pub struct Client {
    pool: Pool,
    config: ConnectionConfig,
    subscriber: tokio::sync::Mutex<Option<Connection>>,
}

impl Client {
    /// Builds the client and verifies the server is reachable by cycling
    /// one pooled connection.
    pub async fn connect(
        config: ConnectionConfig,
        pool_config: PoolConfig,
    ) -> Result<Client, DriverError> {
        let client = Client::new(config, pool_config);
        drop(client.pool.acquire().await?);
        Ok(client)
    }

    /// Builds the client without dialing anything yet.
    pub fn new(config: ConnectionConfig, pool_config: PoolConfig) -> Client {
        Client {
            pool: Pool::new(config.clone(), pool_config),
            config,
            subscriber: tokio::sync::Mutex::new(None),
        }
    }

    /// Sends one command on a pooled connection. Store error replies come
    /// back as [`DriverError::Server`].
    pub async fn send(&self, command: Command) -> Result<RespValue, DriverError> {
        let mut conn = self.pool.acquire().await?;
        match conn.send(command).await? {
            RespValue::Error(line) => Err(DriverError::Server(ServerError::from_line(&line))),
            reply => Ok(reply),
        }
    }

    /// Pipelines a list of commands on one pooled connection and returns
    /// the replies in submission order. Store error replies stay inline as
    /// [`RespValue::Error`] values so one failed element does not discard
    /// the rest of the batch.
    pub async fn batch(&self, commands: Vec<Command>) -> Result<Vec<RespValue>, DriverError> {
        let mut pooled = self.pool.acquire().await?;
        if commands.iter().any(|command| command.is_session_mutating()) {
            pooled.mark_tainted();
        }

        let conn = pooled.connection();
        let mut pending = Vec::with_capacity(commands.len());
        for command in commands {
            pending.push(conn.dispatch(command)?);
        }
        let mut replies = Vec::with_capacity(pending.len());
        for response in pending {
            replies.push(response.wait().await?);
        }
        Ok(replies)
    }

    /// Subscribes to exact channels on the dedicated pub/sub sibling.
    pub async fn subscribe(&self, channels: Vec<String>) -> Result<PushReceiver, DriverError> {
        let conn = self.subscriber_connection().await?;
        conn.subscribe(channels).await
    }

    /// Subscribes to glob patterns on the dedicated pub/sub sibling.
    pub async fn psubscribe(&self, patterns: Vec<String>) -> Result<PushReceiver, DriverError> {
        let conn = self.subscriber_connection().await?;
        conn.psubscribe(patterns).await
    }

    pub async fn unsubscribe(&self, channels: Vec<String>) -> Result<(), DriverError> {
        let conn = self.subscriber_connection().await?;
        conn.unsubscribe(channels).await
    }

    pub async fn punsubscribe(&self, patterns: Vec<String>) -> Result<(), DriverError> {
        let conn = self.subscriber_connection().await?;
        conn.punsubscribe(patterns).await
    }

    async fn subscriber_connection(&self) -> Result<Connection, DriverError> {
        let mut slot = self.subscriber.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.state() != ConnState::Disconnected {
                return Ok(conn.clone());
            }
            debug!("pub/sub sibling died; redialing");
        }
        let conn = Connection::connect(self.config.clone()).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Sends `QUIT` on a pooled connection and on the pub/sub sibling,
    /// the only command issued to two physical connections, then shuts
    /// the pool down.
    pub async fn quit(&self) -> Result<(), DriverError> {
        if let Ok(mut conn) = self.pool.acquire().await {
            let _ = conn.send(Command::new("QUIT")).await;
            conn.mark_tainted();
        }

        let sibling = self.subscriber.lock().await.take();
        if let Some(conn) = sibling {
            let _ = conn.send(Command::new("QUIT")).await;
            conn.close().await;
        }

        self.pool.close();
        Ok(())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
