//! Redis-backed presence store.
//!
//! Holds one multiplexed connection, opened on first use. An I/O failure
//! drops it so the next call dials again; the relay keeps serving in the
//! meantime and store calls simply fail.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Cmd, ConnectionInfo, FromRedisValue, IntoConnectionInfo, RedisError};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PresenceStore, StoreError};

const DEFAULT_PORT: u16 = 6379;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// `host:port`
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    /// Upper bound on dialing Redis
    pub connect_timeout: Duration,
    /// Upper bound on a single command round trip
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "redis:6379".to_string(),
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Connection parameters for the client. A blank password counts as none.
    pub fn connection_info(&self) -> Result<ConnectionInfo, StoreError> {
        let (host, port) = match self.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    StoreError::Database(format!("invalid Redis address {:?}", self.addr))
                })?;
                (host, port)
            }
            None => (self.addr.as_str(), DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let mut info = (host, port).into_connection_info()?;
        info.redis.db = self.db;
        info.redis.password = self.password.clone().filter(|p| !p.is_empty());
        Ok(info)
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Database(e.to_string())
        }
    }
}

pub struct RedisStore {
    client: Client,
    addr: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Build the client. Does not touch the network.
    pub fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.connection_info()?)?;
        Ok(Self {
            client,
            addr: config.addr,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            conn: Mutex::new(None),
        })
    }

    /// The cached connection, or a fresh one.
    ///
    /// The slot lock is never held while dialing, so callers racing an
    /// unreachable server each fail after one connect timeout.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| StoreError::Unavailable(format!("connect to {} timed out", self.addr)))??;

        let mut slot = self.conn.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        log::info!("Connected to Redis at {}", self.addr);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        if self.conn.lock().await.take().is_some() {
            log::warn!("Dropping Redis connection to {}", self.addr);
        }
    }

    /// Run one command, discarding the connection if it failed at the I/O level.
    async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut conn = self.connection().await?;
        let result = match tokio::time::timeout(self.command_timeout, cmd.query_async::<T>(&mut conn))
            .await
        {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Unavailable("command timed out".to_string())),
        };
        if let Err(StoreError::Unavailable(_)) = &result {
            self.reset().await;
        }
        result
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        self.run::<()>(&cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.run(::redis::cmd("HGETALL").arg(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.run::<()>(::redis::cmd("HDEL").arg(key).arg(field)).await
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.run::<()>(::redis::cmd("SADD").arg(set).arg(member)).await
    }

    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.run::<()>(::redis::cmd("SREM").arg(set).arg(member)).await
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.run(::redis::cmd("SMEMBERS").arg(set)).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.run::<()>(::redis::cmd("DEL").arg(key)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let reply: String = self.run(&::redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Database(format!("unexpected PING reply: {reply}")))
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
