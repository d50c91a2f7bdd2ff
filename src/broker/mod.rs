//! Broker channel.
//!
//! Thin wrapper over redis providing the operations the core needs: FIFO
//! lists for the write-behind queue, key/value with TTL for task status, and
//! atomic counters for the per-user semaphores. All methods go through a
//! `ConnectionManager`, which reconnects transparently.

pub mod keys;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Connection(redis::RedisError),
    #[error("broker command failed: {0}")]
    Command(#[from] redis::RedisError),
}

#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(BrokerError::Connection)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(BrokerError::Connection)?;

        log::info!("broker connected at {}", url);
        Ok(Self { conn })
    }

    /// Push one item to the producer end of a list.
    pub async fn lpush(&self, list: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(list, value).await?;
        Ok(())
    }

    /// Push a batch to the producer end of a list in one pipelined round trip.
    pub async fn lpush_many(&self, list: &str, values: &[String]) -> Result<(), BrokerError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for value in values {
            pipe.lpush(list, value).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Push a batch to the consumer end of a list, pipelined. Used to requeue
    /// popped-but-uncommitted items so FIFO order is preserved.
    pub async fn rpush_many(&self, list: &str, values: &[String]) -> Result<(), BrokerError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for value in values {
            pipe.rpush(list, value).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Pop one item from the consumer end of a list. `None` when empty.
    pub async fn rpop(&self, list: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.rpop(list, None).await?;
        Ok(value)
    }

    pub async fn llen(&self, list: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    /// Set a key with a TTL in seconds.
    pub async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// All keys matching a glob pattern. Status key cardinality is bounded by
    /// (users x task types x groups), so a plain KEYS scan is acceptable here.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let found: Vec<String> = conn.keys(pattern).await?;
        Ok(found)
    }

    /// Atomically increment a counter, returning the new value.
    pub async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    /// Atomically decrement a counter, returning the new value.
    pub async fn decr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, 1).await?;
        Ok(value)
    }
}
