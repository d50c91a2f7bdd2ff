//! Embedded relational store.
//!
//! A bounded pool of sqlite handles with WAL concurrency (many readers, one
//! writer). Acquisition is time-boxed: when the pool is exhausted the store
//! hands out a fresh ephemeral connection instead of blocking, so a stalled
//! writer can never wedge the whole runtime. Multi-row write paths run inside
//! explicit transactions; a dropped transaction rolls back exactly once.

pub mod schema;

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Pool exhausted and the ephemeral fallback failed too.
    #[error("store unavailable: {0}")]
    Unavailable(sqlx::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Handle to the embedded store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    connect_options: SqliteConnectOptions,
    /// In-memory stores must never fall back to a fresh connection: it
    /// would see an empty database.
    ephemeral_fallback: bool,
}

impl Store {
    /// Open (creating if missing) the store file and run the seed script.
    pub async fn open(
        path: &Path,
        pool_size: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(sqlx::Error::Io(e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(acquire_timeout)
            .connect_with(connect_options.clone())
            .await?;

        schema::run_migrations(&pool).await?;

        log::info!(
            "store opened at {} (pool size {})",
            path.display(),
            pool_size
        );

        Ok(Self {
            pool,
            connect_options,
            ephemeral_fallback: true,
        })
    }

    /// In-memory store for tests. Single connection so every operation sees
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options.clone())
            .await?;

        schema::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            connect_options,
            ephemeral_fallback: false,
        })
    }

    /// The underlying pool, for plain reads.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire a handle, falling back to an ephemeral connection when the
    /// pool times out. A failed transaction discards the handle either way:
    /// pooled connections are closed by sqlx when returned in a broken state,
    /// ephemeral ones are dropped with the handle.
    pub async fn acquire(&self) -> Result<StoreHandle, StoreError> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(StoreHandle::Pooled(conn)),
            Err(sqlx::Error::PoolTimedOut) if self.ephemeral_fallback => {
                log::warn!("store pool exhausted, opening ephemeral connection");
                let conn = SqliteConnection::connect_with(&self.connect_options)
                    .await
                    .map_err(StoreError::Unavailable)?;
                Ok(StoreHandle::Ephemeral(conn))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A pooled or ephemeral sqlite handle. Both deref to the raw connection so
/// callers can `begin()` transactions and run queries without caring which
/// kind they got.
pub enum StoreHandle {
    Pooled(PoolConnection<Sqlite>),
    Ephemeral(SqliteConnection),
}

impl StoreHandle {
    pub async fn begin(
        &mut self,
    ) -> Result<sqlx::Transaction<'_, Sqlite>, StoreError> {
        Ok(Connection::begin(&mut **self).await?)
    }
}

impl Deref for StoreHandle {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            StoreHandle::Pooled(conn) => conn,
            StoreHandle::Ephemeral(conn) => conn,
        }
    }
}

impl DerefMut for StoreHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            StoreHandle::Pooled(conn) => conn,
            StoreHandle::Ephemeral(conn) => conn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_and_accepts_rows() {
        let store = Store::in_memory().await.expect("open store");

        sqlx::query(
            "INSERT INTO accounts (group_id, email, password, status) VALUES (?, ?, ?, ?)",
        )
        .bind("g1")
        .bind("a@example.com")
        .bind("pw")
        .bind("not-logged-in")
        .execute(store.pool())
        .await
        .expect("insert account");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn transactions_roll_back_on_drop() {
        let store = Store::in_memory().await.expect("open store");

        {
            let mut conn = store.acquire().await.expect("acquire");
            let mut tx = conn.begin().await.expect("begin");
            sqlx::query(
                "INSERT INTO accounts (group_id, email, password, status) VALUES (?, ?, ?, ?)",
            )
            .bind("g1")
            .bind("a@example.com")
            .bind("pw")
            .bind("not-logged-in")
            .execute(&mut *tx)
            .await
            .expect("insert");
            // dropped without commit
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mailhub.db");

        {
            let store = Store::open(&path, 4, Duration::from_secs(5))
                .await
                .expect("open");
            sqlx::query(
                "INSERT INTO accounts (group_id, email, password, status) \
                 VALUES ('g1', 'a@example.com', 'pw', 'success')",
            )
            .execute(store.pool())
            .await
            .expect("insert");
            store.close().await;
        }

        let store = Store::open(&path, 4, Duration::from_secs(5))
            .await
            .expect("reopen");
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn pool_exhaustion_falls_back_to_ephemeral() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mailhub.db");
        let store = Store::open(&path, 1, Duration::from_millis(200))
            .await
            .expect("open");

        let _held = store.acquire().await.expect("first handle");
        let second = store.acquire().await.expect("fallback handle");
        assert!(matches!(second, StoreHandle::Ephemeral(_)));
    }

    #[tokio::test]
    async fn duplicate_msg_uid_is_ignored() {
        let store = Store::in_memory().await.expect("open store");

        for _ in 0..2 {
            sqlx::query(
                "INSERT OR IGNORE INTO mail_message (group_id, msg_uid, subject, from_addr, from_name, to_joined, flags, snippet)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind("g1")
            .bind("uid-1")
            .bind("hello")
            .bind("x@example.com")
            .bind("X")
            .bind("")
            .bind("UNREAD")
            .bind("")
            .execute(store.pool())
            .await
            .expect("insert");
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_message")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }
}
