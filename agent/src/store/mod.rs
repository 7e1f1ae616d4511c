//! Durable delivery store backed by SQLite.
//!
//! The store exclusively owns every [`PendingDelivery`](crate::types::PendingDelivery)
//! and [`LogEntry`](crate::types::LogEntry) for
//! their whole lifetime. It is the single shared mutable resource of the
//! agent: the capture listener enqueues into it, the dispatcher leases from
//! and completes into it, and the log sink appends to it.
//!
//! # Tables
//!
//! | Table | Contents |
//! |-------|----------|
//! | `pending_deliveries` | Forwarding work; drains as entries reach a terminal state and are pruned |
//! | `activity_log` | Capped at [`LOG_CAPACITY`] rows, oldest evicted first |
//! | `spool_offsets` | Read position of each notification spool file |
//!
//! # Atomicity
//!
//! Every mutating operation runs under an in-process write lock and in a
//! single statement or transaction, so concurrent callers never observe
//! partial updates. Leasing is one `UPDATE ... RETURNING` statement: no two
//! callers can lease the same entry.
//!
//! Timestamps are stored as Unix epoch milliseconds.

mod activity_log;
mod deliveries;
mod spool_offsets;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use deliveries::Completion;

/// Maximum number of rows retained in the activity log.
pub const LOG_CAPACITY: usize = 100;

/// Connections kept by a file-backed store.
const MAX_CONNECTIONS: u32 = 4;

/// How long a statement waits for a lock held by another process.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// Errors raised by the delivery store.
///
/// Every variant is a local persistence failure; callers log it and retry on
/// the next cycle. None of them is fatal to the process.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite returned an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the schema failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Creating the database directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `complete` was called for an entry that is not currently leased.
    #[error("delivery {0} is not in flight")]
    NotLeased(i64),

    /// A row holds a value the agent cannot interpret.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the durable store.
///
/// Cheap to clone; all clones share one connection pool and one write lock.
/// Construct it once at process start and pass it to the listener and the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct DeliveryStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl DeliveryStore {
    /// Opens (creating if necessary) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the parent directory cannot be created, the
    /// database cannot be opened, or migrations fail.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened delivery store");

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database. Contents vanish when the store is dropped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if SQLite cannot be initialized.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Delivery store schema is up to date");

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {millis}")))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_schema() {
        let store = DeliveryStore::open_in_memory().await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&store.pool)
                .await
                .unwrap();

        assert!(tables.contains(&"pending_deliveries".to_string()));
        assert!(tables.contains(&"activity_log".to_string()));
        assert!(tables.contains(&"spool_offsets".to_string()));
    }

    #[tokio::test]
    async fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notirelay.db");

        let store = DeliveryStore::open(&path).await.unwrap();
        store.close().await;

        assert!(path.exists());
    }

    #[test]
    fn millis_round_trip() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        assert_eq!(from_millis("t", to_millis(now)).unwrap(), now);
    }

    #[test]
    fn out_of_range_millis_is_corrupt() {
        assert!(matches!(
            from_millis("created_at", i64::MAX),
            Err(StoreError::Corrupt(_))
        ));
    }
}
