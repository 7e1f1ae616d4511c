//! Operations on the capped `activity_log` table.

use chrono::{DateTime, Utc};

use super::{from_millis, to_millis, DeliveryStore, Result, StoreError, LOG_CAPACITY};
use crate::types::{LogEntry, LogKind};

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    timestamp: i64,
    message: String,
    kind: String,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            timestamp: from_millis("timestamp", row.timestamp)?,
            message: row.message,
            kind: row
                .kind
                .parse::<LogKind>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        })
    }
}

impl DeliveryStore {
    /// Appends an entry and evicts the oldest ones beyond [`LOG_CAPACITY`].
    ///
    /// Insert and eviction commit together.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn append_log(
        &self,
        kind: LogKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<LogEntry> {
        let timestamp = to_millis(now);

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO activity_log (timestamp, message, kind) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(timestamp)
        .bind(message)
        .bind(kind.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM activity_log WHERE id NOT IN \
             (SELECT id FROM activity_log ORDER BY id DESC LIMIT ?)",
        )
        .bind(LOG_CAPACITY as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(LogEntry {
            id,
            timestamp: from_millis("timestamp", timestamp)?,
            message: message.to_string(),
            kind,
        })
    }

    /// Every retained entry, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn list_logs(&self) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, timestamp, message, kind FROM activity_log ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }

    /// Removes every entry and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn clear_logs(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activity_log")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
