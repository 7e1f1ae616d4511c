//! Read positions of spool files, so capture resumes where it stopped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{to_millis, DeliveryStore, Result, StoreError};

impl DeliveryStore {
    /// Every recorded spool file and its byte offset.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn spool_offsets(&self) -> Result<HashMap<PathBuf, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT path, byte_offset FROM spool_offsets")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(path, offset)| {
                let offset = u64::try_from(offset)
                    .map_err(|_| StoreError::Corrupt(format!("negative offset for {path}")))?;
                Ok((PathBuf::from(path), offset))
            })
            .collect()
    }

    /// Records how far `path` has been consumed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn save_spool_offset(&self, path: &Path, offset: u64, now: DateTime<Utc>) -> Result<()> {
        let offset = i64::try_from(offset)
            .map_err(|_| StoreError::Corrupt(format!("offset {offset} out of range")))?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO spool_offsets (path, byte_offset, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET byte_offset = excluded.byte_offset, \
             updated_at = excluded.updated_at",
        )
        .bind(path.to_string_lossy().into_owned())
        .bind(offset)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops the offset of a spool file that no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn forget_spool_offset(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM spool_offsets WHERE path = ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
