//! User-visible activity log.
//!
//! A thin facade over the store's capped `activity_log` table. Every entry is
//! also mirrored to `tracing`, so operators see the same events in the process
//! log that the user sees in `notirelay-agent logs`.

use chrono::Utc;
use tracing::{error, info};

use crate::store::{DeliveryStore, Result};
use crate::types::{LogEntry, LogKind};

/// Appends, lists, clears and exports activity log entries.
#[derive(Debug, Clone)]
pub struct LogSink {
    store: DeliveryStore,
}

impl LogSink {
    #[must_use]
    pub fn new(store: DeliveryStore) -> Self {
        Self { store }
    }

    /// Appends an entry stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the entry could not be persisted.
    pub async fn append(&self, kind: LogKind, message: impl AsRef<str>) -> Result<LogEntry> {
        let message = message.as_ref();
        match kind {
            LogKind::Error => error!(kind = %kind, "{message}"),
            _ => info!(kind = %kind, "{message}"),
        }
        self.store.append_log(kind, message, Utc::now()).await
    }

    /// Appends an entry, logging instead of propagating a storage failure.
    ///
    /// For call sites where a lost log line must not abort the operation.
    pub async fn record(&self, kind: LogKind, message: impl AsRef<str>) {
        if let Err(e) = self.append(kind, message).await {
            error!(error = %e, "Failed to persist activity log entry");
        }
    }

    /// Retained entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on storage failure.
    pub async fn list(&self) -> Result<Vec<LogEntry>> {
        self.store.list_logs().await
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on storage failure.
    pub async fn clear(&self) -> Result<u64> {
        self.store.clear_logs().await
    }

    /// Plain-text export, one line per entry, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on storage failure.
    pub async fn export_text(&self) -> Result<String> {
        let entries = self.list().await?;
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        Ok(out)
    }
}
