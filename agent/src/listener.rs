//! Capture entry point.
//!
//! [`CaptureListener::on_event`] is invoked once per raw notification handed
//! over by the platform. It normalizes the event, applies the filter policy
//! and, when accepted, persists a new delivery and wakes the dispatcher. It
//! never performs network I/O.
//!
//! [`CaptureListener::on_spool_lines`] feeds a batch of spool lines through
//! `on_event` in order and stops at the first storage failure, so the caller
//! can re-read from that line instead of losing it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::filter::{decide, FilterDecision};
use crate::log_sink::LogSink;
use crate::parser::{parse_line, ParseError, RawNotification};
use crate::store::{DeliveryStore, StoreError};
use crate::types::{DeliveryPayload, LogKind, NotificationEvent};
use crate::watcher::SpoolLine;

/// Errors returned to the capture callback.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The raw notification could not be normalized.
    #[error("unusable notification: {0}")]
    Parse(#[from] ParseError),

    /// The delivery could not be persisted.
    #[error("failed to queue notification: {0}")]
    Store(#[from] StoreError),
}

/// What happened to a captured notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Persisted as a new delivery with this id.
    Queued(i64),
    /// Rejected by the filter policy.
    Filtered,
}

/// How far a batch of spool lines got.
#[derive(Debug)]
pub enum SpoolProgress {
    /// Every line was handled; the file is consumed up to `offset`.
    Complete { offset: u64 },
    /// Persisting the line starting at `offset` failed. That line and every
    /// line after it must be read again.
    Interrupted { offset: u64, error: StoreError },
}

impl SpoolProgress {
    /// Offset up to which the file has been handled.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Complete { offset } | Self::Interrupted { offset, .. } => *offset,
        }
    }
}

/// Receives captured notifications and turns accepted ones into deliveries.
#[derive(Debug, Clone)]
pub struct CaptureListener {
    store: DeliveryStore,
    log: LogSink,
    config: ConfigHandle,
    wake: Arc<Notify>,
}

impl CaptureListener {
    /// `wake` is notified after every successful enqueue; share it with the
    /// dispatcher.
    #[must_use]
    pub fn new(store: DeliveryStore, config: ConfigHandle, wake: Arc<Notify>) -> Self {
        Self {
            log: LogSink::new(store.clone()),
            store,
            config,
            wake,
        }
    }

    /// Handles one raw notification from the platform.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Parse`] when the notification has no usable
    /// source package or timestamp, and [`CaptureError::Store`] when it was
    /// accepted but could not be persisted.
    pub async fn on_event(&self, raw: RawNotification) -> Result<CaptureOutcome, CaptureError> {
        let event = raw.normalize(Utc::now()).inspect_err(|e| {
            warn!(error = %e, "Dropping notification that could not be normalized");
        })?;
        self.on_notification(event).await
    }

    /// Handles the lines of one spool read, in order.
    ///
    /// Malformed lines and notifications without a usable source are skipped.
    /// `batch_end` is the offset just past the last consumed newline.
    pub async fn on_spool_lines(
        &self,
        path: &Path,
        lines: &[SpoolLine],
        batch_end: u64,
    ) -> SpoolProgress {
        for line in lines {
            let raw = match parse_line(&line.text) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), offset = line.start, error = %e, "Skipping malformed spool line");
                    continue;
                }
            };

            match self.on_event(raw).await {
                Ok(_) | Err(CaptureError::Parse(_)) => {}
                Err(CaptureError::Store(error)) => {
                    return SpoolProgress::Interrupted {
                        offset: line.start,
                        error,
                    };
                }
            }
        }

        SpoolProgress::Complete { offset: batch_end }
    }

    /// Handles an already normalized notification.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Store`] when an accepted notification could not
    /// be persisted. An `ERROR` log entry is attempted first.
    pub async fn on_notification(
        &self,
        event: NotificationEvent,
    ) -> Result<CaptureOutcome, CaptureError> {
        let config = self.config.current();

        if decide(&event, &config) == FilterDecision::Reject {
            debug!(source = %event.source_package, "Notification filtered out");
            if config.log_filtered {
                self.log
                    .record(
                        LogKind::Info,
                        format!("Ignored notification from {}", event.source_package),
                    )
                    .await;
            }
            return Ok(CaptureOutcome::Filtered);
        }

        let payload = DeliveryPayload::from_event(&event);
        let id = match self.store.enqueue(&payload, Utc::now()).await {
            Ok(id) => id,
            Err(e) => {
                self.log
                    .record(
                        LogKind::Error,
                        format!(
                            "Failed to queue notification from {}: {e}",
                            event.source_package
                        ),
                    )
                    .await;
                return Err(e.into());
            }
        };

        self.log
            .record(
                LogKind::Queued,
                format!(
                    "Queued notification from {}: {}",
                    event.source_package,
                    display_title(&event.title)
                ),
            )
            .await;

        self.wake.notify_one();
        Ok(CaptureOutcome::Queued(id))
    }
}

fn display_title(title: &str) -> &str {
    if title.is_empty() {
        "(no title)"
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardingConfig, PackageFilter};
    use crate::types::DeliveryState;

    async fn listener(packages: &str, log_filtered: bool) -> (CaptureListener, DeliveryStore) {
        let store = DeliveryStore::open_in_memory().await.unwrap();
        let config = ForwardingConfig {
            filter_packages: PackageFilter::parse(packages),
            log_filtered,
            ..ForwardingConfig::new("https://api.example.com/hook")
        };
        let listener = CaptureListener::new(
            store.clone(),
            ConfigHandle::new(config),
            Arc::new(Notify::new()),
        );
        (listener, store)
    }

    #[tokio::test]
    async fn accepted_event_is_queued_and_logged() {
        let (listener, store) = listener("com.a", false).await;

        let outcome = listener
            .on_event(RawNotification::new("com.a", "Alice", "hi"))
            .await
            .unwrap();

        let CaptureOutcome::Queued(id) = outcome else {
            panic!("expected queued, got {outcome:?}");
        };
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.state, DeliveryState::Queued);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.payload.title, "Alice");

        let logs = store.list_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::Queued);
        assert!(logs[0].message.contains("com.a"));
    }

    #[tokio::test]
    async fn rejected_event_leaves_no_trace_by_default() {
        let (listener, store) = listener("com.a", false).await;

        let outcome = listener
            .on_event(RawNotification::new("com.c", "t", "b"))
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::Filtered);
        assert!(store.list_deliveries(None).await.unwrap().is_empty());
        assert!(store.list_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_event_logs_info_when_enabled() {
        let (listener, store) = listener("com.a", true).await;

        listener
            .on_event(RawNotification::new("com.c", "t", "b"))
            .await
            .unwrap();

        assert!(store.list_deliveries(None).await.unwrap().is_empty());
        let logs = store.list_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::Info);
    }

    #[tokio::test]
    async fn event_without_package_is_an_error() {
        let (listener, store) = listener("com.a", false).await;

        let err = listener
            .on_event(RawNotification::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::Parse(ParseError::MissingSourcePackage)));
        assert!(store.list_deliveries(None).await.unwrap().is_empty());
    }

    fn spool_lines(texts: &[&str]) -> Vec<SpoolLine> {
        let mut start = 0;
        texts
            .iter()
            .map(|text| {
                let end = start + text.len() as u64 + 1;
                let line = SpoolLine {
                    text: (*text).to_string(),
                    start,
                    end,
                };
                start = end;
                line
            })
            .collect()
    }

    #[tokio::test]
    async fn spool_batch_skips_unusable_lines() {
        let (listener, store) = listener("com.a", false).await;
        let lines = spool_lines(&[
            r#"{"packageName":"com.a","title":"one","text":"b"}"#,
            "not json",
            r#"{"title":"no package"}"#,
            r#"{"packageName":"com.a","title":"two","text":"b"}"#,
        ]);
        let batch_end = lines[3].end;

        let progress = listener
            .on_spool_lines(Path::new("a.jsonl"), &lines, batch_end)
            .await;

        assert!(matches!(progress, SpoolProgress::Complete { offset } if offset == batch_end));
        assert_eq!(store.list_deliveries(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn store_failure_stops_batch_at_the_failed_line() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("notirelay.db");
        let config = ForwardingConfig {
            filter_packages: PackageFilter::parse("com.a"),
            ..ForwardingConfig::new("https://api.example.com/hook")
        };
        let lines = spool_lines(&[
            r#"{"packageName":"com.c","title":"filtered","text":"b"}"#,
            r#"{"packageName":"com.a","title":"kept","text":"b"}"#,
            r#"{"packageName":"com.a","title":"after","text":"b"}"#,
        ]);
        let batch_end = lines[2].end;

        let store = DeliveryStore::open(&db).await.unwrap();
        let listener = CaptureListener::new(
            store.clone(),
            ConfigHandle::new(config.clone()),
            Arc::new(Notify::new()),
        );
        store.close().await;

        let progress = listener
            .on_spool_lines(Path::new("a.jsonl"), &lines, batch_end)
            .await;
        let SpoolProgress::Interrupted { offset, .. } = progress else {
            panic!("expected an interrupted batch, got {progress:?}");
        };
        assert_eq!(offset, lines[1].start);

        // Re-reading from the failed line once storage is back loses nothing.
        let store = DeliveryStore::open(&db).await.unwrap();
        let listener =
            CaptureListener::new(store.clone(), ConfigHandle::new(config), Arc::new(Notify::new()));
        let retry: Vec<SpoolLine> = lines.into_iter().filter(|line| line.start >= offset).collect();
        let progress = listener
            .on_spool_lines(Path::new("a.jsonl"), &retry, batch_end)
            .await;
        assert_eq!(progress.offset(), batch_end);

        let titles: Vec<String> = store
            .list_deliveries(None)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.payload.title)
            .collect();
        assert_eq!(titles, vec!["kept", "after"]);
        store.close().await;
    }

    #[tokio::test]
    async fn enqueue_wakes_dispatcher() {
        let store = DeliveryStore::open_in_memory().await.unwrap();
        let wake = Arc::new(Notify::new());
        let mut config = ForwardingConfig::new("https://api.example.com/hook");
        config.forward_all_apps = true;
        let listener = CaptureListener::new(store, ConfigHandle::new(config), Arc::clone(&wake));

        listener
            .on_event(RawNotification::new("com.any", "t", "b"))
            .await
            .unwrap();

        // notify_one stores a permit when nobody is waiting yet.
        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn configuration_changes_apply_to_next_event() {
        let store = DeliveryStore::open_in_memory().await.unwrap();
        let handle = ConfigHandle::new(ForwardingConfig::new("https://api.example.com/hook"));
        let listener = CaptureListener::new(store, handle.clone(), Arc::new(Notify::new()));

        let raw = RawNotification::new("com.a", "t", "b");
        assert_eq!(
            listener.on_event(raw.clone()).await.unwrap(),
            CaptureOutcome::Filtered
        );

        let mut updated = ForwardingConfig::new("https://api.example.com/hook");
        updated.filter_packages = PackageFilter::parse("com.a");
        handle.replace(updated);

        assert!(matches!(
            listener.on_event(raw).await.unwrap(),
            CaptureOutcome::Queued(_)
        ));
    }
}
