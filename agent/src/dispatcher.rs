//! Background delivery loop.
//!
//! The dispatcher leases due entries from the store and runs up to
//! `concurrency` delivery attempts at once. Every attempt ends in exactly one
//! `complete` call and one activity log entry:
//!
//! - success: `Delivered` plus a `SUCCESS` entry
//! - transient failure within the attempt budget: `Failed` with a backoff
//!   delay plus an `ERROR` entry saying it will retry
//! - permanent failure or exhausted budget: `Abandoned` plus an `ERROR` entry
//!
//! Before leasing, the dispatcher checks the forwarding configuration. While
//! the endpoint or the API key is unusable nothing is leased, so entries stay
//! `Queued` or `Failed` and no attempt is counted.
//!
//! Shutdown is driven by a [`CancellationToken`]: leasing stops at once and
//! in-flight attempts get [`DispatcherConfig::shutdown_timeout`] to finish.
//! Attempts cut off by the timeout stay `InFlight` and are returned to the
//! queue by [`DeliveryStore::recover_stale_leases`] on the next start.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{DeliveryClient, DeliveryTarget};
use crate::config::{Config, ConfigError, ConfigHandle};
use crate::log_sink::LogSink;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{Completion, DeliveryStore, StoreError};
use crate::types::{LogKind, PendingDelivery};

/// Shortest idle sleep, so a due time in the past cannot spin the loop.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(5);

/// Pause after a storage error before leasing again.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tunables of the delivery loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent attempts.
    pub concurrency: usize,
    /// Longest idle sleep between checks for due work.
    pub poll_interval: Duration,
    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long shutdown waits for in-flight attempts.
    pub shutdown_timeout: Duration,
    /// Age after which delivered and abandoned entries are pruned.
    pub retention: Duration,
    /// How often pruning runs.
    pub prune_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(20),
            retention: Duration::from_secs(24 * 3600),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

impl DispatcherConfig {
    /// Derives dispatcher settings from the process configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
            request_timeout: config.request_timeout,
            retry: RetryPolicy::with_max_attempts(config.max_attempts),
            retention: config.retention,
            ..Self::default()
        }
    }
}

/// Errors that stop the dispatcher from being built or from completing a
/// single inline step.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Leases due deliveries and attempts them against the configured endpoint.
///
/// Cheap to clone; clones share the store, the HTTP client and the wake signal.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: DeliveryStore,
    log: LogSink,
    client: DeliveryClient,
    config: ConfigHandle,
    settings: DispatcherConfig,
    wake: Arc<Notify>,
    reported_invalid: Arc<Mutex<Option<ConfigError>>>,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`DispatchError::Client`] if the HTTP client cannot be built.
    pub fn new(
        store: DeliveryStore,
        config: ConfigHandle,
        settings: DispatcherConfig,
        wake: Arc<Notify>,
    ) -> Result<Self, DispatchError> {
        let client = DeliveryClient::new(settings.request_timeout)?;
        Ok(Self {
            log: LogSink::new(store.clone()),
            store,
            client,
            config,
            settings,
            wake,
            reported_invalid: Arc::new(Mutex::new(None)),
        })
    }

    /// Runs until `cancel` fires, then drains in-flight attempts.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            concurrency = self.settings.concurrency,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            max_attempts = self.settings.retry.max_attempts,
            "Delivery dispatcher starting"
        );

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut attempts: JoinSet<()> = JoinSet::new();
        let mut config_changes = self.config.subscribe();
        let mut next_prune = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while let Some(joined) = attempts.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery attempt task failed");
                }
            }

            if Instant::now() >= next_prune {
                self.prune().await;
                next_prune = Instant::now() + self.settings.prune_interval;
            }

            let Some(target) = self.checked_target().await else {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = config_changes.changed() => {}
                    () = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            };

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.lease_due(Utc::now()).await {
                Ok(Some(entry)) => {
                    let worker = self.clone();
                    attempts.spawn(async move {
                        let _permit = permit;
                        let id = entry.id;
                        if let Err(e) = worker.attempt(entry, &target).await {
                            debug!(id, error = %e, "Delivery attempt ended without a recorded outcome");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    let wait = self.idle_wait().await;
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.wake.notified() => {}
                        _ = config_changes.changed() => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to lease due delivery");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.drain(attempts).await;
        info!("Delivery dispatcher stopped");
    }

    /// Leases and attempts at most one due delivery inline.
    ///
    /// Returns the entry as completed, or `None` when nothing was due or the
    /// forwarding configuration is unusable.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if leasing or completing fails.
    pub async fn process_due(&self) -> Result<Option<PendingDelivery>, DispatchError> {
        let Some(target) = self.checked_target().await else {
            return Ok(None);
        };
        let Some(entry) = self.store.lease_due(Utc::now()).await? else {
            return Ok(None);
        };

        Ok(Some(self.attempt(entry, &target).await?))
    }

    /// Attempts the delivery `id` inline, if it is waiting and due.
    ///
    /// Other due entries are left to the background loop.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if leasing or completing fails.
    pub async fn process_delivery(&self, id: i64) -> Result<Option<PendingDelivery>, DispatchError> {
        let Some(target) = self.checked_target().await else {
            return Ok(None);
        };
        let Some(entry) = self.store.lease(id, Utc::now()).await? else {
            return Ok(None);
        };

        Ok(Some(self.attempt(entry, &target).await?))
    }

    /// Validates the endpoint and API key, reporting each distinct problem once.
    async fn checked_target(&self) -> Option<DeliveryTarget> {
        let forwarding = self.config.current();
        let mut reported = self.reported_invalid.lock().await;

        match DeliveryTarget::from_config(&forwarding) {
            Ok(target) => {
                if reported.take().is_some() {
                    info!(endpoint = %target.url, "Forwarding configuration is valid again, resuming delivery");
                }
                Some(target)
            }
            Err(e) => {
                if reported.as_ref() != Some(&e) {
                    self.log
                        .record(LogKind::Error, format!("Delivery paused: {e}"))
                        .await;
                    *reported = Some(e);
                }
                None
            }
        }
    }

    /// One attempt on a leased entry, followed by `complete` and a log entry.
    async fn attempt(
        &self,
        entry: PendingDelivery,
        target: &DeliveryTarget,
    ) -> Result<PendingDelivery, StoreError> {
        let result = self.client.send(target, &entry.payload).await;
        let now = Utc::now();
        let attempt = entry.attempt_count + 1;
        let source = &entry.payload.source_package;

        let (completion, kind, message) = match result {
            Ok(()) => (
                Completion::Delivered,
                LogKind::Success,
                format!("Delivered notification from {source}"),
            ),
            Err(e) => match self.settings.retry.next(attempt, e.failure_kind()) {
                RetryDecision::RetryAfter(delay) => (
                    Completion::Retry {
                        next_attempt_at: later(now, delay),
                        error: e.to_string(),
                    },
                    LogKind::Error,
                    format!(
                        "Failed to deliver notification from {source} (attempt {attempt}): {e}; will retry in {}",
                        format_delay(delay)
                    ),
                ),
                RetryDecision::Abandon { reason } => (
                    Completion::Abandoned {
                        error: e.to_string(),
                    },
                    LogKind::Error,
                    format!(
                        "Gave up on notification from {source} after {attempt} attempt(s): {e} ({reason})"
                    ),
                ),
            },
        };

        let completed = match self.store.complete(entry.id, &completion, now).await {
            Ok(completed) => completed,
            Err(e) => {
                error!(id = entry.id, error = %e, "Failed to record delivery outcome");
                self.log
                    .record(
                        LogKind::Error,
                        format!("Failed to record outcome for notification from {source}: {e}"),
                    )
                    .await;
                return Err(e);
            }
        };

        debug!(
            id = completed.id,
            state = %completed.state,
            attempt_count = completed.attempt_count,
            "Delivery attempt finished"
        );
        self.log.record(kind, message).await;
        Ok(completed)
    }

    /// How long to sleep when nothing is due.
    async fn idle_wait(&self) -> Duration {
        let poll = self.settings.poll_interval;
        match self.store.next_due_at().await {
            Ok(Some(due)) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE_WAIT, poll.max(MIN_IDLE_WAIT)),
            Ok(None) => poll,
            Err(e) => {
                warn!(error = %e, "Failed to read next due time");
                poll
            }
        }
    }

    async fn prune(&self) {
        let Some(cutoff) = TimeDelta::from_std(self.settings.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return;
        };
        match self.store.prune_terminal(cutoff).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Pruned finished deliveries"),
            Err(e) => warn!(error = %e, "Failed to prune finished deliveries"),
        }
    }

    async fn drain(&self, mut attempts: JoinSet<()>) {
        if attempts.is_empty() {
            return;
        }

        info!(
            in_flight = attempts.len(),
            timeout_secs = self.settings.shutdown_timeout.as_secs(),
            "Waiting for in-flight deliveries"
        );

        let finished = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = attempts.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery attempt task failed");
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                abandoned_leases = attempts.len(),
                "Shutdown timeout reached; remaining attempts will be retried on next start"
            );
            attempts.abort_all();
        }
    }
}

fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

fn format_delay(delay: Duration) -> String {
    if delay < Duration::from_secs(1) {
        format!("{}ms", delay.as_millis())
    } else {
        format!("{}s", delay.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardingConfig;
    use crate::types::{DeliveryPayload, DeliveryState, NotificationEvent};

    async fn dispatcher(endpoint: &str) -> (Dispatcher, DeliveryStore) {
        let store = DeliveryStore::open_in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            ConfigHandle::new(ForwardingConfig::new(endpoint)),
            DispatcherConfig {
                retry: RetryPolicy::fast_for_tests(),
                ..DispatcherConfig::default()
            },
            Arc::new(Notify::new()),
        )
        .unwrap();
        (dispatcher, store)
    }

    #[test]
    fn delay_formatting() {
        assert_eq!(format_delay(Duration::from_millis(20)), "20ms");
        assert_eq!(format_delay(Duration::from_secs(4)), "4s");
    }

    #[test]
    fn from_config_carries_attempt_budget() {
        let config = Config {
            data_dir: "/tmp/n".into(),
            spool_dir: "/tmp/n/spool".into(),
            capture_enabled: true,
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(3),
            max_attempts: 7,
            retention: Duration::from_secs(60),
        };
        let settings = DispatcherConfig::from_config(&config);
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.request_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn nothing_due_is_a_no_op() {
        let (dispatcher, _store) = dispatcher("http://127.0.0.1:9/hook").await;
        assert!(dispatcher.process_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_endpoint_is_reported_once_and_leases_nothing() {
        let (dispatcher, store) = dispatcher("ftp://example.com").await;
        let payload =
            DeliveryPayload::from_event(&NotificationEvent::new("com.a", "title", "body"));
        let id = store.enqueue(&payload, Utc::now()).await.unwrap();

        assert!(dispatcher.process_due().await.unwrap().is_none());
        assert!(dispatcher.process_due().await.unwrap().is_none());

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.state, DeliveryState::Queued);
        assert_eq!(entry.attempt_count, 0);

        let logs = store.list_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::Error);
        assert!(logs[0].message.starts_with("Delivery paused"));
    }

    #[tokio::test]
    async fn run_stops_promptly_when_cancelled() {
        let (dispatcher, _store) = dispatcher("http://127.0.0.1:9/hook").await;
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
