//! Operations on the `pending_deliveries` table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{duration_millis, from_millis, to_millis, DeliveryStore, Result, StoreError};
use crate::types::{DeliveryPayload, DeliveryState, PendingDelivery};

const DELIVERY_COLUMNS: &str = "id, payload, state, attempt_count, next_attempt_at, \
                                created_at, last_updated_at, last_error";

/// Result of a finished attempt, applied by [`DeliveryStore::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The endpoint accepted the delivery.
    Delivered,
    /// The attempt failed and will be retried at `next_attempt_at`.
    Retry {
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// The delivery is dead-lettered.
    Abandoned { error: String },
}

impl Completion {
    fn state(&self) -> DeliveryState {
        match self {
            Self::Delivered => DeliveryState::Delivered,
            Self::Retry { .. } => DeliveryState::Failed,
            Self::Abandoned { .. } => DeliveryState::Abandoned,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    payload: String,
    state: String,
    attempt_count: i64,
    next_attempt_at: i64,
    created_at: i64,
    last_updated_at: i64,
    last_error: Option<String>,
}

impl TryFrom<DeliveryRow> for PendingDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        let state = row
            .state
            .parse::<DeliveryState>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("attempt_count {}", row.attempt_count)))?;

        Ok(Self {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            state,
            attempt_count,
            next_attempt_at: from_millis("next_attempt_at", row.next_attempt_at)?,
            created_at: from_millis("created_at", row.created_at)?,
            last_updated_at: from_millis("last_updated_at", row.last_updated_at)?,
            last_error: row.last_error,
        })
    }
}

impl DeliveryStore {
    /// Inserts a new `Queued` delivery, due immediately.
    ///
    /// Returns the assigned id. Ids increase monotonically and are never reused.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn enqueue(&self, payload: &DeliveryPayload, now: DateTime<Utc>) -> Result<i64> {
        let body = serde_json::to_string(payload)?;
        let now = to_millis(now);

        let _guard = self.write_lock.lock().await;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pending_deliveries \
             (delivery_key, payload, state, attempt_count, next_attempt_at, created_at, last_updated_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?) RETURNING id",
        )
        .bind(payload.delivery_id.to_string())
        .bind(body)
        .bind(DeliveryState::Queued.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(id, source = %payload.source_package, "Enqueued delivery");
        Ok(id)
    }

    /// Leases the oldest due entry, moving it to `InFlight`.
    ///
    /// Candidates are `Queued` or `Failed` entries whose `next_attempt_at` is
    /// not after `now`; the lowest id wins. The attempt count is not touched.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn lease_due(&self, now: DateTime<Utc>) -> Result<Option<PendingDelivery>> {
        let now = to_millis(now);
        let sql = format!(
            "UPDATE pending_deliveries SET state = ?, last_updated_at = ? \
             WHERE id = ( \
                 SELECT id FROM pending_deliveries \
                 WHERE state IN (?, ?) AND next_attempt_at <= ? \
                 ORDER BY id ASC LIMIT 1 \
             ) \
             RETURNING {DELIVERY_COLUMNS}"
        );

        let _guard = self.write_lock.lock().await;
        let row = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(DeliveryState::InFlight.as_str())
            .bind(now)
            .bind(DeliveryState::Queued.as_str())
            .bind(DeliveryState::Failed.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PendingDelivery::try_from).transpose()
    }

    /// Leases one specific entry if it is `Queued` or `Failed` and due.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn lease(&self, id: i64, now: DateTime<Utc>) -> Result<Option<PendingDelivery>> {
        let now = to_millis(now);
        let sql = format!(
            "UPDATE pending_deliveries SET state = ?, last_updated_at = ? \
             WHERE id = ? AND state IN (?, ?) AND next_attempt_at <= ? \
             RETURNING {DELIVERY_COLUMNS}"
        );

        let _guard = self.write_lock.lock().await;
        let row = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(DeliveryState::InFlight.as_str())
            .bind(now)
            .bind(id)
            .bind(DeliveryState::Queued.as_str())
            .bind(DeliveryState::Failed.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PendingDelivery::try_from).transpose()
    }

    /// Records the result of an attempt on a leased entry.
    ///
    /// Increments `attempt_count` and moves the entry out of `InFlight`.
    /// Returns the updated entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotLeased`] if the entry is not `InFlight`, or
    /// another `StoreError` on storage failure.
    pub async fn complete(
        &self,
        id: i64,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<PendingDelivery> {
        let (next_attempt_at, error) = match completion {
            Completion::Delivered => (None, None),
            Completion::Retry {
                next_attempt_at,
                error,
            } => (Some(to_millis(*next_attempt_at)), Some(error.as_str())),
            Completion::Abandoned { error } => (None, Some(error.as_str())),
        };

        let sql = format!(
            "UPDATE pending_deliveries SET \
                 state = ?, \
                 attempt_count = attempt_count + 1, \
                 next_attempt_at = COALESCE(?, next_attempt_at), \
                 last_updated_at = ?, \
                 last_error = COALESCE(?, last_error) \
             WHERE id = ? AND state = ? \
             RETURNING {DELIVERY_COLUMNS}"
        );

        let _guard = self.write_lock.lock().await;
        let row = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(completion.state().as_str())
            .bind(next_attempt_at)
            .bind(to_millis(now))
            .bind(error)
            .bind(id)
            .bind(DeliveryState::InFlight.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => PendingDelivery::try_from(row),
            None => Err(StoreError::NotLeased(id)),
        }
    }

    /// Returns leases abandoned by a crashed or killed process to the queue.
    ///
    /// Every `InFlight` entry whose last update is at least `threshold` old
    /// becomes `Failed` and due at `now`. At startup call this with a zero
    /// threshold: no lease can legitimately be held before the dispatcher runs.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn recover_stale_leases(&self, now: DateTime<Utc>, threshold: Duration) -> Result<u64> {
        let now_millis = to_millis(now);
        let cutoff = now_millis.saturating_sub(duration_millis(threshold));

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE pending_deliveries \
             SET state = ?, next_attempt_at = ?, last_updated_at = ?, \
                 last_error = 'attempt interrupted before completion' \
             WHERE state = ? AND last_updated_at <= ?",
        )
        .bind(DeliveryState::Failed.as_str())
        .bind(now_millis)
        .bind(now_millis)
        .bind(DeliveryState::InFlight.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered stale delivery leases");
        }
        Ok(recovered)
    }

    /// Earliest `next_attempt_at` among entries waiting to be leased.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM pending_deliveries WHERE state IN (?, ?)",
        )
        .bind(DeliveryState::Queued.as_str())
        .bind(DeliveryState::Failed.as_str())
        .fetch_one(&self.pool)
        .await?;

        millis.map(|m| from_millis("next_attempt_at", m)).transpose()
    }

    /// Fetches one delivery by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn get(&self, id: i64) -> Result<Option<PendingDelivery>> {
        let sql = format!("SELECT {DELIVERY_COLUMNS} FROM pending_deliveries WHERE id = ?");
        let row = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PendingDelivery::try_from).transpose()
    }

    /// Lists deliveries in id order, optionally restricted to one state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn list_deliveries(&self, state: Option<DeliveryState>) -> Result<Vec<PendingDelivery>> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {DELIVERY_COLUMNS} FROM pending_deliveries WHERE state = ? ORDER BY id"
                );
                sqlx::query_as::<_, DeliveryRow>(&sql)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {DELIVERY_COLUMNS} FROM pending_deliveries ORDER BY id");
                sqlx::query_as::<_, DeliveryRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(PendingDelivery::try_from).collect()
    }

    /// Number of deliveries in each state; states without entries report zero.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn count_by_state(&self) -> Result<Vec<(DeliveryState, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM pending_deliveries GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: Vec<(DeliveryState, u64)> =
            DeliveryState::ALL.into_iter().map(|s| (s, 0)).collect();
        for (state, count) in rows {
            let state = state
                .parse::<DeliveryState>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == state) {
                slot.1 = u64::try_from(count).unwrap_or(0);
            }
        }
        Ok(counts)
    }

    /// Deletes `Delivered` and `Abandoned` entries last updated before `before`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any storage failure.
    pub async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM pending_deliveries WHERE state IN (?, ?) AND last_updated_at < ?",
        )
        .bind(DeliveryState::Delivered.as_str())
        .bind(DeliveryState::Abandoned.as_str())
        .bind(to_millis(before))
        .execute(&self.pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(pruned, "Pruned terminal deliveries");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationEvent;
    use chrono::Duration as ChronoDuration;

    fn payload(source: &str) -> DeliveryPayload {
        DeliveryPayload::from_event(&NotificationEvent::new(source, "title", "body"))
    }

    async fn store() -> DeliveryStore {
        DeliveryStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_creates_queued_entry_due_now() {
        let store = store().await;
        let now = Utc::now();
        let payload = payload("com.a");

        let id = store.enqueue(&payload, now).await.unwrap();
        let entry = store.get(id).await.unwrap().unwrap();

        assert_eq!(entry.state, DeliveryState::Queued);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.next_attempt_at.timestamp_millis(), now.timestamp_millis());
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = store().await;
        let now = Utc::now();
        let first = store.enqueue(&payload("com.a"), now).await.unwrap();
        let second = store.enqueue(&payload("com.a"), now).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn lease_due_is_fifo_and_exclusive() {
        let store = store().await;
        let now = Utc::now();
        let first = store.enqueue(&payload("com.a"), now).await.unwrap();
        let second = store.enqueue(&payload("com.b"), now).await.unwrap();

        let leased = store.lease_due(now).await.unwrap().unwrap();
        assert_eq!(leased.id, first);
        assert_eq!(leased.state, DeliveryState::InFlight);
        assert_eq!(leased.attempt_count, 0);

        let leased = store.lease_due(now).await.unwrap().unwrap();
        assert_eq!(leased.id, second);

        assert!(store.lease_due(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_by_id_leaves_older_entries_alone() {
        let store = store().await;
        let now = Utc::now();
        let older = store.enqueue(&payload("com.a"), now).await.unwrap();
        let target = store.enqueue(&payload("com.b"), now).await.unwrap();

        let leased = store.lease(target, now).await.unwrap().unwrap();
        assert_eq!(leased.id, target);
        assert_eq!(leased.state, DeliveryState::InFlight);
        assert!(store.lease(target, now).await.unwrap().is_none());

        let untouched = store.get(older).await.unwrap().unwrap();
        assert_eq!(untouched.state, DeliveryState::Queued);
        assert!(store.lease(9999, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_due_skips_entries_not_yet_due() {
        let store = store().await;
        let now = Utc::now();
        let id = store.enqueue(&payload("com.a"), now).await.unwrap();
        store.lease_due(now).await.unwrap().unwrap();

        let retry_at = now + ChronoDuration::seconds(30);
        store
            .complete(
                id,
                &Completion::Retry {
                    next_attempt_at: retry_at,
                    error: "server error: 500".to_string(),
                },
                now,
            )
            .await
            .unwrap();

        assert!(store.lease_due(now).await.unwrap().is_none());
        let leased = store.lease_due(retry_at).await.unwrap().unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.attempt_count, 1);
    }

    #[tokio::test]
    async fn complete_increments_attempts_and_sets_state() {
        let store = store().await;
        let now = Utc::now();
        let id = store.enqueue(&payload("com.a"), now).await.unwrap();

        store.lease_due(now).await.unwrap();
        let failed = store
            .complete(
                id,
                &Completion::Retry {
                    next_attempt_at: now,
                    error: "timeout".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(failed.state, DeliveryState::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        store.lease_due(now).await.unwrap();
        let delivered = store.complete(id, &Completion::Delivered, now).await.unwrap();
        assert_eq!(delivered.state, DeliveryState::Delivered);
        assert_eq!(delivered.attempt_count, 2);
        assert_eq!(delivered.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn complete_requires_a_lease() {
        let store = store().await;
        let now = Utc::now();
        let id = store.enqueue(&payload("com.a"), now).await.unwrap();

        let err = store.complete(id, &Completion::Delivered, now).await.unwrap_err();
        assert!(matches!(err, StoreError::NotLeased(n) if n == id));

        store.lease_due(now).await.unwrap();
        store
            .complete(
                id,
                &Completion::Abandoned {
                    error: "rejected with 401".to_string(),
                },
                now,
            )
            .await
            .unwrap();

        // Terminal entries cannot be completed again.
        let err = store.complete(id, &Completion::Delivered, now).await.unwrap_err();
        assert!(matches!(err, StoreError::NotLeased(_)));
        assert!(store.lease_due(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_stale_leases_respects_threshold() {
        let store = store().await;
        let leased_at = Utc::now();
        let id = store.enqueue(&payload("com.a"), leased_at).await.unwrap();
        store.lease_due(leased_at).await.unwrap();

        let soon = leased_at + ChronoDuration::seconds(10);
        let recovered = store
            .recover_stale_leases(soon, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recovered, 0);

        let later = leased_at + ChronoDuration::seconds(120);
        let recovered = store
            .recover_stale_leases(later, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.state, DeliveryState::Failed);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.next_attempt_at.timestamp_millis(), later.timestamp_millis());
    }

    #[tokio::test]
    async fn next_due_at_tracks_earliest_waiting_entry() {
        let store = store().await;
        assert!(store.next_due_at().await.unwrap().is_none());

        let now = Utc::now();
        store.enqueue(&payload("com.a"), now).await.unwrap();
        let due = store.next_due_at().await.unwrap().unwrap();
        assert_eq!(due.timestamp_millis(), now.timestamp_millis());

        store.lease_due(now).await.unwrap();
        assert!(store.next_due_at().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_by_state_reports_every_state() {
        let store = store().await;
        let now = Utc::now();
        store.enqueue(&payload("com.a"), now).await.unwrap();
        store.enqueue(&payload("com.b"), now).await.unwrap();
        store.lease_due(now).await.unwrap();

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.len(), DeliveryState::ALL.len());
        assert!(counts.contains(&(DeliveryState::Queued, 1)));
        assert!(counts.contains(&(DeliveryState::InFlight, 1)));
        assert!(counts.contains(&(DeliveryState::Delivered, 0)));
    }

    #[tokio::test]
    async fn prune_terminal_keeps_pending_work() {
        let store = store().await;
        let now = Utc::now();
        let delivered = store.enqueue(&payload("com.a"), now).await.unwrap();
        let waiting = store.enqueue(&payload("com.b"), now).await.unwrap();

        store.lease_due(now).await.unwrap();
        store.complete(delivered, &Completion::Delivered, now).await.unwrap();

        let pruned = store
            .prune_terminal(now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(delivered).await.unwrap().is_none());
        assert!(store.get(waiting).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_deliveries_filters_by_state() {
        let store = store().await;
        let now = Utc::now();
        store.enqueue(&payload("com.a"), now).await.unwrap();
        store.enqueue(&payload("com.b"), now).await.unwrap();
        store.lease_due(now).await.unwrap();

        assert_eq!(store.list_deliveries(None).await.unwrap().len(), 2);
        let queued = store
            .list_deliveries(Some(DeliveryState::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload.source_package, "com.b");
    }
}
