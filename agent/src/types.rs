//! Domain types for notification capture and delivery.
//!
//! This module defines the records that flow through the agent: the ephemeral
//! [`NotificationEvent`] produced by capture, the [`DeliveryPayload`] sent to the
//! endpoint, the persisted [`PendingDelivery`] and the capped activity
//! [`LogEntry`]. Everything that crosses the wire serializes to camelCase JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A captured notification after normalization.
///
/// Never persisted as-is: once accepted by the filter only its
/// [`DeliveryPayload`] projection is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Identifier of the application that posted the notification.
    pub source_package: String,
    pub title: String,
    pub body: String,
    /// When the platform handed the notification over.
    pub captured_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Creates an event captured now.
    #[must_use]
    pub fn new(
        source_package: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            source_package: source_package.into(),
            title: title.into(),
            body: body.into(),
            captured_at: Utc::now(),
        }
    }
}

/// JSON body posted to the endpoint for one delivery.
///
/// `delivery_id` is stable across retries of the same delivery so the
/// receiving side can de-duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub delivery_id: Uuid,
    pub source_package: String,
    pub title: String,
    pub body: String,
    pub captured_at: DateTime<Utc>,
}

impl DeliveryPayload {
    /// Projects an accepted event into the shape that is persisted and sent.
    #[must_use]
    pub fn from_event(event: &NotificationEvent) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            source_package: event.source_package.clone(),
            title: event.title.clone(),
            body: event.body.clone(),
            captured_at: event.captured_at,
        }
    }
}

/// Lifecycle state of a [`PendingDelivery`].
///
/// Transitions only move forward: `Queued -> InFlight -> {Delivered | Failed |
/// Abandoned}` and `Failed -> InFlight` for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    InFlight,
    Delivered,
    Failed,
    Abandoned,
}

impl DeliveryState {
    /// All states, in lifecycle order.
    pub const ALL: [DeliveryState; 5] = [
        DeliveryState::Queued,
        DeliveryState::InFlight,
        DeliveryState::Delivered,
        DeliveryState::Failed,
        DeliveryState::Abandoned,
    ];

    /// Column value used by the store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Returns `true` for states that will never be dispatched again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Abandoned)
    }

    /// Returns `true` for states the dispatcher may lease.
    #[must_use]
    pub fn is_leasable(&self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored state or log kind string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl FromStr for DeliveryState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "delivery state",
                value: s.to_string(),
            })
    }
}

/// A unit of forwarding work owned by the delivery store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    /// Monotonically assigned row id; lower ids are leased first.
    pub id: i64,
    pub payload: DeliveryPayload,
    pub state: DeliveryState,
    /// Number of attempts made so far.
    pub attempt_count: u32,
    /// The entry is not eligible for dispatch before this instant.
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Description of the most recent failed attempt, if any.
    pub last_error: Option<String>,
}

/// Classification of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Success,
    Error,
    Info,
    Queued,
}

impl LogKind {
    /// Column value used by the store; also used in exported text.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::Queued => "QUEUED",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Success, Self::Error, Self::Info, Self::Queued]
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "log kind",
                value: s.to_string(),
            })
    }
}

/// One row of the capped activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub kind: LogKind,
}

impl LogEntry {
    /// Renders the entry as a single line of exported text.
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use notirelay_agent::types::{LogEntry, LogKind};
    ///
    /// let entry = LogEntry {
    ///     id: 1,
    ///     timestamp: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ///     message: "Delivered notification from com.whatsapp".to_string(),
    ///     kind: LogKind::Success,
    /// };
    /// assert_eq!(
    ///     entry.to_line(),
    ///     "2026-01-15 10:00:00 [SUCCESS] Delivered notification from com.whatsapp"
    /// );
    /// ```
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.message
        )
    }
}
