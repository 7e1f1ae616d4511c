//! Parser for notification spool lines.
//!
//! A platform bridge appends one JSON object per captured notification to a
//! `*.jsonl` spool file. Bridges differ in how they name fields, so the raw
//! shape is deliberately loose:
//!
//! | Field | Accepted names | Notes |
//! |-------|----------------|-------|
//! | source package | `sourcePackage`, `packageName`, `package` | required |
//! | title | `title` | defaults to empty |
//! | body | `body`, `text` | defaults to empty |
//! | posted time | `postedAt` | epoch millis or RFC 3339; defaults to now |
//!
//! Unknown fields are ignored.
//!
//! ```
//! use chrono::Utc;
//! use notirelay_agent::parser::parse_line;
//!
//! let raw = parse_line(r#"{"packageName":"com.whatsapp","title":"Alice","text":"hi"}"#).unwrap();
//! let event = raw.normalize(Utc::now()).unwrap();
//! assert_eq!(event.source_package, "com.whatsapp");
//! assert_eq!(event.body, "hi");
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::types::NotificationEvent;

/// Errors produced while turning a spool line into a [`NotificationEvent`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The notification names no source package.
    #[error("notification has no source package")]
    MissingSourcePackage,

    #[error("invalid postedAt value: {0}")]
    InvalidTimestamp(String),
}

/// Posted time as supplied by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PostedAt {
    EpochMillis(i64),
    Text(String),
}

impl PostedAt {
    fn resolve(&self) -> Result<DateTime<Utc>, ParseError> {
        match self {
            Self::EpochMillis(millis) => DateTime::from_timestamp_millis(*millis)
                .ok_or_else(|| ParseError::InvalidTimestamp(millis.to_string())),
            Self::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ParseError::InvalidTimestamp(text.clone())),
        }
    }
}

/// A notification exactly as the platform handed it over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    #[serde(default, alias = "packageName", alias = "package")]
    pub source_package: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default, alias = "text")]
    pub body: Option<String>,

    #[serde(default)]
    pub posted_at: Option<PostedAt>,
}

impl RawNotification {
    /// Convenience constructor for callers that already have clean fields.
    #[must_use]
    pub fn new(
        source_package: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            source_package: Some(source_package.into()),
            title: Some(title.into()),
            body: Some(body.into()),
            posted_at: None,
        }
    }

    /// Trims every text field and resolves the capture time.
    ///
    /// `now` is used when the bridge supplied no posted time.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MissingSourcePackage`] when the package is absent
    /// or blank, and [`ParseError::InvalidTimestamp`] for an unreadable
    /// `postedAt`.
    pub fn normalize(self, now: DateTime<Utc>) -> Result<NotificationEvent, ParseError> {
        let source_package = self
            .source_package
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingSourcePackage)?
            .to_string();

        let captured_at = match &self.posted_at {
            Some(posted_at) => posted_at.resolve()?,
            None => now,
        };

        Ok(NotificationEvent {
            source_package,
            title: trimmed(self.title),
            body: trimmed(self.body),
            captured_at,
        })
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Parses a single spool line.
///
/// # Errors
///
/// Returns [`ParseError::InvalidJson`] if the line is not a JSON object of the
/// expected shape.
pub fn parse_line(line: &str) -> Result<RawNotification, ParseError> {
    Ok(serde_json::from_str(line)?)
}
