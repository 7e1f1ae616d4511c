//! Configuration module for the notirelay agent.
//!
//! Two kinds of configuration are read from environment variables:
//!
//! - [`Config`]: where the agent keeps its state and how the dispatcher runs.
//! - [`ForwardingConfig`]: the user-facing forwarding settings (endpoint, API
//!   key, package filter). These belong to the external configuration layer;
//!   the core only reads them through a [`ConfigHandle`].
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `NOTIRELAY_ENDPOINT_URL` | Yes (`run`, `test-send`) | - | HTTP(S) endpoint receiving notifications |
//! | `NOTIRELAY_API_KEY` | No | - | Sent as `Authorization: Bearer <key>` |
//! | `NOTIRELAY_FILTER_PACKAGES` | No | (none) | Comma-separated package identifiers to forward |
//! | `NOTIRELAY_FORWARD_ALL` | No | `false` | Forward every package, ignoring the filter |
//! | `NOTIRELAY_LOG_FILTERED` | No | `false` | Add an INFO log entry for rejected notifications |
//! | `NOTIRELAY_DATA_DIR` | No | `~/.notirelay` | Directory holding the SQLite database |
//! | `NOTIRELAY_SPOOL_DIR` | No | `<data dir>/spool` | Directory of `*.jsonl` notification spool files |
//! | `NOTIRELAY_CAPTURE_ENABLED` | No | `true` | Notification access granted; `false` disables capture |
//! | `NOTIRELAY_CONCURRENCY` | No | 4 | Maximum concurrent delivery attempts |
//! | `NOTIRELAY_POLL_INTERVAL_SECS` | No | 5 | Idle poll interval of the dispatcher |
//! | `NOTIRELAY_REQUEST_TIMEOUT_SECS` | No | 15 | Per-attempt HTTP timeout |
//! | `NOTIRELAY_MAX_ATTEMPTS` | No | 5 | Attempts before a delivery is abandoned (1-20) |
//! | `NOTIRELAY_RETENTION_HOURS` | No | 24 | How long delivered/abandoned entries are kept |
//!
//! # Example
//!
//! ```no_run
//! use notirelay_agent::config::{Config, ForwardingConfig};
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! let forwarding = ForwardingConfig::from_env().expect("Failed to load forwarding settings");
//! println!("Database: {}", config.database_path().display());
//! println!("Endpoint: {}", forwarding.endpoint_url);
//! ```

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use directories::BaseDirs;
use reqwest::header::HeaderValue;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::watch;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".notirelay";

/// Database file name inside the data directory.
const DATABASE_FILE: &str = "notirelay.db";

/// Spool directory name inside the data directory.
const DEFAULT_SPOOL_DIR: &str = "spool";

const DEFAULT_CONCURRENCY: usize = 4;
const MAX_CONCURRENCY: usize = 64;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const MIN_MAX_ATTEMPTS: u32 = 1;
const MAX_MAX_ATTEMPTS: u32 = 20;
const DEFAULT_RETENTION_HOURS: u64 = 24;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The endpoint URL is missing or is not an absolute HTTP(S) URL.
    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    /// The API key cannot be sent in an `Authorization` header.
    #[error("invalid API key: {reason}")]
    InvalidApiKey { reason: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Set of package identifiers parsed from comma-separated text.
///
/// Items are whitespace-trimmed and empty items are dropped. Matching is
/// case-sensitive.
///
/// ```
/// use notirelay_agent::config::PackageFilter;
///
/// let filter = PackageFilter::parse(" id.dana, com.whatsapp ,,");
/// assert!(filter.contains("com.whatsapp"));
/// assert!(!filter.contains("com.WhatsApp"));
/// assert_eq!(filter.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageFilter(BTreeSet<String>);

impl PackageFilter {
    /// Parses comma-separated configuration text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self(
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    #[must_use]
    pub fn contains(&self, package: &str) -> bool {
        self.0.contains(package)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PackageFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// User-facing forwarding settings.
///
/// Owned by the external configuration layer. The core never mutates or
/// persists these; it validates the endpoint only at the moment it needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingConfig {
    /// Endpoint receiving `POST` requests. Validated lazily by [`Self::endpoint`].
    pub endpoint_url: String,

    /// Optional bearer credential.
    pub api_key: Option<String>,

    /// Packages to forward when `forward_all_apps` is false.
    pub filter_packages: PackageFilter,

    /// Bypasses the package filter.
    pub forward_all_apps: bool,

    /// Emit an INFO log entry for every rejected notification.
    pub log_filtered: bool,
}

impl ForwardingConfig {
    /// Creates forwarding settings for an endpoint with everything else defaulted.
    #[must_use]
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Self::default()
        }
    }

    /// Reads forwarding settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if `NOTIRELAY_ENDPOINT_URL` is not set or a
    /// boolean variable cannot be parsed. The endpoint's format is not checked
    /// here.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint_url = env::var("NOTIRELAY_ENDPOINT_URL")
            .map_err(|_| ConfigError::MissingEnvVar("NOTIRELAY_ENDPOINT_URL".to_string()))?;

        let api_key = env::var("NOTIRELAY_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let filter_packages = env::var("NOTIRELAY_FILTER_PACKAGES")
            .map(|val| PackageFilter::parse(&val))
            .unwrap_or_default();

        Ok(Self {
            endpoint_url,
            api_key,
            filter_packages,
            forward_all_apps: parse_bool_var("NOTIRELAY_FORWARD_ALL", false)?,
            log_filtered: parse_bool_var("NOTIRELAY_LOG_FILTERED", false)?,
        })
    }

    /// Parses the endpoint as an absolute HTTP(S) URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEndpoint`] when the URL is empty,
    /// malformed, relative, or uses another scheme.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let raw = self.endpoint_url.trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("endpoint URL is empty"));
        }

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(url),
            "http" | "https" => Err(invalid("URL has no host")),
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }

    /// `Authorization` header value for the API key, if one is set.
    ///
    /// The returned value is marked sensitive so it is never printed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidApiKey`] when the key contains characters
    /// that are not allowed in an HTTP header, such as control characters.
    pub fn authorization(&self) -> Result<Option<HeaderValue>, ConfigError> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(None);
        };

        let mut value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
            ConfigError::InvalidApiKey {
                reason: "contains characters not allowed in an HTTP header".to_string(),
            }
        })?;
        value.set_sensitive(true);
        Ok(Some(value))
    }

    /// Human-readable summary for sharing settings; the API key is masked.
    #[must_use]
    pub fn summary(&self) -> String {
        let api_key = match &self.api_key {
            Some(key) if key.chars().count() > 4 => {
                let tail: String = key.chars().skip(key.chars().count() - 4).collect();
                format!("****{tail}")
            }
            Some(_) => "****".to_string(),
            None => "(not set)".to_string(),
        };
        let packages = if self.filter_packages.is_empty() {
            "(none)".to_string()
        } else {
            self.filter_packages.iter().collect::<Vec<_>>().join(", ")
        };

        format!(
            "Endpoint URL: {}\nAPI key: {}\nForward all apps: {}\nFilter packages: {}\nLog filtered: {}",
            self.endpoint_url, api_key, self.forward_all_apps, packages, self.log_filtered
        )
    }
}

/// Read-only, replaceable view of the current [`ForwardingConfig`].
///
/// The capture listener and dispatcher each hold a clone and read the latest
/// value on every event or attempt. The configuration layer publishes new
/// settings with [`ConfigHandle::replace`].
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<ForwardingConfig>>>,
    rx: watch::Receiver<Arc<ForwardingConfig>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: ForwardingConfig) -> Self {
        let (tx, rx) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Returns the current settings.
    #[must_use]
    pub fn current(&self) -> Arc<ForwardingConfig> {
        Arc::clone(&self.rx.borrow())
    }

    /// Publishes new settings to every holder of this handle.
    pub fn replace(&self, config: ForwardingConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Receiver that resolves `changed()` whenever settings are replaced.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ForwardingConfig>> {
        self.tx.subscribe()
    }
}

/// Configuration for the agent process itself.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,

    /// Directory of `*.jsonl` notification spool files.
    pub spool_dir: PathBuf,

    /// Notification access granted. When false the spool is not watched.
    pub capture_enabled: bool,

    /// Maximum number of concurrent delivery attempts.
    pub concurrency: usize,

    /// Longest the dispatcher sleeps while idle.
    pub poll_interval: Duration,

    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,

    /// Attempts before a delivery is abandoned.
    pub max_attempts: u32,

    /// Retention for delivered and abandoned entries.
    pub retention: Duration,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a numeric or boolean variable cannot be
    /// parsed or is out of range, or if the home directory cannot be
    /// determined and `NOTIRELAY_DATA_DIR` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = match env::var("NOTIRELAY_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        let spool_dir = env::var("NOTIRELAY_SPOOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(DEFAULT_SPOOL_DIR));

        let concurrency = parse_number_var("NOTIRELAY_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(ConfigError::InvalidValue {
                key: "NOTIRELAY_CONCURRENCY".to_string(),
                message: format!("concurrency must be between 1 and {MAX_CONCURRENCY}, got {concurrency}"),
            });
        }

        let poll_interval_secs =
            parse_number_var("NOTIRELAY_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOTIRELAY_POLL_INTERVAL_SECS".to_string(),
                message: "poll interval must be at least 1 second".to_string(),
            });
        }

        let request_timeout_secs =
            parse_number_var("NOTIRELAY_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?;
        if request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOTIRELAY_REQUEST_TIMEOUT_SECS".to_string(),
                message: "request timeout must be at least 1 second".to_string(),
            });
        }

        let max_attempts = parse_number_var("NOTIRELAY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&max_attempts) {
            return Err(ConfigError::InvalidValue {
                key: "NOTIRELAY_MAX_ATTEMPTS".to_string(),
                message: format!(
                    "max attempts must be between {MIN_MAX_ATTEMPTS} and {MAX_MAX_ATTEMPTS}, got {max_attempts}"
                ),
            });
        }

        let retention_hours = parse_number_var("NOTIRELAY_RETENTION_HOURS", DEFAULT_RETENTION_HOURS)?;

        Ok(Self {
            data_dir,
            spool_dir,
            capture_enabled: parse_bool_var("NOTIRELAY_CAPTURE_ENABLED", true)?,
            concurrency,
            poll_interval: Duration::from_secs(poll_interval_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_attempts,
            retention: Duration::from_secs(retention_hours * 3600),
        })
    }

    /// Path of the SQLite database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

/// Parses an optional boolean variable (`true/false/1/0/yes/no`).
fn parse_bool_var(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected boolean, got '{val}'"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Parses an optional non-negative integer variable.
fn parse_number_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{val}'"),
        }),
        Err(_) => Ok(default),
    }
}
