//! notirelay agent - notification capture, filtering and reliable delivery.
//!
//! Captured notifications are filtered against the user's package list,
//! persisted in a SQLite store and forwarded to an HTTP endpoint by a
//! background dispatcher with exponential backoff. A capped activity log
//! records what happened to each notification.
//!
//! # Data flow
//!
//! ```text
//! spool *.jsonl -> watcher -> parser -> listener -> filter -> store
//!                                                              |
//!                          log_sink <- retry <- client <- dispatcher
//! ```
//!
//! # Modules
//!
//! - [`types`]: Domain records (events, payloads, deliveries, log entries)
//! - [`config`]: Configuration from environment variables
//! - [`filter`]: Forwarding decision for a single notification
//! - [`parser`]: Normalization of raw spool lines
//! - [`watcher`]: Spool directory tailer
//! - [`listener`]: Capture entry point
//! - [`store`]: Durable delivery queue and activity log
//! - [`retry`]: Backoff policy
//! - [`client`]: One HTTP attempt per call
//! - [`dispatcher`]: Background delivery loop
//! - [`log_sink`]: User-visible activity log
//! - [`error`]: Crate-level error type

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod listener;
pub mod log_sink;
pub mod parser;
pub mod retry;
pub mod store;
pub mod types;
pub mod watcher;

pub use client::DeliveryTarget;
pub use config::{Config, ConfigHandle, ForwardingConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{AgentError, Result};
pub use listener::{CaptureListener, CaptureOutcome, SpoolProgress};
pub use log_sink::LogSink;
pub use store::DeliveryStore;
pub use types::{DeliveryPayload, DeliveryState, LogEntry, LogKind, NotificationEvent, PendingDelivery};
pub use watcher::{SpoolLine, SpoolWatcher, WatchEvent};
