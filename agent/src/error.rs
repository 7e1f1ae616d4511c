//! Crate-level error type.
//!
//! Each module reports failures through its own error enum; [`AgentError`]
//! wraps them for callers that drive several modules at once.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatcher::DispatchError;
use crate::listener::CaptureError;
use crate::parser::ParseError;
use crate::store::StoreError;
use crate::watcher::WatcherError;

/// Errors that can occur while running the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("spool watch error: {0}")]
    Watch(#[from] WatcherError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
