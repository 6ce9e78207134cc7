//! Error types for the keystats monitor.
//!
//! This module defines the crate-level error type. Each subsystem keeps its own
//! error enum, and [`MonitorError`] wraps them so callers can use `?` across
//! module boundaries.

use thiserror::Error;

use crate::batcher::BatchError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors that can occur during monitor operations.
///
/// # Examples
///
/// ```ignore
/// use keystats_monitor::error::MonitorError;
///
/// fn load_stats() -> Result<(), MonitorError> {
///     let contents = std::fs::read_to_string("stats.json")?;
///     let stats: KeystrokeStats = serde_json::from_str(&contents)?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload could not be durably stored.
    ///
    /// Fatal for a buffered post: the payload is not pending delivery.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Draining stored payloads failed.
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
