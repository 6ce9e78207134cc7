//! Configuration module for the keystats monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEYSTATS_API_URL` | Yes | - | Ingestion API base URL (e.g., `https://api.example.com`) |
//! | `KEYSTATS_API_TOKEN` | No | - | Bearer token sent with every request |
//! | `KEYSTATS_DATA_DIR` | No | `~/.keystats` | Directory for the pending store and time data |
//! | `KEYSTATS_PLUGIN_ID` | No | 2 | Plugin id stamped on payloads |
//! | `KEYSTATS_BATCH_INTERVAL_SECS` | No | 60 | Seconds between drains of the pending store |
//! | `KEYSTATS_RETRY_LIMIT` | No | 3 | Max send attempts per batch (1-10) |
//! | `KEYSTATS_SESSION_THRESHOLD_SECS` | No | 900 | Gap after which a new session starts |
//!
//! # Example
//!
//! ```no_run
//! use keystats_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("API URL: {}", config.api_url);
//! ```

use std::env;
use std::path::PathBuf;

use directories::BaseDirs;
use thiserror::Error;

use crate::tracker::DEFAULT_SESSION_THRESHOLD_SECS;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".keystats";

/// Default plugin id.
const DEFAULT_PLUGIN_ID: u32 = 2;

/// Default drain interval (in seconds).
const DEFAULT_BATCH_INTERVAL_SECS: u64 = 60;

/// Default send attempts per batch.
const DEFAULT_RETRY_LIMIT: u8 = 3;

/// Minimum allowed retry limit.
const MIN_RETRY_LIMIT: u8 = 1;

/// Maximum allowed retry limit.
const MAX_RETRY_LIMIT: u8 = 10;

/// Smallest session threshold accepted.
const MIN_SESSION_THRESHOLD_SECS: u64 = 60;

/// File names inside the data directory.
const PENDING_FILE: &str = "pending.jsonl";
const TIME_DATA_FILE: &str = "timeData.json";
const SESSION_FILE: &str = "session.json";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the keystats monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingestion API base URL.
    pub api_url: String,

    /// Optional bearer token for the ingestion API.
    pub api_token: Option<String>,

    /// Directory holding the pending store, time data and session state.
    pub data_dir: PathBuf,

    /// Plugin id stamped on payloads.
    pub plugin_id: u32,

    /// Seconds between drains of the pending store.
    pub batch_interval_secs: u64,

    /// Send attempts per batch before a drain gives up.
    pub retry_limit: u8,

    /// Gap (seconds) after which activity starts a new session.
    pub session_threshold_secs: u64,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `KEYSTATS_API_URL` is not set
    /// - A numeric variable is set but cannot be parsed or is out of range
    /// - The home directory cannot be determined (needed for the default data dir)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Required: KEYSTATS_API_URL
        let api_url = env::var("KEYSTATS_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("KEYSTATS_API_URL".to_string()))?;

        // Optional: KEYSTATS_API_TOKEN (empty counts as unset)
        let api_token = env::var("KEYSTATS_API_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        // Optional: KEYSTATS_DATA_DIR (default: ~/.keystats)
        let data_dir = match env::var("KEYSTATS_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        // Optional: KEYSTATS_PLUGIN_ID (default: 2, must be >= 1; 0 means unset)
        let plugin_id = match env::var("KEYSTATS_PLUGIN_ID") {
            Ok(val) => val
                .parse::<u32>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "KEYSTATS_PLUGIN_ID".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?,
            Err(_) => DEFAULT_PLUGIN_ID,
        };

        // Optional: KEYSTATS_BATCH_INTERVAL_SECS (default: 60, must be >= 1)
        let batch_interval_secs = match env::var("KEYSTATS_BATCH_INTERVAL_SECS") {
            Ok(val) => {
                let secs = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: "KEYSTATS_BATCH_INTERVAL_SECS".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "KEYSTATS_BATCH_INTERVAL_SECS".to_string(),
                        message: "batch interval must be at least 1 second".to_string(),
                    });
                }
                secs
            }
            Err(_) => DEFAULT_BATCH_INTERVAL_SECS,
        };

        // Optional: KEYSTATS_RETRY_LIMIT (default: 3, must be 1-10)
        let retry_limit = match env::var("KEYSTATS_RETRY_LIMIT") {
            Ok(val) => {
                let limit = val.parse::<u8>().map_err(|_| ConfigError::InvalidValue {
                    key: "KEYSTATS_RETRY_LIMIT".to_string(),
                    message: format!("expected integer 1-10, got '{val}'"),
                })?;
                if !(MIN_RETRY_LIMIT..=MAX_RETRY_LIMIT).contains(&limit) {
                    return Err(ConfigError::InvalidValue {
                        key: "KEYSTATS_RETRY_LIMIT".to_string(),
                        message: format!(
                            "retry limit must be between {MIN_RETRY_LIMIT} and {MAX_RETRY_LIMIT}, got {limit}"
                        ),
                    });
                }
                limit
            }
            Err(_) => DEFAULT_RETRY_LIMIT,
        };

        // Optional: KEYSTATS_SESSION_THRESHOLD_SECS (default: 900, must be >= 60)
        let session_threshold_secs = match env::var("KEYSTATS_SESSION_THRESHOLD_SECS") {
            Ok(val) => {
                let secs = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: "KEYSTATS_SESSION_THRESHOLD_SECS".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if secs < MIN_SESSION_THRESHOLD_SECS {
                    return Err(ConfigError::InvalidValue {
                        key: "KEYSTATS_SESSION_THRESHOLD_SECS".to_string(),
                        message: format!(
                            "session threshold must be at least {MIN_SESSION_THRESHOLD_SECS} seconds"
                        ),
                    });
                }
                secs
            }
            Err(_) => DEFAULT_SESSION_THRESHOLD_SECS,
        };

        Ok(Self {
            api_url,
            api_token,
            data_dir,
            plugin_id,
            batch_interval_secs,
            retry_limit,
            session_threshold_secs,
        })
    }

    /// Path of the pending-delivery store.
    #[must_use]
    pub fn pending_path(&self) -> PathBuf {
        self.data_dir.join(PENDING_FILE)
    }

    /// Path of the per-project time data.
    #[must_use]
    pub fn time_data_path(&self) -> PathBuf {
        self.data_dir.join(TIME_DATA_FILE)
    }

    /// Path of the last-payload session state.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}
