//! Keystats Monitor - editor keystroke usage aggregation and delivery.
//!
//! This crate turns per-file editing counters collected by an editor
//! integration into usage payloads and delivers them to an ingestion API.
//!
//! # Overview
//!
//! ```text
//! editor events ──▶ KeystrokeStats ──has_data()──▶ PayloadFinalizer ──▶ DeliveryQueue
//!                                                    │        │            │      │
//!                                                  Clock  TimeAccumulator  send  store
//!                                                                          now    │
//!                                                                                 ▼
//!                                                                  PayloadBatcher (drain)
//! ```
//!
//! A collection window is owned by one [`KeystrokeStats`]. On flush,
//! [`KeystrokeStats::has_data`] prunes focus-only noise and reconciles the
//! keystroke total. If the window has data, [`PayloadFinalizer::post_data`]
//! closes it and either sends it immediately (best effort) or stores it
//! durably for the [`PayloadBatcher`] to deliver at least once.
//!
//! # Modules
//!
//! - [`types`]: Wire types for payloads, file counters and projects
//! - [`keystrokes`]: The per-window keystroke aggregate
//! - [`finalizer`]: Payload finalization and routing
//! - [`clock`]: Wall-clock, local time and timezone source
//! - [`accumulator`]: Per-project session/editor time accounting
//! - [`tracker`]: Time since the previous payload
//! - [`queue`]: Delivery queue (send now / store)
//! - [`store`]: Durable pending-delivery store
//! - [`batcher`]: Drains the store to the batch endpoint
//! - [`sender`]: HTTP client with retry and rate limiting
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations

pub mod accumulator;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod keystrokes;
pub mod queue;
pub mod sender;
pub mod store;
pub mod tracker;
pub mod types;

pub use accumulator::{AccumulatorError, FileTimeAccumulator, TimeAccumulator, TimeData};
pub use batcher::{BatchError, PayloadBatcher, BATCH_ENDPOINT};
pub use clock::{Clock, FixedClock, NowTimes, SystemClock};
pub use config::{Config, ConfigError};
pub use error::{MonitorError, Result};
pub use finalizer::{PayloadFinalizer, DEFAULT_EDITOR_SECONDS};
pub use keystrokes::KeystrokeStats;
pub use queue::{DeliveryQueue, EventHandler};
pub use sender::{RetryPolicy, Sender, SenderConfig, SenderError};
pub use store::{PayloadStore, StoreError, StoredPayload};
pub use tracker::{PayloadTracker, SessionTracker};
pub use types::{
    ChangeKind, EnvironmentTags, FileChangeInfo, KeystrokePayload, Project, NO_PROJ_NAME,
    UNTITLED_WORKSPACE,
};
