//! # abtrack
//!
//! Session-scoped A/B experiment assignment, conversion attribution and
//! behavior tracking.
//!
//! ## Modules
//! - [`experiment`]: experiment, variant and assignment types
//! - [`assignment`]: deterministic / weighted-random variant selection and
//!   persisted assignments
//! - [`attribution`]: impression/conversion records, rates, goal mapping
//! - [`engine`]: [`ExperimentSession`], the per-session context tying the two
//!   together
//! - [`session`]: session identity, duration ticker, inactivity state
//! - [`tracker`]: [`BehaviorTracker`], the page-facing tracking API
//! - [`reporting`]: delivery of batched events to the reporting endpoint
//! - [`store`]: persisted key-value backends
//! - [`config`]: TOML configuration
//! - [`cli`]: command-line arguments for the `abtrack` binary

pub mod assignment;
pub mod attribution;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod reporting;
pub mod session;
pub mod store;
pub mod tracker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use assignment::{assign_variant, rolling_hash, VariantAssigner};
pub use attribution::{EngagementRecord, EventType, GoalMap, TestResults};
pub use config::{AbConfig, TrackerConfig};
pub use engine::ExperimentSession;
pub use error::{AbError, Result};
pub use experiment::{Assignment, Experiment, Variant};
pub use session::{DeviceType, Session, SessionState};
pub use store::{FileStore, KeyValueStore, MemoryStore, SqliteStore};
pub use tracker::BehaviorTracker;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
