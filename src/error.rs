//! Crate-level error type.
//!
//! Internal operations return [`Result`]; the tracking surface
//! ([`crate::tracker::BehaviorTracker`], [`crate::assignment::VariantAssigner`])
//! catches these, logs them through `tracing`, and carries on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbError {
    /// An experiment or tracker setting is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persisted key-value store rejected a read or write.
    #[error("storage error on key '{key}': {detail}")]
    Storage { key: String, detail: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The reporting endpoint replied with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The reporting endpoint could not be reached.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },
}

pub type Result<T> = std::result::Result<T, AbError>;

impl AbError {
    /// `true` for failures of the persisted store (as opposed to the network).
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            AbError::Storage { .. } | AbError::Sqlite(_) | AbError::Io(_)
        )
    }
}
