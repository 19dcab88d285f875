//! TOML configuration for trackers and experiment definitions.
//!
//! ```toml
//! [tracker]
//! enabled = true
//! tracking_id = "G-ALUMNI01"
//! batch_size = 10
//! flush_interval_ms = 30000
//! enable_offline_storage = true
//!
//! [tracker.goals]
//! donate = "donation"
//!
//! [[experiments]]
//! test_id = "pricing_test"
//! variants = [
//!   { id = "control", name = "Control", weight = 50 },
//!   { id = "v2", name = "Annual first", weight = 50, config = { headline = "Save 20%" } },
//! ]
//! ```
//!
//! Keys also accept the camelCase spellings used by the browser-side option
//! objects (`batchSize`, `enableDebugMode`, ...).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attribution::GoalMap;
use crate::error::{AbError, Result};
use crate::experiment::Experiment;

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_ms() -> u64 {
    30_000
}
fn default_endpoint() -> String {
    "http://localhost:8000".into()
}
fn default_session_prefix() -> String {
    "session".into()
}
fn default_viewport_width() -> u32 {
    1280
}

/// Tracker options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Master switch: when `false` every `track_*` call is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "enableDebugMode")]
    pub enable_debug_mode: bool,
    /// Persist events produced while offline and replay them on reconnect.
    #[serde(default, alias = "enableOfflineStorage")]
    pub enable_offline_storage: bool,
    /// Buffered events that trigger an early flush.
    #[serde(default = "default_batch_size", alias = "batchSize")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms", alias = "flushInterval")]
    pub flush_interval_ms: u64,
    #[serde(default, alias = "trackingId", skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, alias = "enableHeatMapping")]
    pub enable_heat_mapping: bool,
    #[serde(default = "default_true", alias = "enableABTesting")]
    pub enable_ab_testing: bool,
    /// Base URL of the reporting endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_session_prefix", alias = "sessionPrefix")]
    pub session_prefix: String,
    /// Flush buffered events on teardown; `false` drops them.
    #[serde(default = "default_true", alias = "flushOnTeardown")]
    pub flush_on_teardown: bool,
    #[serde(default = "default_viewport_width", alias = "viewportWidth")]
    pub viewport_width: u32,
    /// Extra or overriding action -> goal mappings, layered over the defaults.
    #[serde(default = "GoalMap::empty")]
    pub goals: GoalMap,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_debug_mode: false,
            enable_offline_storage: false,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            tracking_id: None,
            enable_heat_mapping: false,
            enable_ab_testing: true,
            endpoint: default_endpoint(),
            session_prefix: default_session_prefix(),
            flush_on_teardown: true,
            viewport_width: default_viewport_width(),
            goals: GoalMap::empty(),
        }
    }
}

impl TrackerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The default goal table with `goals` layered on top.
    pub fn goal_map(&self) -> GoalMap {
        GoalMap::default().merged(&self.goals)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AbError::Config("batch_size must be >= 1".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(AbError::Config("flush_interval_ms must be >= 1".into()));
        }
        if self.session_prefix.is_empty() || self.session_prefix.contains('_') {
            return Err(AbError::Config(format!(
                "session_prefix must be non-empty and contain no '_', got '{}'",
                self.session_prefix
            )));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(AbError::Config(format!("endpoint must be an http(s) URL, got '{}'", self.endpoint)));
        }
        Ok(())
    }
}

/// A full configuration file: tracker options plus experiment definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AbConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

impl AbConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AbConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        for (i, exp) in self.experiments.iter().enumerate() {
            exp.validate()?;
            if self.experiments[..i].iter().any(|o| o.test_id == exp.test_id) {
                return Err(AbError::Config(format!("duplicate experiment '{}'", exp.test_id)));
            }
        }
        Ok(())
    }

    pub fn experiment(&self, test_id: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.test_id == test_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[tracker]
tracking_id = "G-ALUMNI01"
batch_size = 5
enable_offline_storage = true

[tracker.goals]
donate = "donation"

[[experiments]]
test_id = "pricing_test"
traffic_split = [50.0, 50.0]
variants = [
  { id = "control", name = "Control", weight = 50 },
  { id = "v2", name = "Annual first", weight = 50, config = { headline = "Save 20%" } },
]

[[experiments]]
test_id = "hero_copy"
enabled = false
variants = [{ id = "control", weight = 1 }]
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = AbConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.tracker.tracking_id.as_deref(), Some("G-ALUMNI01"));
        assert_eq!(cfg.tracker.batch_size, 5);
        assert!(cfg.tracker.enable_offline_storage);
        assert_eq!(cfg.tracker.flush_interval(), Duration::from_secs(30));
        assert_eq!(cfg.experiments.len(), 2);

        let pricing = cfg.experiment("pricing_test").unwrap();
        assert_eq!(pricing.variants[1].config["headline"], "Save 20%");
        assert_eq!(pricing.traffic_split, Some(vec![50.0, 50.0]));
        assert!(!cfg.experiment("hero_copy").unwrap().enabled);
    }

    #[test]
    fn test_goal_map_layers_over_defaults() {
        let cfg = AbConfig::from_toml_str(SAMPLE).unwrap();
        let goals = cfg.tracker.goal_map();
        assert_eq!(goals.goal_for("donate"), Some("donation"));
        assert_eq!(goals.goal_for("demo"), Some("demo_request"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg = AbConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.tracker, TrackerConfig::default());
        assert!(cfg.experiments.is_empty());
    }

    #[test]
    fn test_camel_case_aliases() {
        let cfg = AbConfig::from_toml_str(
            "[tracker]\nbatchSize = 3\nenableDebugMode = true\nflushInterval = 1000\nenableABTesting = false\n",
        )
        .unwrap();
        assert_eq!(cfg.tracker.batch_size, 3);
        assert!(cfg.tracker.enable_debug_mode);
        assert_eq!(cfg.tracker.flush_interval_ms, 1000);
        assert!(!cfg.tracker.enable_ab_testing);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = AbConfig::from_toml_str("[tracker]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, AbError::Config(_)));
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        assert!(AbConfig::from_toml_str("[tracker]\nendpoint = \"ftp://x\"\n").is_err());
    }

    #[test]
    fn test_prefix_with_underscore_rejected() {
        assert!(AbConfig::from_toml_str("[tracker]\nsession_prefix = \"a_b\"\n").is_err());
    }

    #[test]
    fn test_invalid_experiment_rejected() {
        let doc = "[[experiments]]\ntest_id = \"t\"\nvariants = []\n";
        assert!(AbConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_duplicate_experiment_rejected() {
        let doc = r#"
[[experiments]]
test_id = "t"
variants = [{ id = "control", weight = 1 }]
[[experiments]]
test_id = "t"
variants = [{ id = "control", weight = 1 }]
"#;
        let err = AbConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn test_malformed_toml_is_toml_error() {
        assert!(matches!(AbConfig::from_toml_str("[tracker"), Err(AbError::Toml(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ab.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = AbConfig::from_file(&path).unwrap();
        assert_eq!(cfg.experiments.len(), 2);
        assert!(AbConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
