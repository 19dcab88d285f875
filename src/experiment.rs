//! # Stage: Experiment Definitions
//!
//! ## Responsibility
//! Typed definitions for a named A/B test ([`Experiment`]), its alternatives
//! ([`Variant`]) and the per-session binding to one of them ([`Assignment`]).
//!
//! ## Guarantees
//! - Generic payload: `Variant<C>` carries whatever override shape the UI
//!   layer binds (defaults to free-form JSON)
//! - Non-panicking: validation reports problems as [`AbError::Config`]; the
//!   assignment path tolerates malformed weights instead
//!
//! ## NOT Responsible For
//! - Picking a variant (see [`crate::assignment`])
//! - Counting impressions or conversions (see [`crate::attribution`])

use serde::{Deserialize, Serialize};

use crate::error::{AbError, Result};

/// Variant id that is always treated as the control arm.
pub const CONTROL_ID: &str = "control";

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// One alternative configuration within an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "C: Deserialize<'de> + Default"))]
pub struct Variant<C = serde_json::Value> {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Relative selection weight. Negative or NaN weights count as zero.
    #[serde(default)]
    pub weight: f64,
    /// Rendering/behavior overrides bound by the consuming UI layer.
    #[serde(default)]
    pub config: C,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub conversions: u64,
    /// `conversions / impressions`, only set once an impression exists.
    #[serde(default, alias = "conversionRate", skip_serializing_if = "Option::is_none")]
    pub conversion_rate: Option<f64>,
}

impl<C: Default> Variant<C> {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            weight,
            config: C::default(),
            impressions: 0,
            conversions: 0,
            conversion_rate: None,
        }
    }
}

impl<C> Variant<C> {
    /// Weight as used by the selection walk.
    pub fn effective_weight(&self) -> f64 {
        self.weight.max(0.0)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: C) -> Self {
        self.config = config;
        self
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// A named A/B test with an ordered list of variants.
///
/// Accepts both snake_case (TOML config files) and the camelCase keys used by
/// the browser-side definitions (`testId`, `trafficSplit`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "C: Deserialize<'de> + Default"))]
pub struct Experiment<C = serde_json::Value> {
    #[serde(alias = "testId")]
    pub test_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub variants: Vec<Variant<C>>,
    /// Alternate weighting input. Parsed and carried but never consulted by
    /// the assignment walk, which reads only `Variant::weight`.
    #[serde(default, alias = "trafficSplit", skip_serializing_if = "Option::is_none")]
    pub traffic_split: Option<Vec<f64>>,
}

impl<C> Experiment<C> {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            enabled: true,
            variants: Vec::new(),
            traffic_split: None,
        }
    }

    /// Append a variant, builder style.
    pub fn with(mut self, variant: Variant<C>) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Sum of effective weights across all variants.
    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(Variant::effective_weight).sum()
    }

    pub fn first(&self) -> Option<&Variant<C>> {
        self.variants.first()
    }

    pub fn find(&self, variant_id: &str) -> Option<&Variant<C>> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn find_mut(&mut self, variant_id: &str) -> Option<&mut Variant<C>> {
        self.variants.iter_mut().find(|v| v.id == variant_id)
    }

    /// `true` when `variant_id` is `"control"` or the first configured variant.
    pub fn is_control(&self, variant_id: &str) -> bool {
        variant_id == CONTROL_ID || self.first().is_some_and(|v| v.id == variant_id)
    }

    /// `true` when assignment can produce a variant at all.
    pub fn is_assignable(&self) -> bool {
        self.enabled && !self.variants.is_empty()
    }

    /// Check the structural invariants of the definition.
    ///
    /// Assignment never calls this; it degrades gracefully instead. Config
    /// loading uses it to reject definitions up front.
    pub fn validate(&self) -> Result<()> {
        if self.test_id.trim().is_empty() {
            return Err(AbError::Config("experiment test_id must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(AbError::Config(format!(
                "experiment '{}' has no variants",
                self.test_id
            )));
        }
        for (i, v) in self.variants.iter().enumerate() {
            if v.id.is_empty() {
                return Err(AbError::Config(format!(
                    "experiment '{}' variant #{i} has an empty id",
                    self.test_id
                )));
            }
            if !v.weight.is_finite() || v.weight < 0.0 {
                return Err(AbError::Config(format!(
                    "experiment '{}' variant '{}' has invalid weight {}",
                    self.test_id, v.id, v.weight
                )));
            }
            if self.variants[..i].iter().any(|o| o.id == v.id) {
                return Err(AbError::Config(format!(
                    "experiment '{}' has duplicate variant id '{}'",
                    self.test_id, v.id
                )));
            }
        }
        if self.total_weight() <= 0.0 {
            return Err(AbError::Config(format!(
                "experiment '{}' variant weights sum to zero",
                self.test_id
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// The binding of one session to the variant chosen for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub test_id: String,
    pub variant_id: String,
    pub variant_name: String,
    pub is_control: bool,
    /// Epoch milliseconds.
    pub assigned_at: u64,
}

impl Assignment {
    pub(crate) fn for_variant<C>(experiment: &Experiment<C>, variant: &Variant<C>, assigned_at: u64) -> Self {
        Self {
            test_id: experiment.test_id.clone(),
            variant_id: variant.id.clone(),
            variant_name: variant.name.clone(),
            is_control: experiment.is_control(&variant.id),
            assigned_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
