//! # Stage: Event Attribution
//!
//! ## Responsibility
//! Append-only log of impressions and conversions, the per-variant counters
//! and conversion rates derived from them, and the table that turns
//! high-level UI actions into named conversion goals.
//!
//! ## Guarantees
//! - Append-only: records are never mutated or removed
//! - Never divides by zero: a rate exists only once an impression exists
//! - Bounded rate: `conversion_rate` is clamped to `[0, 1]`
//!
//! ## NOT Responsible For
//! - Deciding which assignment is active (see [`crate::engine`])
//! - Server-side aggregate reporting

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::experiment::{Assignment, Experiment, Variant};
use crate::now_ms;

// ---------------------------------------------------------------------------
// EngagementRecord
// ---------------------------------------------------------------------------

/// Kind of engagement being attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Conversion,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Impression => write!(f, "impression"),
            EventType::Conversion => write!(f, "conversion"),
        }
    }
}

/// One impression or conversion against a test/variant pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementRecord {
    pub test_id: String,
    pub variant_id: String,
    pub event_type: EventType,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl EngagementRecord {
    /// The `goal` field of the context, set for goal-mapped conversions.
    pub fn goal(&self) -> Option<&str> {
        self.context.get("goal").and_then(serde_json::Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Variant counters
// ---------------------------------------------------------------------------

impl<C> Variant<C> {
    pub fn record_impression(&mut self) {
        self.impressions = self.impressions.saturating_add(1);
        self.refresh_rate();
    }

    pub fn record_conversion(&mut self) {
        self.conversions = self.conversions.saturating_add(1);
        self.refresh_rate();
    }

    fn refresh_rate(&mut self) {
        if self.impressions > 0 {
            let rate = self.conversions as f64 / self.impressions as f64;
            self.conversion_rate = Some(rate.min(1.0));
        }
    }
}

// ---------------------------------------------------------------------------
// GoalMap
// ---------------------------------------------------------------------------

/// Maps UI action names (e.g. a CTA's `action`) to conversion goal ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalMap(BTreeMap<String, String>);

impl Default for GoalMap {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for (action, goal) in [
            ("demo", "demo_request"),
            ("trial", "trial_signup"),
            ("register", "registration"),
            ("contact", "contact_sales"),
            ("calculator-complete", "calculator_completion"),
        ] {
            map.insert(action.to_string(), goal.to_string());
        }
        Self(map)
    }
}

impl GoalMap {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn goal_for(&self, action: &str) -> Option<&str> {
        self.0.get(action).map(String::as_str)
    }

    /// Add or replace a mapping.
    pub fn insert(&mut self, action: impl Into<String>, goal: impl Into<String>) {
        self.0.insert(action.into(), goal.into());
    }

    /// Layer `other` on top of this map; its entries win.
    pub fn merged(mut self, other: &GoalMap) -> Self {
        for (action, goal) in &other.0 {
            self.0.insert(action.clone(), goal.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(a, g)| (a.as_str(), g.as_str()))
    }
}

/// Context attached to a goal-mapped conversion: `goal` and `action`, plus
/// any fields of `extra` when it is a JSON object.
pub fn goal_context(goal: &str, action: &str, extra: Option<&serde_json::Value>) -> serde_json::Value {
    let mut ctx = serde_json::Map::new();
    if let Some(serde_json::Value::Object(fields)) = extra {
        for (k, v) in fields {
            ctx.insert(k.clone(), v.clone());
        }
    }
    ctx.insert("goal".into(), goal.into());
    ctx.insert("action".into(), action.into());
    serde_json::Value::Object(ctx)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Observed statistics for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantResult {
    pub variant_id: String,
    pub name: String,
    pub is_control: bool,
    /// `true` for the variant this session is assigned to.
    pub assigned: bool,
    pub impressions: u64,
    pub conversions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_rate: Option<f64>,
}

/// Client-side view of one test: whatever this session observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub test_id: String,
    pub enabled: bool,
    pub variants: Vec<VariantResult>,
    pub total_impressions: u64,
    pub total_conversions: u64,
}

impl TestResults {
    pub fn from_experiment<C>(experiment: &Experiment<C>, assignment: Option<&Assignment>) -> Self {
        let variants: Vec<VariantResult> = experiment
            .variants
            .iter()
            .map(|v| VariantResult {
                variant_id: v.id.clone(),
                name: v.name.clone(),
                is_control: experiment.is_control(&v.id),
                assigned: assignment.is_some_and(|a| a.variant_id == v.id),
                impressions: v.impressions,
                conversions: v.conversions,
                conversion_rate: v.conversion_rate,
            })
            .collect();
        Self {
            test_id: experiment.test_id.clone(),
            enabled: experiment.enabled,
            total_impressions: variants.iter().map(|v| v.impressions).sum(),
            total_conversions: variants.iter().map(|v| v.conversions).sum(),
            variants,
        }
    }

    pub fn variant(&self, variant_id: &str) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    /// The variant with the highest observed conversion rate, if any has one.
    pub fn leading_variant(&self) -> Option<&VariantResult> {
        self.variants
            .iter()
            .filter(|v| v.conversion_rate.is_some())
            .max_by(|a, b| {
                a.conversion_rate
                    .partial_cmp(&b.conversion_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Payload for the conversion-report endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub session_id: String,
    pub generated_at: u64,
    pub tests: Vec<TestResults>,
    pub conversions: Vec<EngagementRecord>,
}

// ---------------------------------------------------------------------------
// Attribution log
// ---------------------------------------------------------------------------

/// Append-only engagement log plus the goal table used to interpret actions.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    records: Vec<EngagementRecord>,
    goals: GoalMap,
}

impl Attribution {
    pub fn new(goals: GoalMap) -> Self {
        Self { records: Vec::new(), goals }
    }

    /// Append a record and return a copy of it.
    pub fn record(
        &mut self,
        event_type: EventType,
        test_id: &str,
        variant_id: &str,
        context: Option<serde_json::Value>,
    ) -> EngagementRecord {
        let record = EngagementRecord {
            test_id: test_id.to_string(),
            variant_id: variant_id.to_string(),
            event_type,
            timestamp: now_ms(),
            context: context.unwrap_or(serde_json::Value::Null),
        };
        self.records.push(record.clone());
        record
    }

    pub fn records(&self) -> &[EngagementRecord] {
        &self.records
    }

    pub fn records_for<'a>(&'a self, test_id: &'a str) -> impl Iterator<Item = &'a EngagementRecord> + 'a {
        self.records.iter().filter(move |r| r.test_id == test_id)
    }

    pub fn count(&self, test_id: &str, event_type: EventType) -> usize {
        self.records_for(test_id).filter(|r| r.event_type == event_type).count()
    }

    pub fn goals(&self) -> &GoalMap {
        &self.goals
    }

    pub fn goals_mut(&mut self) -> &mut GoalMap {
        &mut self.goals
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
