//! # Stage: Experiment Session
//!
//! ## Responsibility
//! The explicit per-session context that owns every experiment this session
//! has seen, the assignment state, and the attribution log. One instance is
//! built per page/session and handed to whatever needs it.
//!
//! ## Guarantees
//! - Isolated: nothing is shared between instances except the persisted store
//! - Silent: unknown tests and missing assignments are no-ops, never errors
//! - A goal-mapped action records one conversion per active assignment,
//!   so overlapping experiments each receive credit
//!
//! ## NOT Responsible For
//! - Session lifetime, timers, or delivery to the reporting endpoint (see
//!   [`crate::tracker`])

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::assignment::VariantAssigner;
use crate::attribution::{
    goal_context, Attribution, ConversionReport, EngagementRecord, EventType, GoalMap, TestResults,
};
use crate::experiment::{Assignment, Experiment};
use crate::now_ms;
use crate::store::KeyValueStore;

/// Assignment plus attribution state for one session.
pub struct ExperimentSession<C = serde_json::Value> {
    session_id: String,
    assigner: VariantAssigner,
    /// Session-local copies of the definitions, carrying the live counters.
    experiments: HashMap<String, Experiment<C>>,
    attribution: Attribution,
}

impl<C: Clone> ExperimentSession<C> {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_assigner(session_id, VariantAssigner::new(store), GoalMap::default())
    }

    pub fn with_assigner(session_id: impl Into<String>, assigner: VariantAssigner, goals: GoalMap) -> Self {
        Self {
            session_id: session_id.into(),
            assigner,
            experiments: HashMap::new(),
            attribution: Attribution::new(goals),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolve the session's variant for `experiment`.
    ///
    /// The first definition seen for a `test_id` is kept for the rest of the
    /// session; later calls only look up the existing assignment.
    pub fn get_variant(&mut self, experiment: &Experiment<C>, subject_key: Option<&str>) -> Option<Assignment> {
        let assignment = self.assigner.get_variant(experiment, subject_key)?;
        self.experiments
            .entry(experiment.test_id.clone())
            .or_insert_with(|| experiment.clone());
        Some(assignment)
    }

    /// The config payload of the variant assigned for `test_id`.
    pub fn variant_config(&self, test_id: &str) -> Option<&C> {
        let assignment = self.assigner.assignment(test_id)?;
        let experiment = self.experiments.get(test_id)?;
        experiment.find(&assignment.variant_id).map(|v| &v.config)
    }

    pub fn assignment(&self, test_id: &str) -> Option<&Assignment> {
        self.assigner.assignment(test_id)
    }

    pub fn active_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assigner.active_assignments()
    }

    pub fn experiment(&self, test_id: &str) -> Option<&Experiment<C>> {
        self.experiments.get(test_id)
    }

    /// Record that `variant_id` of `test_id` was shown.
    ///
    /// The record is always logged; the variant counter only moves when this
    /// session holds an assignment for `test_id`.
    pub fn track_impression(
        &mut self,
        test_id: &str,
        variant_id: &str,
        context: Option<serde_json::Value>,
    ) -> EngagementRecord {
        let record = self.attribution.record(EventType::Impression, test_id, variant_id, context);
        if let Some(variant) = self.assigned_variant_mut(test_id) {
            variant.record_impression();
        } else {
            debug!(test_id, "impression for test without active assignment, counters untouched");
        }
        record
    }

    /// Record a conversion for `variant_id` of `test_id`.
    pub fn track_conversion(
        &mut self,
        test_id: &str,
        variant_id: &str,
        conversion_data: Option<serde_json::Value>,
    ) -> EngagementRecord {
        let record = self
            .attribution
            .record(EventType::Conversion, test_id, variant_id, conversion_data);
        if let Some(variant) = self.assigned_variant_mut(test_id) {
            variant.record_conversion();
        } else {
            debug!(test_id, "conversion for test without active assignment, counters untouched");
        }
        record
    }

    fn assigned_variant_mut(&mut self, test_id: &str) -> Option<&mut crate::experiment::Variant<C>> {
        let variant_id = &self.assigner.assignment(test_id)?.variant_id;
        self.experiments.get_mut(test_id)?.find_mut(variant_id)
    }

    /// Translate a UI `action` into its goal and record a conversion against
    /// every active assignment. Returns the conversions recorded (empty for
    /// an unmapped action).
    pub fn track_goal(&mut self, action: &str, extra: Option<&serde_json::Value>) -> Vec<EngagementRecord> {
        let Some(goal) = self.attribution.goals().goal_for(action).map(str::to_owned) else {
            return Vec::new();
        };
        let mut targets: Vec<(String, String)> = self
            .assigner
            .active_assignments()
            .map(|a| (a.test_id.clone(), a.variant_id.clone()))
            .collect();
        targets.sort();

        targets
            .into_iter()
            .map(|(test_id, variant_id)| {
                let ctx = goal_context(&goal, action, extra);
                self.track_conversion(&test_id, &variant_id, Some(ctx))
            })
            .collect()
    }

    /// Observed statistics for every variant of `test_id`, or `None` if this
    /// session never looked the test up.
    pub fn get_test_results(&self, test_id: &str) -> Option<TestResults> {
        let experiment = self.experiments.get(test_id)?;
        Some(TestResults::from_experiment(experiment, self.assigner.assignment(test_id)))
    }

    /// Everything this session observed, shaped for the conversion-report
    /// endpoint.
    pub fn conversion_report(&self) -> ConversionReport {
        let mut tests: Vec<TestResults> = self
            .experiments
            .values()
            .map(|e| TestResults::from_experiment(e, self.assigner.assignment(&e.test_id)))
            .collect();
        tests.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        ConversionReport {
            session_id: self.session_id.clone(),
            generated_at: now_ms(),
            tests,
            conversions: self
                .attribution
                .records()
                .iter()
                .filter(|r| r.event_type == EventType::Conversion)
                .cloned()
                .collect(),
        }
    }

    pub fn records(&self) -> &[EngagementRecord] {
        self.attribution.records()
    }

    pub fn goals(&self) -> &GoalMap {
        self.attribution.goals()
    }

    pub fn is_storage_degraded(&self) -> bool {
        self.assigner.is_degraded()
    }

    /// Drop the assignment and the session-local counters for `test_id`.
    pub fn clear(&mut self, test_id: &str) {
        self.assigner.clear(test_id);
        self.experiments.remove(test_id);
    }

    pub fn clear_all(&mut self) {
        self.assigner.clear_all();
        self.experiments.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
