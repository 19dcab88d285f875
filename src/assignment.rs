//! # Stage: Variant Assignment
//!
//! ## Responsibility
//! Pick exactly one [`Variant`] of an [`Experiment`] for the current session,
//! remember the decision in memory, and persist it under the `ab_tests` key
//! so later sessions (within the retention window) see the same variant.
//!
//! ## Guarantees
//! - Deterministic routing: a given `(test_id, subject_key)` always maps to
//!   the same variant for a fixed variant list and weights
//! - Idempotent: repeat lookups for a `test_id` within one assigner return the
//!   identical [`Assignment`]
//! - Lazy expiry: persisted records older than the retention window are
//!   ignored on load and pruned opportunistically
//! - Non-panicking, non-throwing: storage failures are logged and the
//!   assigner carries on in memory for the rest of the session
//!
//! ## NOT Responsible For
//! - Counting impressions or conversions (see [`crate::attribution`])
//! - Server-side assignment authority

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::experiment::{Assignment, Experiment, Variant};
use crate::now_ms;
use crate::store::KeyValueStore;

/// Namespace key holding `{ [testId]: { variantId, assignedAt } }`.
pub const STORAGE_KEY: &str = "ab_tests";

/// Persisted assignments older than this are treated as absent.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Number of compare-and-swap rounds before giving up on persisting.
const CAS_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Hashing and selection
// ---------------------------------------------------------------------------

/// 31-multiplier rolling hash over UTF-16 code units, wrapped to 32-bit
/// signed arithmetic, absolute value taken at the end.
///
/// `i32::MIN` has no positive counterpart in `i32`, so the result is `u32`
/// and that input maps to `2^31`.
pub fn rolling_hash(input: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs()
}

/// Stable bucket in `0..100` for a subject within one experiment.
pub fn bucket(test_id: &str, subject_key: &str) -> u32 {
    rolling_hash(&format!("{test_id}-{subject_key}")) % 100
}

/// Walk variants in order, accumulating weight, and return the first whose
/// cumulative weight meets or exceeds `threshold`.
fn select_by_threshold<C>(experiment: &Experiment<C>, threshold: f64) -> Option<&Variant<C>> {
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.effective_weight();
        if threshold <= cumulative {
            return Some(variant);
        }
    }
    None
}

/// Choose a variant for `experiment`.
///
/// With a subject key the choice is a pure function of the key; without one
/// it is a weighted random draw. Returns `None` only when the experiment has
/// no variants.
pub fn assign_variant<'a, C>(
    experiment: &'a Experiment<C>,
    subject_key: Option<&str>,
) -> Option<&'a Variant<C>> {
    assign_variant_with(experiment, subject_key, &mut rand::thread_rng())
}

/// [`assign_variant`] with a caller-supplied random source for the random path.
pub fn assign_variant_with<'a, C, R: Rng + ?Sized>(
    experiment: &'a Experiment<C>,
    subject_key: Option<&str>,
    rng: &mut R,
) -> Option<&'a Variant<C>> {
    let first = experiment.first()?;
    let total = experiment.total_weight();

    let threshold = match subject_key {
        Some(key) => f64::from(bucket(&experiment.test_id, key)) / 100.0 * total,
        None => rng.gen::<f64>() * total,
    };

    match select_by_threshold(experiment, threshold) {
        Some(v) => Some(v),
        None => {
            warn!(
                test_id = %experiment.test_id,
                total_weight = total,
                "variant weights are malformed, falling back to first variant"
            );
            Some(first)
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted form
// ---------------------------------------------------------------------------

/// One entry of the persisted `ab_tests` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAssignment {
    pub variant_id: String,
    /// Epoch milliseconds.
    pub assigned_at: u64,
}

impl StoredAssignment {
    fn is_expired(&self, now: u64, retention_ms: u64) -> bool {
        now.saturating_sub(self.assigned_at) > retention_ms
    }
}

type StoredMap = BTreeMap<String, StoredAssignment>;

fn parse_stored(raw: Option<&str>) -> StoredMap {
    let Some(raw) = raw else { return StoredMap::new() };
    match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, key = STORAGE_KEY, "ignoring corrupt persisted assignments");
            StoredMap::new()
        }
    }
}

// ---------------------------------------------------------------------------
// VariantAssigner
// ---------------------------------------------------------------------------

/// Per-session assignment state backed by a persisted key-value store.
pub struct VariantAssigner {
    store: Arc<dyn KeyValueStore>,
    retention_ms: u64,
    assignments: HashMap<String, Assignment>,
    /// Non-expired records found in the store at load time.
    restored: StoredMap,
    /// Set after the first storage failure; no further store access happens.
    degraded: bool,
}

impl VariantAssigner {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_retention(store, DEFAULT_RETENTION)
    }

    pub fn with_retention(store: Arc<dyn KeyValueStore>, retention: Duration) -> Self {
        let mut assigner = Self {
            store,
            retention_ms: retention.as_millis() as u64,
            assignments: HashMap::new(),
            restored: StoredMap::new(),
            degraded: false,
        };
        assigner.load(now_ms());
        assigner
    }

    fn load(&mut self, now: u64) {
        let raw = match self.store.get(STORAGE_KEY) {
            Ok(raw) => raw,
            Err(e) => {
                self.degrade(&e);
                return;
            }
        };
        let all = parse_stored(raw.as_deref());
        let before = all.len();
        self.restored = all
            .into_iter()
            .filter(|(_, rec)| !rec.is_expired(now, self.retention_ms))
            .collect();

        let expired = before - self.restored.len();
        if expired > 0 {
            debug!(expired, "pruning expired persisted assignments");
            if let Ok(pruned) = serde_json::to_string(&self.restored) {
                // Opportunistic: another session may have written in between.
                if let Err(e) = self.store.compare_and_swap(STORAGE_KEY, raw.as_deref(), &pruned) {
                    self.degrade(&e);
                }
            }
        }
    }

    fn degrade(&mut self, err: &crate::error::AbError) {
        if !self.degraded {
            warn!(error = %err, "assignment storage unavailable, continuing in memory only");
        }
        self.degraded = true;
    }

    /// `true` once a storage failure has switched the assigner to memory only.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Return the session's assignment for `experiment`, creating it on first
    /// lookup.
    ///
    /// Returns `None` for a disabled experiment or one without variants.
    pub fn get_variant<C>(
        &mut self,
        experiment: &Experiment<C>,
        subject_key: Option<&str>,
    ) -> Option<Assignment> {
        if !experiment.is_assignable() {
            debug!(test_id = %experiment.test_id, "experiment disabled or empty, no assignment");
            return None;
        }
        if let Some(existing) = self.assignments.get(&experiment.test_id) {
            return Some(existing.clone());
        }

        let now = now_ms();
        let assignment = match self.restore(experiment, now) {
            Some(restored) => restored,
            None => {
                let variant = assign_variant(experiment, subject_key)?;
                let fresh = Assignment::for_variant(experiment, variant, now);
                debug!(
                    test_id = %fresh.test_id,
                    variant_id = %fresh.variant_id,
                    deterministic = subject_key.is_some(),
                    "assigned variant"
                );
                self.persist(experiment, fresh, now)
            }
        };

        self.assignments.insert(experiment.test_id.clone(), assignment.clone());
        Some(assignment)
    }

    fn restore<C>(&self, experiment: &Experiment<C>, now: u64) -> Option<Assignment> {
        let rec = self.restored.get(&experiment.test_id)?;
        if rec.is_expired(now, self.retention_ms) {
            return None;
        }
        let variant = experiment.find(&rec.variant_id)?;
        debug!(test_id = %experiment.test_id, variant_id = %rec.variant_id, "restored persisted assignment");
        Some(Assignment::for_variant(experiment, variant, rec.assigned_at))
    }

    /// Write `fresh` to the store. If another session persisted a live
    /// assignment for the same test first, that one is adopted instead.
    fn persist<C>(&mut self, experiment: &Experiment<C>, fresh: Assignment, now: u64) -> Assignment {
        if self.degraded {
            return fresh;
        }
        for _ in 0..CAS_ATTEMPTS {
            match self.try_persist(experiment, &fresh, now) {
                Ok(Some(winner)) => return winner,
                Ok(None) => continue,
                Err(e) => {
                    self.degrade(&e);
                    return fresh;
                }
            }
        }
        warn!(test_id = %fresh.test_id, "persisted assignments kept changing underneath, not persisted");
        fresh
    }

    /// One read-modify-CAS round. `Ok(None)` means the store changed and the
    /// round should be retried.
    fn try_persist<C>(
        &mut self,
        experiment: &Experiment<C>,
        fresh: &Assignment,
        now: u64,
    ) -> Result<Option<Assignment>> {
        let raw = self.store.get(STORAGE_KEY)?;
        let mut map = parse_stored(raw.as_deref());

        if let Some(rec) = map.get(&fresh.test_id) {
            if !rec.is_expired(now, self.retention_ms) {
                if let Some(variant) = experiment.find(&rec.variant_id) {
                    debug!(test_id = %fresh.test_id, variant_id = %rec.variant_id, "adopting concurrently persisted assignment");
                    return Ok(Some(Assignment::for_variant(experiment, variant, rec.assigned_at)));
                }
            }
        }

        map.retain(|_, rec| !rec.is_expired(now, self.retention_ms));
        let record = StoredAssignment { variant_id: fresh.variant_id.clone(), assigned_at: fresh.assigned_at };
        map.insert(fresh.test_id.clone(), record.clone());
        let encoded = serde_json::to_string(&map)?;

        if self.store.compare_and_swap(STORAGE_KEY, raw.as_deref(), &encoded)? {
            self.restored.insert(fresh.test_id.clone(), record);
            Ok(Some(fresh.clone()))
        } else {
            Ok(None)
        }
    }

    /// The in-memory assignment for `test_id`, if one exists.
    pub fn assignment(&self, test_id: &str) -> Option<&Assignment> {
        self.assignments.get(test_id)
    }

    /// All assignments made (or restored) in this session.
    pub fn active_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    pub fn active_count(&self) -> usize {
        self.assignments.len()
    }

    /// Forget the assignment for `test_id` in memory and in the store so the
    /// next lookup assigns afresh.
    pub fn clear(&mut self, test_id: &str) {
        self.assignments.remove(test_id);
        self.restored.remove(test_id);
        if self.degraded {
            return;
        }
        for _ in 0..CAS_ATTEMPTS {
            let outcome = self.store.get(STORAGE_KEY).and_then(|raw| {
                let mut map = parse_stored(raw.as_deref());
                if map.remove(test_id).is_none() {
                    return Ok(true);
                }
                let encoded = serde_json::to_string(&map)?;
                self.store.compare_and_swap(STORAGE_KEY, raw.as_deref(), &encoded)
            });
            match outcome {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    self.degrade(&e);
                    return;
                }
            }
        }
    }

    /// Forget every assignment, in memory and in the store.
    pub fn clear_all(&mut self) {
        self.assignments.clear();
        self.restored.clear();
        if self.degraded {
            return;
        }
        if let Err(e) = self.store.remove(STORAGE_KEY) {
            self.degrade(&e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
