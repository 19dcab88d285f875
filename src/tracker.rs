//! # Stage: Behavior Tracker
//!
//! ## Responsibility
//! The surface UI code talks to. Turns page-level signals (page views,
//! sections, scroll depth, CTA clicks, forms, calculator steps) into
//! analytics events, buffers them, and ships them to a [`ReportSink`] in
//! batches. Wraps an [`ExperimentSession`] so CTA clicks that map to a goal
//! become conversions on every active experiment.
//!
//! ## Guarantees
//! - Best-effort: no `track_*` method returns an error or panics; transport
//!   and storage failures are logged with `tracing` and dropped
//! - Non-blocking: `track_*` only appends to a bounded in-memory buffer;
//!   the flusher task, [`BehaviorTracker::flush`] and teardown do the
//!   sending and the persisting
//! - Bounded: past [`MIN_BUFFER_CAPACITY`] or ten batches, whichever is
//!   larger, the oldest events are dropped
//! - Offline-aware: with offline storage enabled, events flushed while
//!   offline are persisted and replayed once, in order, on reconnect
//! - At-most-once teardown: [`BehaviorTracker::shutdown`] is idempotent
//!
//! ## NOT Responsible For
//! - Variant selection or persistence (see [`crate::assignment`])
//! - Retrying failed deliveries

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assignment::VariantAssigner;
use crate::attribution::{EngagementRecord, TestResults};
use crate::config::TrackerConfig;
use crate::engine::ExperimentSession;
use crate::error::Result;
use crate::experiment::{Assignment, Experiment};
use crate::now_ms;
use crate::reporting::{AnalyticsEvent, Endpoint, EventBatch, ReportSink};
use crate::session::{ActivityKind, Session, SessionConfig, SessionState};
use crate::store::KeyValueStore;

/// Store key holding events produced while offline.
pub const OFFLINE_STORAGE_KEY: &str = "analytics_offline_events";

/// Floor for the event buffer and offline stash capacity.
pub const MIN_BUFFER_CAPACITY: usize = 100;

/// Buffer capacity in batches, when that exceeds [`MIN_BUFFER_CAPACITY`].
const BUFFERED_BATCHES: usize = 10;

/// Shortest flush period the flusher will run with.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Scroll-depth milestones, in percent. Each fires at most once per page.
pub const SCROLL_MILESTONES: [u8; 4] = [25, 50, 75, 100];

// ---------------------------------------------------------------------------
// Integrations
// ---------------------------------------------------------------------------

/// What kind of third-party tool an [`Integration`] feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationKind {
    Analytics,
    /// Only receives events when `enable_heat_mapping` is set.
    Heatmap,
}

/// A third-party consumer that sees every tracked event as it happens.
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Analytics
    }

    fn forward(&self, event: &AnalyticsEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Event buffer shared between the tracker and its flusher task.
struct Dispatcher {
    session_id: String,
    tracking_id: Option<String>,
    batch_size: usize,
    /// Most events held in memory or in the offline stash; oldest go first.
    capacity: usize,
    offline_storage: bool,
    buffer: Mutex<Vec<AnalyticsEvent>>,
    online: AtomicBool,
    flush_now: Notify,
    sink: Arc<dyn ReportSink>,
    store: Arc<dyn KeyValueStore>,
}

/// Drop the oldest events past `capacity`, returning how many went.
fn trim_oldest(events: &mut Vec<AnalyticsEvent>, capacity: usize) -> usize {
    let excess = events.len().saturating_sub(capacity);
    if excess > 0 {
        events.drain(..excess);
    }
    excess
}

impl Dispatcher {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Append to the in-memory buffer. Never touches the store.
    fn push(&self, event: AnalyticsEvent) {
        let (len, dropped) = match self.buffer.lock() {
            Ok(mut buf) => {
                buf.push(event);
                let dropped = trim_oldest(&mut buf, self.capacity);
                (buf.len(), dropped)
            }
            Err(_) => return,
        };
        if dropped > 0 {
            debug!(dropped, capacity = self.capacity, "event buffer full, oldest dropped");
        }
        if len >= self.batch_size && self.is_online() {
            self.flush_now.notify_one();
        }
    }

    fn take_buffer(&self) -> Vec<AnalyticsEvent> {
        self.buffer.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Put events back at the front of the buffer, ahead of newer ones.
    fn requeue(&self, events: Vec<AnalyticsEvent>) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.splice(0..0, events);
            let dropped = trim_oldest(&mut buf, self.capacity);
            if dropped > 0 {
                debug!(dropped, capacity = self.capacity, "event buffer full, oldest dropped");
            }
        }
    }

    /// Send everything buffered in `batch_size` chunks. Offline, the buffer
    /// is stashed (offline storage on) or kept for later (off).
    async fn flush(&self) {
        let events = self.take_buffer();
        if events.is_empty() {
            return;
        }
        if !self.is_online() {
            if self.offline_storage {
                self.stash_offline(events);
            } else {
                self.requeue(events);
            }
            return;
        }

        for chunk in events.chunks(self.batch_size) {
            self.send_batch(chunk.to_vec()).await;
        }
    }

    async fn send_batch(&self, events: Vec<AnalyticsEvent>) {
        let count = events.len();
        let batch = EventBatch {
            session_id: self.session_id.clone(),
            tracking_id: self.tracking_id.clone(),
            events,
        };
        let payload = match serde_json::to_value(&batch) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not encode event batch, dropping");
                return;
            }
        };
        match self.sink.deliver(Endpoint::Events, &payload).await {
            Ok(()) => debug!(session_id = %self.session_id, count, "event batch delivered"),
            Err(e) => warn!(error = %e, count, "event batch delivery failed, dropping"),
        }
    }

    fn load_offline(&self) -> Result<Vec<AnalyticsEvent>> {
        match self.store.get(OFFLINE_STORAGE_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append a flushed buffer to the stash, keeping the newest `capacity`.
    fn stash_offline(&self, events: Vec<AnalyticsEvent>) {
        let result = (|| -> Result<usize> {
            // Corrupt stash contents are discarded rather than blocking new events.
            let mut stored = self.load_offline().unwrap_or_default();
            stored.extend(events);
            let dropped = trim_oldest(&mut stored, self.capacity);
            self.store.set(OFFLINE_STORAGE_KEY, &serde_json::to_string(&stored)?)?;
            Ok(dropped)
        })();
        match result {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, capacity = self.capacity, "offline stash full, oldest dropped"),
            Err(e) => warn!(error = %e, "could not persist offline events, dropping"),
        }
    }

    /// Move stashed offline events back into the buffer. The stash only
    /// ever holds events flushed before anything still buffered, so they go
    /// in front.
    fn restore_offline(&self) -> usize {
        let events = match self.load_offline() {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "offline event stash unreadable, discarding");
                Vec::new()
            }
        };
        if let Err(e) = self.store.remove(OFFLINE_STORAGE_KEY) {
            warn!(error = %e, "could not clear offline event stash");
        }
        let n = events.len();
        self.requeue(events);
        n
    }
}

// ---------------------------------------------------------------------------
// BehaviorTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PageState {
    scroll_milestones: BTreeSet<u8>,
    section_entries: HashMap<String, Instant>,
}

/// Per-session behavior tracker.
///
/// Construct with [`BehaviorTracker::new`], call [`start`](Self::start) from
/// inside a tokio runtime, and [`shutdown`](Self::shutdown) at session end.
pub struct BehaviorTracker<C = Value> {
    config: TrackerConfig,
    session: Session,
    experiments: ExperimentSession<C>,
    dispatcher: Arc<Dispatcher>,
    integrations: Vec<Arc<dyn Integration>>,
    page: PageState,
    flusher: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl<C: Clone> BehaviorTracker<C> {
    pub fn new(config: TrackerConfig, store: Arc<dyn KeyValueStore>, sink: Arc<dyn ReportSink>) -> Self {
        let session = Session::new(
            SessionConfig { prefix: config.session_prefix.clone(), ..SessionConfig::default() },
            config.viewport_width,
        );
        let experiments = ExperimentSession::with_assigner(
            session.id(),
            VariantAssigner::new(Arc::clone(&store)),
            config.goal_map(),
        );
        let batch_size = config.batch_size.max(1);
        let dispatcher = Arc::new(Dispatcher {
            session_id: session.id().to_string(),
            tracking_id: config.tracking_id.clone(),
            batch_size,
            capacity: batch_size.saturating_mul(BUFFERED_BATCHES).max(MIN_BUFFER_CAPACITY),
            offline_storage: config.enable_offline_storage,
            buffer: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            flush_now: Notify::new(),
            sink,
            store,
        });
        Self {
            config,
            session,
            experiments,
            dispatcher,
            integrations: Vec::new(),
            page: PageState::default(),
            flusher: None,
            torn_down: false,
        }
    }

    /// Register a third-party integration, builder style.
    pub fn with_integration(mut self, integration: Arc<dyn Integration>) -> Self {
        self.integrations.push(integration);
        self
    }

    /// Start the session timers and the periodic flusher.
    ///
    /// Must be called from within a tokio runtime. No-op when tracking is
    /// disabled or the tracker was already started or torn down.
    pub fn start(&mut self) {
        if !self.config.enabled || self.torn_down || self.flusher.is_some() {
            return;
        }
        self.session.start();

        let dispatcher = Arc::clone(&self.dispatcher);
        let mut period = self.config.flush_interval();
        if period < MIN_FLUSH_INTERVAL {
            warn!(flush_interval_ms = self.config.flush_interval_ms, "flush interval too short, using 1ms");
            period = MIN_FLUSH_INTERVAL;
        }
        self.flusher = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = dispatcher.flush_now.notified() => {}
                }
                dispatcher.flush().await;
            }
        }));
        info!(session_id = %self.session.id(), device = %self.session.device_type(), "tracking started");
    }

    /// End the session: stop timers, then flush or drop buffered events
    /// according to `flush_on_teardown`. Later calls are no-ops.
    pub async fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        self.session.shutdown();

        if self.config.flush_on_teardown {
            self.dispatcher.flush().await;
        } else {
            let dropped = self.dispatcher.take_buffer().len();
            if dropped > 0 {
                debug!(dropped, "buffered events dropped on teardown");
            }
        }
    }

    /// Send buffered events now.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    // -- accessors ---------------------------------------------------------

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn experiments(&self) -> &ExperimentSession<C> {
        &self.experiments
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn is_online(&self) -> bool {
        self.dispatcher.is_online()
    }

    /// Events waiting for the next flush.
    pub fn buffered_events(&self) -> usize {
        self.dispatcher.buffered()
    }

    // -- host signals ------------------------------------------------------

    /// Feed a user-activity signal to the inactivity timer.
    pub fn record_activity(&self, kind: ActivityKind) {
        self.session.record_activity(kind);
    }

    /// Page visibility changed; a hidden page flushes immediately.
    pub async fn set_visibility(&self, hidden: bool) {
        if hidden && !self.torn_down {
            self.dispatcher.flush().await;
        }
    }

    /// Connectivity changed. Going offline stashes the buffer (offline
    /// storage on); going back online replays the stash and flushes.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.dispatcher.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            let restored = if self.config.enable_offline_storage {
                self.dispatcher.restore_offline()
            } else {
                0
            };
            info!(restored, "back online");
            if !self.torn_down {
                self.dispatcher.flush().await;
            }
        } else if !online && was_online {
            info!("offline, holding events");
            if self.config.enable_offline_storage && !self.torn_down {
                self.dispatcher.flush().await;
            }
        }
    }

    // -- behavior tracking -------------------------------------------------

    pub fn track_page_view(&mut self, page: &str, title: Option<&str>) {
        if !self.tracking() {
            return;
        }
        self.session.set_current_page(page);
        self.page = PageState::default();
        self.emit(
            "page_view",
            json!({
                "title": title,
                "deviceType": self.session.device_type().to_string(),
            }),
        );
    }

    pub fn track_section_view(&mut self, section_id: &str) {
        if !self.tracking() {
            return;
        }
        self.page.section_entries.insert(section_id.to_string(), Instant::now());
        self.emit("section_view", json!({ "sectionId": section_id }));
    }

    /// Leaving a section records the time spent since the matching
    /// [`track_section_view`](Self::track_section_view). Exits without a
    /// recorded entry are ignored.
    pub fn track_section_exit(&mut self, section_id: &str) {
        if !self.tracking() {
            return;
        }
        let Some(entered) = self.page.section_entries.remove(section_id) else {
            debug!(section_id, "section exit without entry");
            return;
        };
        let millis = entered.elapsed().as_millis() as u64;
        self.emit("section_exit", json!({ "sectionId": section_id, "timeOnSectionMs": millis }));
        self.track_time_on_section(section_id, millis);
    }

    pub fn track_time_on_section(&mut self, section_id: &str, millis: u64) {
        if !self.tracking() {
            return;
        }
        self.emit("time_on_section", json!({ "sectionId": section_id, "timeMs": millis }));
    }

    /// Report the current scroll position as a percentage. Emits one
    /// `scroll_depth` event per newly crossed milestone.
    pub fn track_scroll_depth(&mut self, percent: f64) {
        if !self.tracking() || percent.is_nan() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        for milestone in SCROLL_MILESTONES {
            if percent >= f64::from(milestone) && self.page.scroll_milestones.insert(milestone) {
                self.emit("scroll_depth", json!({ "depth": milestone }));
            }
        }
    }

    /// Track a call-to-action click. If `action` maps to a goal, a conversion
    /// is recorded against every active experiment assignment.
    pub fn track_cta_click(&mut self, action: &str, label: Option<&str>, extra: Option<Value>) {
        if !self.tracking() {
            return;
        }
        let mut properties = json!({ "action": action, "label": label });
        if let (Some(Value::Object(extra)), Some(props)) = (extra, properties.as_object_mut()) {
            for (k, v) in extra {
                props.entry(k).or_insert(v);
            }
        }
        self.emit("cta_click", properties.clone());

        if !self.config.enable_ab_testing {
            return;
        }
        let conversions = self.experiments.track_goal(action, Some(&properties));
        for record in &conversions {
            self.emit_conversion(record);
        }
    }

    pub fn track_form_submission(&mut self, form_id: &str, success: bool, data: Option<Value>) {
        if !self.tracking() {
            return;
        }
        self.emit(
            "form_submission",
            json!({ "formId": form_id, "success": success, "data": data }),
        );
    }

    pub fn track_calculator_step(&mut self, calculator: &str, step: u32, data: Option<Value>) {
        if !self.tracking() {
            return;
        }
        self.emit(
            "calculator_step",
            json!({ "calculator": calculator, "step": step, "data": data }),
        );
    }

    /// Track an arbitrary named event.
    pub fn track_event(&mut self, name: &str, properties: Value) {
        if !self.tracking() {
            return;
        }
        self.emit(name, properties);
    }

    // -- experiment passthroughs -------------------------------------------

    /// Resolve this session's variant. `None` when A/B testing or tracking
    /// is switched off, or the experiment is not assignable.
    pub fn get_variant(&mut self, experiment: &Experiment<C>, subject_key: Option<&str>) -> Option<Assignment> {
        if !self.config.enabled || !self.config.enable_ab_testing {
            return None;
        }
        self.experiments.get_variant(experiment, subject_key)
    }

    pub fn variant_config(&self, test_id: &str) -> Option<&C> {
        self.experiments.variant_config(test_id)
    }

    pub fn track_impression(&mut self, test_id: &str, variant_id: &str, context: Option<Value>) {
        if !self.tracking() || !self.config.enable_ab_testing {
            return;
        }
        let record = self.experiments.track_impression(test_id, variant_id, context);
        self.emit(
            "ab_impression",
            json!({ "testId": record.test_id, "variantId": record.variant_id, "context": record.context }),
        );
    }

    pub fn track_conversion(&mut self, test_id: &str, variant_id: &str, conversion_data: Option<Value>) {
        if !self.tracking() || !self.config.enable_ab_testing {
            return;
        }
        let record = self.experiments.track_conversion(test_id, variant_id, conversion_data);
        self.emit_conversion(&record);
    }

    pub fn get_test_results(&self, test_id: &str) -> Option<TestResults> {
        self.experiments.get_test_results(test_id)
    }

    /// POST this session's conversion report. Returns whether it was
    /// delivered.
    pub async fn report_conversions(&self) -> bool {
        let report = self.experiments.conversion_report();
        self.deliver(Endpoint::ConversionReport, serde_json::to_value(&report)).await
    }

    /// POST a full export of the session: identity, timing, every
    /// engagement record and the per-test results.
    pub async fn export(&self) -> bool {
        let report = self.experiments.conversion_report();
        let payload = json!({
            "sessionId": self.session.id(),
            "deviceType": self.session.device_type().to_string(),
            "startedAt": self.session.started_at(),
            "durationSecs": self.session.duration_secs(),
            "records": self.experiments.records(),
            "tests": report.tests,
        });
        self.deliver(Endpoint::Export, Ok(payload)).await
    }

    // -- internals ---------------------------------------------------------

    fn tracking(&self) -> bool {
        self.config.enabled && !self.torn_down && self.session.state() != SessionState::Terminated
    }

    async fn deliver(&self, endpoint: Endpoint, payload: serde_json::Result<Value>) -> bool {
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, %endpoint, "could not encode payload");
                return false;
            }
        };
        match self.dispatcher.sink.deliver(endpoint, &payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, %endpoint, "delivery failed");
                false
            }
        }
    }

    fn emit_conversion(&self, record: &EngagementRecord) {
        self.emit(
            "ab_conversion",
            json!({
                "testId": record.test_id,
                "variantId": record.variant_id,
                "goal": record.goal(),
                "context": record.context,
            }),
        );
    }

    fn emit(&self, name: &str, properties: Value) {
        let event = AnalyticsEvent {
            name: name.to_string(),
            session_id: self.session.id().to_string(),
            page: self.session.current_page(),
            timestamp: now_ms(),
            properties,
        };

        for integration in &self.integrations {
            if integration.kind() == IntegrationKind::Heatmap && !self.config.enable_heat_mapping {
                continue;
            }
            if let Err(e) = integration.forward(&event) {
                warn!(integration = integration.name(), error = %e, "integration rejected event");
            }
        }

        if self.config.enable_debug_mode {
            info!(event = %event.name, properties = %event.properties, "tracked");
        } else {
            debug!(event = %event.name, "tracked");
        }
        self.dispatcher.push(event);
    }
}

impl<C> Drop for BehaviorTracker<C> {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::AbError;
    use crate::experiment::Variant;
    use crate::reporting::RecordingSink;
    use crate::store::MemoryStore;

    struct Harness {
        tracker: BehaviorTracker,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryStore>,
    }

    fn harness(config: TrackerConfig) -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());
        let tracker = BehaviorTracker::new(config, store.clone(), sink.clone());
        Harness { tracker, sink, store }
    }

    fn pricing() -> Experiment {
        Experiment::new("pricing_test")
            .with(Variant::new("control", 50.0))
            .with(Variant::new("v2", 50.0))
    }

    #[derive(Default)]
    struct CapturingIntegration {
        kind: Option<IntegrationKind>,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Integration for CapturingIntegration {
        fn name(&self) -> &str {
            "capture"
        }

        fn kind(&self) -> IntegrationKind {
            self.kind.unwrap_or(IntegrationKind::Analytics)
        }

        fn forward(&self, event: &AnalyticsEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.name.clone());
            if self.fail {
                return Err(AbError::Config("integration offline".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_buffer_until_flush() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.track_page_view("/pricing", Some("Pricing"));
        h.tracker.track_event("custom", json!({"k": 1}));
        assert_eq!(h.tracker.buffered_events(), 2);
        assert!(h.sink.deliveries().is_empty());

        h.tracker.flush().await;
        assert_eq!(h.tracker.buffered_events(), 0);
        assert_eq!(h.sink.event_names(), vec!["page_view", "custom"]);

        let (_, body) = &h.sink.deliveries()[0];
        assert_eq!(body["sessionId"], h.tracker.session_id());
        assert_eq!(body["events"][0]["page"], "/pricing");
    }

    #[tokio::test]
    async fn test_disabled_tracker_records_nothing() {
        let mut h = harness(TrackerConfig { enabled: false, ..TrackerConfig::default() });
        h.tracker.track_page_view("/", None);
        h.tracker.track_cta_click("demo", None, None);
        assert_eq!(h.tracker.buffered_events(), 0);
        assert!(h.tracker.get_variant(&pricing(), Some("u1")).is_none());
    }

    #[tokio::test]
    async fn test_ab_testing_switch_disables_assignment() {
        let mut h = harness(TrackerConfig { enable_ab_testing: false, ..TrackerConfig::default() });
        assert!(h.tracker.get_variant(&pricing(), Some("u1")).is_none());
        h.tracker.track_cta_click("demo", None, None);
        assert_eq!(h.tracker.buffered_events(), 1);
    }

    #[tokio::test]
    async fn test_scroll_milestones_fire_once_per_page() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.track_page_view("/a", None);
        h.tracker.track_scroll_depth(30.0);
        h.tracker.track_scroll_depth(60.0);
        h.tracker.track_scroll_depth(55.0);
        h.tracker.track_scroll_depth(f64::NAN);
        h.tracker.track_scroll_depth(250.0);
        h.tracker.track_page_view("/b", None);
        h.tracker.track_scroll_depth(100.0);
        h.tracker.flush().await;

        let deliveries = h.sink.deliveries();
        let depths: Vec<u64> = deliveries
            .iter()
            .flat_map(|(_, body)| body["events"].as_array().unwrap().iter())
            .filter(|e| e["name"] == "scroll_depth")
            .map(|e| e["properties"]["depth"].as_u64().unwrap())
            .collect();
        assert_eq!(depths, vec![25, 50, 75, 100, 25, 50, 75, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_section_exit_records_time_on_section() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.track_section_view("hero");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.tracker.track_section_exit("hero");
        h.tracker.track_section_exit("never-entered");
        h.tracker.flush().await;

        assert_eq!(h.sink.event_names(), vec!["section_view", "section_exit", "time_on_section"]);
        let body = &h.sink.deliveries()[0].1;
        let on_section = body["events"][1]["properties"]["timeOnSectionMs"].as_u64().unwrap();
        assert!((1500..1600).contains(&on_section), "{on_section}");
        assert_eq!(body["events"][2]["properties"]["timeMs"], on_section);
    }

    #[tokio::test]
    async fn test_cta_click_goal_records_conversion_for_each_assignment() {
        let mut h = harness(TrackerConfig::default());
        let a = h.tracker.get_variant(&pricing(), Some("u1")).unwrap();
        h.tracker.track_cta_click("demo", Some("Book a demo"), Some(json!({"placement": "hero"})));
        h.tracker.flush().await;

        assert_eq!(h.sink.event_names(), vec!["cta_click", "ab_conversion"]);
        let body = &h.sink.deliveries()[0].1;
        assert_eq!(body["events"][0]["properties"]["placement"], "hero");
        assert_eq!(body["events"][1]["properties"]["testId"], "pricing_test");
        assert_eq!(body["events"][1]["properties"]["variantId"], a.variant_id.as_str());
        assert_eq!(body["events"][1]["properties"]["goal"], "demo_request");

        let results = h.tracker.get_test_results("pricing_test").unwrap();
        assert_eq!(results.variant(&a.variant_id).unwrap().conversions, 1);
    }

    #[tokio::test]
    async fn test_unmapped_cta_click_records_no_conversion() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.get_variant(&pricing(), Some("u1")).unwrap();
        h.tracker.track_cta_click("unmapped_action", None, None);
        assert_eq!(h.tracker.buffered_events(), 1);
        assert!(h.tracker.experiments().records().is_empty());
    }

    #[tokio::test]
    async fn test_configured_goal_mapping() {
        let mut config = TrackerConfig::default();
        config.goals.insert("donate", "donation");
        let mut h = harness(config);
        h.tracker.get_variant(&pricing(), None).unwrap();
        h.tracker.track_cta_click("donate", None, None);
        assert_eq!(h.tracker.experiments().records()[0].goal(), Some("donation"));
    }

    #[tokio::test]
    async fn test_impression_and_conversion_passthrough() {
        let mut h = harness(TrackerConfig::default());
        let a = h.tracker.get_variant(&pricing(), None).unwrap();
        for _ in 0..10 {
            h.tracker.track_impression("pricing_test", &a.variant_id, None);
        }
        for _ in 0..3 {
            h.tracker.track_conversion("pricing_test", &a.variant_id, None);
        }
        let results = h.tracker.get_test_results("pricing_test").unwrap();
        assert_eq!(results.variant(&a.variant_id).unwrap().conversion_rate, Some(0.3));
        assert_eq!(h.tracker.buffered_events(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let config = TrackerConfig { flush_interval_ms: 5_000, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.start();
        h.tracker.track_event("one", Value::Null);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.sink.deliveries().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.sink.event_names(), vec!["one"]);
        h.tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_triggers_early_flush() {
        let config = TrackerConfig { batch_size: 2, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.start();
        h.tracker.track_event("one", Value::Null);
        h.tracker.track_event("two", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.sink.event_names(), vec!["one", "two"]);
        h.tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_once() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.start();
        h.tracker.track_event("bye", Value::Null);
        h.tracker.shutdown().await;
        h.tracker.shutdown().await;
        assert_eq!(h.sink.deliveries().len(), 1);
        assert_eq!(h.tracker.session().state(), SessionState::Terminated);

        h.tracker.track_event("after", Value::Null);
        assert_eq!(h.tracker.buffered_events(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_when_configured() {
        let config = TrackerConfig { flush_on_teardown: false, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.track_event("lost", Value::Null);
        h.tracker.shutdown().await;
        assert!(h.sink.deliveries().is_empty());
        assert_eq!(h.tracker.buffered_events(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dropped_not_propagated() {
        let mut h = harness(TrackerConfig::default());
        h.sink.set_failing(true);
        h.tracker.track_event("x", Value::Null);
        h.tracker.flush().await;
        assert_eq!(h.tracker.buffered_events(), 0);
        h.sink.set_failing(false);
        h.tracker.flush().await;
        assert!(h.sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_hidden_page_flushes() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.track_event("x", Value::Null);
        h.tracker.set_visibility(false).await;
        assert!(h.sink.deliveries().is_empty());
        h.tracker.set_visibility(true).await;
        assert_eq!(h.sink.event_names(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_offline_events_stashed_and_replayed() {
        let config = TrackerConfig { enable_offline_storage: true, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.track_event("before", Value::Null);
        h.tracker.set_online(false).await;
        h.tracker.flush().await;
        h.tracker.track_event("while_offline", Value::Null);
        assert!(h.sink.deliveries().is_empty());
        assert!(h.store.get(OFFLINE_STORAGE_KEY).unwrap().is_some());

        h.tracker.set_online(true).await;
        assert_eq!(h.sink.event_names(), vec!["before", "while_offline"]);
        assert!(h.store.get(OFFLINE_STORAGE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_without_storage_holds_buffer() {
        let mut h = harness(TrackerConfig::default());
        h.tracker.set_online(false).await;
        h.tracker.track_event("held", Value::Null);
        h.tracker.flush().await;
        assert_eq!(h.tracker.buffered_events(), 1);
        assert!(h.store.get(OFFLINE_STORAGE_KEY).unwrap().is_none());

        h.tracker.set_online(true).await;
        assert_eq!(h.sink.event_names(), vec!["held"]);
    }

    fn stashed_names(store: &MemoryStore) -> Vec<String> {
        let raw = store.get(OFFLINE_STORAGE_KEY).unwrap().unwrap_or_else(|| "[]".into());
        let events: Vec<AnalyticsEvent> = serde_json::from_str(&raw).unwrap();
        events.into_iter().map(|e| e.name).collect()
    }

    #[tokio::test]
    async fn test_offline_tracking_stays_in_memory_and_bounded() {
        let config = TrackerConfig { enable_offline_storage: true, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.set_online(false).await;
        for i in 0..5_000 {
            h.tracker.track_event(&format!("e{i}"), Value::Null);
        }
        assert_eq!(h.tracker.buffered_events(), MIN_BUFFER_CAPACITY);
        assert!(h.store.get(OFFLINE_STORAGE_KEY).unwrap().is_none(), "tracking must not write the store");

        h.tracker.flush().await;
        let stashed = stashed_names(&h.store);
        assert_eq!(stashed.len(), MIN_BUFFER_CAPACITY);
        assert_eq!(stashed.first().map(String::as_str), Some("e4900"));
        assert_eq!(stashed.last().map(String::as_str), Some("e4999"));

        for i in 0..5 {
            h.tracker.track_event(&format!("late{i}"), Value::Null);
        }
        h.tracker.set_visibility(true).await;
        let stashed = stashed_names(&h.store);
        assert_eq!(stashed.len(), MIN_BUFFER_CAPACITY);
        assert_eq!(stashed.first().map(String::as_str), Some("e4905"));
        assert_eq!(stashed.last().map(String::as_str), Some("late4"));

        h.tracker.set_online(true).await;
        let names = h.sink.event_names();
        assert_eq!(names.len(), MIN_BUFFER_CAPACITY);
        assert_eq!(names.last().map(String::as_str), Some("late4"));
        assert_eq!(h.sink.deliveries().len(), MIN_BUFFER_CAPACITY / 10);
    }

    #[tokio::test]
    async fn test_buffer_capacity_scales_with_batch_size() {
        let config = TrackerConfig { batch_size: 50, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.set_online(false).await;
        for i in 0..600 {
            h.tracker.track_event(&format!("e{i}"), Value::Null);
        }
        assert_eq!(h.tracker.buffered_events(), 500);
    }

    #[tokio::test]
    async fn test_reconnect_replays_in_tracking_order() {
        let config = TrackerConfig { enable_offline_storage: true, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.track_event("first_online", Value::Null);
        h.tracker.set_online(false).await;
        assert_eq!(stashed_names(&h.store), vec!["first_online"]);

        h.tracker.track_event("second_offline", Value::Null);
        h.tracker.flush().await;
        h.tracker.track_event("third_offline", Value::Null);
        h.tracker.set_online(true).await;

        assert_eq!(h.sink.event_names(), vec!["first_online", "second_offline", "third_offline"]);
        assert_eq!(h.tracker.buffered_events(), 0);
    }

    #[tokio::test]
    async fn test_flush_sends_batch_size_chunks() {
        let config = TrackerConfig { batch_size: 2, ..TrackerConfig::default() };
        let mut h = harness(config);
        for name in ["a", "b", "c", "d", "e"] {
            h.tracker.track_event(name, Value::Null);
        }
        h.tracker.flush().await;

        let sizes: Vec<usize> = h
            .sink
            .deliveries()
            .iter()
            .map(|(_, body)| body["events"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(h.sink.event_names(), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_flush_interval_keeps_flusher_running() {
        let config = TrackerConfig { flush_interval_ms: 0, ..TrackerConfig::default() };
        let mut h = harness(config);
        h.tracker.start();
        h.tracker.track_event("one", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.sink.event_names(), vec!["one"]);
        assert!(!h.tracker.flusher.as_ref().unwrap().is_finished());

        h.tracker.track_event("two", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.sink.event_names(), vec!["one", "two"]);
        h.tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_heatmap_integration_needs_flag() {
        let analytics = Arc::new(CapturingIntegration::default());
        let heatmap = Arc::new(CapturingIntegration {
            kind: Some(IntegrationKind::Heatmap),
            ..Default::default()
        });
        let mut h = harness(TrackerConfig::default());
        h.tracker = h.tracker.with_integration(analytics.clone()).with_integration(heatmap.clone());
        h.tracker.track_event("click", Value::Null);
        assert_eq!(analytics.seen.lock().unwrap().len(), 1);
        assert!(heatmap.seen.lock().unwrap().is_empty());

        let sink = Arc::new(RecordingSink::new());
        let config = TrackerConfig { enable_heat_mapping: true, ..TrackerConfig::default() };
        let mut t: BehaviorTracker = BehaviorTracker::new(config, Arc::new(MemoryStore::new()), sink)
            .with_integration(heatmap.clone());
        t.track_event("click", Value::Null);
        assert_eq!(heatmap.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_integration_does_not_block_tracking() {
        let failing = Arc::new(CapturingIntegration { fail: true, ..Default::default() });
        let mut h = harness(TrackerConfig::default());
        h.tracker = h.tracker.with_integration(failing.clone());
        h.tracker.track_event("x", Value::Null);
        assert_eq!(h.tracker.buffered_events(), 1);
    }

    #[tokio::test]
    async fn test_report_and_export_endpoints() {
        let mut h = harness(TrackerConfig::default());
        let a = h.tracker.get_variant(&pricing(), Some("u1")).unwrap();
        h.tracker.track_impression("pricing_test", &a.variant_id, None);
        h.tracker.track_cta_click("trial", None, None);

        assert!(h.tracker.report_conversions().await);
        assert!(h.tracker.export().await);
        let d = h.sink.deliveries();
        assert_eq!(d[0].0, Endpoint::ConversionReport);
        assert_eq!(d[0].1["conversions"][0]["context"]["goal"], "trial_signup");
        assert_eq!(d[1].0, Endpoint::Export);
        assert_eq!(d[1].1["records"].as_array().unwrap().len(), 2);

        h.sink.set_failing(true);
        assert!(!h.tracker.report_conversions().await);
    }

    #[tokio::test]
    async fn test_session_prefix_and_device_from_config() {
        let config = TrackerConfig {
            session_prefix: "alumni".into(),
            viewport_width: 800,
            ..TrackerConfig::default()
        };
        let h = harness(config);
        assert!(h.tracker.session_id().starts_with("alumni_"));
        assert_eq!(h.tracker.session().device_type().to_string(), "tablet");
    }
}
