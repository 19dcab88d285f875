//! # Stage: Session Lifecycle
//!
//! ## Responsibility
//! Session identity (`<prefix>_<epoch-ms>_<base36>`), device classification,
//! a one-second duration ticker, and the inactivity timer that moves the
//! session between `Active` and `Idle`.
//!
//! ## Guarantees
//! - Soft idle: `Idle` only flips [`Session::is_active`]; nothing is gated on it
//! - Clean teardown: [`Session::shutdown`] (or drop) aborts every timer task
//! - Terminal: once `Terminated`, activity no longer changes the state
//!
//! ## NOT Responsible For
//! - Tracking events (see [`crate::tracker`])
//! - Aborting in-flight network requests

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::now_ms;

/// Inactivity period after which a session counts as idle.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the session-duration ticker.
pub const DURATION_TICK: Duration = Duration::from_secs(1);

const MOBILE_MAX_WIDTH: u32 = 768;
const TABLET_MAX_WIDTH: u32 = 1024;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Render `n` in lowercase base 36.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// `<prefix>_<epoch-ms>_<9 random base-36 chars>`.
pub fn generate_session_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    // 36^9 fits comfortably in u64; pad so the suffix is always 9 chars.
    let suffix = to_base36(rng.gen_range(0..36u64.pow(9)));
    format!("{prefix}_{}_{suffix:0>9}", now_ms())
}

/// Viewport-width bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceType {
    pub fn from_viewport_width(width: u32) -> Self {
        if width < MOBILE_MAX_WIDTH {
            DeviceType::Mobile
        } else if width < TABLET_MAX_WIDTH {
            DeviceType::Tablet
        } else {
            DeviceType::Desktop
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Mobile => write!(f, "mobile"),
            DeviceType::Tablet => write!(f, "tablet"),
            DeviceType::Desktop => write!(f, "desktop"),
        }
    }
}

/// Host-side signals that count as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Click,
    Scroll,
    Keypress,
    MouseMove,
    TouchStart,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityKind::Click => "click",
            ActivityKind::Scroll => "scroll",
            ActivityKind::Keypress => "keypress",
            ActivityKind::MouseMove => "mousemove",
            ActivityKind::TouchStart => "touchstart",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Active = 1,
    Idle = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Active,
            2 => SessionState::Idle,
            3 => SessionState::Terminated,
            _ => SessionState::Uninitialized,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prefix: String,
    pub inactivity_timeout: Duration,
    pub tick: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: "session".into(),
            inactivity_timeout: INACTIVITY_TIMEOUT,
            tick: DURATION_TICK,
        }
    }
}

struct SessionInner {
    id: String,
    device_type: DeviceType,
    started_at: u64,
    state: AtomicU8,
    duration_secs: AtomicU64,
    activity: Notify,
    current_page: Mutex<Option<String>>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to` only if the session is still in `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One visitor session. Timers run as tokio tasks from [`Session::start`]
/// until [`Session::shutdown`] or drop.
pub struct Session {
    inner: Arc<SessionInner>,
    config: SessionConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: SessionConfig, viewport_width: u32) -> Self {
        let inner = Arc::new(SessionInner {
            id: generate_session_id(&config.prefix),
            device_type: DeviceType::from_viewport_width(viewport_width),
            started_at: now_ms(),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            duration_secs: AtomicU64::new(0),
            activity: Notify::new(),
            current_page: Mutex::new(None),
        });
        Self { inner, config, tasks: Vec::new() }
    }

    /// Start the duration ticker and inactivity timer. Must be called from
    /// within a tokio runtime. Calling it again is a no-op.
    pub fn start(&mut self) {
        if !self.inner.transition(SessionState::Uninitialized, SessionState::Active) {
            return;
        }
        debug!(session_id = %self.inner.id, device = %self.inner.device_type, "session started");

        let ticker_state = Arc::clone(&self.inner);
        let tick = self.config.tick;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ticker_state.duration_secs.fetch_add(1, Ordering::Relaxed);
            }
        }));

        let idle_state = Arc::clone(&self.inner);
        let timeout = self.config.inactivity_timeout;
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = idle_state.activity.notified() => continue,
                    _ = tokio::time::sleep(timeout) => {
                        if idle_state.transition(SessionState::Active, SessionState::Idle) {
                            debug!(session_id = %idle_state.id, "session idle");
                        }
                        // Stay idle until the next activity signal restarts the timer.
                        idle_state.activity.notified().await;
                        if idle_state.transition(SessionState::Idle, SessionState::Active) {
                            debug!(session_id = %idle_state.id, "session active again");
                        }
                    }
                }
            }
        }));
    }

    /// Register a user-activity signal: resets the inactivity timer and
    /// revives an idle session.
    pub fn record_activity(&self, kind: ActivityKind) {
        if matches!(self.inner.state(), SessionState::Uninitialized | SessionState::Terminated) {
            return;
        }
        self.inner.activity.notify_one();
        // The watcher may have gone idle after the state read above; it also
        // revives the session when this signal wakes it.
        if self.inner.transition(SessionState::Idle, SessionState::Active) {
            debug!(session_id = %self.inner.id, activity = %kind, "session active again");
        }
    }

    /// Stop every timer and mark the session terminated.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let previous = self.inner.state.swap(SessionState::Terminated as u8, Ordering::AcqRel);
        if previous != SessionState::Terminated as u8 {
            debug!(
                session_id = %self.inner.id,
                duration_secs = self.duration_secs(),
                "session terminated"
            );
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.device_type
    }

    pub fn started_at(&self) -> u64 {
        self.inner.started_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// `true` while the session is started and not idle or terminated.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Seconds counted by the duration ticker.
    pub fn duration_secs(&self) -> u64 {
        self.inner.duration_secs.load(Ordering::Relaxed)
    }

    pub fn set_current_page(&self, page: impl Into<String>) {
        if let Ok(mut current) = self.inner.current_page.lock() {
            *current = Some(page.into());
        }
    }

    pub fn current_page(&self) -> Option<String> {
        self.inner.current_page.lock().ok().and_then(|p| p.clone())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
