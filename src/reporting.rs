//! Delivery of analytics payloads to the reporting endpoint.
//!
//! The tracker never talks HTTP directly; it hands JSON payloads to a
//! [`ReportSink`]. [`HttpReporter`] is the production sink, [`RecordingSink`]
//! keeps deliveries in memory (dry runs, tests), [`NullSink`] drops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{AbError, Result};

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Reporting endpoints under `{base_url}/api/analytics/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Events,
    ConversionReport,
    Export,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Events => "/api/analytics/events",
            Endpoint::ConversionReport => "/api/analytics/conversion-report",
            Endpoint::Export => "/api/analytics/export",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// One tracked analytics event, as buffered and sent in batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Event name, e.g. `page_view`, `cta_click`, `ab_conversion`.
    pub name: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// Body of a POST to [`Endpoint::Events`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    pub events: Vec<AnalyticsEvent>,
}

// ---------------------------------------------------------------------------
// ReportSink
// ---------------------------------------------------------------------------

/// Destination for reporting payloads.
///
/// Object-safe so trackers can hold `Arc<dyn ReportSink>`.
pub trait ReportSink: Send + Sync {
    fn deliver<'a>(&'a self, endpoint: Endpoint, payload: &'a serde_json::Value) -> BoxFuture<'a, Result<()>>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn deliver<'a>(&'a self, _endpoint: Endpoint, _payload: &'a serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Keeps every delivery in memory. Can be switched into a failing mode to
/// stand in for an unreachable endpoint.
#[derive(Debug, Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(Endpoint, serde_json::Value)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, deliveries are rejected with a connection error and not
    /// recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn deliveries(&self) -> Vec<(Endpoint, serde_json::Value)> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Every event name delivered to [`Endpoint::Events`], in order.
    pub fn event_names(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .filter(|(e, _)| *e == Endpoint::Events)
            .flat_map(|(_, body)| {
                serde_json::from_value::<EventBatch>(body)
                    .map(|b| b.events.into_iter().map(|e| e.name).collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl ReportSink for RecordingSink {
    fn deliver<'a>(&'a self, endpoint: Endpoint, payload: &'a serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::Relaxed) {
                return Err(AbError::Connect {
                    url: endpoint.path().to_string(),
                    detail: "recording sink set to fail".into(),
                });
            }
            if let Ok(mut d) = self.deliveries.lock() {
                d.push((endpoint, payload.clone()));
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// HttpReporter
// ---------------------------------------------------------------------------

/// Connection settings for [`HttpReporter`].
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Base URL of the host application (e.g. `https://alumni.example.org`).
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ReporterConfig {
    /// Defaults: connect timeout 3 s, request timeout 10 s.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

/// POSTs JSON payloads to the reporting endpoints with `reqwest`.
pub struct HttpReporter {
    config: ReporterConfig,
    client: reqwest::Client,
}

impl HttpReporter {
    pub fn builder(base_url: impl Into<String>) -> HttpReporterBuilder {
        HttpReporterBuilder::new(base_url)
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    /// POST `payload` to `endpoint`.
    ///
    /// # Returns
    /// - `Ok(())` on a 2xx response
    /// - `Err(AbError::Connect)` when the request could not be sent
    /// - `Err(AbError::Http)` on a non-2xx response
    pub async fn post(&self, endpoint: Endpoint, payload: &serde_json::Value) -> Result<()> {
        let url = self.config.url(endpoint);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AbError::Connect { url: url.clone(), detail: e.to_string() })?;

        if !resp.status().is_success() {
            return Err(AbError::Http { status: resp.status().as_u16(), url });
        }
        Ok(())
    }
}

impl ReportSink for HttpReporter {
    fn deliver<'a>(&'a self, endpoint: Endpoint, payload: &'a serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post(endpoint, payload))
    }
}

/// Builder for [`HttpReporter`].
pub struct HttpReporterBuilder {
    config: ReporterConfig,
}

impl HttpReporterBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { config: ReporterConfig::new(base_url) }
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> HttpReporter {
        // Client construction only fails in exotic TLS setups; fall back to a
        // default client rather than panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();
        HttpReporter { config: self.config, client }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Endpoint::Events.path(), "/api/analytics/events");
        assert_eq!(Endpoint::ConversionReport.path(), "/api/analytics/conversion-report");
        assert_eq!(Endpoint::Export.to_string(), "/api/analytics/export");
    }

    #[test]
    fn test_reporter_config_trims_trailing_slash() {
        let cfg = ReporterConfig::new("http://localhost:8000/");
        assert_eq!(cfg.url(Endpoint::Events), "http://localhost:8000/api/analytics/events");
    }

    #[test]
    fn test_builder_defaults_and_overrides() {
        let r = HttpReporter::builder("http://localhost:8000").build();
        assert_eq!(r.config().connect_timeout, Duration::from_secs(3));
        assert_eq!(r.config().request_timeout, Duration::from_secs(10));

        let r = HttpReporter::builder("http://localhost:8000")
            .connect_timeout(Duration::from_millis(250))
            .request_timeout(Duration::from_secs(2))
            .build();
        assert_eq!(r.config().connect_timeout, Duration::from_millis(250));
        assert_eq!(r.config().request_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_http_reporter_unreachable_is_connect_error() {
        // Port 9 on localhost: nothing listens there in test environments.
        let r = HttpReporter::builder("http://127.0.0.1:9")
            .connect_timeout(Duration::from_millis(200))
            .request_timeout(Duration::from_millis(500))
            .build();
        let err = r.post(Endpoint::Events, &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, AbError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_recording_sink_records_and_fails_on_demand() {
        let sink = RecordingSink::new();
        sink.deliver(Endpoint::Export, &serde_json::json!({"a": 1})).await.unwrap();
        sink.set_failing(true);
        assert!(sink.deliver(Endpoint::Export, &serde_json::json!({"a": 2})).await.is_err());
        let d = sink.deliveries();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].1["a"], 1);
    }

    #[tokio::test]
    async fn test_recording_sink_event_names() {
        let sink = RecordingSink::new();
        let batch = EventBatch {
            session_id: "s".into(),
            tracking_id: None,
            events: vec![
                AnalyticsEvent {
                    name: "page_view".into(),
                    session_id: "s".into(),
                    page: Some("/".into()),
                    timestamp: 1,
                    properties: serde_json::Value::Null,
                },
                AnalyticsEvent {
                    name: "cta_click".into(),
                    session_id: "s".into(),
                    page: None,
                    timestamp: 2,
                    properties: serde_json::json!({"action": "demo"}),
                },
            ],
        };
        sink.deliver(Endpoint::Events, &serde_json::to_value(&batch).unwrap()).await.unwrap();
        assert_eq!(sink.event_names(), vec!["page_view", "cta_click"]);
    }

    #[test]
    fn test_event_batch_wire_shape_omits_missing_tracking_id() {
        let batch = EventBatch { session_id: "s".into(), tracking_id: None, events: vec![] };
        let v = serde_json::to_value(&batch).unwrap();
        assert_eq!(v["sessionId"], "s");
        assert!(v.get("trackingId").is_none());
    }

    #[tokio::test]
    async fn test_null_sink_accepts_everything() {
        assert!(NullSink.deliver(Endpoint::Events, &serde_json::json!(null)).await.is_ok());
    }
}
