//! Tagged metric emission.
//!
//! Request-path code never touches a global recorder directly: it emits
//! through a [`ContextMetrics`] scope, which carries the tags accumulated so
//! far (endpoint id, handler id, dimension headers) over a shared
//! [`MetricsSink`]. [`RecorderSink`] forwards to the `metrics` facade, so
//! whichever recorder the host process installs receives the samples;
//! [`InMemoryMetrics`] keeps them for assertions in tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::Headers;

/// Metric tags, ordered so that identical tag sets compare equal.
pub type Tags = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub mod names {
    pub const ENDPOINT_REQUEST: &str = "endpoint.request";
    pub const ENDPOINT_SUCCESS: &str = "endpoint.success";
    pub const ENDPOINT_STATUS: &str = "endpoint.status";
    pub const ENDPOINT_APP_ERRORS: &str = "endpoint.app-errors";
    pub const ENDPOINT_SYSTEM_ERRORS: &str = "endpoint.system-errors";
    pub const ENDPOINT_LATENCY: &str = "endpoint.latency";
    pub const ENDPOINT_LATENCY_HIST: &str = "endpoint.latency-hist";
    pub const ENDPOINT_PANIC: &str = "endpoint.panic";

    pub const CLIENT_REQUEST: &str = "client.request";
    pub const CLIENT_SUCCESS: &str = "client.success";
    pub const CLIENT_STATUS: &str = "client.status";
    pub const CLIENT_ERRORS: &str = "client.errors";
    pub const CLIENT_APP_ERRORS: &str = "client.app-errors";
    pub const CLIENT_SYSTEM_ERRORS: &str = "client.system-errors";
    pub const CLIENT_LATENCY: &str = "client.latency";
    pub const CLIENT_LATENCY_HIST: &str = "client.latency-hist";
    pub const CLIENT_UNMARSHAL_ERROR: &str = "client.http-unmarshal-error";

    pub const BREAKER_STATE: &str = "circuitbreaker.state";
    pub const BREAKER_REJECTED: &str = "circuitbreaker.rejected";
}

/// Tag keys shared by endpoint and client metrics.
pub mod tags {
    pub const ENDPOINT_ID: &str = "endpointid";
    pub const HANDLER_ID: &str = "handlerid";
    pub const CLIENT_ID: &str = "clientid";
    pub const CLIENT_METHOD: &str = "clientmethod";
    pub const STATUS: &str = "status";
    pub const CLIENT_TYPE: &str = "clienttype";
    pub const PROTOCOL: &str = "protocol";
    pub const API_ENVIRONMENT: &str = "apienvironment";
}

/// Inbound headers promoted to metric dimensions, with their tag key.
const DIMENSION_HEADERS: &[(&str, &str)] = &[
    ("x-device", "device"),
    ("x-region", "region"),
    ("x-device-version", "deviceversion"),
    ("x-api-environment", tags::API_ENVIRONMENT),
];

/// Extracts the metric dimension tags carried by `headers`.
///
/// `apienvironment` is always present and defaults to `production`.
#[must_use]
pub fn dimension_tags(headers: &Headers) -> Tags {
    let mut out = Tags::new();
    for (header, tag) in DIMENSION_HEADERS {
        if let Some(value) = headers.get(header).filter(|v| !v.is_empty()) {
            out.insert((*tag).to_string(), value.to_string());
        }
    }
    out.entry(tags::API_ENVIRONMENT.to_string())
        .or_insert_with(|| "production".to_string());
    out
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

/// Destination for tagged samples. Implementations must not block.
pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &str, tags: &Tags, value: u64);
    fn gauge(&self, name: &str, tags: &Tags, value: f64);
    fn timer(&self, name: &str, tags: &Tags, value: Duration);
    fn histogram(&self, name: &str, tags: &Tags, value: Duration);
}

fn labels(tags: &Tags) -> Vec<metrics::Label> {
    tags.iter()
        .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
        .collect()
}

/// Sink that forwards to the process-wide `metrics` recorder.
///
/// Timers and histograms are both recorded as histograms in milliseconds;
/// the two names let dashboards keep separate bucket layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn counter(&self, name: &str, tags: &Tags, value: u64) {
        metrics::counter!(name.to_string(), labels(tags)).increment(value);
    }

    fn gauge(&self, name: &str, tags: &Tags, value: f64) {
        metrics::gauge!(name.to_string(), labels(tags)).set(value);
    }

    fn timer(&self, name: &str, tags: &Tags, value: Duration) {
        metrics::histogram!(name.to_string(), labels(tags)).record(value.as_secs_f64() * 1000.0);
    }

    fn histogram(&self, name: &str, tags: &Tags, value: Duration) {
        metrics::histogram!(name.to_string(), labels(tags)).record(value.as_secs_f64() * 1000.0);
    }
}

/// One recorded sample, as captured by [`InMemoryMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Counter(u64),
    Gauge(f64),
    Timer(Duration),
    Histogram(Duration),
}

/// A sample together with its name and tags.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    pub name: String,
    pub tags: Tags,
    pub sample: Sample,
}

/// Sink that keeps every sample in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<RecordedMetric>>,
}

impl InMemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples recorded so far, in emission order.
    #[must_use]
    pub fn samples(&self) -> Vec<RecordedMetric> {
        self.samples.lock().clone()
    }

    /// All samples with the given metric name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<RecordedMetric> {
        self.samples
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    /// Sum of every counter sample named `name`.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.samples
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .filter_map(|m| match m.sample {
                Sample::Counter(v) => Some(v),
                _ => None,
            })
            .sum()
    }

    /// Last gauge value recorded for `name`, if any.
    #[must_use]
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.samples
            .lock()
            .iter()
            .rev()
            .find_map(|m| match m.sample {
                Sample::Gauge(v) if m.name == name => Some(v),
                _ => None,
            })
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    fn push(&self, name: &str, tags: &Tags, sample: Sample) {
        self.samples.lock().push(RecordedMetric {
            name: name.to_string(),
            tags: tags.clone(),
            sample,
        });
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, tags: &Tags, value: u64) {
        self.push(name, tags, Sample::Counter(value));
    }

    fn gauge(&self, name: &str, tags: &Tags, value: f64) {
        self.push(name, tags, Sample::Gauge(value));
    }

    fn timer(&self, name: &str, tags: &Tags, value: Duration) {
        self.push(name, tags, Sample::Timer(value));
    }

    fn histogram(&self, name: &str, tags: &Tags, value: Duration) {
        self.push(name, tags, Sample::Histogram(value));
    }
}

// ---------------------------------------------------------------------------
// ContextMetrics
// ---------------------------------------------------------------------------

/// A tag scope over a shared sink.
#[derive(Clone)]
pub struct ContextMetrics {
    sink: Arc<dyn MetricsSink>,
    tags: Tags,
}

impl ContextMetrics {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            tags: Tags::new(),
        }
    }

    /// Returns a child scope with `extra` layered over the current tags.
    #[must_use]
    pub fn tagged<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut tags = self.tags.clone();
        tags.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            sink: Arc::clone(&self.sink),
            tags,
        }
    }

    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    #[must_use]
    pub fn sink(&self) -> Arc<dyn MetricsSink> {
        Arc::clone(&self.sink)
    }

    pub fn inc_counter(&self, name: &str, value: u64) {
        self.sink.counter(name, &self.tags, value);
    }

    pub fn update_gauge(&self, name: &str, value: f64) {
        self.sink.gauge(name, &self.tags, value);
    }

    pub fn record_timer(&self, name: &str, value: Duration) {
        self.sink.timer(name, &self.tags, value);
    }

    pub fn record_histogram(&self, name: &str, value: Duration) {
        self.sink.histogram(name, &self.tags, value);
    }
}

impl std::fmt::Debug for ContextMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextMetrics")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_tags_pick_known_headers() {
        let headers: Headers = [
            ("X-Device", "ios"),
            ("x-region", "sjc"),
            ("x-unrelated", "nope"),
        ]
        .into_iter()
        .collect();
        let tags = dimension_tags(&headers);
        assert_eq!(tags.get("device").map(String::as_str), Some("ios"));
        assert_eq!(tags.get("region").map(String::as_str), Some("sjc"));
        assert_eq!(tags.get("apienvironment").map(String::as_str), Some("production"));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn scope_tags_are_layered() {
        let sink = Arc::new(InMemoryMetrics::new());
        let base = ContextMetrics::new(sink.clone()).tagged([("endpointid", "health")]);
        let child = base.tagged([("status", "200")]);
        child.inc_counter(names::ENDPOINT_STATUS, 1);
        base.inc_counter(names::ENDPOINT_REQUEST, 1);

        let status = sink.named(names::ENDPOINT_STATUS);
        assert_eq!(status[0].tags.len(), 2);
        let request = sink.named(names::ENDPOINT_REQUEST);
        assert_eq!(request[0].tags.len(), 1);
        assert_eq!(sink.counter_total(names::ENDPOINT_REQUEST), 1);
    }

    #[test]
    fn last_gauge_returns_latest() {
        let sink = InMemoryMetrics::new();
        let tags = Tags::new();
        sink.gauge("g", &tags, 1.0);
        sink.gauge("g", &tags, 2.0);
        assert_eq!(sink.last_gauge("g"), Some(2.0));
        assert_eq!(sink.last_gauge("missing"), None);
    }

    #[test]
    fn recorder_sink_without_recorder_is_noop() {
        let sink = RecorderSink;
        let tags: Tags = [("a".to_string(), "b".to_string())].into_iter().collect();
        sink.counter("c", &tags, 1);
        sink.gauge("g", &tags, 1.0);
        sink.timer("t", &tags, Duration::from_millis(3));
        sink.histogram("h", &tags, Duration::from_millis(3));
    }
}
