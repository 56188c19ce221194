//! Prometheus-based metrics module
//!
//! Session and traffic counters, exposed on `/metrics` by the HTTP surface.

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Session Metrics ===

    /// Total WebSocket sessions accepted
    pub static ref SESSIONS_TOTAL: IntCounter = IntCounter::new(
        "wsproxy_sessions_total",
        "Total number of tunnel sessions accepted"
    ).unwrap();

    /// Currently active sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "wsproxy_sessions_active",
        "Number of currently active tunnel sessions"
    ).unwrap();

    /// Sessions that ended in failure, by kind
    pub static ref SESSIONS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("wsproxy_sessions_failed_total", "Failed tunnel sessions by kind"),
        &["kind"]
    ).unwrap();

    /// Dial failures, by reason
    pub static ref DIAL_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("wsproxy_dial_failures_total", "Outbound dial failures by reason"),
        &["reason"]
    ).unwrap();

    // === Traffic Metrics ===

    /// Bytes relayed client -> destination
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "wsproxy_traffic_bytes_uploaded_total",
        "Total bytes relayed from clients to destinations"
    ).unwrap();

    /// Bytes relayed destination -> client
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "wsproxy_traffic_bytes_downloaded_total",
        "Total bytes relayed from destinations to clients"
    ).unwrap();

    // === Session Duration ===

    pub static ref SESSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "wsproxy_session_duration_seconds",
            "Tunnel session duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0])
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(DIAL_FAILURES.clone())).ok();

    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();

    REGISTRY.register(Box::new(SESSION_DURATION_SECONDS.clone())).ok();
}

/// Render the registry in the Prometheus text format
pub fn render() -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Tracks one session from accept to teardown
pub struct SessionMetrics {
    start_time: Instant,
}

impl SessionMetrics {
    pub fn start() -> Self {
        SESSIONS_TOTAL.inc();
        SESSIONS_ACTIVE.inc();
        Self {
            start_time: Instant::now(),
        }
    }

    /// Record a failed session
    pub fn record_failure(&self, kind: &str) {
        SESSIONS_FAILED.with_label_values(&[kind]).inc();
    }
}

impl Drop for SessionMetrics {
    fn drop(&mut self) {
        SESSIONS_ACTIVE.dec();
        SESSION_DURATION_SECONDS.observe(self.start_time.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        init_metrics();
        DIAL_FAILURES.with_label_values(&["refused"]).inc();
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("wsproxy_dial_failures_total"));
        assert!(text.contains("reason=\"refused\""));
    }

    #[test]
    fn test_session_metrics_guard_counts_total() {
        let before = SESSIONS_TOTAL.get();
        {
            let guard = SessionMetrics::start();
            guard.record_failure("header");
        }
        assert!(SESSIONS_TOTAL.get() > before);
        assert!(SESSIONS_FAILED.with_label_values(&["header"]).get() >= 1);
    }
}
