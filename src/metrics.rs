use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::models::Usage;

/// Process-wide metrics, owned by an isolated registry so tests do not share state.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    streamed_frames_total: IntCounterVec,
    stream_terminations_total: IntCounterVec,
    errors_total: IntCounterVec,
    tokens_total: IntCounterVec,
}

/// Decrements the in-flight gauge on every exit path, unwinding included.
#[must_use = "the in-flight gauge is decremented when the guard drops"]
pub struct InflightGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "proxy_http_requests_total",
                "Total client requests handled by the proxy"
            ),
            &["endpoint", "status", "outcome"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "proxy_http_request_duration_seconds",
                "Client request latency in seconds",
            ),
            &["endpoint"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "proxy_inflight_requests",
            "Client requests currently being processed",
        )
        .expect("valid inflight_requests metric");

        let streamed_frames_total = IntCounterVec::new(
            opts!(
                "proxy_streamed_frames_total",
                "Incremental frames written to streaming clients"
            ),
            &["endpoint"],
        )
        .expect("valid streamed_frames_total metric");

        let stream_terminations_total = IntCounterVec::new(
            opts!(
                "proxy_stream_terminations_total",
                "Streaming exchanges by how they ended"
            ),
            &["endpoint", "outcome"],
        )
        .expect("valid stream_terminations_total metric");

        let errors_total = IntCounterVec::new(
            opts!("proxy_errors_total", "Errors returned or signalled by kind"),
            &["kind"],
        )
        .expect("valid errors_total metric");

        let tokens_total = IntCounterVec::new(
            opts!("proxy_tokens_total", "Token counts reported by the backend"),
            &["kind"],
        )
        .expect("valid tokens_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(streamed_frames_total.clone()))
            .expect("register streamed_frames_total");
        registry
            .register(Box::new(stream_terminations_total.clone()))
            .expect("register stream_terminations_total");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("register errors_total");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("register tokens_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            streamed_frames_total,
            stream_terminations_total,
            errors_total,
            tokens_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            gauge: self.inflight_requests.clone(),
        }
    }

    pub fn inflight(&self) -> i64 {
        self.inflight_requests.get()
    }

    pub fn observe_request(&self, endpoint: &str, status: u16, outcome: &str, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[endpoint, &status_label, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn observe_streamed_frame(&self, endpoint: &str) {
        self.streamed_frames_total.with_label_values(&[endpoint]).inc();
    }

    pub fn observe_stream_end(&self, endpoint: &str, outcome: &str) {
        self.stream_terminations_total
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    pub fn observe_usage(&self, usage: &Usage) {
        self.tokens_total
            .with_label_values(&["prompt"])
            .inc_by(u64::from(usage.prompt_tokens));
        self.tokens_total
            .with_label_values(&["completion"])
            .inc_by(u64::from(usage.completion_tokens));
    }

    pub fn requests(&self, endpoint: &str, status: u16, outcome: &str) -> u64 {
        self.request_total
            .with_label_values(&[endpoint, &status.to_string(), outcome])
            .get()
    }

    pub fn errors(&self, kind: &str) -> u64 {
        self.errors_total.with_label_values(&[kind]).get()
    }

    pub fn streamed_frames(&self, endpoint: &str) -> u64 {
        self.streamed_frames_total.with_label_values(&[endpoint]).get()
    }

    pub fn stream_ends(&self, endpoint: &str, outcome: &str) -> u64 {
        self.stream_terminations_total
            .with_label_values(&[endpoint, outcome])
            .get()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
