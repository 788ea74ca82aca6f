pub mod metrics;
pub mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;

/// プロセスが所有するメトリクスレジストリ。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// 新しいレジストリを作成し、メトリクスを登録する。
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(&registry)?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn record_published(&self, routing_key: &str, ok: bool) {
        self.metrics
            .messages_published
            .with_label_values(&[routing_key, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn record_delivery(&self, queue: &str, settlement: &str) {
        self.metrics
            .deliveries
            .with_label_values(&[queue, settlement])
            .inc();
    }

    pub fn observe_handler(&self, queue: &str, seconds: f64) {
        self.metrics
            .handler_duration
            .with_label_values(&[queue])
            .observe(seconds);
    }

    pub fn record_dispatch_run(&self, job: &str, outcome: &str) {
        self.metrics
            .dispatch_runs
            .with_label_values(&[job, outcome])
            .inc();
    }

    pub fn record_dispatched(&self, job: &str, outcome: &str, count: u64) {
        self.metrics
            .dispatched_items
            .with_label_values(&[job, outcome])
            .inc_by(count);
    }

    pub fn record_transition(&self, to: &str, outcome: &str) {
        self.metrics
            .transitions
            .with_label_values(&[to, outcome])
            .inc();
    }

    /// Prometheusメトリクスをテキスト形式でレンダリングする。
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_series() {
        let telemetry = Telemetry::new().expect("telemetry");
        telemetry.record_published("crawl.start", true);
        telemetry.record_delivery("summarizer", "acked");
        telemetry.observe_handler("summarizer", 0.02);

        let rendered = telemetry.render_prometheus();

        assert!(rendered.contains("pipeline_messages_published_total"));
        assert!(rendered.contains("routing_key=\"crawl.start\""));
        assert!(rendered.contains("pipeline_handler_duration_seconds_bucket"));
    }

    #[test]
    fn registries_are_independent() {
        let first = Telemetry::new().expect("first");
        let second = Telemetry::new().expect("second");
        first.record_dispatch_run("crawl", "ok");

        assert!(!second.render_prometheus().contains("job=\"crawl\""));
    }
}
