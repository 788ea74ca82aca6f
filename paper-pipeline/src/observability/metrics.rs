//! Prometheusメトリクス定義。

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub messages_published: IntCounterVec,
    pub deliveries: IntCounterVec,
    pub dispatch_runs: IntCounterVec,
    pub dispatched_items: IntCounterVec,
    pub transitions: IntCounterVec,

    // ヒストグラム
    pub handler_duration: HistogramVec,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成し、`registry` に登録する。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_published = counter_vec(
            registry,
            "pipeline_messages_published_total",
            "Messages handed to the broker, by routing key and outcome",
            &["routing_key", "outcome"],
        )?;
        let deliveries = counter_vec(
            registry,
            "pipeline_deliveries_total",
            "Consumed deliveries, by queue and settlement",
            &["queue", "settlement"],
        )?;
        let dispatch_runs = counter_vec(
            registry,
            "pipeline_dispatch_runs_total",
            "Dispatch job runs, by job and outcome",
            &["job", "outcome"],
        )?;
        let dispatched_items = counter_vec(
            registry,
            "pipeline_dispatched_items_total",
            "Records dispatched by the scheduler, by job and outcome",
            &["job", "outcome"],
        )?;
        let transitions = counter_vec(
            registry,
            "pipeline_publication_transitions_total",
            "Publication state transitions, by target status and outcome",
            &["to", "outcome"],
        )?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_handler_duration_seconds",
                "Time spent inside message handlers",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["queue"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        Ok(Self {
            messages_published,
            deliveries,
            dispatch_runs,
            dispatched_items,
            transitions,
            handler_duration,
        })
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
