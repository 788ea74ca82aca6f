use anyhow::{Context, Error, Result};
use opentelemetry::{KeyValue, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Keeps the OTLP provider alive; call [`TracingGuard::shutdown`] before exit.
#[derive(Debug, Default)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// 未送信のスパンをフラッシュしてエクスポーターを停止する。
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(error) = provider.shutdown() {
                warn!(error = %error, "failed to flush OTLP spans");
            }
        }
    }
}

/// Tracing サブスクライバを初期化する。
///
/// `RUST_LOG` が優先され、未設定なら `LOG_LEVEL` を使う。
/// `OTEL_EXPORTER_OTLP_ENDPOINT` が設定されている場合は OTLP レイヤーも追加し、
/// 初期化に失敗したときは JSON 出力のみで続行する。
///
/// # Errors
/// グローバルサブスクライバが既に設定されている場合はエラーを返す。
pub fn init(config: &Config, role: &str) -> Result<TracingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

    let Some(endpoint) = config.otel_exporter_endpoint() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| Error::msg(e.to_string()))?;
        info!(otel_enabled = false, role, "tracing initialized");
        return Ok(TracingGuard::default());
    };

    match init_tracer(endpoint, config.otel_sampling_ratio(), role) {
        Ok((tracer, provider)) => {
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()
                .map_err(|e| Error::msg(e.to_string()))?;
            info!(otel_enabled = true, endpoint, role, "tracing initialized");
            Ok(TracingGuard {
                provider: Some(provider),
            })
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| Error::msg(e.to_string()))?;
            warn!(otel_enabled = false, error = %error, role, "tracing initialized without OTLP");
            Ok(TracingGuard::default())
        }
    }
}

fn init_tracer(endpoint: &str, sampling_ratio: f64, role: &str) -> Result<(SdkTracer, SdkTracerProvider)> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", format!("paper-pipeline-{role}")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("paper-pipeline");
    opentelemetry::global::set_tracer_provider(provider.clone());

    Ok((tracer, provider))
}
