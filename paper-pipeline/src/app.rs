use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;

use crate::{
    api,
    broker::Broker,
    config::Config,
    observability::Telemetry,
    pipeline::{ApprovalService, IngestService},
    store::{PgPipelineStore, PipelineStore},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

/// Shared components of the gateway role.
pub struct ComponentRegistry {
    telemetry: Telemetry,
    store: Arc<dyn PipelineStore>,
    broker: Broker,
    ingest: IngestService,
    approval: ApprovalService,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn store(&self) -> Arc<dyn PipelineStore> {
        Arc::clone(&self.registry.store)
    }

    pub(crate) fn ingest(&self) -> &IngestService {
        &self.registry.ingest
    }

    pub(crate) fn approval(&self) -> &ApprovalService {
        &self.registry.approval
    }
}

impl ComponentRegistry {
    /// 設定から DB プールとブローカー接続を確立し、ゲートウェイの共有レジストリを構築する。
    ///
    /// # Errors
    /// ブローカーへの接続やトポロジー宣言に失敗した場合はエラーを返す。
    pub async fn build(config: &Config, telemetry: Telemetry) -> Result<Self> {
        let store: Arc<dyn PipelineStore> = Arc::new(PgPipelineStore::connect_lazy(config)?);
        let broker = Broker::connect(config)
            .await
            .context("failed to connect to broker")?
            .with_telemetry(telemetry.clone());
        Ok(Self::from_parts(store, broker, telemetry))
    }

    #[must_use]
    pub fn from_parts(store: Arc<dyn PipelineStore>, broker: Broker, telemetry: Telemetry) -> Self {
        let ingest = IngestService::new(Arc::clone(&store), broker.producer());
        let approval =
            ApprovalService::new(Arc::clone(&store), broker.producer(), Some(telemetry.clone()));
        Self {
            telemetry,
            store,
            broker,
            ingest,
            approval,
        }
    }

    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
