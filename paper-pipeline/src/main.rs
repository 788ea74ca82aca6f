use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use paper_pipeline::{
    app::{ComponentRegistry, build_router},
    broker::{Broker, RetryPolicy, RoutingKey, join_consumers},
    clients::{OpenAiSummarizer, TelegramClient},
    config::Config,
    observability::{Telemetry, tracing as telemetry_tracing},
    pipeline::{ApprovalNoticeHandler, DraftHandler, ScheduledPublicationHandler, SummarizeHandler},
    scheduler::{DispatchSettings, Dispatcher, SchedulerDaemon},
    shutdown,
    store::{PgPipelineStore, PipelineStore},
};

#[derive(Debug, Parser)]
#[command(name = "paper-pipeline", version, about = "Scientific article publication pipeline")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Role {
    /// Daily crawl and publication dispatch timers.
    Scheduler,
    /// Consumes `summarize.request`.
    Summarizer,
    /// Sends draft previews and delivers scheduled publications.
    Publisher,
    /// HTTP gateway: sources, ingestion, approval.
    Gateway,
    /// Applies database migrations and exits.
    Migrate,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Summarizer => "summarizer",
            Self::Publisher => "publisher",
            Self::Gateway => "gateway",
            Self::Migrate => "migrate",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let guard = telemetry_tracing::init(&config, cli.role.as_str())?;
    let telemetry = Telemetry::new().context("failed to initialize metrics")?;

    let result = match cli.role {
        Role::Migrate => run_migrate(&config).await,
        Role::Scheduler => run_scheduler(&config, telemetry).await,
        Role::Summarizer => run_summarizer(&config, telemetry).await,
        Role::Publisher => run_publisher(&config, telemetry).await,
        Role::Gateway => run_gateway(&config, telemetry).await,
    };
    if let Err(error) = &result {
        error!(role = cli.role.as_str(), error = %format!("{error:#}"), "role exited with error");
    }

    guard.shutdown();
    result
}

async fn run_migrate(config: &Config) -> Result<()> {
    let store = PgPipelineStore::connect_lazy(config)?;
    store.migrate().await?;
    info!("database migrations applied");
    Ok(())
}

async fn connect(config: &Config, telemetry: &Telemetry) -> Result<(Arc<dyn PipelineStore>, Broker)> {
    let store: Arc<dyn PipelineStore> = Arc::new(PgPipelineStore::connect_lazy(config)?);
    store.ping().await.context("database is unreachable")?;
    let broker = Broker::connect(config)
        .await
        .context("failed to connect to broker")?
        .with_telemetry(telemetry.clone());
    Ok((store, broker))
}

async fn run_scheduler(config: &Config, telemetry: Telemetry) -> Result<()> {
    let (store, broker) = connect(config, &telemetry).await?;
    let dispatcher = Dispatcher::new(
        store,
        broker.producer(),
        DispatchSettings::from_config(config),
        Some(telemetry),
    );
    let shutdown = shutdown::install();
    let timers = SchedulerDaemon::from_config(dispatcher, config)?.spawn(shutdown.clone());
    info!(
        crawl_hour = config.scheduler_start_hour(),
        publication_hour = config.publication_hour(),
        timezone = %config.timezone(),
        "scheduler started"
    );

    for timer in timers {
        if let Err(error) = timer.await {
            warn!(error = %error, "dispatch timer task failed");
        }
    }
    close(&broker).await;
    Ok(())
}

async fn run_summarizer(config: &Config, telemetry: Telemetry) -> Result<()> {
    let openai = config.require_openai()?;
    let (store, broker) = connect(config, &telemetry).await?;
    let summarizer = Arc::new(OpenAiSummarizer::new(&openai)?);
    let handler = Arc::new(SummarizeHandler::new(
        store,
        summarizer,
        broker.producer(),
        config.channel_chat_id().map(str::to_string),
        config.idempotency_ledger_enabled(),
    ));

    let shutdown = shutdown::install();
    let key = RoutingKey::SummarizeRequest;
    let consumers = vec![broker.subscribe(
        key.default_queue(),
        key,
        handler,
        RetryPolicy::from_config(config),
        shutdown.clone(),
    )];
    let result = join_consumers(consumers, shutdown).await;
    close(&broker).await;
    result
}

async fn run_publisher(config: &Config, telemetry: Telemetry) -> Result<()> {
    let telegram = config.require_telegram()?;
    let (store, broker) = connect(config, &telemetry).await?;
    let delivery = Arc::new(TelegramClient::new(&telegram)?);
    let policy = RetryPolicy::from_config(config);
    let shutdown = shutdown::install();

    let drafts = RoutingKey::PublicationDraftRequest;
    let approved = RoutingKey::PublicationApproved;
    let schedule = RoutingKey::PublicationSchedule;
    let consumers = vec![
        broker.subscribe(
            drafts.default_queue(),
            drafts,
            Arc::new(DraftHandler::new(
                Arc::clone(&store),
                delivery.clone(),
                config.idempotency_ledger_enabled(),
            )),
            policy,
            shutdown.clone(),
        ),
        broker.subscribe(
            approved.default_queue(),
            approved,
            Arc::new(ApprovalNoticeHandler),
            policy,
            shutdown.clone(),
        ),
        broker.subscribe(
            schedule.default_queue(),
            schedule,
            Arc::new(ScheduledPublicationHandler::new(
                store,
                delivery,
                Some(telemetry),
            )),
            policy,
            shutdown.clone(),
        ),
    ];
    let result = join_consumers(consumers, shutdown).await;
    close(&broker).await;
    result
}

async fn run_gateway(config: &Config, telemetry: Telemetry) -> Result<()> {
    let bind_addr = config.gateway_http_bind();
    let registry = ComponentRegistry::build(config, telemetry)
        .await
        .context("failed to build component registry")?;
    let broker = registry.broker().clone();
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(%bind_addr, "listening");

    let shutdown: CancellationToken = shutdown::install();
    if let Err(error) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        warn!(error = %error, "server exited with error");
    }
    close(&broker).await;
    Ok(())
}

async fn close(broker: &Broker) {
    if let Err(error) = broker.close().await {
        warn!(error = %error, "failed to close broker connection");
    }
}
