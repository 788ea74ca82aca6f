use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::scheduler::cadence::DailyCadence;
use crate::scheduler::dispatch::Dispatcher;

/// Owns the crawl and publication timers.
pub struct SchedulerDaemon {
    dispatcher: Dispatcher,
    crawl: DailyCadence,
    publication: DailyCadence,
    run_on_start: bool,
}

impl SchedulerDaemon {
    pub fn new(
        dispatcher: Dispatcher,
        crawl: DailyCadence,
        publication: DailyCadence,
        run_on_start: bool,
    ) -> Self {
        Self {
            dispatcher,
            crawl,
            publication,
            run_on_start,
        }
    }

    pub fn from_config(dispatcher: Dispatcher, config: &Config) -> anyhow::Result<Self> {
        let crawl = DailyCadence::new(config.timezone(), config.scheduler_start_hour())
            .ok_or_else(|| anyhow::anyhow!("invalid SCHEDULER_START_HOUR"))?;
        let publication = DailyCadence::new(config.timezone(), config.publication_hour())
            .ok_or_else(|| anyhow::anyhow!("invalid PUBLICATION_HOUR"))?;
        Ok(Self::new(dispatcher, crawl, publication, config.is_development()))
    }

    /// Spawns both timers; they stop when `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let crawl_dispatcher = self.dispatcher.clone();
        let crawl = spawn_timer("crawl", self.crawl, self.run_on_start, shutdown.clone(), move || {
            let dispatcher = crawl_dispatcher.clone();
            async move {
                if let Err(error) = dispatcher.dispatch_crawl_jobs().await {
                    error!(error = %error, "crawl dispatch failed");
                }
            }
        });

        let publication_dispatcher = self.dispatcher;
        let publication = spawn_timer(
            "publication",
            self.publication,
            self.run_on_start,
            shutdown,
            move || {
                let dispatcher = publication_dispatcher.clone();
                async move {
                    if let Err(error) = dispatcher.dispatch_publications().await {
                        error!(error = %error, "publication dispatch failed");
                    }
                }
            },
        );
        vec![crawl, publication]
    }
}

fn spawn_timer<F, Fut>(
    job: &'static str,
    cadence: DailyCadence,
    run_on_start: bool,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if run_on_start {
            info!(job, "development mode: running dispatch at start-up");
            tick().await;
        }
        let mut last_fired = None;
        loop {
            let now = Utc::now();
            let next = next_slot(&cadence, now, last_fired);
            let wait = duration_until(next, now);
            info!(
                job,
                next_run_utc = %next.to_rfc3339(),
                next_run_local = %next.with_timezone(&cadence.timezone()).to_rfc3339(),
                wait_seconds = wait.as_secs(),
                "scheduled dispatch"
            );
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(job, "dispatch timer stopped");
                    return;
                }
                () = sleep(wait) => {}
            }
            last_fired = Some(next);
            tick().await;
        }
    })
}

/// `sleep` runs on the monotonic clock; a wall clock stepped backwards after
/// wake-up must not hand back the slot that just fired.
fn next_slot(
    cadence: &DailyCadence,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let reference = last_fired.map_or(now, |fired| fired.max(now));
    cadence.next_run_after(reference)
}

fn duration_until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
