use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::broker::{CrawlStart, Producer, PublicationSchedule};
use crate::config::Config;
use crate::observability::Telemetry;
use crate::pipeline::state::TransitionOutcome;
use crate::store::PipelineStore;

const CRAWL_JOB: &str = "crawl";
const PUBLICATION_JOB: &str = "publication";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub start_hour: u32,
    pub end_hour: u32,
    /// Trailing window of `approved_at` the publication dispatch claims from.
    pub window: Duration,
}

impl DispatchSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_hour: config.scheduler_start_hour(),
            end_hour: config.scheduler_end_hour(),
            window: config.publication_window(),
        }
    }

    /// Crawl window used when a source has no schedule of its own.
    #[must_use]
    pub fn fallback_schedule(&self) -> String {
        format!("{}:00-{}:00", self.start_hour, self.end_hour)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            start_hour: 3,
            end_hour: 5,
            window: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlDispatchReport {
    pub sources: usize,
    pub dispatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationDispatchReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub claimed: usize,
    pub dispatched: usize,
    /// Claims returned to `approved` after a failed publish.
    pub released: usize,
}

/// Runs the two dispatch jobs against the store and broker.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn PipelineStore>,
    producer: Producer,
    settings: DispatchSettings,
    telemetry: Option<Telemetry>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        producer: Producer,
        settings: DispatchSettings,
        telemetry: Option<Telemetry>,
    ) -> Self {
        Self {
            store,
            producer,
            settings,
            telemetry,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// 有効なソースごとに `crawl.start` を一件ずつ発行する。
    ///
    /// 一件の発行失敗は記録して残りのソースを続行する。
    pub async fn dispatch_crawl_jobs(&self) -> Result<CrawlDispatchReport> {
        let sources = self
            .store
            .enabled_sources()
            .await
            .context("failed to load enabled sources")?;
        let mut report = CrawlDispatchReport {
            sources: sources.len(),
            ..CrawlDispatchReport::default()
        };
        if sources.is_empty() {
            info!("no enabled sources; skipping crawl dispatch");
            self.record_run(CRAWL_JOB, "empty");
            return Ok(report);
        }

        let fallback = self.settings.fallback_schedule();
        for source in &sources {
            let message = CrawlStart {
                source_id: source.id,
                schedule: source.schedule.clone().unwrap_or_else(|| fallback.clone()),
            };
            match self.producer.send(&message).await {
                Ok(()) => report.dispatched += 1,
                Err(error) => {
                    report.failed += 1;
                    error!(source_id = %source.id, source = %source.name, error = %error, "failed to dispatch crawl job");
                }
            }
        }

        self.record_counts(CRAWL_JOB, report.dispatched, report.failed, 0);
        self.record_run(CRAWL_JOB, if report.failed == 0 { "ok" } else { "partial" });
        info!(
            sources = report.sources,
            dispatched = report.dispatched,
            failed = report.failed,
            "crawl dispatch finished"
        );
        Ok(report)
    }

    pub async fn dispatch_publications(&self) -> Result<PublicationDispatchReport> {
        self.dispatch_publications_at(Utc::now()).await
    }

    /// Claims publications approved in `[now - window, now)` and emits
    /// `publication.schedule` for each claim.
    pub async fn dispatch_publications_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<PublicationDispatchReport> {
        let window_start = now - self.settings.window;
        let claimed = self
            .store
            .claim_approved_in_window(window_start, now, now)
            .await
            .context("failed to claim approved publications")?;
        let mut report = PublicationDispatchReport {
            window_start,
            window_end: now,
            claimed: claimed.len(),
            dispatched: 0,
            released: 0,
        };
        if claimed.is_empty() {
            info!(window_start = %window_start, window_end = %now, "no approved publications in window");
            self.record_run(PUBLICATION_JOB, "empty");
            return Ok(report);
        }

        for publication in &claimed {
            let message = PublicationSchedule {
                publication_id: publication.id,
                summary_id: publication.summary_id,
            };
            match self.producer.send(&message).await {
                Ok(()) => report.dispatched += 1,
                Err(error) => {
                    warn!(publication_id = %publication.id, error = %error, "failed to publish schedule; releasing claim");
                    match self.store.release_schedule_claim(publication.id).await {
                        Ok(TransitionOutcome::Applied(_)) => report.released += 1,
                        Ok(outcome) => {
                            warn!(publication_id = %publication.id, outcome = outcome.label(), "claim release rejected");
                        }
                        Err(release_error) => {
                            error!(publication_id = %publication.id, error = %release_error, "failed to release claim");
                        }
                    }
                }
            }
        }

        let failed = report.claimed - report.dispatched;
        self.record_counts(PUBLICATION_JOB, report.dispatched, failed, report.released);
        self.record_run(PUBLICATION_JOB, if failed == 0 { "ok" } else { "partial" });
        info!(
            claimed = report.claimed,
            dispatched = report.dispatched,
            released = report.released,
            "publication dispatch finished"
        );
        Ok(report)
    }

    fn record_run(&self, job: &str, outcome: &str) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_dispatch_run(job, outcome);
        }
    }

    fn record_counts(&self, job: &str, dispatched: usize, failed: usize, released: usize) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_dispatched(job, "dispatched", dispatched as u64);
            telemetry.record_dispatched(job, "failed", failed as u64);
            telemetry.record_dispatched(job, "released", released as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_schedule_uses_configured_hours() {
        let settings = DispatchSettings {
            start_hour: 3,
            end_hour: 5,
            window: Duration::hours(24),
        };
        assert_eq!(settings.fallback_schedule(), "3:00-5:00");
    }
}
