//! Time-driven dispatch: daily crawl fan-out and publication claims.

pub mod cadence;
pub mod daemon;
pub mod dispatch;

pub use cadence::DailyCadence;
pub use daemon::SchedulerDaemon;
pub use dispatch::{CrawlDispatchReport, DispatchSettings, Dispatcher, PublicationDispatchReport};
