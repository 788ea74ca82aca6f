//! Stage handlers: ingestion, summarization, drafting, approval and delivery.

pub mod approval;
pub mod deliver;
pub mod draft;
pub mod ingest;
pub mod notice;
pub mod state;
pub mod summarize;

pub use approval::{ApprovalError, ApprovalService};
pub use deliver::ScheduledPublicationHandler;
pub use draft::DraftHandler;
pub use ingest::{IngestArticle, IngestError, IngestService};
pub use notice::ApprovalNoticeHandler;
pub use state::{PublicationStatus, Transition, TransitionOutcome};
pub use summarize::SummarizeHandler;
