//! Persistence for sources, articles, summaries, publications and the
//! processing ledger.

mod memory;
pub mod models;
mod postgres;
mod traits;

pub use memory::InMemoryStore;
pub use models::{
    Article, ArticleText, ArticleWithText, DraftCreation, LedgerEntry, NewArticle, NewArticleText,
    NewDraft, NewSource, NewSummary, Publication, PublicationBundle, Source, SourceKind, Summary,
};
pub use postgres::PgPipelineStore;
pub use traits::{ArticleStore, PipelineStore, PublicationStore, SourceStore};
