use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::models::{
    Article, ArticleText, ArticleWithText, DraftCreation, LedgerEntry, NewArticle, NewArticleText,
    NewDraft, NewSource, Publication, PublicationBundle, Source, Summary,
};
use super::traits::{ArticleStore, PipelineStore, PublicationStore, SourceStore};
use crate::config::Config;
use crate::pipeline::state::{PublicationStatus, Transition, TransitionOutcome};

const SOURCE_COLUMNS: &str = "id, name, kind, base_url, enabled, schedule, rate_limit, priority, default_tags, created_at";

const ARTICLE_COLUMNS: &str = "id, source_id, external_id, title, url, fulltext_url, journal, year, license, language, authors, published_at, created_at";

const SUMMARY_COLUMNS: &str = "id, article_id, text, needs_review, created_by, created_at";

const PUBLICATION_COLUMNS: &str = "id, summary_id, status, channel_id, approved_by, approved_at, scheduled_at, sent_at, retry_count, dm_preview_message_id, delivery_message_id, created_at";

const BUNDLE_SELECT: &str = r"
    SELECT p.id, p.summary_id, p.status, p.channel_id, p.approved_by, p.approved_at,
           p.scheduled_at, p.sent_at, p.retry_count, p.dm_preview_message_id,
           p.delivery_message_id, p.created_at,
           s.article_id AS s_article_id, s.text AS s_text, s.needs_review AS s_needs_review,
           s.created_by AS s_created_by, s.created_at AS s_created_at,
           a.source_id AS a_source_id, a.external_id AS a_external_id, a.title AS a_title,
           a.url AS a_url, a.fulltext_url AS a_fulltext_url, a.journal AS a_journal,
           a.year AS a_year, a.license AS a_license, a.language AS a_language,
           a.authors AS a_authors, a.published_at AS a_published_at,
           a.created_at AS a_created_at
    FROM publications p
    JOIN summaries s ON s.id = p.summary_id
    JOIN articles a ON a.id = s.article_id
";

/// PostgreSQL 実装。条件付き UPDATE で状態遷移を直列化する。
#[derive(Debug, Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds a lazily connecting pool from the configured DSN.
    pub fn connect_lazy(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections())
            .acquire_timeout(config.database_acquire_timeout())
            .test_before_acquire(true)
            .connect_lazy(config.database_url())
            .context("failed to build database pool")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")
    }

    /// Maps an empty conditional UPDATE to `Rejected` or `NotFound`.
    async fn outcome(&self, publication_id: Uuid, row: Option<PgRow>) -> Result<TransitionOutcome> {
        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(publication_from_row(&row)?));
        }
        let current = sqlx::query("SELECT status FROM publications WHERE id = $1")
            .bind(publication_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read publication status")?;
        match current {
            Some(row) => Ok(TransitionOutcome::Rejected {
                current: status_from_row(&row, "status")?,
            }),
            None => Ok(TransitionOutcome::NotFound),
        }
    }
}

#[async_trait]
impl SourceStore for PgPipelineStore {
    async fn create_source(&self, source: NewSource) -> Result<Source> {
        let sql = format!(
            r"
            INSERT INTO sources
                (id, name, kind, base_url, enabled, schedule, rate_limit, priority, default_tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {SOURCE_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(&source.name)
            .bind(source.kind.as_str())
            .bind(&source.base_url)
            .bind(source.enabled)
            .bind(&source.schedule)
            .bind(source.rate_limit)
            .bind(source.priority)
            .bind(&source.default_tags)
            .fetch_one(&self.pool)
            .await
            .context("failed to insert source")?;
        source_from_row(&row)
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY created_at ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to list sources")?;
        rows.iter().map(source_from_row).collect()
    }

    async fn find_source(&self, source_id: Uuid) -> Result<Option<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load source")?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn enabled_sources(&self) -> Result<Vec<Source>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE enabled = TRUE ORDER BY priority DESC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to load enabled sources")?;
        rows.iter().map(source_from_row).collect()
    }
}

#[async_trait]
impl ArticleStore for PgPipelineStore {
    async fn upsert_article(&self, article: NewArticle) -> Result<Article> {
        let sql = format!(
            r"
            INSERT INTO articles
                (id, source_id, external_id, title, url, fulltext_url, journal, year,
                 license, language, authors, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (source_id, external_id) DO UPDATE
            SET title = EXCLUDED.title,
                url = EXCLUDED.url,
                fulltext_url = EXCLUDED.fulltext_url,
                journal = EXCLUDED.journal,
                year = EXCLUDED.year,
                license = EXCLUDED.license,
                language = EXCLUDED.language,
                authors = EXCLUDED.authors,
                published_at = EXCLUDED.published_at,
                updated_at = NOW()
            RETURNING {ARTICLE_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(article.source_id)
            .bind(&article.external_id)
            .bind(&article.title)
            .bind(&article.url)
            .bind(&article.fulltext_url)
            .bind(&article.journal)
            .bind(article.year)
            .bind(&article.license)
            .bind(&article.language)
            .bind(&article.authors)
            .bind(article.published_at)
            .fetch_one(&self.pool)
            .await
            .context("failed to upsert article")?;
        article_from_row(&row)
    }

    async fn upsert_article_text(
        &self,
        article_id: Uuid,
        text: NewArticleText,
    ) -> Result<ArticleText> {
        let row = sqlx::query(
            r"
            INSERT INTO article_texts (article_id, raw_text, cleaned_text, ocr_used)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (article_id) DO UPDATE
            SET raw_text = EXCLUDED.raw_text,
                cleaned_text = EXCLUDED.cleaned_text,
                ocr_used = EXCLUDED.ocr_used,
                updated_at = NOW()
            RETURNING article_id, raw_text, cleaned_text, ocr_used
            ",
        )
        .bind(article_id)
        .bind(&text.raw_text)
        .bind(&text.cleaned_text)
        .bind(text.ocr_used)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert article text")?;
        article_text_from_row(&row)
    }

    async fn find_article(&self, article_id: Uuid) -> Result<Option<ArticleWithText>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1");
        let Some(row) = sqlx::query(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load article")?
        else {
            return Ok(None);
        };
        let article = article_from_row(&row)?;

        let text = sqlx::query(
            "SELECT article_id, raw_text, cleaned_text, ocr_used FROM article_texts WHERE article_id = $1",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load article text")?
        .as_ref()
        .map(article_text_from_row)
        .transpose()?;

        Ok(Some(ArticleWithText { article, text }))
    }

    async fn recent_summaries(&self, limit: i64) -> Result<Vec<Summary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM summaries ORDER BY created_at DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to list summaries")?;
        rows.iter().map(summary_from_row).collect()
    }
}

#[async_trait]
impl PublicationStore for PgPipelineStore {
    async fn create_summary_with_draft(&self, draft: NewDraft) -> Result<DraftCreation> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        if let Some(key) = draft.ledger_key.as_deref() {
            let inserted = sqlx::query(
                "INSERT INTO processing_ledger (key) VALUES ($1) ON CONFLICT (key) DO NOTHING RETURNING key",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to reserve ledger key")?;
            if inserted.is_none() {
                let row = sqlx::query(
                    "SELECT key, summary_id, publication_id, created_at FROM processing_ledger WHERE key = $1",
                )
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .context("failed to read ledger entry")?;
                tx.rollback().await.context("failed to roll back")?;
                return Ok(DraftCreation::Duplicate(ledger_from_row(&row)?));
            }
        }

        let summary_sql = format!(
            r"
            INSERT INTO summaries (id, article_id, text, needs_review, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SUMMARY_COLUMNS}
            "
        );
        let row = sqlx::query(&summary_sql)
            .bind(Uuid::now_v7())
            .bind(draft.summary.article_id)
            .bind(&draft.summary.text)
            .bind(draft.summary.needs_review)
            .bind(&draft.summary.created_by)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert summary")?;
        let summary = summary_from_row(&row)?;

        let publication_sql = format!(
            r"
            INSERT INTO publications (id, summary_id, status, channel_id)
            VALUES ($1, $2, $3, $4)
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&publication_sql)
            .bind(Uuid::now_v7())
            .bind(summary.id)
            .bind(PublicationStatus::Draft.as_str())
            .bind(&draft.channel_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert draft publication")?;
        let publication = publication_from_row(&row)?;

        if let Some(key) = draft.ledger_key.as_deref() {
            sqlx::query(
                "UPDATE processing_ledger SET summary_id = $2, publication_id = $3 WHERE key = $1",
            )
            .bind(key)
            .bind(summary.id)
            .bind(publication.id)
            .execute(&mut *tx)
            .await
            .context("failed to complete ledger entry")?;
        }

        tx.commit().await.context("failed to commit draft")?;
        Ok(DraftCreation::Created {
            summary,
            publication,
        })
    }

    async fn find_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            "SELECT key, summary_id, publication_id, created_at FROM processing_ledger WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read ledger entry")?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn record_draft_preview(
        &self,
        publication_id: Uuid,
        preview_message_id: Option<String>,
        ledger_key: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        if let Some(key) = ledger_key {
            let inserted = sqlx::query(
                r"
                INSERT INTO processing_ledger (key, publication_id) VALUES ($1, $2)
                ON CONFLICT (key) DO NOTHING
                RETURNING key
                ",
            )
            .bind(key)
            .bind(publication_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to record draft ledger key")?;
            if inserted.is_none() {
                tx.rollback().await.context("failed to roll back")?;
                return Ok(false);
            }
        }

        let updated = sqlx::query(
            "UPDATE publications SET dm_preview_message_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(publication_id)
        .bind(&preview_message_id)
        .execute(&mut *tx)
        .await
        .context("failed to store preview message id")?;
        if updated.rows_affected() == 0 {
            tx.rollback().await.context("failed to roll back")?;
            bail!("publication {publication_id} does not exist");
        }

        tx.commit().await.context("failed to commit draft preview")?;
        Ok(true)
    }

    async fn find_publication(&self, publication_id: Uuid) -> Result<Option<PublicationBundle>> {
        let sql = format!("{BUNDLE_SELECT} WHERE p.id = $1");
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load publication")?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    async fn recent_publications(&self, limit: i64) -> Result<Vec<PublicationBundle>> {
        let sql = format!("{BUNDLE_SELECT} ORDER BY p.created_at DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to list publications")?;
        rows.iter().map(bundle_from_row).collect()
    }

    async fn approve(
        &self,
        publication_id: Uuid,
        approved_by: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let transition = Transition::Approve;
        let sql = format!(
            r"
            UPDATE publications
            SET status = $2, approved_by = $3, approved_at = $4, updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .bind(transition.target().as_str())
            .bind(approved_by)
            .bind(approved_at)
            .bind(transition.source_names())
            .fetch_optional(&self.pool)
            .await
            .context("failed to approve publication")?;
        self.outcome(publication_id, row).await
    }

    async fn claim_approved_in_window(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<Publication>> {
        let transition = Transition::Claim;
        let sql = format!(
            r"
            UPDATE publications
            SET status = $1, scheduled_at = $2, updated_at = NOW()
            WHERE status = ANY($3)
              AND approved_at >= $4
              AND approved_at < $5
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let rows = sqlx::query(&sql)
            .bind(transition.target().as_str())
            .bind(scheduled_at)
            .bind(transition.source_names())
            .bind(since)
            .bind(until)
            .fetch_all(&self.pool)
            .await
            .context("failed to claim approved publications")?;
        rows.iter().map(publication_from_row).collect()
    }

    async fn release_schedule_claim(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        let transition = Transition::Release;
        let sql = format!(
            r"
            UPDATE publications
            SET status = $2, scheduled_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .bind(transition.target().as_str())
            .bind(transition.source_names())
            .fetch_optional(&self.pool)
            .await
            .context("failed to release schedule claim")?;
        self.outcome(publication_id, row).await
    }

    async fn mark_sent(
        &self,
        publication_id: Uuid,
        delivery_message_id: Option<String>,
        sent_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let transition = Transition::MarkSent;
        let sql = format!(
            r"
            UPDATE publications
            SET status = $2, sent_at = $3, retry_count = 0, delivery_message_id = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .bind(transition.target().as_str())
            .bind(sent_at)
            .bind(&delivery_message_id)
            .bind(transition.source_names())
            .fetch_optional(&self.pool)
            .await
            .context("failed to mark publication sent")?;
        self.outcome(publication_id, row).await
    }

    async fn mark_failed(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        let transition = Transition::MarkFailed;
        let sql = format!(
            r"
            UPDATE publications
            SET status = $2, retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .bind(transition.target().as_str())
            .bind(transition.source_names())
            .fetch_optional(&self.pool)
            .await
            .context("failed to mark publication failed")?;
        self.outcome(publication_id, row).await
    }

    async fn record_delivery_failure(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        let sql = format!(
            r"
            UPDATE publications
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {PUBLICATION_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(publication_id)
            .bind(PublicationStatus::Scheduled.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to record delivery failure")?;
        self.outcome(publication_id, row).await
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

fn status_from_row(row: &PgRow, column: &str) -> Result<PublicationStatus> {
    let raw: String = row.try_get(column).context("failed to get status")?;
    raw.parse()
}

fn source_from_row(row: &PgRow) -> Result<Source> {
    let kind: String = row.try_get("kind").context("failed to get source kind")?;
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        base_url: row.try_get("base_url")?,
        enabled: row.try_get("enabled")?,
        schedule: row.try_get("schedule")?,
        rate_limit: row.try_get("rate_limit")?,
        priority: row.try_get("priority")?,
        default_tags: row.try_get("default_tags")?,
        created_at: row.try_get("created_at")?,
    })
}

fn article_from_row(row: &PgRow) -> Result<Article> {
    Ok(Article {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        fulltext_url: row.try_get("fulltext_url")?,
        journal: row.try_get("journal")?,
        year: row.try_get("year")?,
        license: row.try_get("license")?,
        language: row.try_get("language")?,
        authors: row.try_get("authors")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn article_text_from_row(row: &PgRow) -> Result<ArticleText> {
    Ok(ArticleText {
        article_id: row.try_get("article_id")?,
        raw_text: row.try_get("raw_text")?,
        cleaned_text: row.try_get("cleaned_text")?,
        ocr_used: row.try_get("ocr_used")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<Summary> {
    Ok(Summary {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        text: row.try_get("text")?,
        needs_review: row.try_get("needs_review")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn publication_from_row(row: &PgRow) -> Result<Publication> {
    Ok(Publication {
        id: row.try_get("id")?,
        summary_id: row.try_get("summary_id")?,
        status: status_from_row(row, "status")?,
        channel_id: row.try_get("channel_id")?,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        sent_at: row.try_get("sent_at")?,
        retry_count: row.try_get("retry_count")?,
        dm_preview_message_id: row.try_get("dm_preview_message_id")?,
        delivery_message_id: row.try_get("delivery_message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        key: row.try_get("key")?,
        summary_id: row.try_get("summary_id")?,
        publication_id: row.try_get("publication_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Bundle rows alias summary and article columns with `s_` / `a_`.
fn bundle_from_row(row: &PgRow) -> Result<PublicationBundle> {
    let publication = publication_from_row(row)?;
    let summary = Summary {
        id: publication.summary_id,
        article_id: row.try_get("s_article_id")?,
        text: row.try_get("s_text")?,
        needs_review: row.try_get("s_needs_review")?,
        created_by: row.try_get("s_created_by")?,
        created_at: row.try_get("s_created_at")?,
    };
    let article = Article {
        id: summary.article_id,
        source_id: row.try_get("a_source_id")?,
        external_id: row.try_get("a_external_id")?,
        title: row.try_get("a_title")?,
        url: row.try_get("a_url")?,
        fulltext_url: row.try_get("a_fulltext_url")?,
        journal: row.try_get("a_journal")?,
        year: row.try_get("a_year")?,
        license: row.try_get("a_license")?,
        language: row.try_get("a_language")?,
        authors: row.try_get("a_authors")?,
        published_at: row.try_get("a_published_at")?,
        created_at: row.try_get("a_created_at")?,
    };
    Ok(PublicationBundle {
        publication,
        summary,
        article,
    })
}
