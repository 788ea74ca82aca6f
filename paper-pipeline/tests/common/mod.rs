#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use paper_pipeline::clients::{DeliveryAdapter, GeneratedSummary, Summarizer, SummaryInput};
use paper_pipeline::store::{
    Article, ArticleStore, InMemoryStore, NewArticle, NewArticleText, NewSource, Source,
    SourceKind, SourceStore,
};

pub fn new_source(name: &str, priority: i32, enabled: bool) -> NewSource {
    NewSource {
        name: name.to_string(),
        kind: SourceKind::Rss,
        base_url: format!("https://example.org/{name}.rss"),
        enabled,
        schedule: None,
        rate_limit: None,
        priority,
        default_tags: vec!["science".to_string()],
    }
}

/// One source plus one article with an abstract.
pub async fn seed_article(store: &InMemoryStore) -> (Source, Article) {
    let source = store
        .create_source(new_source("arxiv", 1, true))
        .await
        .expect("source");
    let article = store
        .upsert_article(NewArticle {
            source_id: source.id,
            external_id: Some("arXiv:2603.00001".to_string()),
            title: "Quantum error correction below threshold".to_string(),
            url: "https://arxiv.org/abs/2603.00001".to_string(),
            fulltext_url: None,
            journal: Some("arXiv".to_string()),
            year: Some(2026),
            license: None,
            language: Some("en".to_string()),
            authors: vec!["A. Author".to_string(), "B. Author".to_string()],
            published_at: None,
        })
        .await
        .expect("article");
    store
        .upsert_article_text(
            article.id,
            NewArticleText {
                raw_text: "We demonstrate logical qubits below the surface code threshold."
                    .to_string(),
                cleaned_text: None,
                ocr_used: false,
            },
        )
        .await
        .expect("text");
    (source, article)
}

#[derive(Debug, Default)]
pub struct StubSummarizer {
    calls: AtomicUsize,
}

impl StubSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, input: SummaryInput) -> Result<GeneratedSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedSummary {
            text: format!("Summary of {}", input.title),
            needs_review: false,
            created_by: "stub".to_string(),
        })
    }
}

/// Records every message; the first `failures` sends fail.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    drafts: Mutex<Vec<String>>,
    channel: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl RecordingDelivery {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn drafts(&self) -> Vec<String> {
        self.drafts.lock().expect("drafts").clone()
    }

    pub fn channel_posts(&self) -> Vec<String> {
        self.channel.lock().expect("channel").clone()
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DeliveryAdapter for RecordingDelivery {
    async fn send_draft(&self, text: &str) -> Result<Option<String>> {
        if self.should_fail() {
            bail!("chat unavailable");
        }
        let mut drafts = self.drafts.lock().expect("drafts");
        drafts.push(text.to_string());
        Ok(Some(format!("42:{}", drafts.len())))
    }

    async fn send_to_channel(&self, text: &str) -> Result<Option<String>> {
        if self.should_fail() {
            bail!("chat unavailable");
        }
        let mut channel = self.channel.lock().expect("channel");
        channel.push(text.to_string());
        Ok(Some(format!("-100:{}", channel.len())))
    }
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
