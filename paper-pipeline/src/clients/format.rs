//! Telegram 投稿本文の組み立て。

use crate::store::PublicationBundle;
use crate::util::text::escape_html;

const MAX_LISTED_AUTHORS: usize = 3;

/// Everything a post renders, detached from storage types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostContent {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub journal: Option<String>,
    pub year: Option<i32>,
    pub is_preprint: bool,
}

impl PostContent {
    #[must_use]
    pub fn from_bundle(bundle: &PublicationBundle) -> Self {
        let article = &bundle.article;
        let is_preprint = article
            .journal
            .as_deref()
            .is_some_and(|journal| journal.to_lowercase().contains("arxiv"));
        Self {
            title: article.title.clone(),
            summary: bundle.summary.text.clone(),
            url: article.url.clone(),
            authors: article.authors.clone(),
            doi: article.external_id.clone(),
            journal: article.journal.clone(),
            year: article.year,
            is_preprint,
        }
    }
}

fn format_authors(authors: &[String]) -> String {
    if authors.len() <= MAX_LISTED_AUTHORS {
        return authors.join(", ");
    }
    format!("{}, et al.", authors[..MAX_LISTED_AUTHORS].join(", "))
}

/// Renders the HTML post used for both the owner preview and the channel.
#[must_use]
pub fn build_post(content: &PostContent) -> String {
    let mut lines = vec![
        escape_html(&content.title),
        String::new(),
        escape_html(&content.summary),
        String::new(),
        format!("Оригинал: {}", escape_html(&content.url)),
    ];

    if !content.authors.is_empty() {
        lines.push(format!(
            "Авторы (до 3): {}",
            escape_html(&format_authors(&content.authors))
        ));
    }

    let meta: Vec<String> = [
        content.doi.as_deref().map(|doi| format!("DOI: {}", escape_html(doi))),
        content
            .journal
            .as_deref()
            .map(|journal| format!("Журнал: {}", escape_html(journal))),
        content.year.map(|year| format!("Год: {year}")),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !meta.is_empty() {
        lines.push(format!("DOI/Журнал/Год: {}", meta.join(" · ")));
    }

    if content.is_preprint {
        lines.push("Примечание: preprint, без peer-review".to_string());
    }

    lines.join("\n")
}
