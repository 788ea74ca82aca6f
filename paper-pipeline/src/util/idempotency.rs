//! Deterministic dedupe keys for the processing ledger.

use uuid::Uuid;

/// `summarize:{articleId}:{timestamp}`, or `summarize:{articleId}` when the
/// message carries no timestamp.
///
/// The timestamp is the producer's raw value so a broker redelivery maps to
/// the same key while a fresh ingest of the same article does not.
#[must_use]
pub fn summarize_key(article_id: Uuid, timestamp: Option<&str>) -> String {
    match timestamp.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(timestamp) => format!("summarize:{article_id}:{timestamp}"),
        None => format!("summarize:{article_id}"),
    }
}

#[must_use]
pub fn draft_key(publication_id: Uuid) -> String {
    format!("draft:{publication_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_key_includes_timestamp_when_present() {
        let id = Uuid::parse_str("01890a5d-ac96-774b-bcce-b302099a8057").unwrap();

        assert_eq!(
            summarize_key(id, Some("2026-03-01T08:30:00.000Z")),
            "summarize:01890a5d-ac96-774b-bcce-b302099a8057:2026-03-01T08:30:00.000Z"
        );
        assert_eq!(
            summarize_key(id, None),
            "summarize:01890a5d-ac96-774b-bcce-b302099a8057"
        );
        assert_eq!(summarize_key(id, Some("  ")), summarize_key(id, None));
    }

    #[test]
    fn draft_key_is_deterministic() {
        let id = Uuid::now_v7();
        assert_eq!(draft_key(id), draft_key(id));
        assert!(draft_key(id).starts_with("draft:"));
    }
}
