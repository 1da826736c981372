// tests/dedup_upsert.rs
// Upsert engine properties against the in-memory store, plus the
// unique-violation recovery path against a scripted transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use cefwire::dedup::{apply_ticker_hits, upsert_article, EntryRecord};
use cefwire::matcher::{MatchKind, TickerHit, TickerHits};
use cefwire::store::{
    ArticleRow, ArticleTickerRow, ArticleUpdate, EntryTx, MemoryStore, NewArticle,
    NewRawFeedItem, Store, StoreError,
};

fn record(url: &str, title: &str, summary: Option<&str>) -> EntryRecord {
    EntryRecord {
        canonical_url: url.to_string(),
        title: title.to_string(),
        summary: summary.map(|s| s.to_string()),
        published_at: Utc::now(),
        source_name: "PR Newswire RSS".to_string(),
        provider_name: "PR Newswire RSS".to_string(),
    }
}

#[tokio::test]
async fn concurrent_same_url_upserts_yield_one_row() {
    let store = MemoryStore::new();
    let rec = record(
        "https://www.prnewswire.com/news-releases/gof-distribution.html",
        "Guggenheim Strategic Opportunities Fund Declares Distribution",
        Some("Monthly distribution declared."),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let rec = rec.clone();
        tasks.push(tokio::spawn(async move {
            let mut tx = store.begin_entry().await.unwrap();
            let resolved = upsert_article(tx.as_mut(), &rec, true).await.unwrap();
            tx.commit().await.unwrap();
            resolved.created
        }));
    }

    let mut created = 0;
    for task in tasks {
        if task.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(store.article_count().await, 1);
}

#[tokio::test]
async fn exact_url_resight_replaces_summary_unconditionally() {
    let store = MemoryStore::new();
    let url = "https://www.prnewswire.com/news-releases/update.html";

    let long = record(url, "Fund update", Some("A much longer original summary text"));
    let mut tx = store.begin_entry().await.unwrap();
    upsert_article(tx.as_mut(), &long, true).await.unwrap();
    tx.commit().await.unwrap();

    // Same URL with a shorter summary still wins: the feed payload for the
    // exact URL is authoritative.
    let short = record(url, "Fund update", Some("Short"));
    let mut tx = store.begin_entry().await.unwrap();
    let resolved = upsert_article(tx.as_mut(), &short, true).await.unwrap();
    tx.commit().await.unwrap();

    assert!(resolved.matched_by_url);
    assert_eq!(resolved.article.summary.as_deref(), Some("Short"));
}

#[tokio::test]
async fn fuzzy_resight_only_takes_longer_summaries() {
    let store = MemoryStore::new();

    let original = record(
        "https://www.prnewswire.com/news-releases/a.html",
        "Same headline",
        Some("Original summary text"),
    );
    let mut tx = store.begin_entry().await.unwrap();
    upsert_article(tx.as_mut(), &original, true).await.unwrap();
    tx.commit().await.unwrap();

    // Different URL, same title, shorter summary: stored summary survives.
    let shorter = record(
        "https://www.globenewswire.com/news-release/b.html",
        "Same headline",
        Some("Tiny"),
    );
    let mut tx = store.begin_entry().await.unwrap();
    let resolved = upsert_article(tx.as_mut(), &shorter, true).await.unwrap();
    tx.commit().await.unwrap();
    assert!(!resolved.created);
    assert!(!resolved.matched_by_url);
    assert_eq!(
        resolved.article.summary.as_deref(),
        Some("Original summary text")
    );

    // A longer one replaces it.
    let longer = record(
        "https://www.globenewswire.com/news-release/c.html",
        "Same headline",
        Some("A considerably longer replacement summary"),
    );
    let mut tx = store.begin_entry().await.unwrap();
    let resolved = upsert_article(tx.as_mut(), &longer, true).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        resolved.article.summary.as_deref(),
        Some("A considerably longer replacement summary")
    );
}

#[tokio::test]
async fn published_time_only_moves_forward() {
    let store = MemoryStore::new();
    let url = "https://www.prnewswire.com/news-releases/time.html";

    let mut newer = record(url, "Fund update", None);
    newer.published_at = Utc::now();
    let mut tx = store.begin_entry().await.unwrap();
    upsert_article(tx.as_mut(), &newer, true).await.unwrap();
    tx.commit().await.unwrap();

    let mut older = record(url, "Fund update", None);
    older.published_at = newer.published_at - Duration::hours(5);
    let mut tx = store.begin_entry().await.unwrap();
    let resolved = upsert_article(tx.as_mut(), &older, true).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(resolved.article.published_at, newer.published_at);
}

#[tokio::test]
async fn exact_url_resight_prunes_stale_associations() {
    let store = MemoryStore::new();
    let url = "https://www.prnewswire.com/news-releases/pair.html";
    let symbol_ids: HashMap<String, i64> =
        [("GOF".to_string(), 1i64), ("UTF".to_string(), 2i64)].into();

    let rec = record(url, "Fund update (GOF) (UTF)", None);
    let both: TickerHits = [
        ("GOF".to_string(), TickerHit::new(MatchKind::Paren)),
        ("UTF".to_string(), TickerHit::new(MatchKind::Paren)),
    ]
    .into();

    let mut tx = store.begin_entry().await.unwrap();
    let resolved = upsert_article(tx.as_mut(), &rec, true).await.unwrap();
    apply_ticker_hits(tx.as_mut(), resolved.article.id, &both, &symbol_ids, false)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.associations(resolved.article.id).await.len(), 2);

    // Re-sight of the same URL now only mentions GOF; UTF is pruned.
    let only_gof: TickerHits =
        [("GOF".to_string(), TickerHit::new(MatchKind::Paren))].into();
    let mut tx = store.begin_entry().await.unwrap();
    let again = upsert_article(tx.as_mut(), &rec, true).await.unwrap();
    assert!(again.matched_by_url);
    apply_ticker_hits(tx.as_mut(), again.article.id, &only_gof, &symbol_ids, true)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rows = store.associations(resolved.article.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].ticker_id, 1);
}

// ---- Unique-violation recovery against a scripted transaction ----

/// EntryTx whose first URL lookup misses and whose insert collides, as if a
/// concurrent worker inserted the row in between.
struct RacingTx {
    lookups: usize,
    existing: ArticleRow,
    updated: bool,
}

impl RacingTx {
    fn new() -> Self {
        Self {
            lookups: 0,
            existing: ArticleRow {
                id: 41,
                canonical_url: "https://example.com/story".to_string(),
                canonical_url_hash: String::new(),
                title: "Racy story".to_string(),
                summary: None,
                published_at: Utc::now(),
                source_name: "Business Wire".to_string(),
                provider_name: "Business Wire".to_string(),
                content_hash: String::new(),
                title_normalized_hash: String::new(),
                cluster_key: String::new(),
            },
            updated: false,
        }
    }
}

#[async_trait]
impl EntryTx for RacingTx {
    async fn lock_identity(&mut self, _keys: &[i64]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn article_by_url_hash(
        &mut self,
        url_hash: &str,
    ) -> Result<Option<ArticleRow>, StoreError> {
        self.lookups += 1;
        if self.lookups == 1 {
            return Ok(None);
        }
        let mut row = self.existing.clone();
        row.canonical_url_hash = url_hash.to_string();
        Ok(Some(row))
    }

    async fn article_by_title_window(
        &mut self,
        _title_hash: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Option<ArticleRow>, StoreError> {
        Ok(None)
    }

    async fn insert_article(&mut self, _article: &NewArticle) -> Result<ArticleRow, StoreError> {
        Err(StoreError::UniqueViolation)
    }

    async fn update_article(
        &mut self,
        id: i64,
        _update: &ArticleUpdate,
    ) -> Result<(), StoreError> {
        assert_eq!(id, self.existing.id);
        self.updated = true;
        Ok(())
    }

    async fn associations_for(
        &mut self,
        _article_id: i64,
    ) -> Result<Vec<ArticleTickerRow>, StoreError> {
        Ok(Vec::new())
    }

    async fn association_for(
        &mut self,
        _article_id: i64,
        _ticker_id: i64,
    ) -> Result<Option<ArticleTickerRow>, StoreError> {
        Ok(None)
    }

    async fn insert_association(
        &mut self,
        _article_id: i64,
        _ticker_id: i64,
        _match_type: &str,
        _confidence: f64,
    ) -> Result<ArticleTickerRow, StoreError> {
        Err(StoreError::UniqueViolation)
    }

    async fn update_association(
        &mut self,
        _id: i64,
        _match_type: &str,
        _confidence: f64,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_association(&mut self, _id: i64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_raw_item(&mut self, _item: &NewRawFeedItem) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn losing_writer_recovers_by_rereading() {
    let mut tx = RacingTx::new();
    let rec = record("https://example.com/story", "Racy story", None);

    let resolved = upsert_article(&mut tx, &rec, true).await.unwrap();

    assert!(!resolved.created);
    assert!(resolved.matched_by_url);
    assert_eq!(resolved.article.id, 41);
    assert!(tx.updated);
}
