// src/store/mod.rs
// Storage seam for the ingestion core.
//
// `Store` hands out short-lived `EntryTx` write transactions (one per feed
// entry) plus the committed-immediately bookkeeping operations (runs,
// sources, ticker catalog). Advisory locking is a capability: backends
// without it implement `lock_identity` as a no-op and correctness rests on
// the unique constraints plus the violation/re-read path in `dedup`.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected an insert; the caller re-reads and
    /// continues instead of aborting.
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ArticleRow {
    pub id: i64,
    pub canonical_url: String,
    pub canonical_url_hash: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_name: String,
    pub provider_name: String,
    pub content_hash: String,
    pub title_normalized_hash: String,
    pub cluster_key: String,
}

/// Article fields at insert time. `canonical_url_hash` carries the unique
/// constraint; `cluster_key` currently equals the title hash.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub canonical_url: String,
    pub canonical_url_hash: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_name: String,
    pub provider_name: String,
    pub content_hash: String,
    pub title_normalized_hash: String,
    pub cluster_key: String,
}

/// Mutable-field refresh applied on re-sighting an existing article.
#[derive(Debug, Clone)]
pub struct ArticleUpdate {
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_name: String,
    pub provider_name: String,
    pub content_hash: String,
    pub cluster_key: String,
}

#[derive(Debug, Clone)]
pub struct ArticleTickerRow {
    pub id: i64,
    pub article_id: i64,
    pub ticker_id: i64,
    pub match_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct NewRawFeedItem {
    pub source_id: i64,
    pub article_id: Option<i64>,
    pub feed_url: String,
    pub raw_guid: Option<String>,
    pub raw_title: String,
    pub raw_link: String,
    pub raw_pub_date: Option<DateTime<Utc>>,
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct IngestionRunRow {
    pub id: i64,
    pub source_id: i64,
    pub feed_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub items_seen: i64,
    pub items_inserted: i64,
    pub error_text: Option<String>,
}

/// Catalog input row (symbol already upper-cased by the loader).
#[derive(Debug, Clone)]
pub struct TickerRecord {
    pub symbol: String,
    pub fund_name: Option<String>,
    pub sponsor: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CatalogCounts {
    pub loaded: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl CatalogCounts {
    /// Whether the active-symbol catalog changed enough to warrant a remap.
    pub fn changed(&self) -> bool {
        self.created + self.updated > 0
    }
}

/// One write transaction scoped to a single feed entry. Dropping without
/// `commit` rolls everything back.
#[async_trait]
pub trait EntryTx: Send {
    /// Acquire transaction-scoped advisory locks for the given keys, in the
    /// caller's (sorted) order. No-op for backends without the capability.
    async fn lock_identity(&mut self, keys: &[i64]) -> Result<(), StoreError>;

    async fn article_by_url_hash(&mut self, url_hash: &str)
        -> Result<Option<ArticleRow>, StoreError>;

    /// Most recent article sharing the title hash with a published time
    /// inside `[from, to]`.
    async fn article_by_title_window(
        &mut self,
        title_hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<ArticleRow>, StoreError>;

    /// Insert inside a nested scope so `UniqueViolation` leaves the
    /// enclosing transaction usable.
    async fn insert_article(&mut self, article: &NewArticle) -> Result<ArticleRow, StoreError>;

    async fn update_article(&mut self, id: i64, update: &ArticleUpdate)
        -> Result<(), StoreError>;

    async fn associations_for(
        &mut self,
        article_id: i64,
    ) -> Result<Vec<ArticleTickerRow>, StoreError>;

    async fn association_for(
        &mut self,
        article_id: i64,
        ticker_id: i64,
    ) -> Result<Option<ArticleTickerRow>, StoreError>;

    /// Insert inside a nested scope; `UniqueViolation` on the
    /// (article, ticker) pair is recoverable.
    async fn insert_association(
        &mut self,
        article_id: i64,
        ticker_id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<ArticleTickerRow, StoreError>;

    async fn update_association(
        &mut self,
        id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<(), StoreError>;

    async fn delete_association(&mut self, id: i64) -> Result<(), StoreError>;

    async fn insert_raw_item(&mut self, item: &NewRawFeedItem) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin_entry(&self) -> Result<Box<dyn EntryTx>, StoreError>;

    async fn health(&self) -> bool;

    /// Upsert a `Source` row from current configuration (enabled = true).
    async fn upsert_source(
        &self,
        code: &str,
        name: &str,
        base_url: &str,
    ) -> Result<SourceRow, StoreError>;

    /// Apply a full catalog snapshot, returning change counts.
    async fn sync_tickers(&self, records: &[TickerRecord]) -> Result<CatalogCounts, StoreError>;

    /// Mapping of active symbol -> ticker id.
    async fn active_symbols(&self) -> Result<HashMap<String, i64>, StoreError>;

    /// Cheap existence probe used by the persistence gate.
    async fn article_exists_by_url_hash(&self, url_hash: &str) -> Result<bool, StoreError>;

    /// Create a run row in `running` state, committed immediately so
    /// in-flight runs are observable.
    async fn create_run(&self, source_id: i64, feed_url: &str)
        -> Result<IngestionRunRow, StoreError>;

    /// Terminal transition; always stamps `finished_at`. Committed
    /// independently of any rolled-back entry work.
    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        items_seen: i64,
        items_inserted: i64,
        error_text: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Recent runs paired with their source code, newest first.
    async fn recent_runs(&self, limit: i64)
        -> Result<Vec<(IngestionRunRow, String)>, StoreError>;

    /// Newest-first articles stamped with the given provider, optionally
    /// only those with zero ticker associations. Drives the remap batch.
    async fn recent_articles_by_provider(
        &self,
        provider_name: &str,
        only_unmapped: bool,
        limit: i64,
    ) -> Result<Vec<ArticleRow>, StoreError>;
}
