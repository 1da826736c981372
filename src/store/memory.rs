// src/store/memory.rs
// In-process store used by the test suite (and handy for local smoke runs).
//
// A tokio mutex serializes entry transactions; each transaction mutates a
// snapshot that replaces the shared state on commit, so dropping a
// transaction rolls back. Unique indexes mirror the Postgres constraints.
// There is no advisory-lock capability here: `lock_identity` is a no-op and
// correctness rides on the unique-index + re-read path, as the dedup engine
// guarantees.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    ArticleRow, ArticleTickerRow, ArticleUpdate, CatalogCounts, EntryTx, IngestionRunRow,
    NewArticle, NewRawFeedItem, RunStatus, SourceRow, Store, StoreError, TickerRecord,
};

#[derive(Debug, Clone)]
struct MemTicker {
    id: i64,
    symbol: String,
    fund_name: Option<String>,
    sponsor: Option<String>,
    active: bool,
}

#[derive(Debug, Clone)]
pub struct RawItemRow {
    pub id: i64,
    pub item: NewRawFeedItem,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    next_id: i64,
    tickers: HashMap<String, MemTicker>,
    sources: HashMap<String, SourceRow>,
    articles: HashMap<i64, ArticleRow>,
    articles_by_url_hash: HashMap<String, i64>,
    associations: HashMap<i64, ArticleTickerRow>,
    association_index: HashMap<(i64, i64), i64>,
    raw_items: Vec<RawItemRow>,
    runs: HashMap<i64, IngestionRunRow>,
    run_order: Vec<i64>,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Inspection helpers for tests ----

    pub async fn article_count(&self) -> usize {
        self.state.lock().await.articles.len()
    }

    pub async fn articles(&self) -> Vec<ArticleRow> {
        let mut rows: Vec<ArticleRow> =
            self.state.lock().await.articles.values().cloned().collect();
        rows.sort_by_key(|a| a.id);
        rows
    }

    pub async fn associations(&self, article_id: i64) -> Vec<ArticleTickerRow> {
        let mut rows: Vec<ArticleTickerRow> = self
            .state
            .lock()
            .await
            .associations
            .values()
            .filter(|a| a.article_id == article_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.ticker_id);
        rows
    }

    pub async fn raw_item_count(&self) -> usize {
        self.state.lock().await.raw_items.len()
    }

    pub async fn runs(&self) -> Vec<IngestionRunRow> {
        let state = self.state.lock().await;
        state
            .run_order
            .iter()
            .filter_map(|id| state.runs.get(id).cloned())
            .collect()
    }
}

pub struct MemoryEntryTx {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

#[async_trait]
impl EntryTx for MemoryEntryTx {
    async fn lock_identity(&mut self, _keys: &[i64]) -> Result<(), StoreError> {
        // No advisory-lock capability in this backend.
        Ok(())
    }

    async fn article_by_url_hash(
        &mut self,
        url_hash: &str,
    ) -> Result<Option<ArticleRow>, StoreError> {
        Ok(self
            .work
            .articles_by_url_hash
            .get(url_hash)
            .and_then(|id| self.work.articles.get(id))
            .cloned())
    }

    async fn article_by_title_window(
        &mut self,
        title_hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<ArticleRow>, StoreError> {
        Ok(self
            .work
            .articles
            .values()
            .filter(|a| {
                a.title_normalized_hash == title_hash
                    && a.published_at >= from
                    && a.published_at <= to
            })
            .max_by_key(|a| a.id)
            .cloned())
    }

    async fn insert_article(&mut self, article: &NewArticle) -> Result<ArticleRow, StoreError> {
        if self
            .work
            .articles_by_url_hash
            .contains_key(&article.canonical_url_hash)
        {
            return Err(StoreError::UniqueViolation);
        }
        let id = self.work.next_id();
        let row = ArticleRow {
            id,
            canonical_url: article.canonical_url.clone(),
            canonical_url_hash: article.canonical_url_hash.clone(),
            title: article.title.clone(),
            summary: article.summary.clone(),
            published_at: article.published_at,
            source_name: article.source_name.clone(),
            provider_name: article.provider_name.clone(),
            content_hash: article.content_hash.clone(),
            title_normalized_hash: article.title_normalized_hash.clone(),
            cluster_key: article.cluster_key.clone(),
        };
        self.work
            .articles_by_url_hash
            .insert(row.canonical_url_hash.clone(), id);
        self.work.articles.insert(id, row.clone());
        Ok(row)
    }

    async fn update_article(
        &mut self,
        id: i64,
        update: &ArticleUpdate,
    ) -> Result<(), StoreError> {
        let row = self.work.articles.get_mut(&id).ok_or(StoreError::NotFound)?;
        row.title = update.title.clone();
        row.summary = update.summary.clone();
        row.published_at = update.published_at;
        row.source_name = update.source_name.clone();
        row.provider_name = update.provider_name.clone();
        row.content_hash = update.content_hash.clone();
        row.cluster_key = update.cluster_key.clone();
        Ok(())
    }

    async fn associations_for(
        &mut self,
        article_id: i64,
    ) -> Result<Vec<ArticleTickerRow>, StoreError> {
        Ok(self
            .work
            .associations
            .values()
            .filter(|a| a.article_id == article_id)
            .cloned()
            .collect())
    }

    async fn association_for(
        &mut self,
        article_id: i64,
        ticker_id: i64,
    ) -> Result<Option<ArticleTickerRow>, StoreError> {
        Ok(self
            .work
            .association_index
            .get(&(article_id, ticker_id))
            .and_then(|id| self.work.associations.get(id))
            .cloned())
    }

    async fn insert_association(
        &mut self,
        article_id: i64,
        ticker_id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<ArticleTickerRow, StoreError> {
        if self
            .work
            .association_index
            .contains_key(&(article_id, ticker_id))
        {
            return Err(StoreError::UniqueViolation);
        }
        let id = self.work.next_id();
        let row = ArticleTickerRow {
            id,
            article_id,
            ticker_id,
            match_type: match_type.to_string(),
            confidence,
        };
        self.work
            .association_index
            .insert((article_id, ticker_id), id);
        self.work.associations.insert(id, row.clone());
        Ok(row)
    }

    async fn update_association(
        &mut self,
        id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<(), StoreError> {
        let row = self
            .work
            .associations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        row.match_type = match_type.to_string();
        row.confidence = confidence;
        Ok(())
    }

    async fn delete_association(&mut self, id: i64) -> Result<(), StoreError> {
        if let Some(row) = self.work.associations.remove(&id) {
            self.work
                .association_index
                .remove(&(row.article_id, row.ticker_id));
        }
        Ok(())
    }

    async fn insert_raw_item(&mut self, item: &NewRawFeedItem) -> Result<(), StoreError> {
        let id = self.work.next_id();
        self.work.raw_items.push(RawItemRow {
            id,
            item: item.clone(),
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        *self.guard = self.work;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_entry(&self) -> Result<Box<dyn EntryTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryEntryTx { guard, work }))
    }

    async fn health(&self) -> bool {
        true
    }

    async fn upsert_source(
        &self,
        code: &str,
        name: &str,
        base_url: &str,
    ) -> Result<SourceRow, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sources.get_mut(code) {
            existing.name = name.to_string();
            existing.base_url = base_url.to_string();
            existing.enabled = true;
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let row = SourceRow {
            id,
            code: code.to_string(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            enabled: true,
        };
        state.sources.insert(code.to_string(), row.clone());
        Ok(row)
    }

    async fn sync_tickers(&self, records: &[TickerRecord]) -> Result<CatalogCounts, StoreError> {
        let mut state = self.state.lock().await;
        let mut counts = CatalogCounts {
            loaded: records.len(),
            ..CatalogCounts::default()
        };
        for record in records {
            match state.tickers.get(&record.symbol) {
                None => {
                    let id = state.next_id();
                    state.tickers.insert(
                        record.symbol.clone(),
                        MemTicker {
                            id,
                            symbol: record.symbol.clone(),
                            fund_name: record.fund_name.clone(),
                            sponsor: record.sponsor.clone(),
                            active: record.active,
                        },
                    );
                    counts.created += 1;
                }
                Some(existing)
                    if existing.fund_name == record.fund_name
                        && existing.sponsor == record.sponsor
                        && existing.active == record.active =>
                {
                    counts.unchanged += 1;
                }
                Some(existing) => {
                    let id = existing.id;
                    state.tickers.insert(
                        record.symbol.clone(),
                        MemTicker {
                            id,
                            symbol: record.symbol.clone(),
                            fund_name: record.fund_name.clone(),
                            sponsor: record.sponsor.clone(),
                            active: record.active,
                        },
                    );
                    counts.updated += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn active_symbols(&self) -> Result<HashMap<String, i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tickers
            .values()
            .filter(|t| t.active)
            .map(|t| (t.symbol.to_uppercase(), t.id))
            .collect())
    }

    async fn article_exists_by_url_hash(&self, url_hash: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .articles_by_url_hash
            .contains_key(url_hash))
    }

    async fn create_run(
        &self,
        source_id: i64,
        feed_url: &str,
    ) -> Result<IngestionRunRow, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let row = IngestionRunRow {
            id,
            source_id,
            feed_url: feed_url.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            items_seen: 0,
            items_inserted: 0,
            error_text: None,
        };
        state.runs.insert(id, row.clone());
        state.run_order.push(id);
        Ok(row)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        items_seen: i64,
        items_inserted: i64,
        error_text: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound)?;
        run.status = status;
        run.items_seen = items_seen;
        run.items_inserted = items_inserted;
        run.error_text = error_text.map(|s| s.to_string());
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn recent_runs(
        &self,
        limit: i64,
    ) -> Result<Vec<(IngestionRunRow, String)>, StoreError> {
        let state = self.state.lock().await;
        let code_by_id: HashMap<i64, String> = state
            .sources
            .values()
            .map(|s| (s.id, s.code.clone()))
            .collect();
        Ok(state
            .run_order
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .filter_map(|id| state.runs.get(id))
            .map(|run| {
                let code = code_by_id
                    .get(&run.source_id)
                    .cloned()
                    .unwrap_or_default();
                (run.clone(), code)
            })
            .collect())
    }

    async fn recent_articles_by_provider(
        &self,
        provider_name: &str,
        only_unmapped: bool,
        limit: i64,
    ) -> Result<Vec<ArticleRow>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ArticleRow> = state
            .articles
            .values()
            .filter(|a| a.provider_name == provider_name)
            .filter(|a| {
                !only_unmapped
                    || !state
                        .associations
                        .values()
                        .any(|assoc| assoc.article_id == a.id)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
