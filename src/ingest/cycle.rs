// src/ingest/cycle.rs
// One ingestion cycle: catalog sync, feed list rebuild, sequential feed
// ingest, and the post-sync remap of general-stream articles.
//
// The orchestrator owns the single-flight lock shared by the scheduler and
// the manual admin trigger; a second caller gets "busy" instead of a queued
// or concurrent cycle.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::SymbolCatalog;
use crate::config::Settings;
use crate::dedup::apply_ticker_hits;
use crate::fallback::FallbackResolver;
use crate::ingest::sources::{build_source_feeds, GENERAL_STREAM_NAME};
use crate::ingest::{ingest_feed, FeedContext, FeedFetcher, FeedSummary};
use crate::matcher::extract_entry_tickers;
use crate::store::{CatalogCounts, Store};

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub total_feeds: usize,
    pub total_items_seen: i64,
    pub total_items_inserted: i64,
    pub failed_feeds: usize,
    pub feeds: Vec<FeedSummary>,
    pub catalog: CatalogCounts,
    pub remap: Option<RemapSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemapSummary {
    pub processed: usize,
    pub articles_with_hits: usize,
    pub remapped_articles: usize,
    pub only_unmapped: bool,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn FeedFetcher>,
    fallback: Arc<FallbackResolver>,
    catalog: Arc<dyn SymbolCatalog>,
    settings: Settings,
    cycle_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn FeedFetcher>,
        fallback: Arc<FallbackResolver>,
        catalog: Arc<dyn SymbolCatalog>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            fetcher,
            fallback,
            catalog,
            settings,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Whether a cycle currently holds the single-flight lock.
    pub fn is_busy(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Single-flight cycle entry point. `None` means a cycle is already in
    /// flight; the caller reports busy instead of waiting.
    pub async fn try_run(&self) -> Option<anyhow::Result<CycleSummary>> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            counter!("ingest_cycles_skipped_total").increment(1);
            info!(target: "ingest", "cycle already in flight, skipping");
            return None;
        };
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        // Catalog failure (missing required column) is fatal to the whole
        // cycle; an absent file just syncs nothing.
        let catalog_counts = self.catalog.sync(self.store.as_ref()).await?;

        let symbol_ids = self.store.active_symbols().await?;
        let known_symbols: HashSet<String> = symbol_ids.keys().cloned().collect();
        let mut symbols: Vec<String> = known_symbols.iter().cloned().collect();
        symbols.sort_unstable();

        let ctx = FeedContext {
            store: self.store.as_ref(),
            fetcher: self.fetcher.as_ref(),
            fallback: self.fallback.as_ref(),
            known_symbols: &known_symbols,
            symbol_ids: &symbol_ids,
            timeout: self.settings.request_timeout(),
        };

        let mut feeds: Vec<FeedSummary> = Vec::new();
        let mut total_items_seen = 0i64;
        let mut total_items_inserted = 0i64;
        let mut failed_feeds = 0usize;

        for source_feed in build_source_feeds(&self.settings, &symbols) {
            let source_row = match self
                .store
                .upsert_source(&source_feed.code, &source_feed.name, &source_feed.base_url)
                .await
            {
                Ok(row) => row,
                Err(error) => {
                    warn!(target: "ingest", source = %source_feed.code, error = %error, "source upsert failed");
                    continue;
                }
            };

            for feed_url in &source_feed.feed_urls {
                let summary = ingest_feed(
                    &ctx,
                    &source_row,
                    feed_url,
                    source_feed.is_general_stream(),
                )
                .await;
                total_items_seen += summary.items_seen;
                total_items_inserted += summary.items_inserted;
                if summary.status != "success" {
                    failed_feeds += 1;
                }
                feeds.push(summary);
            }
        }

        let remap = if catalog_counts.changed() {
            Some(
                self.remap_general(self.settings.remap_limit, true)
                    .await?,
            )
        } else {
            None
        };

        counter!("ingest_cycles_total").increment(1);
        info!(
            target: "ingest",
            total_feeds = feeds.len(),
            total_items_seen,
            total_items_inserted,
            failed_feeds,
            "ingestion cycle finished"
        );

        Ok(CycleSummary {
            total_feeds: feeds.len(),
            total_items_seen,
            total_items_inserted,
            failed_feeds,
            feeds,
            catalog: catalog_counts,
            remap,
        })
    }

    /// Re-scan recent general-stream articles against the current symbol
    /// set, recovering associations for symbols added after first ingest.
    /// Never prunes; remap only adds or raises.
    pub async fn remap_general(
        &self,
        limit: i64,
        only_unmapped: bool,
    ) -> anyhow::Result<RemapSummary> {
        let symbol_ids = self.store.active_symbols().await?;
        let known_symbols: HashSet<String> = symbol_ids.keys().cloned().collect();

        let articles = self
            .store
            .recent_articles_by_provider(GENERAL_STREAM_NAME, only_unmapped, limit)
            .await?;

        let mut processed = 0usize;
        let mut articles_with_hits = 0usize;
        let mut remapped_articles = 0usize;

        for article in articles {
            processed += 1;

            let mut hits = extract_entry_tickers(
                &article.title,
                article.summary.as_deref().unwrap_or(""),
                &article.canonical_url,
                "",
                &known_symbols,
                true,
            );
            if hits.is_empty() {
                hits = self
                    .fallback
                    .resolve(&article.title, &article.canonical_url, &known_symbols)
                    .await;
            }
            if hits.is_empty() {
                continue;
            }
            articles_with_hits += 1;

            let mut tx = self.store.begin_entry().await?;
            let changed =
                apply_ticker_hits(tx.as_mut(), article.id, &hits, &symbol_ids, false).await?;
            tx.commit().await?;
            if changed > 0 {
                remapped_articles += 1;
            }
        }

        info!(
            target: "ingest",
            processed,
            articles_with_hits,
            remapped_articles,
            only_unmapped,
            "general-stream remap finished"
        );

        Ok(RemapSummary {
            processed,
            articles_with_hits,
            remapped_articles,
            only_unmapped,
        })
    }
}
