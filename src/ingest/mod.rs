// src/ingest/mod.rs
// Feed fetch, RSS parse, and the per-entry persistence pipeline.
//
// One `ingest_feed` call covers a single (source, feed URL) attempt and is
// bracketed by a run row (`running` -> `success`/`failed`). Entry work runs
// in short per-entry write transactions; a failure rolls back the entry in
// flight, marks the run failed, and never takes the other feeds down.

pub mod cycle;
pub mod scheduler;
pub mod sources;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canonical::{
    canonicalize_url, clamp_label, clean_summary_text, parse_feed_datetime, sha256_hex,
};
use crate::dedup::{apply_ticker_hits, should_persist, upsert_article, EntryRecord};
use crate::fallback::FallbackResolver;
use crate::matcher::extract_entry_tickers;
use crate::store::{NewRawFeedItem, RunStatus, SourceRow, Store};

pub const REQUEST_USER_AGENT: &str = "cefwire/0.1 (+local)";
pub const REQUEST_ACCEPT: &str =
    "application/rss+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.1";

/// Fetches one RSS document. Implemented over reqwest in production and by
/// fixtures in tests.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, feed_url: &str, timeout: Duration) -> anyhow::Result<String>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, feed_url: &str, timeout: Duration) -> anyhow::Result<String> {
        let response = self
            .client
            .get(feed_url)
            .timeout(timeout)
            .header("User-Agent", REQUEST_USER_AGENT)
            .header("Accept", REQUEST_ACCEPT)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("feed fetch returned status {}", response.status());
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    source: Option<ItemSource>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: Option<String>,
}

/// `<source url="...">Provider Name</source>` on an item.
#[derive(Debug, Deserialize)]
struct ItemSource {
    #[serde(rename = "$text")]
    title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawEntry {
    pub title: String,
    pub link: String,
    pub guid: Option<String>,
    pub pub_date: Option<String>,
    pub description: Option<String>,
    pub source_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub channel_title: Option<String>,
    pub entries: Vec<RawEntry>,
}

/// Parse an RSS 2.0 document into raw entries. Entries keep their raw text;
/// normalization happens in the persistence pipeline.
pub fn parse_feed(xml: &str) -> anyhow::Result<ParsedFeed> {
    let started = std::time::Instant::now();
    let rss: Rss = from_str(xml)?;
    let entries = rss
        .channel
        .items
        .into_iter()
        .map(|item| RawEntry {
            title: item.title.unwrap_or_default().trim().to_string(),
            link: item.link.unwrap_or_default().trim().to_string(),
            guid: item.guid.and_then(|g| g.value).filter(|v| !v.is_empty()),
            pub_date: item.pub_date,
            description: item.description,
            source_title: item
                .source
                .and_then(|s| s.title)
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
        .collect();
    histogram!("ingest_parse_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
    Ok(ParsedFeed {
        channel_title: rss.channel.title.map(|t| t.trim().to_string()),
        entries,
    })
}

/// Per-feed outcome, also what the admin status endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    pub source: String,
    pub feed_url: String,
    pub status: String,
    pub items_seen: i64,
    pub items_inserted: i64,
    pub error: Option<String>,
}

/// Shared per-cycle context threaded through each feed.
pub struct FeedContext<'a> {
    pub store: &'a dyn Store,
    pub fetcher: &'a dyn FeedFetcher,
    pub fallback: &'a FallbackResolver,
    pub known_symbols: &'a HashSet<String>,
    pub symbol_ids: &'a HashMap<String, i64>,
    pub timeout: Duration,
}

/// Ingest one feed URL for one source, bracketed by a run row.
pub async fn ingest_feed(
    ctx: &FeedContext<'_>,
    source: &SourceRow,
    feed_url: &str,
    is_general_stream: bool,
) -> FeedSummary {
    let run = match ctx.store.create_run(source.id, feed_url).await {
        Ok(run) => run,
        Err(error) => {
            warn!(target: "ingest", feed_url, error = %error, "failed to create run row");
            return FeedSummary {
                source: source.code.clone(),
                feed_url: feed_url.to_string(),
                status: RunStatus::Failed.as_str().to_string(),
                items_seen: 0,
                items_inserted: 0,
                error: Some(error.to_string()),
            };
        }
    };

    let mut items_seen = 0i64;
    let mut items_inserted = 0i64;
    let outcome = process_feed(
        ctx,
        source,
        feed_url,
        is_general_stream,
        &mut items_seen,
        &mut items_inserted,
    )
    .await;

    let (status, error_text) = match outcome {
        Ok(()) => (RunStatus::Success, None),
        Err(error) => {
            counter!("ingest_feed_failures_total").increment(1);
            warn!(target: "ingest", feed_url, error = %error, "feed ingest failed");
            (RunStatus::Failed, Some(error.to_string()))
        }
    };

    if let Err(error) = ctx
        .store
        .finish_run(run.id, status, items_seen, items_inserted, error_text.as_deref())
        .await
    {
        warn!(target: "ingest", run_id = run.id, error = %error, "failed to finish run row");
    }

    counter!("ingest_items_seen_total").increment(items_seen as u64);
    counter!("ingest_items_inserted_total").increment(items_inserted as u64);
    info!(
        target: "ingest",
        source = %source.code,
        feed_url,
        status = status.as_str(),
        items_seen,
        items_inserted,
        "feed ingest finished"
    );

    FeedSummary {
        source: source.code.clone(),
        feed_url: feed_url.to_string(),
        status: status.as_str().to_string(),
        items_seen,
        items_inserted,
        error: error_text,
    }
}

async fn process_feed(
    ctx: &FeedContext<'_>,
    source: &SourceRow,
    feed_url: &str,
    is_general_stream: bool,
    items_seen: &mut i64,
    items_inserted: &mut i64,
) -> anyhow::Result<()> {
    let xml = ctx.fetcher.fetch(feed_url, ctx.timeout).await?;
    let parsed = parse_feed(&xml)?;

    // Wire-service channels carry a more specific display title than the
    // configured source name. Yahoo channels don't (per-symbol boilerplate),
    // so yahoo keeps its configured name.
    let mut source_name = source.name.clone();
    if source.code != "yahoo" {
        if let Some(channel_title) = parsed.channel_title.as_deref() {
            if !channel_title.is_empty() {
                source_name = clamp_label(channel_title);
            }
        }
    }
    let provider_name = clamp_label(&source.name);

    for entry in &parsed.entries {
        *items_seen += 1;

        let title = clean_summary_text(&entry.title).unwrap_or_else(|| entry.title.clone());
        let link = canonicalize_url(&entry.link);
        if title.is_empty() || link.is_empty() {
            continue;
        }

        let raw_summary = entry
            .description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let summary = raw_summary.and_then(clean_summary_text);
        let published_at = entry
            .pub_date
            .as_deref()
            .and_then(parse_feed_datetime)
            .unwrap_or_else(Utc::now);

        let mut hits = extract_entry_tickers(
            &title,
            summary.as_deref().unwrap_or(""),
            &link,
            feed_url,
            ctx.known_symbols,
            true,
        );
        if is_general_stream && hits.is_empty() {
            hits = ctx.fallback.resolve(&title, &link, ctx.known_symbols).await;
        }

        let url_hash = sha256_hex(&link);
        let article_exists = ctx.store.article_exists_by_url_hash(&url_hash).await?;
        if !should_persist(is_general_stream, &hits, article_exists) {
            continue;
        }

        let record = EntryRecord {
            canonical_url: link.clone(),
            title: title.clone(),
            summary: summary.clone(),
            published_at,
            source_name: source_name.clone(),
            provider_name: provider_name.clone(),
        };

        let mut tx = ctx.store.begin_entry().await?;
        let resolved = upsert_article(tx.as_mut(), &record, !is_general_stream).await?;
        if resolved.created {
            *items_inserted += 1;
        }

        let prune_missing = resolved.matched_by_url && !resolved.created && !is_general_stream;
        apply_ticker_hits(
            tx.as_mut(),
            resolved.article.id,
            &hits,
            ctx.symbol_ids,
            prune_missing,
        )
        .await?;

        let entry_source_name = entry
            .source_title
            .as_deref()
            .map(clamp_label)
            .unwrap_or_else(|| source_name.clone());
        let payload = serde_json::json!({
            "title": entry.title,
            "link": link,
            "published": entry.pub_date,
            "summary": raw_summary,
            "source": entry_source_name,
        });
        tx.insert_raw_item(&NewRawFeedItem {
            source_id: source.id,
            article_id: Some(resolved.article.id),
            feed_url: feed_url.to_string(),
            raw_guid: entry.guid.clone(),
            raw_title: entry.title.clone(),
            raw_link: link,
            raw_pub_date: Some(published_at),
            raw_payload: payload,
        })
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
