// src/dedup.rs
// Identity resolution and upsert: at most one article row per real-world
// story, correct under concurrent writers.
//
// Resolution order: exact canonical-URL hash, then (for sources that allow
// it) the ±48h title-hash window. A losing racer recovers from the unique
// constraint by re-reading instead of aborting its feed. Exact-URL
// re-sights are authoritative: they replace the summary unconditionally and
// may prune stale ticker associations; fuzzy matches do neither.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::canonical::{content_hash, lock_key, normalize_title, sha256_hex};
use crate::matcher::TickerHits;
use crate::store::{ArticleUpdate, EntryTx, NewArticle, StoreError};

/// Fuzzy title matches only merge stories published within this window.
pub const TITLE_MATCH_WINDOW_HOURS: i64 = 48;

/// One normalized feed entry, ready for identity resolution.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub canonical_url: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_name: String,
    pub provider_name: String,
}

/// Outcome of identity resolution for one entry.
#[derive(Debug, Clone)]
pub struct ResolvedArticle {
    pub article: crate::store::ArticleRow,
    pub created: bool,
    /// True when the entry matched (or raced into) the exact URL-hash row,
    /// as opposed to a title-window fuzzy merge.
    pub matched_by_url: bool,
}

/// Persistence gate: an entry is stored only when it matched at least one
/// active ticker, belongs to the general news stream, or refreshes an
/// article that already exists for its URL.
pub fn should_persist(is_general_stream: bool, hits: &TickerHits, article_exists: bool) -> bool {
    is_general_stream || !hits.is_empty() || article_exists
}

fn sorted_lock_keys(url_hash: &str, title_hash: &str) -> Vec<i64> {
    let mut keys = vec![lock_key(url_hash), lock_key(title_hash)];
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Resolve an entry to a new or existing article row and refresh its
/// mutable fields. `allow_title_merge` is false for the general-stream
/// source, which may legitimately emit distinct stories under one headline.
pub async fn upsert_article(
    tx: &mut dyn EntryTx,
    record: &EntryRecord,
    allow_title_merge: bool,
) -> Result<ResolvedArticle, StoreError> {
    let url_hash = sha256_hex(&record.canonical_url);
    let title_hash = sha256_hex(&normalize_title(&record.title));
    let summary_text = record.summary.as_deref().unwrap_or("");
    let content = content_hash(&title_hash, summary_text);
    let cluster_key = title_hash.clone();

    // Serialize racing writers on the identity keys. Sorted order prevents
    // lock-order deadlocks across workers; released with the transaction.
    tx.lock_identity(&sorted_lock_keys(&url_hash, &title_hash))
        .await?;

    let window = Duration::hours(TITLE_MATCH_WINDOW_HOURS);
    let window_start = record.published_at - window;
    let window_end = record.published_at + window;

    let mut matched_by_url = false;
    let mut existing = tx.article_by_url_hash(&url_hash).await?;
    if existing.is_some() {
        matched_by_url = true;
    } else if allow_title_merge {
        existing = tx
            .article_by_title_window(&title_hash, window_start, window_end)
            .await?;
    }

    let article = match existing {
        Some(article) => article,
        None => {
            let candidate = NewArticle {
                canonical_url: record.canonical_url.clone(),
                canonical_url_hash: url_hash.clone(),
                title: record.title.clone(),
                summary: record.summary.clone(),
                published_at: record.published_at,
                source_name: record.source_name.clone(),
                provider_name: record.provider_name.clone(),
                content_hash: content.clone(),
                title_normalized_hash: title_hash.clone(),
                cluster_key: cluster_key.clone(),
            };
            match tx.insert_article(&candidate).await {
                Ok(row) => {
                    return Ok(ResolvedArticle {
                        article: row,
                        created: true,
                        matched_by_url: true,
                    });
                }
                Err(StoreError::UniqueViolation) => {
                    // Another worker inserted the same URL first. Re-read
                    // and fall through to the update path.
                    if let Some(row) = tx.article_by_url_hash(&url_hash).await? {
                        matched_by_url = true;
                        row
                    } else if allow_title_merge {
                        tx.article_by_title_window(&title_hash, window_start, window_end)
                            .await?
                            .ok_or(StoreError::NotFound)?
                    } else {
                        return Err(StoreError::NotFound);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    };

    // Re-sighting: title/source/provider/content hash always refresh.
    // Exact-URL payloads are authoritative for the summary; fuzzy matches
    // only replace it with something strictly longer. Published time moves
    // forward only.
    let summary = if matched_by_url {
        record.summary.clone()
    } else {
        match (&record.summary, &article.summary) {
            (Some(new), Some(old)) if new.len() > old.len() => Some(new.clone()),
            (Some(new), None) if !new.is_empty() => Some(new.clone()),
            _ => article.summary.clone(),
        }
    };
    let published_at = article.published_at.max(record.published_at);

    let update = ArticleUpdate {
        title: record.title.clone(),
        summary,
        published_at,
        source_name: record.source_name.clone(),
        provider_name: record.provider_name.clone(),
        content_hash: content,
        cluster_key,
    };
    tx.update_article(article.id, &update).await?;

    let refreshed = tx
        .article_by_url_hash(&article.canonical_url_hash)
        .await?
        .ok_or(StoreError::NotFound)?;

    Ok(ResolvedArticle {
        article: refreshed,
        created: false,
        matched_by_url,
    })
}

/// Upsert ticker associations for a resolved article. Confidence only
/// rises; `prune_missing` deletes associations whose symbol vanished from
/// the current extraction (exact-URL re-sights on non-general sources).
/// Returns the number of associations inserted or raised.
pub async fn apply_ticker_hits(
    tx: &mut dyn EntryTx,
    article_id: i64,
    hits: &TickerHits,
    symbol_ids: &HashMap<String, i64>,
    prune_missing: bool,
) -> Result<usize, StoreError> {
    let existing = tx.associations_for(article_id).await?;
    let mut by_ticker: HashMap<i64, crate::store::ArticleTickerRow> = existing
        .into_iter()
        .map(|row| (row.ticker_id, row))
        .collect();

    let mut changed = 0usize;
    let mut matched_ids: HashSet<i64> = HashSet::new();

    for (symbol, hit) in hits {
        let Some(&ticker_id) = symbol_ids.get(symbol) else {
            continue;
        };
        matched_ids.insert(ticker_id);

        let row = match by_ticker.get(&ticker_id) {
            Some(row) => row.clone(),
            None => {
                match tx
                    .insert_association(article_id, ticker_id, hit.kind.as_str(), hit.confidence)
                    .await
                {
                    Ok(row) => {
                        changed += 1;
                        by_ticker.insert(ticker_id, row);
                        continue;
                    }
                    Err(StoreError::UniqueViolation) => {
                        // Concurrent insert of the same pair; adopt it.
                        let row = tx
                            .association_for(article_id, ticker_id)
                            .await?
                            .ok_or(StoreError::NotFound)?;
                        by_ticker.insert(ticker_id, row.clone());
                        row
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        if hit.confidence > row.confidence {
            tx.update_association(row.id, hit.kind.as_str(), hit.confidence)
                .await?;
            changed += 1;
        }
    }

    if prune_missing {
        for (ticker_id, row) in &by_ticker {
            if !matched_ids.contains(ticker_id) {
                tx.delete_association(row.id).await?;
            }
        }
    }

    Ok(changed)
}
