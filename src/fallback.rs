// src/fallback.rs
// Page-fallback resolver for the general news stream (Business Wire).
//
// The Business Wire RSS payload under-reports tickers, but the linked
// article pages carry them in fund tables. When RSS-text extraction comes
// up empty for a Business Wire entry, fetch the page once, render it to
// plain text, and re-run extraction with the bare-token heuristic off plus
// a table-cell scan. Pages (and failures) are cached behind a bounded LRU
// so re-sightings and remap batches do not hammer the site.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::matcher::{extract_entry_tickers, is_stopword, MatchKind, TickerHit, TickerHits};

/// Host (and subdomains) the resolver is ever allowed to fetch.
pub const GENERAL_STREAM_DOMAIN: &str = "businesswire.com";

pub const PAGE_CACHE_CAPACITY: usize = 512;
pub const PAGE_SUCCESS_TTL: Duration = Duration::from_secs(6 * 3600);
pub const PAGE_FAILURE_TTL: Duration = Duration::from_secs(60);

/// Fetches one article page as text. Failure covers transport errors,
/// non-2xx statuses, and empty bodies alike.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> anyhow::Result<String>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .header("User-Agent", crate::ingest::REQUEST_USER_AGENT)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("page fetch returned status {}", response.status());
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            anyhow::bail!("page fetch returned empty body");
        }
        Ok(body)
    }
}

#[derive(Debug, Clone)]
struct CacheSlot {
    /// `None` records a failed fetch (negative result).
    body: Option<String>,
    stored_at: Instant,
}

/// Bounded LRU of fetched pages keyed by path-only canonical URL.
/// Successes live `success_ttl`; failures expire after `failure_ttl` so
/// retry pressure stays bounded.
struct PageCache {
    slots: HashMap<String, CacheSlot>,
    order: VecDeque<String>,
    capacity: usize,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl PageCache {
    fn new(capacity: usize, success_ttl: Duration, failure_ttl: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            success_ttl,
            failure_ttl,
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    /// `Some(slot)` for a live entry, `None` for a miss or expired entry.
    fn get(&mut self, key: &str) -> Option<Option<String>> {
        let slot = self.slots.get(key)?;
        let ttl = if slot.body.is_some() {
            self.success_ttl
        } else {
            self.failure_ttl
        };
        if slot.stored_at.elapsed() > ttl {
            self.slots.remove(key);
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            return None;
        }
        let body = slot.body.clone();
        self.touch(key);
        Some(body)
    }

    fn insert(&mut self, key: String, body: Option<String>) {
        self.slots.insert(
            key.clone(),
            CacheSlot {
                body,
                stored_at: Instant::now(),
            },
        );
        self.touch(&key);
        while self.slots.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.slots.remove(&oldest);
        }
    }
}

fn re_script_style() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap()
    })
}

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap())
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn re_table_cell() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<t[dh][^>]*>\s*([A-Z]{1,5})\s*</t[dh]>").unwrap())
}

/// Plain-text rendering of an HTML page: scripts/styles removed, tags
/// stripped, entities decoded, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let without_blocks = re_script_style().replace_all(html, " ");
    let without_tags = re_tags().replace_all(&without_blocks, " ");
    let decoded = html_escape::decode_html_entities(without_tags.as_ref()).to_string();
    re_ws().replace_all(&decoded, " ").trim().to_string()
}

/// Short symbol-shaped strings sitting alone in table cells. Only stop
/// words stay excluded: a dedicated ticker column is a strong enough
/// signal to reach ambiguous symbols like `FUND` that the bare-token scan
/// refuses.
pub fn table_cell_symbols(html: &str, known: &HashSet<String>) -> HashSet<String> {
    re_table_cell()
        .captures_iter(html)
        .map(|capture| capture[1].to_string())
        .filter(|symbol| !is_stopword(symbol) && known.contains(symbol))
        .collect()
}

pub struct FallbackResolver {
    fetcher: Arc<dyn PageFetcher>,
    cache: Mutex<PageCache>,
    timeout: Duration,
}

impl FallbackResolver {
    pub fn new(fetcher: Arc<dyn PageFetcher>, timeout: Duration) -> Self {
        Self::with_cache(
            fetcher,
            timeout,
            PAGE_CACHE_CAPACITY,
            PAGE_SUCCESS_TTL,
            PAGE_FAILURE_TTL,
        )
    }

    pub fn with_cache(
        fetcher: Arc<dyn PageFetcher>,
        timeout: Duration,
        capacity: usize,
        success_ttl: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(PageCache::new(capacity, success_ttl, failure_ttl)),
            timeout,
        }
    }

    /// Only the general stream's own domain is ever fetched.
    pub fn is_allowed_url(url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_lowercase();
        host == GENERAL_STREAM_DOMAIN || host.ends_with(&format!(".{GENERAL_STREAM_DOMAIN}"))
    }

    /// Cache key: path-only canonical form (query and fragment stripped).
    fn cache_key(url: &str) -> String {
        match Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or_default().to_lowercase();
                let path = parsed.path().trim_end_matches('/');
                let path = if path.is_empty() { "/" } else { path };
                format!("{}://{host}{path}", parsed.scheme())
            }
            Err(_) => url.to_string(),
        }
    }

    /// Fetch (or recall) a page. `None` covers disallowed hosts, cached
    /// failures, and fresh failures; a failure is never raised.
    pub async fn fetch_page(&self, url: &str) -> Option<String> {
        if !Self::is_allowed_url(url) {
            return None;
        }
        let key = Self::cache_key(url);
        {
            let mut cache = self.cache.lock().expect("page cache mutex poisoned");
            if let Some(cached) = cache.get(&key) {
                return cached;
            }
        }

        let fetched = self.fetcher.fetch(url, self.timeout).await;
        let body = match fetched {
            Ok(body) => Some(body),
            Err(error) => {
                debug!(target: "ingest", url, error = %error, "fallback page fetch failed");
                None
            }
        };

        let mut cache = self.cache.lock().expect("page cache mutex poisoned");
        cache.insert(key, body.clone());
        body
    }

    /// Re-run extraction against the linked page. Token heuristic stays
    /// off; table cells contribute `bw_table` hits at 0.84.
    pub async fn resolve(
        &self,
        title: &str,
        link: &str,
        known: &HashSet<String>,
    ) -> TickerHits {
        let Some(html) = self.fetch_page(link).await else {
            return TickerHits::new();
        };

        let page_text = html_to_text(&html);
        let mut hits = extract_entry_tickers(title, &page_text, link, "", known, false);

        for symbol in table_cell_symbols(&html, known) {
            let candidate = TickerHit::new(MatchKind::BwTable);
            match hits.get(&symbol) {
                Some(existing) if existing.confidence >= candidate.confidence => {}
                _ => {
                    hits.insert(symbol, candidate);
                }
            }
        }

        hits
    }
}
