// src/ingest/sources.rs
// Feed catalog: which providers are polled and with which URLs.
//
// Yahoo feeds are built per cycle from the active ticker catalog, batched
// into `?s=SYM1,SYM2,...` URLs. The wire services use fixed topic feeds.
// Business Wire is the general stream: entries are persisted regardless of
// ticker hits and get the page-fallback treatment.

use crate::config::Settings;

/// Source code of the general (non-symbol-scoped) stream.
pub const GENERAL_STREAM_CODE: &str = "businesswire";
pub const GENERAL_STREAM_NAME: &str = "Business Wire";

pub const PRNEWSWIRE_FEEDS: &[&str] = &[
    "https://www.prnewswire.com/rss/financial-services-latest-news/financial-services-latest-news-list.rss",
    "https://www.prnewswire.com/rss/financial-services-latest-news/mutual-funds-list.rss",
    "https://www.prnewswire.com/rss/financial-services-latest-news/dividends-list.rss",
    "https://www.prnewswire.com/rss/financial-services-latest-news/conference-call-announcements-list.rss",
    "https://www.prnewswire.com/rss/financial-services-latest-news/earnings-list.rss",
    "https://www.prnewswire.com/rss/financial-services-latest-news/stock-offering-list.rss",
];

pub const GLOBENEWSWIRE_FEEDS: &[&str] = &[
    "https://rss.globenewswire.com/en/RssFeed/industry/30204000-Closed%20End%20Investments/feedTitle/CEF%20Industry",
    "https://rss.globenewswire.com/en/RssFeed/exchange/NYSE/feedTitle/NYSE%20News",
    "https://rss.globenewswire.com/en/RssFeed/orgclass/1/feedTitle/Public%20Companies",
];

pub const BUSINESSWIRE_FEEDS: &[&str] = &["https://feed.businesswire.com/rss/home"];

/// One provider with the feed URLs to poll this cycle.
#[derive(Debug, Clone)]
pub struct SourceFeed {
    pub code: String,
    pub name: String,
    pub base_url: String,
    pub feed_urls: Vec<String>,
}

impl SourceFeed {
    pub fn is_general_stream(&self) -> bool {
        self.code == GENERAL_STREAM_CODE
    }
}

/// Batch active symbols into Yahoo headline-feed URLs.
pub fn build_yahoo_feed_urls(symbols: &[String], chunk_size: usize) -> Vec<String> {
    if symbols.is_empty() {
        return Vec::new();
    }
    symbols
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            format!(
                "https://feeds.finance.yahoo.com/rss/2.0/headline?s={}&region=US&lang=en-US",
                chunk.join(",")
            )
        })
        .collect()
}

/// Assemble the enabled providers for one cycle. `symbols` must already be
/// sorted for stable Yahoo batching.
pub fn build_source_feeds(settings: &Settings, symbols: &[String]) -> Vec<SourceFeed> {
    let mut feeds = Vec::new();

    if settings.yahoo_enabled {
        feeds.push(SourceFeed {
            code: "yahoo".to_string(),
            name: "Yahoo Finance RSS".to_string(),
            base_url: "https://feeds.finance.yahoo.com".to_string(),
            feed_urls: build_yahoo_feed_urls(symbols, settings.yahoo_chunk_size),
        });
    }

    if settings.prnewswire_enabled {
        feeds.push(SourceFeed {
            code: "prnewswire".to_string(),
            name: "PR Newswire RSS".to_string(),
            base_url: "https://www.prnewswire.com".to_string(),
            feed_urls: PRNEWSWIRE_FEEDS.iter().map(|s| s.to_string()).collect(),
        });
    }

    if settings.globenewswire_enabled {
        feeds.push(SourceFeed {
            code: "globenewswire".to_string(),
            name: "GlobeNewswire RSS".to_string(),
            base_url: "https://rss.globenewswire.com".to_string(),
            feed_urls: GLOBENEWSWIRE_FEEDS.iter().map(|s| s.to_string()).collect(),
        });
    }

    if settings.businesswire_enabled {
        feeds.push(SourceFeed {
            code: GENERAL_STREAM_CODE.to_string(),
            name: GENERAL_STREAM_NAME.to_string(),
            base_url: "https://www.businesswire.com".to_string(),
            feed_urls: BUSINESSWIRE_FEEDS.iter().map(|s| s.to_string()).collect(),
        });
    }

    feeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn yahoo_urls_are_chunked() {
        let urls = build_yahoo_feed_urls(&symbols(&["AIO", "BDJ", "GOF", "PDI", "UTF"]), 2);
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("s=AIO,BDJ&"));
        assert!(urls[2].contains("s=UTF&"));
    }

    #[test]
    fn no_symbols_means_no_yahoo_urls() {
        assert!(build_yahoo_feed_urls(&[], 40).is_empty());
    }

    #[test]
    fn disabled_providers_are_skipped() {
        let settings = Settings {
            yahoo_enabled: false,
            prnewswire_enabled: true,
            globenewswire_enabled: false,
            businesswire_enabled: true,
            ..Settings::default()
        };
        let feeds = build_source_feeds(&settings, &symbols(&["GOF"]));
        let codes: Vec<&str> = feeds.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["prnewswire", GENERAL_STREAM_CODE]);
        assert!(feeds[1].is_general_stream());
    }
}
