// src/matcher.rs
// Multi-heuristic ticker extraction with confidence scoring.
//
// Every heuristic runs over the entry text; per symbol, only the highest
// confidence wins and a confidence never regresses once recorded. Symbols
// outside the active catalog are discarded no matter what matched.

use std::collections::{HashMap, HashSet};

use once_cell::sync::OnceCell;
use regex::Regex;
use url::Url;

/// Which heuristic produced a ticker association. Ordered weakest-first so
/// the raise-only merge can lean on `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchKind {
    /// Bare 1-5 letter uppercase token in free text.
    Token,
    /// Symbol in parentheses, e.g. `(GOF)`.
    Paren,
    /// Symbol found in a table cell on a fetched Business Wire page.
    BwTable,
    /// `EXCHANGE: SYMBOL` pattern for a known exchange prefix.
    Exchange,
    /// Feed URL scoped to exactly one symbol (`?s=GOF`).
    Context,
}

impl MatchKind {
    pub fn confidence(self) -> f64 {
        match self {
            MatchKind::Token => 0.62,
            MatchKind::Paren => 0.75,
            MatchKind::BwTable => 0.84,
            MatchKind::Exchange => 0.88,
            MatchKind::Context => 0.93,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Token => "token",
            MatchKind::Paren => "paren",
            MatchKind::BwTable => "bw_table",
            MatchKind::Exchange => "exchange",
            MatchKind::Context => "context",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "token" => Some(MatchKind::Token),
            "paren" => Some(MatchKind::Paren),
            "bw_table" => Some(MatchKind::BwTable),
            "exchange" => Some(MatchKind::Exchange),
            "context" => Some(MatchKind::Context),
            _ => None,
        }
    }
}

/// One resolved symbol hit: the winning heuristic and its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickerHit {
    pub kind: MatchKind,
    pub confidence: f64,
}

impl TickerHit {
    pub fn new(kind: MatchKind) -> Self {
        Self {
            kind,
            confidence: kind.confidence(),
        }
    }
}

pub type TickerHits = HashMap<String, TickerHit>;

/// Common English/finance words that look like tickers in uppercase text.
const STOPWORDS: &[&str] = &[
    "A", "AN", "AND", "ARE", "AS", "AT", "BY", "CEO", "ETF", "FOR", "FROM", "IN", "INC", "IS",
    "IT", "NAV", "NEW", "NOT", "OF", "ON", "OR", "Q", "THE", "TO", "US", "USA", "WITH",
];

/// Real symbols that collide with ordinary finance vocabulary. Never matched
/// by the bare-token or table-cell heuristics; an exchange prefix, context
/// URL, or parenthesis still reaches them.
const AMBIGUOUS_SYMBOLS: &[&str] = &["FUND", "CASH", "GOLD"];

fn re_exchange() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:NYSE|NASDAQ|AMEX|OTC(?:QB|QX)?)\s*[:\-]\s*([A-Z]{1,5})\b").unwrap()
    })
}

fn re_paren() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\(([A-Z]{1,5})\)").unwrap())
}

fn re_token() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{1,5}\b").unwrap())
}

pub(crate) fn is_stopword(symbol: &str) -> bool {
    STOPWORDS.contains(&symbol)
}

/// Whether a bare symbol-shaped token may be trusted on its own.
pub(crate) fn token_scan_allowed(symbol: &str) -> bool {
    !is_stopword(symbol) && !AMBIGUOUS_SYMBOLS.contains(&symbol)
}

/// Symbols named by the feed URL's `s=` query parameter (comma separated,
/// possibly repeated).
fn context_symbols(feed_url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(feed_url) else {
        return Vec::new();
    };
    let mut symbols = Vec::new();
    for (key, value) in parsed.query_pairs() {
        if key != "s" {
            continue;
        }
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                symbols.push(token.to_uppercase());
            }
        }
    }
    symbols
}

fn add_hit(hits: &mut TickerHits, known: &HashSet<String>, symbol: &str, kind: MatchKind) {
    if !known.contains(symbol) {
        return;
    }
    let candidate = TickerHit::new(kind);
    match hits.get(symbol) {
        Some(existing) if existing.confidence >= candidate.confidence => {}
        _ => {
            hits.insert(symbol.to_string(), candidate);
        }
    }
}

/// Run all heuristics over one feed entry and keep the strongest hit per
/// symbol. `include_token` disables the noisy bare-token scan (the page
/// fallback turns it off for whole-page text).
pub fn extract_entry_tickers(
    title: &str,
    summary: &str,
    link: &str,
    feed_url: &str,
    known: &HashSet<String>,
    include_token: bool,
) -> TickerHits {
    let mut hits = TickerHits::new();

    // Yahoo feed URLs are often batched (s=SYM1,SYM2,...). Trusting a batch
    // would tag every entry with every symbol, so context only counts when
    // the URL is scoped to a single symbol.
    let context = context_symbols(feed_url);
    if let [only] = context.as_slice() {
        add_hit(&mut hits, known, only, MatchKind::Context);
    }

    let text = format!("{title} {summary} {link}");

    for capture in re_exchange().captures_iter(&text) {
        add_hit(&mut hits, known, &capture[1], MatchKind::Exchange);
    }

    for capture in re_paren().captures_iter(&text) {
        add_hit(&mut hits, known, &capture[1], MatchKind::Paren);
    }

    if include_token {
        for token in re_token().find_iter(&text) {
            let symbol = token.as_str();
            if token_scan_allowed(symbol) {
                add_hit(&mut hits, known, symbol, MatchKind::Token);
            }
        }
    }

    hits
}
