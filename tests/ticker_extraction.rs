// tests/ticker_extraction.rs
// Matcher behavior over realistic feed entries.

use std::collections::HashSet;

use cefwire::matcher::{extract_entry_tickers, MatchKind};

fn known(symbols: &[&str]) -> HashSet<String> {
    symbols.iter().map(|s| s.to_string()).collect()
}

#[test]
fn paren_and_exchange_hits_carry_expected_confidence() {
    let known = known(&["GOF", "UTF"]);
    let hits = extract_entry_tickers(
        "Guggenheim Strategic Opportunities Fund (GOF) and NYSE: UTF announce results",
        "",
        "https://www.prnewswire.com/news-releases/results.html",
        "",
        &known,
        true,
    );
    assert!(hits["GOF"].confidence >= 0.75);
    assert!(hits["UTF"].confidence >= 0.88);
}

#[test]
fn single_symbol_feed_context_without_text_signal() {
    let known = known(&["GOF"]);
    let hits = extract_entry_tickers(
        "Monthly commentary",
        "Nothing symbol-shaped here.",
        "https://finance.yahoo.com/news/commentary.html",
        "https://feeds.finance.yahoo.com/rss/2.0/headline?s=GOF&region=US&lang=en-US",
        &known,
        true,
    );
    assert_eq!(hits.len(), 1);
    assert_eq!(hits["GOF"].kind, MatchKind::Context);
    assert_eq!(hits["GOF"].confidence, 0.93);
}

#[test]
fn batched_feed_context_only_matches_text_symbols() {
    let known = known(&["GOF", "UTF", "PDI"]);
    let hits = extract_entry_tickers(
        "GOF announces rights offering",
        "",
        "https://finance.yahoo.com/news/gof-rights.html",
        "https://feeds.finance.yahoo.com/rss/2.0/headline?s=GOF,UTF,PDI&region=US&lang=en-US",
        &known,
        true,
    );
    assert!(hits.contains_key("GOF"));
    assert!(!hits.contains_key("UTF"));
    assert!(!hits.contains_key("PDI"));
}

#[test]
fn ambiguous_symbols_need_exchange_or_paren() {
    let known = known(&["FUND", "CASH", "GOLD"]);

    // Bare vocabulary words never match, even though the symbols are real.
    let hits = extract_entry_tickers(
        "SPECIAL OPPORTUNITIES FUND ANNOUNCES CASH DISTRIBUTION",
        "Investors seeking GOLD exposure",
        "https://example.com/story",
        "",
        &known,
        true,
    );
    assert!(hits.is_empty());

    let hits = extract_entry_tickers(
        "Special Opportunities Fund (FUND) announces NYSE: CASH listing",
        "",
        "https://example.com/story",
        "",
        &known,
        true,
    );
    assert_eq!(hits["FUND"].kind, MatchKind::Paren);
    assert_eq!(hits["CASH"].kind, MatchKind::Exchange);
}

#[test]
fn stopwords_never_match_as_tokens() {
    let known = known(&["NEW", "CEO", "GOF"]);
    let hits = extract_entry_tickers(
        "NEW CEO joins GOF team",
        "",
        "https://example.com/story",
        "",
        &known,
        true,
    );
    assert_eq!(hits.len(), 1);
    assert_eq!(hits["GOF"].kind, MatchKind::Token);
    assert_eq!(hits["GOF"].confidence, 0.62);
}

#[test]
fn strongest_heuristic_wins_per_symbol() {
    let known = known(&["GOF"]);
    let hits = extract_entry_tickers(
        "GOF update (GOF) on NASDAQ: GOF",
        "",
        "https://example.com/story",
        "",
        &known,
        true,
    );
    assert_eq!(hits.len(), 1);
    assert_eq!(hits["GOF"].kind, MatchKind::Exchange);
    assert_eq!(hits["GOF"].confidence, 0.88);
}
