// src/canonical.rs
// Canonicalization & identity: stable hash keys for URLs and titles.
//
// Two URLs that differ only by tracking parameters, parameter order, or a
// default port must canonicalize to the same string; two headlines that
// differ only by HTML-entity encoding or punctuation noise must normalize
// to the same hash. Everything downstream (dedup, advisory locks) keys off
// these values.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;
use url::Url;

/// Query parameters dropped exactly by name.
const TRACKING_PARAM_EXACT: &[&str] = &["tsrc", "cmpid", "ncid", "ocid"];

/// Query parameters dropped by prefix.
const TRACKING_PARAM_PREFIXES: &[&str] = &["utm_", "ga_"];

/// Labels stored in 120-char columns (source/provider names).
pub const LABEL_MAX_CHARS: usize = 120;

/// Hex-encoded SHA-256 of a string. All identity hashes use this.
pub fn sha256_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap())
}

/// Normalize a title into the form used for the title-identity hash:
/// entity-decode, lower-case, keep only `[a-z0-9 ]`, collapse whitespace.
pub fn normalize_title(value: &str) -> String {
    let decoded = html_escape::decode_html_entities(value.trim()).to_lowercase();
    let kept: String = decoded
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    re_ws().replace_all(&kept, " ").trim().to_string()
}

/// Strip markup from a feed summary: decode entities, drop tags, collapse
/// whitespace. Returns `None` when nothing readable is left.
pub fn clean_summary_text(value: &str) -> Option<String> {
    let without_tags = re_tags().replace_all(value, " ");
    let decoded = html_escape::decode_html_entities(without_tags.as_ref()).to_string();
    let collapsed = re_ws().replace_all(&decoded, " ").trim().to_string();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn is_tracking_param(key: &str) -> bool {
    // Yahoo feed links prefix some tracking keys with a dot (`?.tsrc=rss`).
    let lower = key.trim_start_matches('.').to_lowercase();
    if TRACKING_PARAM_EXACT.contains(&lower.as_str()) {
        return true;
    }
    TRACKING_PARAM_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Canonicalize a link into its identity form.
///
/// Lower-cases scheme/host, strips default ports and fragments, drops
/// tracking parameters and blank-valued parameters, sorts the remaining
/// query by key, and trims the trailing slash from the path (root stays
/// `/`). Unparseable input is returned trimmed, unchanged.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_string(),
    };

    // The url crate already lower-cases scheme/host and drops default ports
    // for known schemes.
    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or_default();
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();

    let mut query_items: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, value)| !value.is_empty() && !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    query_items.sort();

    let query = if query_items.is_empty() {
        String::new()
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &query_items {
            serializer.append_pair(key, value);
        }
        format!("?{}", serializer.finish())
    };

    let path = parsed.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    format!("{scheme}://{host}{port}{path}{query}")
}

/// Content-change signal: hash of the title hash plus the first 300 chars
/// of the normalized summary. Not an identity key.
pub fn content_hash(title_hash: &str, summary: &str) -> String {
    let summary_norm = normalize_title(summary);
    let head: String = summary_norm.chars().take(300).collect();
    sha256_hex(&format!("{title_hash}|{head}"))
}

/// Clamp a display label to the stored column width, trimming first.
pub fn clamp_label(value: &str) -> String {
    let text = value.trim();
    if text.chars().count() <= LABEL_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(LABEL_MAX_CHARS).collect()
}

/// Derive a signed 64-bit advisory-lock key from a hex identity hash.
/// Uses the first 16 hex chars, reinterpreted as two's complement.
pub fn lock_key(hash_hex: &str) -> i64 {
    let head = &hash_hex[..hash_hex.len().min(16)];
    u64::from_str_radix(head, 16).unwrap_or(0) as i64
}

fn offset_to_chrono(dt: OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond())
}

/// Parse a feed timestamp. RSS pubDate is RFC 2822; some providers emit
/// RFC 3339. Anything else is treated as missing.
pub fn parse_feed_datetime(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(text, &Rfc2822) {
        return offset_to_chrono(dt);
    }
    if let Ok(dt) = OffsetDateTime::parse(text, &Rfc3339) {
        return offset_to_chrono(dt);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_params_are_removed() {
        let url = "https://finance.yahoo.com/news/example?utm_source=x&tsrc=rss&id=7";
        assert_eq!(
            canonicalize_url(url),
            "https://finance.yahoo.com/news/example?id=7"
        );
    }

    #[test]
    fn dotted_tracking_params_are_removed() {
        assert_eq!(
            canonicalize_url("https://finance.yahoo.com/news/example?.tsrc=rss"),
            "https://finance.yahoo.com/news/example"
        );
        assert_eq!(
            canonicalize_url("https://finance.yahoo.com/news/example?.tsrc=rss"),
            canonicalize_url("https://finance.yahoo.com/news/example")
        );
    }

    #[test]
    fn query_order_does_not_matter() {
        let a = canonicalize_url("https://example.com/story?b=2&a=1");
        let b = canonicalize_url("https://example.com/story?a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn default_ports_and_fragments_are_dropped() {
        assert_eq!(
            canonicalize_url("HTTPS://Example.COM:443/a/b/#part"),
            "https://example.com/a/b"
        );
        assert_eq!(
            canonicalize_url("http://example.com:80/"),
            "http://example.com/"
        );
    }

    #[test]
    fn normalize_title_reduces_noise() {
        assert_eq!(normalize_title("  Hello,   World!  "), "hello world");
        assert_eq!(
            normalize_title("Fund &amp; Income"),
            normalize_title("Fund & Income")
        );
    }

    #[test]
    fn clean_summary_strips_markup() {
        let raw = "<p>CHARLOTTE&nbsp;N.C.</p><div>Monthly <b>distribution</b></div>";
        assert_eq!(
            clean_summary_text(raw).as_deref(),
            Some("CHARLOTTE N.C. Monthly distribution")
        );
        assert_eq!(clean_summary_text("<p> </p>"), None);
    }

    #[test]
    fn clamp_label_caps_to_column_width() {
        let long = "X".repeat(240);
        assert_eq!(clamp_label(&long).len(), LABEL_MAX_CHARS);
        assert_eq!(clamp_label("  short  "), "short");
    }

    #[test]
    fn lock_key_is_stable_and_signed() {
        let hash = sha256_hex("abc");
        assert_eq!(lock_key(&hash), lock_key(&hash));
        // 16 hex chars with a high bit set must wrap, not panic.
        assert!(lock_key("ffffffffffffffff") < 0);
    }

    #[test]
    fn feed_datetime_accepts_rfc2822_and_rfc3339() {
        assert!(parse_feed_datetime("Tue, 20 Jan 2026 14:30:00 GMT").is_some());
        assert!(parse_feed_datetime("2026-01-20T14:30:00Z").is_some());
        assert!(parse_feed_datetime("not a date").is_none());
    }
}
