// src/config.rs
// Environment-driven runtime settings with safe defaults and clamps.

use std::env;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    pub scheduler_enabled: bool,
    /// Seconds between ingestion cycles; clamped to >= 30.
    pub ingest_interval_secs: u64,
    /// Upper bound of the random per-tick start jitter.
    pub ingest_jitter_secs: u64,

    /// Per-request HTTP timeout; clamped to 5..=120 seconds.
    pub request_timeout_secs: u64,

    pub yahoo_enabled: bool,
    pub prnewswire_enabled: bool,
    pub globenewswire_enabled: bool,
    pub businesswire_enabled: bool,
    /// Symbols per batched Yahoo feed URL.
    pub yahoo_chunk_size: usize,

    pub tickers_csv_path: String,
    /// Article batch size for the post-catalog-change remap.
    pub remap_limit: i64,
}

impl Settings {
    pub fn from_env() -> Self {
        let ingest_interval_secs = env_u64("INGEST_INTERVAL_SECS", 60).max(30);
        let request_timeout_secs = env_u64("REQUEST_TIMEOUT_SECS", 20).clamp(5, 120);
        Self {
            database_url: env_string("DATABASE_URL", ""),
            host: env_string("HOST", "0.0.0.0"),
            port: env_u64("PORT", 8000) as u16,
            scheduler_enabled: env_bool("SCHEDULER_ENABLED", true),
            ingest_interval_secs,
            ingest_jitter_secs: env_u64("INGEST_JITTER_SECS", 10),
            request_timeout_secs,
            yahoo_enabled: env_bool("YAHOO_FEEDS_ENABLED", true),
            prnewswire_enabled: env_bool("PRNEWSWIRE_FEEDS_ENABLED", true),
            globenewswire_enabled: env_bool("GLOBENEWSWIRE_FEEDS_ENABLED", true),
            businesswire_enabled: env_bool("BUSINESSWIRE_FEED_ENABLED", true),
            yahoo_chunk_size: env_usize("YAHOO_CHUNK_SIZE", 40).max(1),
            tickers_csv_path: env_string("TICKERS_CSV_PATH", "data/tickers.csv"),
            remap_limit: env_u64("REMAP_LIMIT", 500).max(1) as i64,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.ingest_interval_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            scheduler_enabled: true,
            ingest_interval_secs: 60,
            ingest_jitter_secs: 10,
            request_timeout_secs: 20,
            yahoo_enabled: true,
            prnewswire_enabled: true,
            globenewswire_enabled: true,
            businesswire_enabled: true,
            yahoo_chunk_size: 40,
            tickers_csv_path: "data/tickers.csv".to_string(),
            remap_limit: 500,
        }
    }
}
