// src/catalog.rs
// Symbol catalog boundary: where active ticker symbols come from.
//
// Production uses a CSV file (`ticker` column required; `fund_name`,
// `sponsor`, `active` optional). A missing file means an empty sync, a
// missing required column is fatal to the whole cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::store::{CatalogCounts, Store, TickerRecord};

#[async_trait]
pub trait SymbolCatalog: Send + Sync {
    /// Apply the current catalog snapshot to the store and report change
    /// counts (they drive the post-sync remap).
    async fn sync(&self, store: &dyn Store) -> Result<CatalogCounts>;
}

pub struct CsvSymbolCatalog {
    path: PathBuf,
}

impl CsvSymbolCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SymbolCatalog for CsvSymbolCatalog {
    async fn sync(&self, store: &dyn Store) -> Result<CatalogCounts> {
        if !self.path.exists() {
            info!(target: "ingest", path = %self.path.display(), "ticker csv absent, skipping sync");
            return Ok(CatalogCounts::default());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading ticker csv {}", self.path.display()))?;
        let records = parse_ticker_csv(&content, &self.path)?;
        if records.is_empty() {
            return Ok(CatalogCounts::default());
        }
        let counts = store.sync_tickers(&records).await?;
        info!(
            target: "ingest",
            loaded = counts.loaded,
            created = counts.created,
            updated = counts.updated,
            "ticker catalog synced"
        );
        Ok(counts)
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "0" | "false" | "no" | "n")
}

/// Parse the catalog CSV. Header names are case-insensitive; a UTF-8 BOM on
/// the first header is tolerated. Duplicate symbols keep the last row.
pub fn parse_ticker_csv(content: &str, path: &Path) -> Result<Vec<TickerRecord>> {
    let mut lines = content.lines();
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header_line
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(|name| name.trim().to_lowercase())
        .collect();
    let column = |name: &str| header.iter().position(|h| h == name);

    let Some(ticker_col) = column("ticker") else {
        bail!("missing required column 'ticker' in {}", path.display());
    };
    let fund_name_col = column("fund_name");
    let sponsor_col = column("sponsor");
    let active_col = column("active");

    let mut by_symbol: HashMap<String, usize> = HashMap::new();
    let mut records: Vec<TickerRecord> = Vec::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let field = |index: Option<usize>| -> Option<String> {
            index
                .and_then(|i| fields.get(i))
                .map(|v| v.to_string())
                .filter(|v| !v.is_empty())
        };

        let Some(symbol) = field(Some(ticker_col)).map(|s| s.to_uppercase()) else {
            continue;
        };
        let record = TickerRecord {
            symbol: symbol.clone(),
            fund_name: field(fund_name_col),
            sponsor: field(sponsor_col),
            active: field(active_col).map(|v| parse_bool(&v)).unwrap_or(true),
        };

        match by_symbol.get(&symbol) {
            Some(&index) => records[index] = record,
            None => {
                by_symbol.insert(symbol, records.len());
                records.push(record);
            }
        }
    }

    Ok(records)
}
