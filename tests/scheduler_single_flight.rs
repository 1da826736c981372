// tests/scheduler_single_flight.rs
// Single-flight and scheduling behavior: an overlapping trigger reports
// busy instead of stacking a second cycle, and the periodic driver keeps
// running cycles until aborted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cefwire::catalog::SymbolCatalog;
use cefwire::config::Settings;
use cefwire::fallback::{FallbackResolver, PageFetcher};
use cefwire::ingest::cycle::Orchestrator;
use cefwire::ingest::scheduler::{spawn_scheduler, SchedulerCfg};
use cefwire::ingest::FeedFetcher;
use cefwire::store::{CatalogCounts, MemoryStore, Store};

struct SlowFeeds {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl FeedFetcher for SlowFeeds {
    async fn fetch(&self, _feed_url: &str, _timeout: Duration) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(r#"<rss version="2.0"><channel><title>BW</title></channel></rss>"#.to_string())
    }
}

struct NoPages;

#[async_trait]
impl PageFetcher for NoPages {
    async fn fetch(&self, _url: &str, _timeout: Duration) -> anyhow::Result<String> {
        anyhow::bail!("no page available")
    }
}

struct EmptyCatalog;

#[async_trait]
impl SymbolCatalog for EmptyCatalog {
    async fn sync(&self, _store: &dyn Store) -> anyhow::Result<CatalogCounts> {
        Ok(CatalogCounts::default())
    }
}

fn orchestrator(delay: Duration, calls: Arc<AtomicUsize>) -> Arc<Orchestrator> {
    // Only the single Business Wire feed, so one fetch per cycle.
    let settings = Settings {
        yahoo_enabled: false,
        prnewswire_enabled: false,
        globenewswire_enabled: false,
        businesswire_enabled: true,
        ..Settings::default()
    };
    Arc::new(Orchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SlowFeeds { delay, calls }),
        Arc::new(FallbackResolver::new(
            Arc::new(NoPages),
            Duration::from_secs(5),
        )),
        Arc::new(EmptyCatalog),
        settings,
    ))
}

#[tokio::test]
async fn overlapping_trigger_reports_busy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = orchestrator(Duration::from_millis(300), calls.clone());

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.try_run().await.is_some() })
    };

    // Let the first cycle reach its slow fetch, then poke it again.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(orchestrator.is_busy());
    assert!(orchestrator.try_run().await.is_none());

    assert!(runner.await.unwrap());
    assert!(!orchestrator.is_busy());
    // Only the first trigger fetched anything.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scheduler_runs_cycles_until_aborted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = orchestrator(Duration::from_millis(1), calls.clone());

    let handle = spawn_scheduler(
        orchestrator,
        SchedulerCfg {
            interval: Duration::from_millis(40),
            jitter: Duration::ZERO,
        },
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.abort();
    let ran = calls.load(Ordering::SeqCst);
    assert!(ran >= 2, "expected at least two cycles, got {ran}");

    // No further cycles after abort.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), ran);
}
