// tests/api_http.rs
// Admin router contract via tower::oneshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use cefwire::api::create_router;
use cefwire::catalog::SymbolCatalog;
use cefwire::config::Settings;
use cefwire::fallback::{FallbackResolver, PageFetcher};
use cefwire::ingest::cycle::Orchestrator;
use cefwire::ingest::FeedFetcher;
use cefwire::store::{CatalogCounts, MemoryStore, Store};

struct NoFeeds;

#[async_trait]
impl FeedFetcher for NoFeeds {
    async fn fetch(&self, feed_url: &str, _timeout: Duration) -> anyhow::Result<String> {
        anyhow::bail!("unexpected fetch of {feed_url}")
    }
}

struct SlowFeeds;

#[async_trait]
impl FeedFetcher for SlowFeeds {
    async fn fetch(&self, _feed_url: &str, _timeout: Duration) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(400)).await;
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

fn no_source_settings() -> Settings {
    Settings {
        yahoo_enabled: false,
        prnewswire_enabled: false,
        globenewswire_enabled: false,
        businesswire_enabled: false,
        ..Settings::default()
    }
}

fn orchestrator(fetcher: Arc<dyn FeedFetcher>, settings: Settings) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        Arc::new(MemoryStore::new()),
        fetcher,
        Arc::new(FallbackResolver::new(
            Arc::new(NoPages),
            Duration::from_secs(5),
        )),
        Arc::new(EmptyCatalog),
        settings,
    ))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let router = create_router(
        orchestrator(Arc::new(NoFeeds), no_source_settings()),
        no_source_settings(),
    );

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["database"], true);
}

#[tokio::test]
async fn run_once_returns_cycle_summary() {
    let router = create_router(
        orchestrator(Arc::new(NoFeeds), no_source_settings()),
        no_source_settings(),
    );

    let response = router
        .oneshot(
            Request::post("/api/v1/admin/ingest/run-once")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_feeds"], 0);
    assert_eq!(json["failed_feeds"], 0);
    assert!(json["remap"].is_null());
}

#[tokio::test]
async fn run_once_conflicts_while_cycle_in_flight() {
    let settings = Settings {
        businesswire_enabled: true,
        ..no_source_settings()
    };
    let orchestrator = orchestrator(Arc::new(SlowFeeds), settings.clone());
    let router = create_router(orchestrator.clone(), settings);

    let background = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.try_run().await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;

    let response = router
        .clone()
        .oneshot(
            Request::post("/api/v1/admin/ingest/run-once")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Status reports the in-flight cycle.
    let response = router
        .oneshot(
            Request::get("/api/v1/admin/ingest/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["busy"], true);

    assert!(background.await.unwrap().is_some());
}

#[tokio::test]
async fn status_lists_recent_runs() {
    let settings = Settings {
        businesswire_enabled: true,
        ..no_source_settings()
    };
    let orchestrator = orchestrator(Arc::new(SlowFeeds), settings.clone());
    let router = create_router(orchestrator.clone(), settings);

    orchestrator.try_run().await.unwrap().unwrap();

    let response = router
        .oneshot(
            Request::get("/api/v1/admin/ingest/status?limit=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["busy"], false);
    let runs = json["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["source"], "businesswire");
    assert_eq!(runs[0]["status"], "success");
}

#[tokio::test]
async fn remap_endpoint_honors_query_params() {
    let router = create_router(
        orchestrator(Arc::new(NoFeeds), no_source_settings()),
        no_source_settings(),
    );

    let response = router
        .oneshot(
            Request::post("/api/v1/admin/remap/general?limit=7&only_unmapped=false")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["processed"], 0);
    assert_eq!(json["only_unmapped"], false);
}
