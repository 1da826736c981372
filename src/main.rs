//! cefwire — closed-end fund news ingestion service.
//! Boots the store, the ingestion orchestrator and scheduler, and the
//! admin HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cefwire::api;
use cefwire::catalog::CsvSymbolCatalog;
use cefwire::config::Settings;
use cefwire::fallback::{FallbackResolver, HttpPageFetcher};
use cefwire::ingest::cycle::Orchestrator;
use cefwire::ingest::scheduler::{spawn_scheduler, SchedulerCfg};
use cefwire::ingest::HttpFeedFetcher;
use cefwire::store::{PgStore, Store};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when variables come from the platform.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env();
    if settings.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is not set");
    }

    let store: Arc<dyn Store> =
        Arc::new(PgStore::connect(&settings.database_url).await.context("connecting to postgres")?);

    let fallback = Arc::new(FallbackResolver::new(
        Arc::new(HttpPageFetcher::new()),
        settings.request_timeout(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(HttpFeedFetcher::new()),
        fallback,
        Arc::new(CsvSymbolCatalog::new(settings.tickers_csv_path.clone())),
        settings.clone(),
    ));

    let scheduler = if settings.scheduler_enabled {
        Some(spawn_scheduler(
            orchestrator.clone(),
            SchedulerCfg {
                interval: settings.ingest_interval(),
                jitter: std::time::Duration::from_secs(settings.ingest_jitter_secs),
            },
        ))
    } else {
        None
    };

    let router = api::create_router(orchestrator, settings.clone());
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(target: "ingest", addr = %addr, "admin server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving admin api")?;

    // Best-effort stop: the in-flight cycle is not joined.
    if let Some(handle) = scheduler {
        handle.abort();
    }

    Ok(())
}
