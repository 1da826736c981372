// src/api.rs
// Admin/trigger surface. The read API serving stored news lives in a
// separate service; this router only exposes health, the manual cycle
// trigger, run status, and the general-stream remap.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::Settings;
use crate::ingest::cycle::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    settings: Settings,
}

pub fn create_router(orchestrator: Arc<Orchestrator>, settings: Settings) -> Router {
    let state = AppState {
        orchestrator,
        settings,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/admin/ingest/run-once", post(ingest_run_once))
        .route("/api/v1/admin/ingest/status", get(ingest_status))
        .route("/api/v1/admin/remap/general", post(remap_general))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct HealthResp {
    status: &'static str,
    database: bool,
}

async fn health(State(state): State<AppState>) -> Response {
    let database = state.orchestrator.store().health().await;
    let (code, status) = if database {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (code, Json(HealthResp { status, database })).into_response()
}

#[derive(serde::Serialize)]
struct ErrorResp {
    error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResp {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn ingest_run_once(State(state): State<AppState>) -> Response {
    match state.orchestrator.try_run().await {
        None => error_response(StatusCode::CONFLICT, "ingestion cycle already running"),
        Some(Err(error)) => {
            warn!(target: "ingest", error = %error, "manual cycle failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
        Some(Ok(summary)) => (StatusCode::OK, Json(summary)).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct StatusQuery {
    #[serde(default = "default_status_limit")]
    limit: i64,
}

fn default_status_limit() -> i64 {
    20
}

#[derive(serde::Serialize)]
struct RunOut {
    id: i64,
    source: String,
    feed_url: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    items_seen: i64,
    items_inserted: i64,
    error: Option<String>,
}

#[derive(serde::Serialize)]
struct StatusResp {
    busy: bool,
    runs: Vec<RunOut>,
}

async fn ingest_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let limit = query.limit.clamp(1, 200);
    match state.orchestrator.store().recent_runs(limit).await {
        Ok(rows) => {
            let runs = rows
                .into_iter()
                .map(|(run, source_code)| RunOut {
                    id: run.id,
                    source: source_code,
                    feed_url: run.feed_url,
                    status: run.status.as_str().to_string(),
                    started_at: run.started_at,
                    finished_at: run.finished_at,
                    items_seen: run.items_seen,
                    items_inserted: run.items_inserted,
                    error: run.error_text,
                })
                .collect();
            (
                StatusCode::OK,
                Json(StatusResp {
                    busy: state.orchestrator.is_busy(),
                    runs,
                }),
            )
                .into_response()
        }
        Err(error) => {
            warn!(target: "ingest", error = %error, "run status query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}

#[derive(serde::Deserialize)]
struct RemapQuery {
    limit: Option<i64>,
    #[serde(default = "default_only_unmapped")]
    only_unmapped: bool,
}

fn default_only_unmapped() -> bool {
    true
}

async fn remap_general(
    State(state): State<AppState>,
    Query(query): Query<RemapQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(state.settings.remap_limit)
        .clamp(1, 5000);
    match state
        .orchestrator
        .remap_general(limit, query.only_unmapped)
        .await
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(error) => {
            warn!(target: "ingest", error = %error, "remap failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}
