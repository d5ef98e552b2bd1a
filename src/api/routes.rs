//! API route definitions. All responses use a `{ data, meta }` envelope.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::storage;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/targets/{id}/history", get(target_history))
        .route("/alerts", get(list_alerts))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %e, "api query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_targets(State(state): State<AppState>) -> Json<Value> {
    let targets = state.monitor.status().await;
    Json(json!({ "data": targets, "meta": { "total": targets.len() } }))
}

async fn target_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult {
    if !state.monitor.targets().any(|t| t.id == id) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown target '{}'", id) })),
        ));
    }

    let pool = state.pool.clone();
    let limit = q.limit();
    let target = id.clone();
    let records = tokio::task::spawn_blocking(move || storage::history(&pool, &target, limit))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(internal_error)?;

    Ok(Json(json!({
        "data": records,
        "meta": { "target": id, "total": records.len() }
    })))
}

async fn list_alerts(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let pool = state.pool.clone();
    let limit = q.limit();
    let alerts = tokio::task::spawn_blocking(move || storage::recent_alerts(&pool, limit))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(internal_error)?;

    Ok(Json(json!({ "data": alerts, "meta": { "total": alerts.len() } })))
}
