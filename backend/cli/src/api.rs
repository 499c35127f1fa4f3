use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use havoc_core::{ExperimentStatus, HavocError, StressCommand};
use havoc_executor::StressAttack;
use havoc_scheduler::AttackScheduler;

/// Shared application state for API handlers.
pub struct AppState {
    pub scheduler: AttackScheduler<StressAttack>,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/experiments", get(list_experiments))
        .route("/api/experiments/:uid", get(get_experiment))
        .route("/api/attack/stress", post(create_stress_attack))
        .route("/api/attack/:uid", delete(recover_attack))
        .with_state(state)
}

fn error_response(err: HavocError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        HavocError::Validation(_) => StatusCode::BAD_REQUEST,
        HavocError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    (status, Json(json!({ "error": err.to_string() })))
}

/// Health check endpoint.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "havoc",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

/// List experiments, optionally filtered by status.
async fn list_experiments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let experiments = match query.status.as_deref() {
        Some(raw) => {
            let status: ExperimentStatus = raw.parse().map_err(error_response)?;
            state.scheduler.list_by_status(status)
        }
        None => state.scheduler.list(),
    }
    .map_err(error_response)?;
    Ok(Json(json!({ "experiments": experiments })))
}

async fn get_experiment(State(state): State<Arc<AppState>>, Path(uid): Path<Uuid>) -> ApiResult {
    let experiment = state.scheduler.get(&uid).map_err(error_response)?;
    Ok(Json(json!(experiment)))
}

/// Launch a stress attack.
async fn create_stress_attack(
    State(state): State<Arc<AppState>>,
    Json(mut command): Json<StressCommand>,
) -> ApiResult {
    // The pid belongs to the agent, never the caller.
    command.pid = None;
    let uid = state.scheduler.schedule(command).await.map_err(error_response)?;
    tracing::info!(uid = %uid, "Stress attack accepted");
    Ok(Json(json!({ "uid": uid })))
}

/// Recover an attack before its duration elapses.
async fn recover_attack(State(state): State<Arc<AppState>>, Path(uid): Path<Uuid>) -> ApiResult {
    state.scheduler.recover(&uid).await.map_err(error_response)?;
    Ok(Json(json!({ "uid": uid, "recovered": true })))
}
