//! Axum JSON surface over the sync orchestrator and the head-to-head read path.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rivals_core::{OpponentRecord, WinLoss};
use rivals_sync::{StartOutcome, SyncError, SyncOrchestrator, ALREADY_SYNCING_MESSAGE};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rivals-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    #[serde(flatten)]
    pub totals: WinLoss,
    pub opponents: Vec<OpponentRecord>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/users/{id}/sync", get(sync_status_handler).post(start_sync_handler))
        .route("/users/{id}/records", get(records_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn start_sync_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.spawn_sync(id).await {
        Ok(StartOutcome::Started) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "scheduled" }))).into_response()
        }
        Ok(StartOutcome::AlreadySyncing) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_syncing", "message": ALREADY_SYNCING_MESSAGE })),
        )
            .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.status(id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn records_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let store = state.orchestrator.store();
    let user = match store.user_by_id(id).await {
        Ok(Some(user)) => user,
        Ok(None) => return sync_error(SyncError::UnknownUser(id)),
        Err(err) => return sync_error(err.into()),
    };
    let totals = match store.win_loss(user.id).await {
        Ok(totals) => totals,
        Err(err) => return sync_error(err.into()),
    };
    match store.head_to_head(user.id).await {
        Ok(opponents) => Json(RecordsResponse { totals, opponents }).into_response(),
        Err(err) => sync_error(err.into()),
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::UnknownUser(_) => StatusCode::NOT_FOUND,
        SyncError::AlreadySyncing => StatusCode::CONFLICT,
        SyncError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::Store(_) => {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
