use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::coordinator::{BatchRecord, PipelineCoordinator};
use crate::error::HarvestError;
use crate::status::StatusSnapshot;
use crate::store;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PipelineCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/batch/run", post(run_batch))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct StatusOut {
    scraping_enabled: bool,
    batch_running: bool,
    last_batch: Option<BatchRecord>,
    #[serde(flatten)]
    board: StatusSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let c = &state.coordinator;
    Json(StatusOut {
        scraping_enabled: c.scraping_enabled(),
        batch_running: c.batch_running(),
        last_batch: c.last_run(),
        board: c.status().snapshot(),
    })
}

#[derive(Deserialize)]
struct RunQuery {
    #[serde(default)]
    date: Option<String>,
}

async fn run_batch(
    State(state): State<AppState>,
    Query(q): Query<RunQuery>,
) -> impl IntoResponse {
    let date = match q.date.filter(|d| !d.trim().is_empty()) {
        Some(d) => d.trim().to_string(),
        None => match store::previous_day(&store::today()) {
            Ok(d) => d,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("{e:#}") })),
                )
            }
        },
    };

    match state.coordinator.start_batch(date.clone()) {
        Ok(_handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "date": date })),
        ),
        Err(e @ HarvestError::Coordination(_)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() })))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}
