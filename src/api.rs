use std::sync::Arc;

use shuttle_axum::axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::cors::CorsLayer;

use crate::ingest::{MessageProcessor, StatsSnapshot};

pub const SERVICE_NAME: &str = "Amazon Monitor Bot";

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<MessageProcessor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/status", get(status))
        .route("/health", get(|| async { "OK" }))
        .route("/health/downstream", get(downstream_health))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct HomeOut {
    service: &'static str,
    status: &'static str,
}

async fn home(State(state): State<AppState>) -> Json<HomeOut> {
    let running = state.processor.stats().snapshot().running;
    Json(HomeOut {
        service: SERVICE_NAME,
        status: if running { "running" } else { "stopped" },
    })
}

#[derive(serde::Serialize)]
struct StatusOut {
    last_message_ids_count: usize,
    dedup_entries: usize,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let markers = state
        .processor
        .progress()
        .lock()
        .expect("progress mutex poisoned")
        .len();
    Json(StatusOut {
        last_message_ids_count: markers,
        dedup_entries: state.processor.dedup_len(),
        stats: state.processor.stats().snapshot(),
    })
}

async fn downstream_health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.processor.dispatcher().health_check().await {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "downstream": "healthy" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "downstream": "unreachable" })),
        )
    }
}
