//! Admin/operator HTTP surface: health, shard ownership, queue depth.
//!
//! This surface is operational tooling only — workflow/task wire protocols
//! are out of scope here.

use std::sync::Arc;

use axum::{extract::Path, extract::State, routing::get, Json, Router};
use orchestrator_core::{MatchingService, ShardManager};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub shard_manager: Arc<ShardManager>,
    pub matching: Arc<MatchingService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/shards", get(list_owned_shards))
        .route("/queues/:namespace_id/:queue_name", get(queue_depth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    identity: String,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        identity: state.shard_manager.identity().to_string(),
    })
}

#[derive(Serialize)]
struct ShardsResponse {
    identity: String,
    owned_shards: Vec<u32>,
}

async fn list_owned_shards(State(state): State<AppState>) -> Json<ShardsResponse> {
    Json(ShardsResponse {
        identity: state.shard_manager.identity().to_string(),
        owned_shards: state.shard_manager.owned_shards(),
    })
}

#[derive(Serialize)]
struct QueueDepthResponse {
    queue_name: String,
    pending_tasks: i64,
    active_leases: i64,
}

async fn queue_depth(
    State(state): State<AppState>,
    Path((namespace_id, queue_name)): Path<(Uuid, String)>,
) -> Result<Json<QueueDepthResponse>, axum::http::StatusCode> {
    let stats = state
        .matching
        .queue_depth(namespace_id, &queue_name)
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(QueueDepthResponse {
        queue_name: stats.queue_name,
        pending_tasks: stats.pending_tasks,
        active_leases: stats.active_leases,
    }))
}
