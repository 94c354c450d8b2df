use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::tasks::runner::RunnerSnapshot;
use crate::tasks::RunnerError;
use crate::ws::handler as ws_handler;
use crate::ws::protocol::ServerMessage;
use crate::ws::registry::ConnectionCounts;
use crate::ws::topics::LiveStats;

/// Build the axum Router. The HTTP surface is deliberately thin: the
/// WebSocket endpoint, health, and the operator's task/stats endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/api/live/stats", get(live_stats))
        .route("/api/tasks", get(task_statuses))
        .route("/api/tasks/{id}/trigger", post(trigger_task))
        .route("/api/tasks/{id}/enable", post(enable_task))
        .route("/api/tasks/{id}/disable", post(disable_task))
        .route("/api/admin/episode-event", post(inject_episode_event))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    websockets: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        websockets: format!("{} active", state.connections.len()),
    })
}

#[derive(Debug, Serialize)]
struct LiveStatsReport {
    connections: ConnectionCounts,
    shows: Vec<LiveStats>,
}

/// GET /api/live/stats: connection counts plus per-show statistics.
async fn live_stats(State(state): State<AppState>) -> Json<LiveStatsReport> {
    Json(LiveStatsReport {
        connections: state.connections.counts(),
        shows: state.topics.stats_snapshot(),
    })
}

/// GET /api/tasks: the task table, running executions and recent results.
async fn task_statuses(State(state): State<AppState>) -> Json<RunnerSnapshot> {
    Json(state.runner.snapshot())
}

fn runner_error_response(err: RunnerError) -> (StatusCode, String) {
    let status = match &err {
        RunnerError::UnknownTask(_) => StatusCode::NOT_FOUND,
        RunnerError::AlreadyRunning(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

/// POST /api/tasks/{id}/trigger: run a task out-of-band.
async fn trigger_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .runner
        .trigger_task(&id)
        .map(|()| StatusCode::ACCEPTED)
        .map_err(runner_error_response)
}

async fn enable_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .runner
        .enable_task(&id)
        .map(|()| StatusCode::OK)
        .map_err(runner_error_response)
}

async fn disable_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .runner
        .disable_task(&id)
        .map(|()| StatusCode::OK)
        .map_err(runner_error_response)
}

#[derive(Debug, Deserialize)]
struct EpisodeEventRequest {
    show_id: String,
    event_type: String,
    description: String,
    #[serde(default)]
    contestants: Vec<String>,
    episode: u32,
    #[serde(default)]
    points: i64,
}

/// POST /api/admin/episode-event: operator-injected live event, broadcast
/// to the show's subscribers.
async fn inject_episode_event(
    State(state): State<AppState>,
    Json(request): Json<EpisodeEventRequest>,
) -> StatusCode {
    state.broadcaster.broadcast_to_show(
        &request.show_id,
        ServerMessage::EpisodeEvent {
            event_type: request.event_type,
            description: request.description,
            contestants: request.contestants,
            episode: request.episode,
            points: request.points,
        },
    );
    StatusCode::ACCEPTED
}
