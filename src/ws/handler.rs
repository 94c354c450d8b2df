//! WebSocket upgrade endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for the WebSocket endpoint. `show_id` subscribes the
/// connection immediately, saving clients a round trip. Identity arrives
/// later via the `authenticate` message; the transport itself carries none.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub show_id: Option<String>,
}

/// GET /ws?show_id=...
/// Upgrades the connection and hands it to the per-connection actor.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, params.show_id))
}
