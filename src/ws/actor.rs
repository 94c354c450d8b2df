//! Actor-per-connection: one reader loop plus one writer task per client.
//!
//! The writer task owns the sink and drains the connection's mpsc channel;
//! everything else pushes frames through the registry. The reader loop is
//! the sole place client disappearance is detected outside the stale sweep.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;
use crate::ws::protocol::{ClientMessage, ServerMessage};
use crate::ws::ConnectionId;

/// Run a connection until its transport closes, then clean up every
/// registry trace of it.
pub async fn run_connection(socket: WebSocket, state: AppState, initial_show: Option<String>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let connection_id = state.connections.register(tx.clone());

    // Spawn writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Welcome frame carrying the identifier the client will see in logs
    state
        .broadcaster
        .send_to_connection(connection_id, ServerMessage::Connected { connection_id }, None);

    // Optional immediate subscription from the upgrade query string
    if let Some(show_id) = initial_show {
        if let Some(stats) = state.connections.subscribe(connection_id, &show_id, &state.topics) {
            state.broadcaster.send_to_connection(
                connection_id,
                ServerMessage::LiveStats { show_id, stats },
                None,
            );
        }
    }

    tracing::info!(connection_id = %connection_id, "WebSocket actor started");

    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    handle_client_text(&state, connection_id, text.as_str());
                }
                Message::Ping(data) => {
                    // transport-level ping; the JSON ping is handled above
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        "ignoring binary frame on a text protocol"
                    );
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection_id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    writer_handle.abort();
    state.connections.deregister(connection_id, &state.topics);

    tracing::info!(connection_id = %connection_id, "WebSocket actor stopped");
}

/// Writer task: receives messages from the mpsc channel and forwards them
/// to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed; the connection is broken
            break;
        }
    }
}

/// Decode one inbound text frame and dispatch it. All outcomes are sent
/// back through the normal rate-limited delivery path.
fn handle_client_text(state: &AppState, id: ConnectionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(connection_id = %id, error = %e, "unparseable client frame");
            state.broadcaster.send_to_connection(
                id,
                ServerMessage::Error {
                    message: "unrecognized message".to_string(),
                },
                None,
            );
            return;
        }
    };

    match message {
        ClientMessage::Authenticate { user_id, username } => {
            if let Some((user_id, username)) = state.connections.authenticate(id, &user_id, username)
            {
                state.broadcaster.send_to_connection(
                    id,
                    ServerMessage::AuthenticationSuccess { user_id, username },
                    None,
                );
            }
        }
        ClientMessage::SubscribeShow { show_id } => {
            if let Some(stats) = state.connections.subscribe(id, &show_id, &state.topics) {
                state
                    .broadcaster
                    .send_to_connection(id, ServerMessage::LiveStats { show_id, stats }, None);
            }
        }
        ClientMessage::UnsubscribeShow { show_id } => {
            state.connections.unsubscribe(id, &show_id, &state.topics);
        }
        ClientMessage::Ping => {
            state.connections.touch(id);
            state
                .broadcaster
                .send_to_connection(id, ServerMessage::Pong, None);
        }
    }
}
