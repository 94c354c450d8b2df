//! Wire protocol for the real-time layer.
//!
//! Both directions use a tagged JSON envelope: a `type` discriminator plus
//! a `timestamp`, with outbound topic messages additionally stamped with
//! the `show_id` they were broadcast on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ws::topics::LiveStats;
use crate::ws::ConnectionId;

/// Messages accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        user_id: String,
        #[serde(default)]
        username: Option<String>,
    },
    SubscribeShow {
        show_id: String,
    },
    UnsubscribeShow {
        show_id: String,
    },
    Ping,
}

/// Messages sent to clients. Serialized inside [`Outbound`], which stamps
/// the timestamp and, for broadcasts, the show id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: ConnectionId,
    },
    AuthenticationSuccess {
        user_id: String,
        username: Option<String>,
    },
    Pong,
    ScoreUpdate {
        contestant_id: String,
        contestant_name: String,
        points: i64,
        reason: String,
        episode: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_total_points: Option<i64>,
    },
    EpisodeEvent {
        event_type: String,
        description: String,
        contestants: Vec<String>,
        episode: u32,
        points: i64,
    },
    PredictionUpdate {
        contestant_id: String,
        contestant_name: String,
        old_prediction: f64,
        new_prediction: f64,
        confidence: f64,
        factors: Vec<String>,
    },
    LeaderboardUpdate {
        user_id: String,
        show_id: String,
        old_rank: u32,
        new_rank: u32,
        total_points: i64,
    },
    LiveStats {
        show_id: String,
        stats: LiveStats,
    },
    Error {
        message: String,
    },
}

/// Outbound envelope: the payload flattened next to the stamp fields.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    #[serde(flatten)]
    pub payload: ServerMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Outbound {
    pub fn stamped(payload: ServerMessage, show_id: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            payload,
            show_id: show_id.map(String::from),
            timestamp: at,
        }
    }

    /// Serialize to the text frame that goes on the wire. `None` (with a
    /// log line) if serialization fails; it never should for these types.
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound frame");
                None
            }
        }
    }
}
