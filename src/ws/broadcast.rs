//! Broadcast engine: fan-out of one message to a topic's subscribers.
//!
//! Delivery is lossy by policy: a rate-limited frame is dropped silently
//! and a dead transport evicts that connection, never the broadcast. The
//! stats heartbeat re-sends the aggregate state, so nothing dropped here
//! stays missing for long.

use std::sync::Arc;

use chrono::Utc;

use crate::ws::protocol::{Outbound, ServerMessage};
use crate::ws::registry::{ConnectionRegistry, DeliveryError};
use crate::ws::topics::TopicRegistry;
use crate::ws::ConnectionId;

pub struct Broadcaster {
    connections: Arc<ConnectionRegistry>,
    topics: Arc<TopicRegistry>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionRegistry>, topics: Arc<TopicRegistry>) -> Self {
        Self {
            connections,
            topics,
        }
    }

    /// Send `message` to every current subscriber of `show_id`.
    ///
    /// The subscriber set is snapshotted up front: connections subscribing
    /// mid-broadcast may or may not see this message, but always a whole
    /// one. Failed deliveries are collected and deregistered after the
    /// pass. Topic counters are updated even when nobody is subscribed,
    /// provided the topic record exists.
    pub fn broadcast_to_show(&self, show_id: &str, message: ServerMessage) {
        let now = Utc::now();
        let subscribers = self.topics.subscribers_of(show_id);

        // Payloads that already carry their show id are not stamped again;
        // everything else gets the topic identifier added to the envelope.
        let stamp = match &message {
            ServerMessage::LiveStats { .. } | ServerMessage::LeaderboardUpdate { .. } => None,
            _ => Some(show_id),
        };
        let Some(frame) = Outbound::stamped(message.clone(), stamp, now).to_frame() else {
            return;
        };

        let mut delivered = 0usize;
        let mut evicted: Vec<ConnectionId> = Vec::new();
        for id in &subscribers {
            match self.connections.try_send(*id, &frame, now) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::RateLimited(_)) => {
                    tracing::trace!(connection_id = %id, show_id, "frame dropped by rate limit");
                }
                Err(DeliveryError::Closed(_)) => evicted.push(*id),
                Err(DeliveryError::UnknownConnection(_)) => {
                    // lost a race with a disconnect; nothing left to clean up
                    tracing::debug!(connection_id = %id, show_id, "subscriber vanished mid-broadcast");
                }
            }
        }

        for id in evicted {
            tracing::info!(connection_id = %id, show_id, "evicting unreachable subscriber");
            self.connections.deregister(id, &self.topics);
        }

        self.topics.record_outbound(show_id, &message, now);

        tracing::debug!(
            show_id,
            subscribers = subscribers.len(),
            delivered,
            "broadcast complete"
        );
    }

    /// Deliver to the most recent connection of an authenticated user.
    /// A user without a live connection is a logged no-op, not an error.
    pub fn send_to_user(&self, user_id: &str, message: ServerMessage) {
        let Some(id) = self.connections.connection_of_user(user_id) else {
            tracing::info!(user_id, "send_to_user: user has no live connection");
            return;
        };
        self.send_to_connection(id, message, None);
    }

    /// Single delivery with broadcast failure semantics: a closed transport
    /// evicts the connection, a rate-limited frame is silently dropped.
    pub(crate) fn send_to_connection(
        &self,
        id: ConnectionId,
        message: ServerMessage,
        show_id: Option<&str>,
    ) {
        let now = Utc::now();
        let Some(frame) = Outbound::stamped(message, show_id, now).to_frame() else {
            return;
        };
        match self.connections.try_send(id, &frame, now) {
            Ok(()) => {}
            Err(DeliveryError::RateLimited(_)) => {
                tracing::trace!(connection_id = %id, "frame dropped by rate limit");
            }
            Err(DeliveryError::Closed(_)) => {
                tracing::info!(connection_id = %id, "evicting unreachable connection");
                self.connections.deregister(id, &self.topics);
            }
            Err(DeliveryError::UnknownConnection(_)) => {
                tracing::debug!(connection_id = %id, "send to unknown connection ignored");
            }
        }
    }
}
