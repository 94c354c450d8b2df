//! Topic registry: show id -> subscriber set + live statistics.
//!
//! Topic records are created lazily on first subscription and persist for
//! the process lifetime. The viewer count is recomputed from the subscriber
//! set on every membership change, so the two can never drift.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::ws::protocol::ServerMessage;
use crate::ws::ConnectionId;

/// Best-scoring user seen on a topic so far. Replaced only by a higher score.
#[derive(Debug, Clone, Serialize)]
pub struct TopPerformer {
    pub username: String,
    pub points: i64,
}

impl Default for TopPerformer {
    fn default() -> Self {
        Self {
            username: "TBD".to_string(),
            points: 0,
        }
    }
}

/// Live statistics for one show, re-broadcast on the stats heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStats {
    pub show_id: String,
    pub viewers_count: usize,
    pub active_predictions: u64,
    pub total_points_awarded: i64,
    pub recent_events: u64,
    pub top_performer: TopPerformer,
    pub updated_at: DateTime<Utc>,
}

impl LiveStats {
    fn new(show_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            show_id: show_id.to_string(),
            viewers_count: 0,
            active_predictions: 0,
            total_points_awarded: 0,
            recent_events: 0,
            top_performer: TopPerformer::default(),
            updated_at: now,
        }
    }
}

struct Topic {
    subscribers: HashSet<ConnectionId>,
    stats: LiveStats,
}

/// In-memory topic registry. All state sits behind a single lock; callers
/// that also hold the connection registry lock must acquire that one first
/// (the lock order is connection registry, then topic registry).
pub struct TopicRegistry {
    inner: RwLock<HashMap<String, Topic>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Add a subscriber, creating the topic record on first subscription.
    /// Returns a stats snapshot so the caller can push the current numbers
    /// to the new subscriber.
    pub(crate) fn add_subscriber(
        &self,
        show_id: &str,
        id: ConnectionId,
        now: DateTime<Utc>,
    ) -> LiveStats {
        let mut topics = self.inner.write();
        let topic = topics.entry(show_id.to_string()).or_insert_with(|| Topic {
            subscribers: HashSet::new(),
            stats: LiveStats::new(show_id, now),
        });
        topic.subscribers.insert(id);
        topic.stats.viewers_count = topic.subscribers.len();
        topic.stats.clone()
    }

    pub(crate) fn remove_subscriber(&self, show_id: &str, id: ConnectionId) {
        let mut topics = self.inner.write();
        if let Some(topic) = topics.get_mut(show_id) {
            topic.subscribers.remove(&id);
            topic.stats.viewers_count = topic.subscribers.len();
        }
    }

    /// Remove a connection from every listed topic. Used on deregistration.
    pub(crate) fn remove_from_all<'a>(
        &self,
        id: ConnectionId,
        shows: impl Iterator<Item = &'a String>,
    ) {
        let mut topics = self.inner.write();
        for show_id in shows {
            if let Some(topic) = topics.get_mut(show_id) {
                topic.subscribers.remove(&id);
                topic.stats.viewers_count = topic.subscribers.len();
            }
        }
    }

    /// Snapshot of the current subscriber set, for fan-out iteration.
    /// Empty for unknown topics.
    pub fn subscribers_of(&self, show_id: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .get(show_id)
            .map(|t| t.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn viewer_count(&self, show_id: &str) -> Option<usize> {
        self.inner.read().get(show_id).map(|t| t.subscribers.len())
    }

    /// Fold an outbound message into the topic's counters. Only messages
    /// that carry scoring content move the counters; heartbeat and control
    /// frames leave the record untouched. No-op for unknown topics: stats
    /// records only come into existence through a subscription.
    pub fn record_outbound(&self, show_id: &str, message: &ServerMessage, now: DateTime<Utc>) {
        let mut topics = self.inner.write();
        let Some(topic) = topics.get_mut(show_id) else {
            return;
        };
        let stats = &mut topic.stats;
        match message {
            ServerMessage::ScoreUpdate {
                points,
                username,
                user_total_points,
                ..
            } => {
                stats.total_points_awarded += points;
                stats.recent_events += 1;
                if let (Some(username), Some(total)) = (username, user_total_points) {
                    if *total > stats.top_performer.points {
                        stats.top_performer = TopPerformer {
                            username: username.clone(),
                            points: *total,
                        };
                    }
                }
            }
            ServerMessage::EpisodeEvent { .. } => {
                stats.recent_events += 1;
            }
            ServerMessage::PredictionUpdate { .. } => {
                stats.active_predictions += 1;
            }
            _ => return,
        }
        stats.updated_at = now;
    }

    /// Stats for every topic that currently has at least one subscriber.
    /// Drives the periodic statistics heartbeat.
    pub fn heartbeat_snapshot(&self) -> Vec<LiveStats> {
        self.inner
            .read()
            .values()
            .filter(|t| !t.subscribers.is_empty())
            .map(|t| t.stats.clone())
            .collect()
    }

    /// Stats for every known topic, subscribed or not.
    pub fn stats_snapshot(&self) -> Vec<LiveStats> {
        self.inner.read().values().map(|t| t.stats.clone()).collect()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}
