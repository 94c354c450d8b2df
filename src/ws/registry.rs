//! Connection registry: the single source of truth for live connections.
//!
//! Every connection record owns its subscription set, keep-alive timestamp
//! and outbound rate window. The whole registry sits behind one lock;
//! operations that also touch the topic registry acquire this lock first
//! and the topic lock second, so the subscriber/subscription invariant is
//! never observable broken and the two locks cannot deadlock.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Message;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::ws::topics::{LiveStats, TopicRegistry};
use crate::ws::{ConnectionId, ConnectionSender};

/// Why a single delivery did not happen.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} closed its transport")]
    Closed(ConnectionId),
    #[error("outbound rate limit reached for connection {0}")]
    RateLimited(ConnectionId),
}

/// Per-connection outbound window, keyed by the integer UTC second.
/// A client can in theory receive up to 2x the limit straddling a second
/// boundary; the stats heartbeat makes any dropped frame irrelevant within
/// ten seconds, so the simple window is kept.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    second: i64,
    sent: u32,
}

struct Connection {
    user_id: Option<String>,
    username: Option<String>,
    subscriptions: HashSet<String>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    sender: ConnectionSender,
    window: RateWindow,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    /// userId -> most recently authenticated connection. Last writer wins;
    /// only that connection is addressable by user id.
    by_user: HashMap<String, ConnectionId>,
}

/// Counts reported by the health and live-stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub total: usize,
    pub authenticated: usize,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    rate_limit_per_sec: u32,
}

impl ConnectionRegistry {
    pub fn new(rate_limit_per_sec: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            rate_limit_per_sec,
        }
    }

    /// Allocate a record for a freshly accepted transport and hand back its
    /// identifier. Retries id generation on the practically-impossible
    /// collision rather than clobbering a live record.
    pub fn register(&self, sender: ConnectionSender) -> ConnectionId {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let id = loop {
            let candidate = ConnectionId::generate();
            if !inner.connections.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.connections.insert(
            id,
            Connection {
                user_id: None,
                username: None,
                subscriptions: HashSet::new(),
                connected_at: now,
                last_seen: now,
                sender,
                window: RateWindow { second: 0, sent: 0 },
            },
        );
        tracing::debug!(connection_id = %id, total = inner.connections.len(), "connection registered");
        id
    }

    /// Attach an authenticated identity. Idempotent: a repeat call
    /// overwrites the prior identity, and the reverse index always points
    /// at the most recent connection claiming the user id. Returns the
    /// stored identity for the confirmation reply, `None` when the
    /// connection is unknown (logged no-op).
    pub fn authenticate(
        &self,
        id: ConnectionId,
        user_id: &str,
        username: Option<String>,
    ) -> Option<(String, Option<String>)> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(conn) = inner.connections.get_mut(&id) else {
            tracing::warn!(connection_id = %id, "authenticate on unknown connection");
            return None;
        };
        let previous = conn.user_id.replace(user_id.to_string());
        conn.username = username;
        if let Some(previous) = previous {
            if previous != user_id && inner.by_user.get(&previous) == Some(&id) {
                inner.by_user.remove(&previous);
            }
        }
        inner.by_user.insert(user_id.to_string(), id);
        tracing::info!(connection_id = %id, user_id = %user_id, "connection authenticated");
        Some((user_id.to_string(), conn.username.clone()))
    }

    /// Subscribe a connection to a show, keeping both sides of the
    /// subscription mapping in step. Returns a stats snapshot for the new
    /// subscriber, or `None` if the connection is unknown (logged no-op:
    /// the caller may be racing a disconnect).
    pub fn subscribe(
        &self,
        id: ConnectionId,
        show_id: &str,
        topics: &TopicRegistry,
    ) -> Option<LiveStats> {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get_mut(&id) else {
            tracing::warn!(connection_id = %id, show_id, "subscribe on unknown connection");
            return None;
        };
        conn.subscriptions.insert(show_id.to_string());
        // connection lock still held; topic lock acquired second
        let stats = topics.add_subscriber(show_id, id, Utc::now());
        tracing::info!(connection_id = %id, show_id, viewers = stats.viewers_count, "subscribed");
        Some(stats)
    }

    pub fn unsubscribe(&self, id: ConnectionId, show_id: &str, topics: &TopicRegistry) {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get_mut(&id) else {
            tracing::warn!(connection_id = %id, show_id, "unsubscribe on unknown connection");
            return;
        };
        conn.subscriptions.remove(show_id);
        topics.remove_subscriber(show_id, id);
        tracing::info!(connection_id = %id, show_id, "unsubscribed");
    }

    /// Remove every trace of a connection: topic memberships, the reverse
    /// user mapping and the record itself. Safe to call repeatedly; the
    /// second call is a no-op.
    pub fn deregister(&self, id: ConnectionId, topics: &TopicRegistry) {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.remove(&id) else {
            tracing::debug!(connection_id = %id, "deregister on unknown connection");
            return;
        };
        topics.remove_from_all(id, conn.subscriptions.iter());
        if let Some(user_id) = &conn.user_id {
            if inner.by_user.get(user_id) == Some(&id) {
                inner.by_user.remove(user_id);
            }
        }
        tracing::info!(connection_id = %id, total = inner.connections.len(), "connection deregistered");
    }

    /// Refresh the keep-alive timestamp. Called on inbound ping.
    pub fn touch(&self, id: ConnectionId) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.last_seen = Utc::now();
        }
    }

    pub fn connection_of_user(&self, user_id: &str) -> Option<ConnectionId> {
        self.inner.read().by_user.get(user_id).copied()
    }

    /// Push one serialized frame to a connection, enforcing the per-second
    /// outbound limit. Rate-limited frames are dropped here and reported as
    /// such; a closed transport is reported for eviction by the caller.
    pub fn try_send(
        &self,
        id: ConnectionId,
        frame: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get_mut(&id) else {
            return Err(DeliveryError::UnknownConnection(id));
        };
        let second = now.timestamp();
        if conn.window.second == second {
            if conn.window.sent >= self.rate_limit_per_sec {
                return Err(DeliveryError::RateLimited(id));
            }
            conn.window.sent += 1;
        } else {
            conn.window = RateWindow { second, sent: 1 };
        }
        conn.sender
            .send(Message::Text(frame.to_string().into()))
            .map_err(|_| DeliveryError::Closed(id))
    }

    /// Ask the client to close. Used by the stale sweep before eviction so
    /// the peer sees an orderly shutdown instead of a dead socket.
    pub fn close(&self, id: ConnectionId) {
        let inner = self.inner.read();
        if let Some(conn) = inner.connections.get(&id) {
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    /// Connections whose last activity is older than `max_idle` at `now`.
    pub fn stale_ids(&self, max_idle: TimeDelta, now: DateTime<Utc>) -> Vec<ConnectionId> {
        self.inner
            .read()
            .connections
            .iter()
            .filter(|(_, conn)| now - conn.last_seen > max_idle)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn counts(&self) -> ConnectionCounts {
        let inner = self.inner.read();
        ConnectionCounts {
            total: inner.connections.len(),
            authenticated: inner
                .connections
                .values()
                .filter(|c| c.user_id.is_some())
                .count(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscription set of one connection, for invariant checks and the
    /// live-stats endpoint. `None` for unknown connections.
    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<HashSet<String>> {
        self.inner
            .read()
            .connections
            .get(&id)
            .map(|c| c.subscriptions.clone())
    }

    pub(crate) fn backdate_last_seen(&self, id: ConnectionId, to: DateTime<Utc>) {
        if let Some(conn) = self.inner.write().connections.get_mut(&id) {
            conn.last_seen = to;
        }
    }

    /// Seconds since the connection was accepted. Unused in the hot path;
    /// surfaced for diagnostics.
    pub fn age_secs(&self, id: ConnectionId, now: DateTime<Utc>) -> Option<i64> {
        self.inner
            .read()
            .connections
            .get(&id)
            .map(|c| (now - c.connected_at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (ConnectionSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    /// Bidirectional consistency: C in subscribers(T) iff T in subscriptions(C).
    fn assert_consistent(
        registry: &ConnectionRegistry,
        topics: &TopicRegistry,
        ids: &[ConnectionId],
        shows: &[&str],
    ) {
        for &id in ids {
            let subs = registry.subscriptions_of(id).unwrap_or_default();
            for &show in shows {
                let in_topic = topics.subscribers_of(show).contains(&id);
                let in_conn = subs.contains(show);
                assert_eq!(in_topic, in_conn, "conn {id} vs show {show}");
            }
        }
    }

    #[test]
    fn subscribe_and_deregister_keep_viewer_counts_in_step() {
        let registry = ConnectionRegistry::new(10);
        let topics = TopicRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let c1 = registry.register(tx1);
        registry.subscribe(c1, "bachelor-28", &topics);
        assert_eq!(topics.viewer_count("bachelor-28"), Some(1));

        let c2 = registry.register(tx2);
        registry.subscribe(c2, "bachelor-28", &topics);
        assert_eq!(topics.viewer_count("bachelor-28"), Some(2));
        assert_consistent(&registry, &topics, &[c1, c2], &["bachelor-28"]);

        registry.deregister(c1, &topics);
        assert_eq!(topics.viewer_count("bachelor-28"), Some(1));
        assert!(!topics.subscribers_of("bachelor-28").contains(&c1));
        assert!(registry.subscriptions_of(c1).is_none());
        assert_consistent(&registry, &topics, &[c1, c2], &["bachelor-28"]);
    }

    #[test]
    fn deregister_twice_is_a_no_op() {
        let registry = ConnectionRegistry::new(10);
        let topics = TopicRegistry::new();
        let (tx, _rx) = channel();

        let id = registry.register(tx);
        registry.subscribe(id, "s", &topics);
        registry.deregister(id, &topics);
        assert_eq!(topics.viewer_count("s"), Some(0));

        // second call must not double-decrement or panic
        registry.deregister(id, &topics);
        assert_eq!(topics.viewer_count("s"), Some(0));
    }

    #[test]
    fn unsubscribe_removes_both_sides() {
        let registry = ConnectionRegistry::new(10);
        let topics = TopicRegistry::new();
        let (tx, _rx) = channel();

        let id = registry.register(tx);
        registry.subscribe(id, "s", &topics);
        registry.unsubscribe(id, "s", &topics);

        assert_eq!(topics.viewer_count("s"), Some(0));
        assert!(registry.subscriptions_of(id).unwrap().is_empty());
        assert_consistent(&registry, &topics, &[id], &["s"]);
    }

    #[test]
    fn authenticate_last_writer_wins() {
        let registry = ConnectionRegistry::new(10);
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let c1 = registry.register(tx1);
        let c2 = registry.register(tx2);
        registry.authenticate(c1, "u1", Some("ana".into()));
        assert_eq!(registry.connection_of_user("u1"), Some(c1));

        // the same user opens a second connection: it takes over the index
        registry.authenticate(c2, "u1", Some("ana".into()));
        assert_eq!(registry.connection_of_user("u1"), Some(c2));

        // re-authenticating c1 as someone else must not disturb u1 -> c2
        registry.authenticate(c1, "u2", None);
        assert_eq!(registry.connection_of_user("u1"), Some(c2));
        assert_eq!(registry.connection_of_user("u2"), Some(c1));
    }

    #[test]
    fn deregister_only_removes_own_user_mapping() {
        let registry = ConnectionRegistry::new(10);
        let topics = TopicRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let c1 = registry.register(tx1);
        let c2 = registry.register(tx2);
        registry.authenticate(c1, "u1", None);
        registry.authenticate(c2, "u1", None);

        // c1 lost the index to c2; deregistering c1 must not clear it
        registry.deregister(c1, &topics);
        assert_eq!(registry.connection_of_user("u1"), Some(c2));

        registry.deregister(c2, &topics);
        assert_eq!(registry.connection_of_user("u1"), None);
    }

    #[test]
    fn fifteen_sends_in_one_second_deliver_exactly_ten() {
        let registry = ConnectionRegistry::new(10);
        let (tx, mut rx) = channel();
        let id = registry.register(tx);
        let now = Utc::now();

        let mut delivered = 0;
        let mut limited = 0;
        for _ in 0..15 {
            match registry.try_send(id, "{}", now) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::RateLimited(_)) => limited += 1,
                Err(other) => panic!("unexpected delivery error: {other}"),
            }
        }
        assert_eq!(delivered, 10);
        assert_eq!(limited, 5);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);

        // the window resets on the next second
        let later = now + TimeDelta::seconds(1);
        assert!(registry.try_send(id, "{}", later).is_ok());
    }

    #[test]
    fn send_to_closed_transport_reports_closed() {
        let registry = ConnectionRegistry::new(10);
        let (tx, rx) = channel();
        let id = registry.register(tx);
        drop(rx);

        match registry.try_send(id, "{}", Utc::now()) {
            Err(DeliveryError::Closed(closed)) => assert_eq!(closed, id),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn stale_ids_respect_the_idle_threshold() {
        let registry = ConnectionRegistry::new(10);
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let now = Utc::now();

        let old = registry.register(tx1);
        let fresh = registry.register(tx2);
        registry.backdate_last_seen(old, now - TimeDelta::minutes(6));

        let stale = registry.stale_ids(TimeDelta::minutes(5), now);
        assert_eq!(stale, vec![old]);
        assert!(!stale.contains(&fresh));
    }
}
