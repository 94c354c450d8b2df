//! Periodic self-maintenance for the real-time layer.
//!
//! Two independent loops: the stale sweep bounds memory growth from
//! clients that vanished without a clean close, and the stats heartbeat
//! gives late joiners eventual consistency without a pull endpoint. Both
//! observe cancellation only between iterations, so an in-flight pass
//! always finishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RealtimeConfig;
use crate::ws::broadcast::Broadcaster;
use crate::ws::protocol::ServerMessage;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::topics::TopicRegistry;

/// Evict connections idle past the staleness threshold, forever.
pub async fn stale_sweep_loop(
    connections: Arc<ConnectionRegistry>,
    topics: Arc<TopicRegistry>,
    config: RealtimeConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(config.sweep_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip the immediate first tick

    let max_idle = TimeDelta::seconds(config.stale_after_secs as i64);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = sweep_once(&connections, &topics, max_idle);
                if evicted > 0 {
                    tracing::info!(evicted, "stale sweep evicted connections");
                }
            }
        }
    }
    tracing::debug!("stale sweep stopped");
}

/// One sweep pass. Returns the number of evicted connections.
pub(crate) fn sweep_once(
    connections: &ConnectionRegistry,
    topics: &TopicRegistry,
    max_idle: TimeDelta,
) -> usize {
    let now = Utc::now();
    let stale = connections.stale_ids(max_idle, now);
    for &id in &stale {
        tracing::info!(connection_id = %id, "evicting stale connection");
        connections.close(id);
        connections.deregister(id, topics);
    }
    stale.len()
}

/// Re-broadcast each subscribed topic's live statistics, forever.
pub async fn stats_heartbeat_loop(
    topics: Arc<TopicRegistry>,
    broadcaster: Arc<Broadcaster>,
    config: RealtimeConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(config.stats_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                heartbeat_once(&topics, &broadcaster);
            }
        }
    }
    tracing::debug!("stats heartbeat stopped");
}

/// One heartbeat pass over every topic with at least one subscriber.
pub(crate) fn heartbeat_once(topics: &TopicRegistry, broadcaster: &Broadcaster) {
    for stats in topics.heartbeat_snapshot() {
        let show_id = stats.show_id.clone();
        broadcaster.broadcast_to_show(&show_id, ServerMessage::LiveStats { show_id: show_id.clone(), stats });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let connections = Arc::new(ConnectionRegistry::new(10));
        let topics = Arc::new(TopicRegistry::new());

        let (tx_old, mut rx_old) = tokio::sync::mpsc::unbounded_channel();
        let (tx_fresh, _rx_fresh) = tokio::sync::mpsc::unbounded_channel();
        let old = connections.register(tx_old);
        let fresh = connections.register(tx_fresh);
        connections.subscribe(old, "s", &topics);
        connections.backdate_last_seen(old, Utc::now() - TimeDelta::minutes(10));

        let evicted = sweep_once(&connections, &topics, TimeDelta::minutes(5));
        assert_eq!(evicted, 1);
        assert!(connections.subscriptions_of(old).is_none());
        assert!(connections.subscriptions_of(fresh).is_some());
        assert_eq!(topics.viewer_count("s"), Some(0));

        // the evicted client was asked to close
        match rx_old.try_recv() {
            Ok(Message::Close(_)) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_reaches_subscribers_of_active_topics() {
        let connections = Arc::new(ConnectionRegistry::new(10));
        let topics = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(connections.clone(), topics.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = connections.register(tx);
        connections.subscribe(id, "bachelor-28", &topics);

        heartbeat_once(&topics, &broadcaster);

        match rx.try_recv() {
            Ok(Message::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value["type"], "live_stats");
                assert_eq!(value["show_id"], "bachelor-28");
                assert_eq!(value["stats"]["viewers_count"], 1);
            }
            other => panic!("expected live_stats frame, got {other:?}"),
        }
    }
}
