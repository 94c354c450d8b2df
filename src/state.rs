use std::sync::Arc;

use crate::config::{RealtimeConfig, TasksConfig};
use crate::tasks::TaskRunner;
use crate::ws::broadcast::Broadcaster;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::topics::TopicRegistry;

/// Shared application state passed to all handlers via the axum State
/// extractor. Everything here is constructed once at startup and torn
/// down at shutdown; there is no ambient module-level state.
#[derive(Clone)]
pub struct AppState {
    /// Live connections and the userId reverse index
    pub connections: Arc<ConnectionRegistry>,
    /// Topic subscriber sets and live statistics
    pub topics: Arc<TopicRegistry>,
    /// Fan-out engine over the two registries
    pub broadcaster: Arc<Broadcaster>,
    /// Scheduled task runner
    pub runner: Arc<TaskRunner>,
}

impl AppState {
    /// Wire up the registries, broadcast engine and task runner.
    pub fn build(realtime: &RealtimeConfig, tasks: &TasksConfig) -> Self {
        let connections = Arc::new(ConnectionRegistry::new(realtime.rate_limit_per_sec));
        let topics = Arc::new(TopicRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(connections.clone(), topics.clone()));
        let runner = TaskRunner::new(tasks);
        Self {
            connections,
            topics,
            broadcaster,
            runner,
        }
    }
}
