//! Application-level scheduled jobs.
//!
//! The runner stays domain-agnostic; these jobs own the domain: they read
//! through the data-access seam, call the predictor, and push anything
//! subscribers should see through the broadcast engine themselves.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde_json::json;

use crate::predict::{ContestantFeatures, Predictor};
use crate::store::{DataAccess, PredictionWrite};
use crate::tasks::{Job, JobFuture, RunnerError, TaskPriority, TaskRunner, Trigger};
use crate::ws::broadcast::Broadcaster;
use crate::ws::protocol::ServerMessage;

/// A winner-probability move below this is not worth a broadcast.
const SIGNIFICANT_PREDICTION_CHANGE: f64 = 0.05;
/// Sentiment moves below this are logged but not counted as significant.
const SIGNIFICANT_SENTIMENT_CHANGE: f64 = 0.2;
/// Leaderboard moves of fewer places than this stay quiet.
const SIGNIFICANT_RANK_CHANGE: i64 = 5;
/// Stored event history older than this is pruned by the cleanup job.
const EVENT_RETENTION_DAYS: i64 = 30;

/// Everything a job needs, injected by the composition root.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn DataAccess>,
    pub predictor: Arc<dyn Predictor>,
    pub broadcaster: Arc<Broadcaster>,
}

/// Register the default task set on the runner.
pub fn register_default_jobs(runner: &TaskRunner, ctx: JobContext) -> Result<(), RunnerError> {
    runner.register_task(
        "prediction_refresh",
        "Refresh outcome predictions",
        prediction_refresh_job(ctx.clone()),
        Trigger::Interval(TimeDelta::minutes(30)),
        TaskPriority::High,
        3,
    )?;
    runner.register_task(
        "sentiment_refresh",
        "Refresh contestant sentiment",
        sentiment_refresh_job(ctx.clone()),
        Trigger::Interval(TimeDelta::minutes(15)),
        TaskPriority::Normal,
        3,
    )?;
    runner.register_task(
        "leaderboard_refresh",
        "Recompute leaderboards",
        leaderboard_refresh_job(ctx.clone()),
        Trigger::Interval(TimeDelta::minutes(10)),
        TaskPriority::Normal,
        3,
    )?;
    runner.register_task(
        "history_cleanup",
        "Prune stored event history",
        history_cleanup_job(ctx),
        Trigger::Daily { hour: 3, minute: 0 },
        TaskPriority::Low,
        3,
    )?;
    Ok(())
}

pub fn prediction_refresh_job(ctx: JobContext) -> Job {
    Arc::new(move || -> JobFuture {
        let ctx = ctx.clone();
        Box::pin(async move { refresh_predictions(&ctx).await })
    })
}

pub fn sentiment_refresh_job(ctx: JobContext) -> Job {
    Arc::new(move || -> JobFuture {
        let ctx = ctx.clone();
        Box::pin(async move { refresh_sentiment(&ctx).await })
    })
}

pub fn leaderboard_refresh_job(ctx: JobContext) -> Job {
    Arc::new(move || -> JobFuture {
        let ctx = ctx.clone();
        Box::pin(async move { refresh_leaderboards(&ctx).await })
    })
}

pub fn history_cleanup_job(ctx: JobContext) -> Job {
    Arc::new(move || -> JobFuture {
        let ctx = ctx.clone();
        Box::pin(async move { cleanup_history(&ctx).await })
    })
}

/// Re-run the predictor over every remaining contestant of every active
/// show, persist the numbers, and broadcast moves large enough to matter.
async fn refresh_predictions(ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
    let mut updated = 0u64;
    let mut significant = 0u64;

    for show in ctx.store.active_shows().await? {
        for contestant in ctx.store.contestants_for_show(&show.id).await? {
            if contestant.eliminated {
                continue;
            }
            let old_prediction = contestant.winner_probability;
            let features = ContestantFeatures::from(&contestant);
            let prediction = ctx.predictor.predict_outcomes(&features).await?;

            ctx.store
                .update_contestant_prediction(
                    &contestant.id,
                    PredictionWrite {
                        elimination_probability: prediction.elimination_probability,
                        winner_probability: prediction.winner_probability,
                        next_episode_safe: prediction.next_episode_safe,
                        confidence_low: prediction.confidence_interval.0,
                        confidence_high: prediction.confidence_interval.1,
                        trend: prediction.trend,
                    },
                )
                .await?;
            updated += 1;

            let change = (prediction.winner_probability - old_prediction).abs();
            if change > SIGNIFICANT_PREDICTION_CHANGE {
                significant += 1;
                ctx.broadcaster.broadcast_to_show(
                    &show.id,
                    ServerMessage::PredictionUpdate {
                        contestant_id: contestant.id.clone(),
                        contestant_name: contestant.name.clone(),
                        old_prediction,
                        new_prediction: prediction.winner_probability,
                        confidence: prediction.confidence_interval.1
                            - prediction.confidence_interval.0,
                        factors: prediction.factors.clone(),
                    },
                );
            }
        }
    }

    tracing::info!(updated, significant, "prediction refresh complete");
    Ok(json!({
        "updated_count": updated,
        "significant_changes": significant,
    }))
}

/// Re-score sentiment for every remaining contestant of every active show.
async fn refresh_sentiment(ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
    let mut analyzed = 0u64;
    let mut significant = 0u64;

    for show in ctx.store.active_shows().await? {
        for contestant in ctx.store.contestants_for_show(&show.id).await? {
            if contestant.eliminated {
                continue;
            }
            let features = ContestantFeatures::from(&contestant);
            let score = ctx.predictor.analyze_sentiment(&features).await?;
            if (score - contestant.sentiment_score).abs() > SIGNIFICANT_SENTIMENT_CHANGE {
                significant += 1;
            }
            ctx.store
                .set_contestant_sentiment(&contestant.id, score)
                .await?;
            analyzed += 1;
        }
    }

    tracing::info!(analyzed, significant, "sentiment refresh complete");
    Ok(json!({
        "analyzed_count": analyzed,
        "significant_changes": significant,
    }))
}

/// Recompute ranks per show from total points and broadcast the moves
/// worth telling subscribers about.
async fn refresh_leaderboards(ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
    let mut updated_shows = 0u64;
    let mut rank_changes = 0u64;

    for show in ctx.store.active_shows().await? {
        let standings = ctx.store.standings_for_show(&show.id).await?;
        for (position, standing) in standings.iter().enumerate() {
            let new_rank = position as u32 + 1;
            if standing.rank == Some(new_rank) {
                continue;
            }
            ctx.store
                .set_team_rank(&standing.user_id, &show.id, new_rank)
                .await?;

            if let Some(old_rank) = standing.rank {
                let moved = (i64::from(old_rank) - i64::from(new_rank)).abs();
                if moved >= SIGNIFICANT_RANK_CHANGE {
                    rank_changes += 1;
                    ctx.broadcaster.broadcast_to_show(
                        &show.id,
                        ServerMessage::LeaderboardUpdate {
                            user_id: standing.user_id.clone(),
                            show_id: show.id.clone(),
                            old_rank,
                            new_rank,
                            total_points: standing.total_points,
                        },
                    );
                }
            }
        }
        updated_shows += 1;
    }

    tracing::info!(updated_shows, rank_changes, "leaderboard refresh complete");
    Ok(json!({
        "updated_shows": updated_shows,
        "rank_changes": rank_changes,
    }))
}

/// Prune stored event history past the retention window.
async fn cleanup_history(ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
    let cutoff = Utc::now() - TimeDelta::days(EVENT_RETENTION_DAYS);
    let removed = ctx.store.prune_before(cutoff).await?;
    tracing::info!(removed, %cutoff, "history cleanup complete");
    Ok(json!({
        "removed": removed,
        "cutoff": cutoff.to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::{CarryForwardPredictor, OutcomePrediction, PredictError, Trend};
    use crate::store::memory::MemoryStore;
    use crate::ws::registry::ConnectionRegistry;
    use crate::ws::topics::TopicRegistry;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Predictor that always shifts the winner probability up by a fixed
    /// amount, so prediction moves are deterministic in tests.
    struct ShiftPredictor(f64);

    #[async_trait]
    impl Predictor for ShiftPredictor {
        async fn predict_outcomes(
            &self,
            features: &ContestantFeatures,
        ) -> Result<OutcomePrediction, PredictError> {
            let winner = (features.winner_probability + self.0).clamp(0.0, 1.0);
            Ok(OutcomePrediction {
                elimination_probability: 1.0 - winner,
                winner_probability: winner,
                next_episode_safe: true,
                confidence_interval: (winner - 0.05, winner + 0.05),
                trend: Trend::Rising,
                factors: vec!["momentum".to_string()],
            })
        }

        async fn analyze_sentiment(
            &self,
            features: &ContestantFeatures,
        ) -> Result<f64, PredictError> {
            Ok(features.sentiment_score + self.0)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        ctx: JobContext,
        rx: UnboundedReceiver<Message>,
    }

    fn fixture(predictor: Arc<dyn Predictor>) -> Fixture {
        let connections = Arc::new(ConnectionRegistry::new(100));
        let topics = Arc::new(TopicRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(connections.clone(), topics.clone()));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = connections.register(tx);
        connections.subscribe(id, "show-1", &topics);

        let store = Arc::new(MemoryStore::new());
        store.add_show("show-1", "The Bachelor", true);

        let ctx = JobContext {
            store: store.clone(),
            predictor,
            broadcaster,
        };
        Fixture { store, ctx, rx }
    }

    fn drain_frames(rx: &mut UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(text.as_str()).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn prediction_refresh_broadcasts_significant_moves_only() {
        let mut fx = fixture(Arc::new(ShiftPredictor(0.2)));
        fx.store.add_contestant("c-1", "show-1", "Alex", 0.3);

        let summary = refresh_predictions(&fx.ctx).await.unwrap();
        assert_eq!(summary["updated_count"], 1);
        assert_eq!(summary["significant_changes"], 1);

        let frames = drain_frames(&mut fx.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "prediction_update");
        assert_eq!(frames[0]["show_id"], "show-1");

        // the write landed
        let contestant = fx.store.contestant("c-1").unwrap();
        assert!((contestant.winner_probability - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn carry_forward_predictor_produces_no_broadcasts() {
        let mut fx = fixture(Arc::new(CarryForwardPredictor));
        fx.store.add_contestant("c-1", "show-1", "Alex", 0.3);

        let summary = refresh_predictions(&fx.ctx).await.unwrap();
        assert_eq!(summary["significant_changes"], 0);
        assert!(drain_frames(&mut fx.rx).is_empty());
    }

    #[tokio::test]
    async fn leaderboard_refresh_broadcasts_big_moves() {
        let mut fx = fixture(Arc::new(CarryForwardPredictor));
        // u1 was ranked 9th but now has the most points: an 8-place move
        fx.store.add_standing("u1", "show-1", 500, Some(9));
        // u2 slides from 1st to 2nd: a quiet one-place move
        fx.store.add_standing("u2", "show-1", 400, Some(1));

        let summary = refresh_leaderboards(&fx.ctx).await.unwrap();
        assert_eq!(summary["rank_changes"], 1);

        let frames = drain_frames(&mut fx.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "leaderboard_update");
        assert_eq!(frames[0]["user_id"], "u1");
        assert_eq!(frames[0]["new_rank"], 1);

        assert_eq!(fx.store.standing("u1", "show-1").unwrap().rank, Some(1));
        assert_eq!(fx.store.standing("u2", "show-1").unwrap().rank, Some(2));
    }

    #[tokio::test]
    async fn sentiment_refresh_counts_significant_moves() {
        let fx = fixture(Arc::new(ShiftPredictor(0.5)));
        fx.store.add_contestant("c-1", "show-1", "Alex", 0.3);

        let summary = refresh_sentiment(&fx.ctx).await.unwrap();
        assert_eq!(summary["analyzed_count"], 1);
        assert_eq!(summary["significant_changes"], 1);
        assert!((fx.store.contestant("c-1").unwrap().sentiment_score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cleanup_prunes_old_history() {
        let fx = fixture(Arc::new(CarryForwardPredictor));
        fx.store.add_event_at(Utc::now() - TimeDelta::days(45));
        fx.store.add_event_at(Utc::now());

        let summary = cleanup_history(&fx.ctx).await.unwrap();
        assert_eq!(summary["removed"], 1);
        assert_eq!(fx.store.event_count(), 1);
    }

    #[tokio::test]
    async fn default_job_set_registers_cleanly() {
        let fx = fixture(Arc::new(CarryForwardPredictor));
        let runner = TaskRunner::new(&crate::config::TasksConfig::default());
        register_default_jobs(&runner, fx.ctx).unwrap();

        let snapshot = runner.snapshot();
        let ids: Vec<&str> = snapshot.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "history_cleanup",
                "leaderboard_refresh",
                "prediction_refresh",
                "sentiment_refresh",
            ]
        );
        assert!(snapshot.tasks.iter().all(|t| t.enabled && t.next_run.is_some()));
    }
}
