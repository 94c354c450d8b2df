//! Data-access collaborator seam.
//!
//! Persistence internals are out of scope for this crate: jobs reach
//! stored entities only through [`DataAccess`], and every call is allowed
//! to fail without taking the job wrapper down with it.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::predict::Trend;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("show {0} not found")]
    ShowNotFound(String),
    #[error("contestant {0} not found")]
    ContestantNotFound(String),
    #[error("no team for user {user_id} in show {show_id}")]
    TeamNotFound { user_id: String, show_id: String },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Show {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Contestant {
    pub id: String,
    pub show_id: String,
    pub name: String,
    pub eliminated: bool,
    pub winner_probability: f64,
    pub elimination_probability: f64,
    pub sentiment_score: f64,
}

/// One fantasy team's standing within a show.
#[derive(Debug, Clone, Serialize)]
pub struct TeamStanding {
    pub user_id: String,
    pub show_id: String,
    pub total_points: i64,
    pub rank: Option<u32>,
}

/// Prediction fields written back after a model refresh.
#[derive(Debug, Clone)]
pub struct PredictionWrite {
    pub elimination_probability: f64,
    pub winner_probability: f64,
    pub next_episode_safe: bool,
    pub confidence_low: f64,
    pub confidence_high: f64,
    pub trend: Trend,
}

#[async_trait]
pub trait DataAccess: Send + Sync {
    async fn active_shows(&self) -> Result<Vec<Show>, StoreError>;

    async fn contestants_for_show(&self, show_id: &str) -> Result<Vec<Contestant>, StoreError>;

    async fn update_contestant_prediction(
        &self,
        contestant_id: &str,
        write: PredictionWrite,
    ) -> Result<(), StoreError>;

    async fn set_contestant_sentiment(
        &self,
        contestant_id: &str,
        score: f64,
    ) -> Result<(), StoreError>;

    /// Standings ordered by total points, highest first.
    async fn standings_for_show(&self, show_id: &str) -> Result<Vec<TeamStanding>, StoreError>;

    async fn set_team_rank(
        &self,
        user_id: &str,
        show_id: &str,
        rank: u32,
    ) -> Result<(), StoreError>;

    /// Drop stored event history older than `cutoff`. Returns how many
    /// records went away.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
