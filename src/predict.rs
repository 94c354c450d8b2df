//! Prediction collaborator seam.
//!
//! The model backend is external: possibly slow, possibly failing, and
//! opaque. This module pins down only the data contract the jobs consume.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::store::Contestant;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("prediction backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid contestant features: {0}")]
    InvalidFeatures(String),
}

/// Direction a contestant's outlook is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Steady,
    Falling,
}

/// Inputs handed to the model backend for one contestant.
#[derive(Debug, Clone)]
pub struct ContestantFeatures {
    pub contestant_id: String,
    pub show_id: String,
    pub name: String,
    pub winner_probability: f64,
    pub elimination_probability: f64,
    pub sentiment_score: f64,
}

impl From<&Contestant> for ContestantFeatures {
    fn from(contestant: &Contestant) -> Self {
        Self {
            contestant_id: contestant.id.clone(),
            show_id: contestant.show_id.clone(),
            name: contestant.name.clone(),
            winner_probability: contestant.winner_probability,
            elimination_probability: contestant.elimination_probability,
            sentiment_score: contestant.sentiment_score,
        }
    }
}

/// Output contract of one prediction call.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomePrediction {
    pub elimination_probability: f64,
    pub winner_probability: f64,
    pub next_episode_safe: bool,
    pub confidence_interval: (f64, f64),
    pub trend: Trend,
    pub factors: Vec<String>,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict_outcomes(
        &self,
        features: &ContestantFeatures,
    ) -> Result<OutcomePrediction, PredictError>;

    /// Aggregate social sentiment score in [-1, 1].
    async fn analyze_sentiment(&self, features: &ContestantFeatures)
        -> Result<f64, PredictError>;
}

/// Default wiring until a real model backend is attached: reports the
/// currently stored numbers unchanged, with a fixed confidence band.
pub struct CarryForwardPredictor;

#[async_trait]
impl Predictor for CarryForwardPredictor {
    async fn predict_outcomes(
        &self,
        features: &ContestantFeatures,
    ) -> Result<OutcomePrediction, PredictError> {
        let winner = features.winner_probability.clamp(0.0, 1.0);
        Ok(OutcomePrediction {
            elimination_probability: features.elimination_probability.clamp(0.0, 1.0),
            winner_probability: winner,
            next_episode_safe: features.elimination_probability < 0.5,
            confidence_interval: ((winner - 0.1).max(0.0), (winner + 0.1).min(1.0)),
            trend: Trend::Steady,
            factors: Vec::new(),
        })
    }

    async fn analyze_sentiment(
        &self,
        features: &ContestantFeatures,
    ) -> Result<f64, PredictError> {
        Ok(features.sentiment_score.clamp(-1.0, 1.0))
    }
}
