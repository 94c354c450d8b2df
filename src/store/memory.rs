//! In-memory [`DataAccess`] implementation.
//!
//! Serves the composition root and the test suite; a deployment with real
//! persistence plugs its own implementation into the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Contestant, DataAccess, PredictionWrite, Show, StoreError, TeamStanding};

/// A retained event-history record, only interesting for its age.
#[derive(Debug, Clone)]
struct EventRecord {
    created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    shows: RwLock<Vec<Show>>,
    contestants: RwLock<Vec<Contestant>>,
    standings: RwLock<Vec<TeamStanding>>,
    events: RwLock<Vec<EventRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_show(&self, id: &str, name: &str, is_active: bool) {
        self.shows.write().push(Show {
            id: id.to_string(),
            name: name.to_string(),
            is_active,
        });
    }

    pub fn add_contestant(&self, id: &str, show_id: &str, name: &str, winner_probability: f64) {
        self.contestants.write().push(Contestant {
            id: id.to_string(),
            show_id: show_id.to_string(),
            name: name.to_string(),
            eliminated: false,
            winner_probability,
            elimination_probability: 1.0 - winner_probability,
            sentiment_score: 0.0,
        });
    }

    pub fn add_standing(&self, user_id: &str, show_id: &str, total_points: i64, rank: Option<u32>) {
        self.standings.write().push(TeamStanding {
            user_id: user_id.to_string(),
            show_id: show_id.to_string(),
            total_points,
            rank,
        });
    }

    pub fn add_event_at(&self, created_at: DateTime<Utc>) {
        self.events.write().push(EventRecord { created_at });
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn contestant(&self, id: &str) -> Option<Contestant> {
        self.contestants.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn standing(&self, user_id: &str, show_id: &str) -> Option<TeamStanding> {
        self.standings
            .read()
            .iter()
            .find(|t| t.user_id == user_id && t.show_id == show_id)
            .cloned()
    }
}

#[async_trait]
impl DataAccess for MemoryStore {
    async fn active_shows(&self) -> Result<Vec<Show>, StoreError> {
        Ok(self
            .shows
            .read()
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn contestants_for_show(&self, show_id: &str) -> Result<Vec<Contestant>, StoreError> {
        Ok(self
            .contestants
            .read()
            .iter()
            .filter(|c| c.show_id == show_id)
            .cloned()
            .collect())
    }

    async fn update_contestant_prediction(
        &self,
        contestant_id: &str,
        write: PredictionWrite,
    ) -> Result<(), StoreError> {
        let mut contestants = self.contestants.write();
        let contestant = contestants
            .iter_mut()
            .find(|c| c.id == contestant_id)
            .ok_or_else(|| StoreError::ContestantNotFound(contestant_id.to_string()))?;
        contestant.winner_probability = write.winner_probability;
        contestant.elimination_probability = write.elimination_probability;
        Ok(())
    }

    async fn set_contestant_sentiment(
        &self,
        contestant_id: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        let mut contestants = self.contestants.write();
        let contestant = contestants
            .iter_mut()
            .find(|c| c.id == contestant_id)
            .ok_or_else(|| StoreError::ContestantNotFound(contestant_id.to_string()))?;
        contestant.sentiment_score = score;
        Ok(())
    }

    async fn standings_for_show(&self, show_id: &str) -> Result<Vec<TeamStanding>, StoreError> {
        let mut standings: Vec<TeamStanding> = self
            .standings
            .read()
            .iter()
            .filter(|t| t.show_id == show_id)
            .cloned()
            .collect();
        standings.sort_by(|a, b| b.total_points.cmp(&a.total_points));
        Ok(standings)
    }

    async fn set_team_rank(
        &self,
        user_id: &str,
        show_id: &str,
        rank: u32,
    ) -> Result<(), StoreError> {
        let mut standings = self.standings.write();
        let standing = standings
            .iter_mut()
            .find(|t| t.user_id == user_id && t.show_id == show_id)
            .ok_or_else(|| StoreError::TeamNotFound {
                user_id: user_id.to_string(),
                show_id: show_id.to_string(),
            })?;
        standing.rank = Some(rank);
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
