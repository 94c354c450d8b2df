//! Scheduled task types: triggers, priorities, execution results and the
//! job contract consumed by [`runner::TaskRunner`].
//!
//! The runner is domain-agnostic: a job is a zero-argument async operation
//! returning an arbitrary JSON payload or failing. Jobs that need to reach
//! live subscribers call the broadcast engine themselves.

pub mod runner;

pub use runner::TaskRunner;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

/// Future returned by one job invocation.
pub type JobFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;

/// The job contract: callable any number of times, each call producing an
/// independent execution.
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("task {0} is not registered")]
    UnknownTask(String),
    #[error("task {0} is already registered")]
    DuplicateTask(String),
    #[error("task {0} is already executing")]
    AlreadyRunning(String),
    #[error("invalid trigger for task {id}: {reason}")]
    InvalidTrigger { id: String, reason: String },
}

/// Launch-order tier for due tasks within one scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Scheduled but not yet started.
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// When a task should run.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed period between completions.
    Interval(TimeDelta),
    /// Every day at the given hour:minute (UTC). Hour/minute granularity
    /// only; no day-of-week or month fields.
    Daily { hour: u32, minute: u32 },
    /// Fire once at the given time, or immediately when `None`; never
    /// rescheduled afterwards.
    Once { at: Option<DateTime<Utc>> },
}

impl Trigger {
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Trigger::Interval(period) if *period <= TimeDelta::zero() => {
                Err("interval must be positive".to_string())
            }
            Trigger::Daily { hour, minute } if *hour > 23 || *minute > 59 => {
                Err(format!("{hour:02}:{minute:02} is not a valid time of day"))
            }
            _ => Ok(()),
        }
    }

    /// Run time assigned at registration (or on manual re-enable).
    pub(crate) fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Trigger::Interval(period) => now + *period,
            Trigger::Daily { hour, minute } => next_daily_occurrence(now, *hour, *minute),
            Trigger::Once { at } => at.unwrap_or(now),
        }
    }

    /// Run time after a successful completion. `None` for one-shots.
    pub(crate) fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { .. } => None,
            _ => Some(self.first_run(now)),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Trigger::Interval(period) => format!("every {}s", period.num_seconds()),
            Trigger::Daily { hour, minute } => format!("daily at {hour:02}:{minute:02}"),
            Trigger::Once { at: Some(at) } => format!("once at {}", at.to_rfc3339()),
            Trigger::Once { at: None } => "once".to_string(),
        }
    }
}

/// Today at hour:minute if still ahead, otherwise tomorrow.
fn next_daily_occurrence(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| now.naive_utc())
        .and_utc();
    if today <= now {
        today + TimeDelta::days(1)
    } else {
        today
    }
}

/// Outcome record of one execution, kept in a bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip)]
    pub(crate) execution: u64,
}

/// One entry in the task table.
pub(crate) struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub job: Job,
    pub trigger: Trigger,
    pub priority: TaskPriority,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u32,
    pub max_failures: u32,
}

/// Serializable projection of a task table entry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub priority: TaskPriority,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u32,
    pub max_failures: u32,
}

impl From<&ScheduledTask> for TaskView {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            trigger: task.trigger.describe(),
            priority: task.priority,
            enabled: task.enabled,
            last_run: task.last_run,
            next_run: task.next_run,
            run_count: task.run_count,
            failure_count: task.failure_count,
            max_failures: task.max_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_trigger_adds_the_period() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let trigger = Trigger::Interval(TimeDelta::minutes(30));
        assert_eq!(trigger.first_run(now), now + TimeDelta::minutes(30));
        assert_eq!(trigger.next_run(now), Some(now + TimeDelta::minutes(30)));
    }

    #[test]
    fn daily_trigger_runs_today_when_still_ahead() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let trigger = Trigger::Daily { hour: 3, minute: 0 };
        assert_eq!(
            trigger.first_run(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_trigger_rolls_to_tomorrow_when_passed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        let trigger = Trigger::Daily { hour: 3, minute: 0 };
        assert_eq!(
            trigger.first_run(now),
            Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn once_trigger_never_reschedules() {
        let now = Utc::now();
        let trigger = Trigger::Once { at: None };
        assert_eq!(trigger.first_run(now), now);
        assert_eq!(trigger.next_run(now), None);
    }

    #[test]
    fn invalid_triggers_are_rejected() {
        assert!(Trigger::Interval(TimeDelta::zero()).validate().is_err());
        assert!(Trigger::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Trigger::Daily { hour: 3, minute: 60 }.validate().is_err());
        assert!(Trigger::Daily { hour: 3, minute: 0 }.validate().is_ok());
    }

    #[test]
    fn priorities_order_critical_first() {
        let mut tiers = [
            TaskPriority::Normal,
            TaskPriority::Critical,
            TaskPriority::Low,
            TaskPriority::High,
        ];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            tiers,
            [
                TaskPriority::Critical,
                TaskPriority::High,
                TaskPriority::Normal,
                TaskPriority::Low,
            ]
        );
    }
}
