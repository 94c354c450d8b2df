//! The scheduled task runner.
//!
//! A polling loop launches every due, enabled, not-already-executing task
//! concurrently; executions run under a cancellation token derived from
//! the runner's shutdown token. A task never has two concurrent
//! executions, but distinct tasks overlap freely. Failures feed an
//! exponential-backoff counter that permanently disables the task once the
//! threshold is crossed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TasksConfig;
use crate::tasks::{
    Job, RunnerError, ScheduledTask, TaskPriority, TaskResult, TaskStatus, TaskView, Trigger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionMode {
    /// Launched by the polling loop; completion drives the schedule.
    Scheduled,
    /// Launched out-of-band by an operator; only records a result.
    Manual,
}

/// Snapshot served by the task inspection endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub tasks: Vec<TaskView>,
    pub running: Vec<String>,
    pub recent_results: Vec<TaskResult>,
}

pub struct TaskRunner {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    running: DashMap<String, JoinHandle<()>>,
    history: Mutex<VecDeque<TaskResult>>,
    execution_seq: AtomicU64,
    retention: usize,
    poll_interval: Duration,
    error_backoff: Duration,
    shutdown: CancellationToken,
}

impl TaskRunner {
    pub fn new(config: &TasksConfig) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            running: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            execution_seq: AtomicU64::new(0),
            retention: config.result_retention,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
            shutdown: CancellationToken::new(),
        })
    }

    /// Add a task to the static table with a computed initial next-run.
    pub fn register_task(
        &self,
        id: &str,
        name: &str,
        job: Job,
        trigger: Trigger,
        priority: TaskPriority,
        max_failures: u32,
    ) -> Result<(), RunnerError> {
        trigger.validate().map_err(|reason| RunnerError::InvalidTrigger {
            id: id.to_string(),
            reason,
        })?;
        let mut tasks = self.tasks.write();
        if tasks.contains_key(id) {
            return Err(RunnerError::DuplicateTask(id.to_string()));
        }
        let next_run = Some(trigger.first_run(Utc::now()));
        tasks.insert(
            id.to_string(),
            ScheduledTask {
                id: id.to_string(),
                name: name.to_string(),
                job,
                trigger,
                priority,
                enabled: true,
                last_run: None,
                next_run,
                run_count: 0,
                failure_count: 0,
                max_failures,
            },
        );
        tracing::info!(task = %id, name, "task registered");
        Ok(())
    }

    /// Re-enable a disabled task, clearing its failure count and computing
    /// a fresh next-run.
    pub fn enable_task(&self, id: &str) -> Result<(), RunnerError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RunnerError::UnknownTask(id.to_string()))?;
        task.enabled = true;
        task.failure_count = 0;
        task.next_run = Some(task.trigger.first_run(Utc::now()));
        tracing::info!(task = %id, "task enabled");
        Ok(())
    }

    /// Halt scheduling of a task. The table entry stays for inspection and
    /// later re-enabling.
    pub fn disable_task(&self, id: &str) -> Result<(), RunnerError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RunnerError::UnknownTask(id.to_string()))?;
        task.enabled = false;
        tracing::info!(task = %id, "task disabled");
        Ok(())
    }

    /// Run a task out-of-band. Records a Task Result but leaves the
    /// schedule untouched. Refused while the task is already executing:
    /// the single-execution guarantee has no manual exemption.
    pub fn trigger_task(self: &Arc<Self>, id: &str) -> Result<(), RunnerError> {
        let job = {
            let tasks = self.tasks.read();
            let task = tasks
                .get(id)
                .ok_or_else(|| RunnerError::UnknownTask(id.to_string()))?;
            task.job.clone()
        };
        tracing::info!(task = %id, "manual trigger");
        if self.spawn_execution(id.to_string(), job, Utc::now(), ExecutionMode::Manual) {
            Ok(())
        } else {
            Err(RunnerError::AlreadyRunning(id.to_string()))
        }
    }

    /// The polling loop. Runs until shutdown; a failing tick is logged and
    /// followed by a longer sleep instead of terminating the loop.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            poll_secs = self.poll_interval.as_secs(),
            "task scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.tick(Utc::now()) {
                        Ok(launched) if launched > 0 => {
                            tracing::debug!(launched, "scheduling tick launched tasks");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "scheduling tick failed");
                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.error_backoff) => {}
                            }
                        }
                    }
                }
            }
        }
        tracing::info!("task scheduler stopped");
    }

    /// One scheduling pass at `now`: launch every enabled task whose
    /// next-run has passed and which is not currently executing, highest
    /// priority first. Returns the number of launched executions.
    pub(crate) fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, RunnerError> {
        let mut due: Vec<(String, Job, TaskPriority)> = {
            let tasks = self.tasks.read();
            tasks
                .values()
                .filter(|t| {
                    t.enabled
                        && t.next_run.is_some_and(|next| next <= now)
                        && !self.running.contains_key(&t.id)
                })
                .map(|t| (t.id.clone(), t.job.clone(), t.priority))
                .collect()
        };
        due.sort_by(|a, b| b.2.cmp(&a.2));

        let mut launched = 0;
        for (id, job, _) in due {
            if self.spawn_execution(id, job, now, ExecutionMode::Scheduled) {
                launched += 1;
            }
        }
        Ok(launched)
    }

    /// Spawn one execution, holding the single-flight slot for the task.
    /// Returns false when the slot is already taken.
    fn spawn_execution(
        self: &Arc<Self>,
        id: String,
        job: Job,
        now: DateTime<Utc>,
        mode: ExecutionMode,
    ) -> bool {
        let slot = match self.running.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(task = %id, "execution still in flight; skipping");
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => slot,
        };

        let execution = self.execution_seq.fetch_add(1, Ordering::Relaxed);
        self.push_history(TaskResult {
            task_id: id.clone(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            started_at: now,
            completed_at: None,
            duration_seconds: None,
            execution,
        });
        tracing::info!(task = %id, "starting task");

        let runner = Arc::clone(self);
        let token = self.shutdown.child_token();
        let task_id = id;
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = (job)() => Some(result),
            };
            runner.finish_execution(&task_id, execution, outcome, mode);
            runner.running.remove(&task_id);
        });
        slot.insert(handle);
        true
    }

    /// Close out one execution: record the result and, for scheduled runs,
    /// advance the task's state machine. `None` means the execution
    /// observed cancellation; no backoff or reschedule applies.
    fn finish_execution(
        &self,
        id: &str,
        execution: u64,
        outcome: Option<anyhow::Result<serde_json::Value>>,
        mode: ExecutionMode,
    ) {
        let completed = Utc::now();

        let Some(outcome) = outcome else {
            self.update_history(execution, |r| {
                r.status = TaskStatus::Cancelled;
                r.completed_at = Some(completed);
                r.duration_seconds = Some(duration_secs(r.started_at, completed));
            });
            tracing::info!(task = %id, "task cancelled");
            return;
        };

        match outcome {
            Ok(value) => {
                self.update_history(execution, |r| {
                    r.status = TaskStatus::Completed;
                    r.result = Some(value.clone());
                    r.completed_at = Some(completed);
                    r.duration_seconds = Some(duration_secs(r.started_at, completed));
                });
                if mode == ExecutionMode::Scheduled {
                    let mut tasks = self.tasks.write();
                    if let Some(task) = tasks.get_mut(id) {
                        task.last_run = Some(completed);
                        task.run_count += 1;
                        task.failure_count = 0;
                        task.next_run = task.trigger.next_run(completed);
                    }
                }
                tracing::info!(task = %id, "task completed");
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.update_history(execution, |r| {
                    r.status = TaskStatus::Failed;
                    r.error = Some(message.clone());
                    r.completed_at = Some(completed);
                    r.duration_seconds = Some(duration_secs(r.started_at, completed));
                });
                if mode == ExecutionMode::Scheduled {
                    let mut tasks = self.tasks.write();
                    if let Some(task) = tasks.get_mut(id) {
                        task.failure_count += 1;
                        if task.failure_count >= task.max_failures {
                            task.enabled = false;
                            task.next_run = None;
                            tracing::warn!(
                                task = %id,
                                failures = task.failure_count,
                                "task disabled after repeated failures"
                            );
                        } else {
                            let backoff = 1i64 << task.failure_count.min(16);
                            task.next_run = Some(completed + TimeDelta::minutes(backoff));
                        }
                    }
                }
                tracing::error!(task = %id, error = %message, "task failed");
            }
        }
    }

    /// Stop the scheduling loop, cancel every in-flight execution and wait
    /// for all of them to observe cancellation. Nothing is left running
    /// when this returns.
    pub async fn shutdown(&self) {
        tracing::info!("stopping task runner");
        self.shutdown.cancel();
        loop {
            let keys: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                if let Some((id, handle)) = self.running.remove(&key) {
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            tracing::warn!(task = %id, error = %e, "execution join failed");
                        }
                    }
                }
            }
        }
        tracing::info!("task runner stopped");
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let mut views: Vec<TaskView> = self.tasks.read().values().map(TaskView::from).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        let history = self.history.lock();
        let recent = history
            .iter()
            .rev()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        RunnerSnapshot {
            tasks: views,
            running: self.running.iter().map(|e| e.key().clone()).collect(),
            recent_results: recent,
        }
    }

    pub fn task_view(&self, id: &str) -> Option<TaskView> {
        self.tasks.read().get(id).map(TaskView::from)
    }

    fn push_history(&self, result: TaskResult) {
        let mut history = self.history.lock();
        history.push_back(result);
        while history.len() > self.retention {
            history.pop_front();
        }
    }

    fn update_history(&self, execution: u64, update: impl FnOnce(&mut TaskResult)) {
        let mut history = self.history.lock();
        if let Some(result) = history.iter_mut().rev().find(|r| r.execution == execution) {
            update(result);
        }
    }
}

fn duration_secs(started: DateTime<Utc>, completed: DateTime<Utc>) -> f64 {
    (completed - started).num_milliseconds() as f64 / 1000.0
}
