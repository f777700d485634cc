//! The tick engine.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use butlers_core::TriggerSource;

use crate::cron_eval::next_fire;
use crate::error::SchedulerResult;
use crate::store::{ScheduledTask, TaskStore};

/// Dispatches one due task.
///
/// The daemon wires this to the spawner (prompt tasks) and to module
/// jobs (job tasks). Returning `Err` is recorded in `last_result` and
/// never blocks sibling tasks.
#[async_trait]
pub trait TickDispatcher: Send + Sync {
    /// Dispatch a prompt task as a `schedule:<name>` session.
    async fn dispatch_prompt(
        &self,
        trigger: TriggerSource,
        prompt: &str,
    ) -> Result<String, String>;

    /// Dispatch a registered module job.
    async fn dispatch_job(&self, job_name: &str) -> Result<String, String>;
}

/// Outcome of one task within a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickOutcome {
    /// Task name.
    pub task: String,
    /// Whether dispatch succeeded.
    pub success: bool,
    /// Result or error text.
    pub detail: String,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickSummary {
    /// Tasks that were due.
    pub due: usize,
    /// Tasks this tick claimed and dispatched.
    pub dispatched: Vec<TickOutcome>,
    /// Tasks another concurrent tick claimed first.
    pub lost_claims: usize,
}

/// The per-butler scheduler.
#[derive(Debug, Clone)]
pub struct Scheduler {
    store: TaskStore,
}

impl Scheduler {
    /// Create a scheduler over the butler's task store.
    #[must_use]
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Evaluate due tasks, claim, dispatch, and advance.
    ///
    /// Idempotent under concurrency: the claim is a conditional update
    /// on the observed `next_run_at`, so duplicated ticks in the same
    /// second dispatch each task at most once. Tasks are dispatched
    /// independently; a failure is recorded and the loop continues.
    ///
    /// # Errors
    ///
    /// Only storage failures while selecting tasks are fatal to the
    /// tick; per-task dispatch failures are captured in the summary.
    pub async fn tick(&self, dispatcher: &dyn TickDispatcher) -> SchedulerResult<TickSummary> {
        let now = Utc::now();
        let due = self.store.due(now).await?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        for task in due {
            let Some(observed_next) = task.next_run_at else {
                continue;
            };
            // Advance from the observed due time so a task that was due
            // several periods ago does not fire once per missed period.
            let advanced = match next_fire(&task.cron, self.store.timezone(), now) {
                Ok(t) => t,
                Err(e) => {
                    warn!(task = %task.name, error = %e, "cron no longer evaluates; disabling advance");
                    self.store
                        .record_result(&task.name, &format!("error: {e}"))
                        .await?;
                    continue;
                },
            };

            if !self.store.claim(&task.name, observed_next, advanced).await? {
                summary.lost_claims = summary.lost_claims.saturating_add(1);
                continue;
            }

            let outcome = self.dispatch_one(&task, dispatcher).await;
            self.store.record_result(&task.name, &outcome.detail).await?;
            info!(
                task = %outcome.task,
                success = outcome.success,
                "scheduled task dispatched"
            );
            summary.dispatched.push(outcome);
        }
        Ok(summary)
    }

    async fn dispatch_one(
        &self,
        task: &ScheduledTask,
        dispatcher: &dyn TickDispatcher,
    ) -> TickOutcome {
        let result = match (&task.prompt, &task.job_name) {
            (Some(prompt), _) => {
                dispatcher
                    .dispatch_prompt(TriggerSource::Schedule(task.name.clone()), prompt)
                    .await
            },
            (None, Some(job)) => dispatcher.dispatch_job(job).await,
            (None, None) => Err("task has neither prompt nor job_name".to_owned()),
        };

        match result {
            Ok(detail) => TickOutcome {
                task: task.name.clone(),
                success: true,
                detail,
            },
            Err(detail) => TickOutcome {
                task: task.name.clone(),
                success: false,
                detail: format!("error: {detail}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records dispatches; fails tasks whose prompt contains "boom".
    struct RecordingDispatcher {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TickDispatcher for RecordingDispatcher {
        async fn dispatch_prompt(
            &self,
            trigger: TriggerSource,
            prompt: &str,
        ) -> Result<String, String> {
            self.calls.lock().unwrap().push(trigger.to_wire());
            if prompt.contains("boom") {
                Err("exploded".to_owned())
            } else {
                Ok("done".to_owned())
            }
        }

        async fn dispatch_job(&self, job_name: &str) -> Result<String, String> {
            self.calls.lock().unwrap().push(format!("job:{job_name}"));
            Ok("done".to_owned())
        }
    }

    #[tokio::test]
    async fn dispatch_one_isolates_failures() {
        // Exercises the per-task dispatch path without a database: a
        // failing task yields a failed outcome, not an Err.
        let dispatcher = RecordingDispatcher {
            calls: Mutex::new(Vec::new()),
        };
        let store = TaskStore::new(
            butlers_storage::Database::connect_lazy("postgres://localhost/butlers", "test_sched")
                .unwrap(),
            chrono_tz::UTC,
        );
        let scheduler = Scheduler::new(store);

        let ok_task = ScheduledTask {
            name: "a".to_owned(),
            cron: "0 0 8 * * *".to_owned(),
            prompt: Some("do the thing".to_owned()),
            job_name: None,
            enabled: true,
            source: "config".to_owned(),
            last_run_at: None,
            last_result: None,
            next_run_at: Some(Utc::now()),
        };
        let boom_task = ScheduledTask {
            prompt: Some("boom".to_owned()),
            name: "b".to_owned(),
            ..ok_task.clone()
        };

        let out_a = scheduler.dispatch_one(&ok_task, &dispatcher).await;
        let out_b = scheduler.dispatch_one(&boom_task, &dispatcher).await;

        assert!(out_a.success);
        assert!(!out_b.success);
        assert!(out_b.detail.contains("exploded"));

        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["schedule:a", "schedule:b"]);
    }

    #[tokio::test]
    async fn task_without_prompt_or_job_fails_cleanly() {
        let dispatcher = RecordingDispatcher {
            calls: Mutex::new(Vec::new()),
        };
        let store = TaskStore::new(
            butlers_storage::Database::connect_lazy("postgres://localhost/butlers", "test_sched")
                .unwrap(),
            chrono_tz::UTC,
        );
        let scheduler = Scheduler::new(store);
        let task = ScheduledTask {
            name: "empty".to_owned(),
            cron: "0 0 8 * * *".to_owned(),
            prompt: None,
            job_name: None,
            enabled: true,
            source: "runtime".to_owned(),
            last_run_at: None,
            last_result: None,
            next_run_at: Some(Utc::now()),
        };
        let out = scheduler.dispatch_one(&task, &dispatcher).await;
        assert!(!out.success);
    }
}
