//! Pipeline notifications with failure aggregation.
//!
//! Failures are noisy: one bad statement can fail a dozen task runs in a few
//! seconds. The [`PipelineNotifier`] opens an aggregation window on the first
//! failure for a plan and collects further failures into it; when the window
//! elapses it sends a single `PipelineFailed` notification listing every
//! failed task. Completion sends one `PipelineCompleted` notification when
//! the last task's run lands `DONE`.
//!
//! Windows are process-local. Cross-replica at-most-once delivery comes from
//! [`Store::claim_notification`]: each window flush (and each completion)
//! first claims the (plan, kind, window) tuple and only the claim winner
//! sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{PlanId, TaskId};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::Store;
use crate::taskrun::TaskRunState;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// One or more task runs failed within an aggregation window.
    PipelineFailed,
    /// Every task in the pipeline finished successfully.
    PipelineCompleted,
}

impl NotificationKind {
    /// Returns a label suitable for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::PipelineFailed => "pipeline_failed",
            Self::PipelineCompleted => "pipeline_completed",
        }
    }
}

/// An outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// The plan the pipeline belongs to.
    pub plan_id: PlanId,
    /// Tasks whose runs failed within the window (failure notifications).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tasks: Vec<TaskId>,
}

/// Delivers notifications to the outside world (webhooks, chat, email).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sends one notification.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Sink that records notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification sent so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn sent(&self) -> Result<Vec<Notification>> {
        let sent = self.sent.lock().map_err(poison_err)?;
        Ok(sent.clone())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut sent = self.sent.lock().map_err(poison_err)?;
        sent.push(notification.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct FailureWindow {
    opened_at: DateTime<Utc>,
    failed_tasks: Vec<TaskId>,
}

/// Aggregates failures per plan and sends claim-guarded notifications.
#[derive(Debug)]
pub struct PipelineNotifier<K: Store + ?Sized + 'static, S: NotificationSink + ?Sized + 'static> {
    store: Arc<K>,
    sink: Arc<S>,
    window: Duration,
    windows: Mutex<HashMap<PlanId, FailureWindow>>,
    metrics: FlowMetrics,
}

impl<K: Store + ?Sized, S: NotificationSink + ?Sized> PipelineNotifier<K, S> {
    /// Creates a notifier with the given aggregation window.
    #[must_use]
    pub fn new(store: Arc<K>, sink: Arc<S>, window: Duration) -> Self {
        Self {
            store,
            sink,
            window,
            windows: Mutex::new(HashMap::new()),
            metrics: FlowMetrics::new(),
        }
    }

    /// Records a failed task run.
    ///
    /// The first failure for a plan opens an aggregation window and spawns
    /// its flush timer; later failures within the window only join the list.
    ///
    /// # Errors
    ///
    /// Returns an error if the window lock is poisoned.
    pub fn record_failure(self: &Arc<Self>, plan_id: PlanId, task_id: TaskId) -> Result<()> {
        let mut windows = self.windows.lock().map_err(poison_err)?;
        if let Some(window) = windows.get_mut(&plan_id) {
            if !window.failed_tasks.contains(&task_id) {
                window.failed_tasks.push(task_id);
            }
            return Ok(());
        }

        windows.insert(
            plan_id,
            FailureWindow {
                opened_at: Utc::now(),
                failed_tasks: vec![task_id],
            },
        );
        drop(windows);

        tracing::debug!(plan_id = %plan_id, "failure aggregation window opened");
        let notifier = Arc::clone(self);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Err(error) = notifier.flush_failures(plan_id).await {
                tracing::warn!(plan_id = %plan_id, %error, "failure window flush failed");
            }
        });
        Ok(())
    }

    /// Handles a successful task run: if every task in the plan now has a
    /// `DONE` latest run, sends the (claim-guarded) completion notification
    /// and discards any open failure window.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures.
    pub async fn record_success(&self, plan_id: PlanId) -> Result<()> {
        let tasks = self.store.list_tasks_by_plan(plan_id).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        for task in &tasks {
            let latest = self.store.latest_task_run_for_task(task.id).await?;
            if !latest.is_some_and(|r| r.state == TaskRunState::Done) {
                return Ok(());
            }
        }

        {
            let mut windows = self.windows.lock().map_err(poison_err)?;
            windows.remove(&plan_id);
        }

        // A pipeline completes at most once, so the claim window is a fixed
        // sentinel rather than a wall-clock bucket.
        let won = self
            .store
            .claim_notification(
                plan_id,
                NotificationKind::PipelineCompleted,
                DateTime::<Utc>::UNIX_EPOCH,
            )
            .await?;
        if !won {
            return Ok(());
        }

        let notification = Notification {
            kind: NotificationKind::PipelineCompleted,
            plan_id,
            failed_tasks: Vec::new(),
        };
        self.sink.send(&notification).await?;
        self.metrics
            .record_notification(NotificationKind::PipelineCompleted.as_label());
        tracing::info!(plan_id = %plan_id, "pipeline completed notification sent");
        Ok(())
    }

    /// Flushes the failure window for a plan, if one is still open.
    async fn flush_failures(&self, plan_id: PlanId) -> Result<()> {
        let window = {
            let mut windows = self.windows.lock().map_err(poison_err)?;
            windows.remove(&plan_id)
        };
        let Some(window) = window else {
            // Cleared by a completion in the meantime.
            return Ok(());
        };

        let won = self
            .store
            .claim_notification(plan_id, NotificationKind::PipelineFailed, window.opened_at)
            .await?;
        if !won {
            tracing::debug!(plan_id = %plan_id, "failure notification already claimed elsewhere");
            return Ok(());
        }

        let notification = Notification {
            kind: NotificationKind::PipelineFailed,
            plan_id,
            failed_tasks: window.failed_tasks,
        };
        self.sink.send(&notification).await?;
        self.metrics
            .record_notification(NotificationKind::PipelineFailed.as_label());
        tracing::info!(
            plan_id = %plan_id,
            failed = notification.failed_tasks.len(),
            "pipeline failure notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn notifier(
        window: Duration,
    ) -> (
        Arc<PipelineNotifier<InMemoryStore, RecordingSink>>,
        Arc<InMemoryStore>,
        Arc<RecordingSink>,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let notifier = Arc::new(PipelineNotifier::new(
            Arc::clone(&store),
            Arc::clone(&sink),
            window,
        ));
        (notifier, store, sink)
    }

    #[tokio::test]
    async fn failures_within_window_aggregate_into_one_notification() {
        let (notifier, _store, sink) = notifier(Duration::from_millis(50));
        let plan_id = PlanId::generate();
        let tasks = [TaskId::generate(), TaskId::generate(), TaskId::generate()];

        for task_id in tasks {
            notifier.record_failure(plan_id, task_id).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = sink.sent().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::PipelineFailed);
        assert_eq!(sent[0].failed_tasks.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_task_failures_are_not_double_counted() {
        let (notifier, _store, sink) = notifier(Duration::from_millis(50));
        let plan_id = PlanId::generate();
        let task_id = TaskId::generate();

        notifier.record_failure(plan_id, task_id).unwrap();
        notifier.record_failure(plan_id, task_id).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = sink.sent().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].failed_tasks.len(), 1);
    }

    #[tokio::test]
    async fn failures_in_separate_windows_notify_separately() {
        let (notifier, _store, sink) = notifier(Duration::from_millis(30));
        let plan_id = PlanId::generate();

        notifier.record_failure(plan_id, TaskId::generate()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        notifier.record_failure(plan_id, TaskId::generate()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.sent().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn completion_clears_pending_failure_window() {
        let (notifier, store, sink) = notifier(Duration::from_millis(50));

        // A plan whose single task already has a DONE latest run.
        use crate::plan::{ChangeKind, ChangeSpec, Plan, RolloutBuilder};
        use crate::taskrun::TransitionReason;
        use strata_core::{InstanceId, ProjectId};

        let plan = Plan::new(
            ProjectId::generate(),
            "finishes",
            vec![ChangeSpec {
                kind: ChangeKind::DdlMigrate,
                instance_id: InstanceId::generate(),
                database_name: "orders".into(),
                statement: "ALTER TABLE t ADD COLUMN c INT".into(),
                schema_version: Some("0001".into()),
                environment: "prod".into(),
                run_at: None,
            }],
        );
        store.save_plan(&plan).await.unwrap();
        let rollout = RolloutBuilder::new(&plan).build().unwrap();
        store
            .save_rollout(&rollout.pipeline, &rollout.tasks, &rollout.task_runs)
            .await
            .unwrap();
        let run_id = rollout.task_runs[0].id;
        store
            .cas_task_run_state(
                run_id,
                TaskRunState::Pending,
                TaskRunState::Running,
                TransitionReason::Promoted,
            )
            .await
            .unwrap();
        store
            .cas_task_run_state(
                run_id,
                TaskRunState::Running,
                TaskRunState::Done,
                TransitionReason::ExecutionSucceeded,
            )
            .await
            .unwrap();

        // Open a failure window, then complete before it flushes.
        notifier
            .record_failure(plan.id, rollout.tasks[0].id)
            .unwrap();
        notifier.record_success(plan.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = sink.sent().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::PipelineCompleted);
    }

    #[tokio::test]
    async fn completion_is_sent_at_most_once() {
        let (notifier, store, sink) = notifier(Duration::from_millis(50));

        use crate::plan::{ChangeKind, ChangeSpec, Plan, RolloutBuilder};
        use crate::taskrun::TransitionReason;
        use strata_core::{InstanceId, ProjectId};

        let plan = Plan::new(
            ProjectId::generate(),
            "idempotent",
            vec![ChangeSpec {
                kind: ChangeKind::Backup,
                instance_id: InstanceId::generate(),
                database_name: "orders".into(),
                statement: String::new(),
                schema_version: None,
                environment: "prod".into(),
                run_at: None,
            }],
        );
        store.save_plan(&plan).await.unwrap();
        let rollout = RolloutBuilder::new(&plan).build().unwrap();
        store
            .save_rollout(&rollout.pipeline, &rollout.tasks, &rollout.task_runs)
            .await
            .unwrap();
        let run_id = rollout.task_runs[0].id;
        store
            .cas_task_run_state(
                run_id,
                TaskRunState::Pending,
                TaskRunState::Running,
                TransitionReason::Promoted,
            )
            .await
            .unwrap();
        store
            .cas_task_run_state(
                run_id,
                TaskRunState::Running,
                TaskRunState::Done,
                TransitionReason::ExecutionSucceeded,
            )
            .await
            .unwrap();

        notifier.record_success(plan.id).await.unwrap();
        notifier.record_success(plan.id).await.unwrap();

        assert_eq!(sink.sent().unwrap().len(), 1);
    }
}
