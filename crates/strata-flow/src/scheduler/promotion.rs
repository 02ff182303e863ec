//! Promotion pass: `PENDING` -> `RUNNING`.
//!
//! Each pass scans pending runs and promotes those that are eligible:
//!
//! - their `run_at` (if any) has arrived,
//! - every `depends_on` task has a `DONE` latest run,
//! - no earlier schema version on the same (plan, instance, database) has a
//!   run that is still non-terminal.
//!
//! Blocked runs get a human-readable waiting cause written to the store;
//! the cause is logged only when it changes, so a migration stuck behind a
//! long copy does not spam the execution log every tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::Instrument;

use strata_core::observability::scheduler_span;

use crate::error::Result;
use crate::metrics::{FlowMetrics, TimingGuard};
use crate::plan::Task;
use crate::scheduler::{SchedulerContext, Tickle};
use crate::store::{CasResult, Store};
use crate::taskrun::{TaskRun, TaskRunLogEntry, TaskRunState, TransitionReason};

/// The loop that promotes eligible pending runs.
pub struct PromotionLoop {
    store: Arc<dyn Store>,
    ctx: Arc<SchedulerContext>,
    tick_interval: Duration,
    dispatch_tickle: Tickle,
    metrics: FlowMetrics,
}

impl PromotionLoop {
    /// Creates the loop.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ctx: Arc<SchedulerContext>,
        tick_interval: Duration,
        dispatch_tickle: Tickle,
    ) -> Self {
        Self {
            store,
            ctx,
            tick_interval,
            dispatch_tickle,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs until shutdown, waking on the tick interval or a tickle.
    pub async fn run(self, mut tickle: mpsc::Receiver<()>) {
        let shutdown = self.ctx.shutdown_token();
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("promotion loop shutting down");
                    return;
                }
                _ = tick.tick() => {}
                wake = tickle.recv() => {
                    if wake.is_none() {
                        tracing::info!("promotion tickle channel closed, stopping");
                        return;
                    }
                }
            }

            if let Err(error) = self
                .run_pass()
                .instrument(scheduler_span("promotion_pass"))
                .await
            {
                tracing::warn!(%error, "promotion pass failed");
            }
        }
    }

    /// Runs one promotion pass. Public for tests that drive the scheduler
    /// deterministically without the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if listing pending runs fails; per-run failures are
    /// logged and skipped.
    pub async fn run_pass(&self) -> Result<()> {
        let metrics = self.metrics.clone();
        let _timing = TimingGuard::new(move |d| metrics.observe_pass_duration("promotion", d));

        let pending = self.store.list_task_runs_by_state(TaskRunState::Pending).await?;
        let mut promoted = 0usize;

        for run in pending {
            match self.consider(&run).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(task_run_id = %run.id, %error, "promotion check failed");
                }
            }
        }

        if promoted > 0 {
            tracing::info!(promoted, "promotion pass scheduled task runs");
            self.dispatch_tickle.tickle();
        }
        Ok(())
    }

    /// Evaluates one pending run, promoting it if eligible.
    async fn consider(&self, run: &TaskRun) -> Result<bool> {
        let now = Utc::now();
        if !run.is_due(now) {
            let cause = format!(
                "scheduled for {}",
                run.run_at.map_or_else(String::new, |at| at.to_rfc3339())
            );
            self.record_waiting(run, &cause).await?;
            return Ok(false);
        }

        let Some(task) = self.store.get_task(run.task_id).await? else {
            tracing::warn!(task_run_id = %run.id, task_id = %run.task_id, "run references missing task");
            return Ok(false);
        };

        if let Some(cause) = self.blocking_cause(&task).await? {
            self.record_waiting(run, &cause).await?;
            return Ok(false);
        }

        match self
            .store
            .cas_task_run_state(
                run.id,
                TaskRunState::Pending,
                TaskRunState::Running,
                TransitionReason::Promoted,
            )
            .await?
        {
            CasResult::Success => {
                self.metrics.record_transition("PENDING", "RUNNING");
                self.store
                    .append_task_run_log(&TaskRunLogEntry::new(run.id, "task run scheduled"))
                    .await?;
                tracing::info!(task_run_id = %run.id, task_id = %task.id, kind = %task.kind, "promoted");
                Ok(true)
            }
            CasResult::NotFound => Ok(false),
            CasResult::StateMismatch { actual } => {
                // Another replica won; nothing to do.
                tracing::debug!(task_run_id = %run.id, %actual, "lost promotion race");
                Ok(false)
            }
        }
    }

    /// Returns the reason the task cannot start yet, if any.
    async fn blocking_cause(&self, task: &Task) -> Result<Option<String>> {
        for dep in &task.depends_on {
            let latest = self.store.latest_task_run_for_task(*dep).await?;
            let done = latest
                .as_ref()
                .is_some_and(|r| r.state == TaskRunState::Done);
            if !done {
                return Ok(Some(format!("waiting for dependency task {dep}")));
            }
        }

        if task.kind.is_sequential() {
            if let Some(version) = task.schema_version.as_deref() {
                let blocker = self
                    .store
                    .find_blocking_task_by_version(
                        task.plan_id,
                        task.instance_id,
                        &task.database_name,
                        version,
                    )
                    .await?;
                if let Some(blocker) = blocker {
                    return Ok(Some(format!(
                        "waiting for earlier schema version (task {blocker}) on {}",
                        task.database_name
                    )));
                }
            }
        }

        Ok(None)
    }

    /// Writes the waiting cause, logging only when it changed.
    async fn record_waiting(&self, run: &TaskRun, cause: &str) -> Result<()> {
        let changed = self.store.record_waiting_cause(run.id, cause).await?;
        if changed {
            self.store
                .append_task_run_log(&TaskRunLogEntry::new(run.id, cause))
                .await?;
            tracing::info!(task_run_id = %run.id, cause, "task run waiting");
        }
        Ok(())
    }
}
