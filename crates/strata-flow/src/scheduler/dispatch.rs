//! Dispatch pass: claim `RUNNING` runs and execute them.
//!
//! Each pass atomically claims every unclaimed `RUNNING` run for this
//! replica, resolves an executor per task, and spawns the execution. The
//! spawn boundary is also the panic boundary: executor panics are caught
//! and settled as `FAILED` runs, so one bad migration never takes the
//! scheduler down.
//!
//! Migrate-class tasks additionally pass through per-(instance, database)
//! sequential admission. A run that loses admission has its claim released
//! and stays `RUNNING`-unclaimed for a later pass; it never loses its place
//! in the state machine.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use strata_core::observability::{scheduler_span, task_run_span};
use strata_core::{TaskId, TaskRunId};

use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::metrics::{FlowMetrics, TimingGuard};
use crate::notify::{NotificationSink, PipelineNotifier};
use crate::plan::Task;
use crate::scheduler::{SchedulerContext, Tickle};
use crate::store::{CasResult, Store};
use crate::taskrun::{TaskRunLogEntry, TaskRunResult, TaskRunState, TransitionReason};

type Notifier = PipelineNotifier<dyn Store, dyn NotificationSink>;

/// The loop that executes claimed task runs.
pub struct DispatchLoop {
    store: Arc<dyn Store>,
    registry: Arc<ExecutorRegistry>,
    exec_ctx: ExecutionContext,
    ctx: Arc<SchedulerContext>,
    notifier: Arc<Notifier>,
    replica_id: String,
    tick_interval: Duration,
    promotion_tickle: Tickle,
    metrics: FlowMetrics,
}

impl DispatchLoop {
    /// Creates the loop.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ExecutorRegistry>,
        exec_ctx: ExecutionContext,
        ctx: Arc<SchedulerContext>,
        notifier: Arc<Notifier>,
        replica_id: String,
        tick_interval: Duration,
        promotion_tickle: Tickle,
    ) -> Self {
        Self {
            store,
            registry,
            exec_ctx,
            ctx,
            notifier,
            replica_id,
            tick_interval,
            promotion_tickle,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs until shutdown, waking on the tick interval or a tickle.
    pub async fn run(self, mut tickle: mpsc::Receiver<()>) {
        let this = Arc::new(self);
        let shutdown = this.ctx.shutdown_token();
        let mut tick = tokio::time::interval(this.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("dispatch loop shutting down");
                    return;
                }
                _ = tick.tick() => {}
                wake = tickle.recv() => {
                    if wake.is_none() {
                        tracing::info!("dispatch tickle channel closed, stopping");
                        return;
                    }
                }
            }

            if let Err(error) = this
                .run_pass()
                .instrument(scheduler_span("dispatch_pass"))
                .await
            {
                tracing::warn!(%error, "dispatch pass failed");
            }
        }
    }

    /// Runs one dispatch pass. Public for tests that drive the scheduler
    /// deterministically without the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails; per-run failures are logged and
    /// settled individually.
    pub async fn run_pass(self: &Arc<Self>) -> Result<()> {
        let metrics = self.metrics.clone();
        let _timing = TimingGuard::new(move |d| metrics.observe_pass_duration("dispatch", d));

        let claimed = self
            .store
            .claim_available_task_runs(&self.replica_id)
            .await?;

        for (task_run_id, task_id) in claimed {
            if let Err(error) = self.dispatch_one(task_run_id, task_id).await {
                tracing::warn!(task_run_id = %task_run_id, %error, "dispatch failed");
            }
        }

        self.metrics.set_inflight(self.ctx.inflight_count()?);
        Ok(())
    }

    async fn dispatch_one(self: &Arc<Self>, task_run_id: TaskRunId, task_id: TaskId) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            self.settle_unstarted(
                task_run_id,
                None,
                &Error::TaskNotFound { task_id },
                TransitionReason::ExecutionFailed,
            )
            .await;
            return Ok(());
        };

        let Some(executor) = self.registry.get(task.kind) else {
            // Registration is a deployment concern; the run fails but the
            // scheduler keeps going.
            self.settle_unstarted(
                task_run_id,
                Some(&task),
                &Error::MissingExecutor {
                    kind: task.kind.to_string(),
                },
                TransitionReason::ExecutorMissing,
            )
            .await;
            return Ok(());
        };

        if task.kind.is_sequential()
            && !self
                .ctx
                .try_occupy_sequential(task.instance_id, &task.database_name)?
        {
            // Another migrate-class run holds this database. Put the claim
            // back; the run stays RUNNING and a later pass retries.
            self.store.release_claim(task_run_id).await?;
            self.metrics.record_dispatch("blocked");
            tracing::debug!(
                task_run_id = %task_run_id,
                database = %task.database_name,
                "sequential slot occupied, dispatch deferred"
            );
            return Ok(());
        }

        let cancel = self.ctx.register_run(task_run_id)?;
        self.exec_ctx
            .log(task_run_id, format!("executor started ({})", task.kind))
            .await;
        self.metrics.record_dispatch("dispatched");

        let span = task_run_span("execute", &task_run_id.to_string(), task.kind.as_label());
        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                // Panic boundary: a panicking executor fails its run,
                // nothing else.
                let outcome = std::panic::AssertUnwindSafe(executor.run_once(
                    &this.exec_ctx,
                    cancel,
                    &task,
                    task_run_id,
                ))
                .catch_unwind()
                .await;

                this.settle(task_run_id, &task, outcome).await;
            }
            .instrument(span),
        );

        Ok(())
    }

    /// Settles a run that never reached an executor.
    async fn settle_unstarted(
        &self,
        task_run_id: TaskRunId,
        task: Option<&Task>,
        error: &Error,
        reason: TransitionReason,
    ) {
        tracing::error!(task_run_id = %task_run_id, %error, "task run failed before execution");
        self.finish_run_state(
            task_run_id,
            TaskRunState::Failed,
            reason,
            &TaskRunResult::with_detail(error.to_string()),
        )
        .await;
        if let Some(task) = task {
            if let Err(error) = self.notifier.record_failure(task.plan_id, task.id) {
                tracing::warn!(%error, "failed to record failure notification");
            }
        }
    }

    /// Settles a finished (or panicked) execution.
    async fn settle(
        self: &Arc<Self>,
        task_run_id: TaskRunId,
        task: &Task,
        outcome: std::result::Result<Result<TaskRunResult>, Box<dyn std::any::Any + Send>>,
    ) {
        let (target, reason, result) = match outcome {
            Ok(Ok(result)) => (
                TaskRunState::Done,
                TransitionReason::ExecutionSucceeded,
                result,
            ),
            Ok(Err(error)) if error.is_cancellation() => {
                let reason = if self.ctx.shutdown_token().is_cancelled() {
                    TransitionReason::SchedulerShutdown
                } else {
                    TransitionReason::UserRequested
                };
                (
                    TaskRunState::Canceled,
                    reason,
                    TaskRunResult::with_detail("execution cancelled"),
                )
            }
            // Failure detail carries the executor error verbatim so the
            // operator sees the database's words, not a paraphrase.
            Ok(Err(error)) => (
                TaskRunState::Failed,
                TransitionReason::ExecutionFailed,
                TaskRunResult::with_detail(error.to_string()),
            ),
            Err(panic) => {
                let error = Error::ExecutorPanic {
                    message: panic_message(panic.as_ref()),
                };
                tracing::error!(task_run_id = %task_run_id, %error, "executor panicked");
                (
                    TaskRunState::Failed,
                    TransitionReason::ExecutorPanicked,
                    TaskRunResult::with_detail(error.to_string()),
                )
            }
        };

        self.finish_run_state(task_run_id, target, reason, &result)
            .await;

        if let Err(error) = self.ctx.finish_run(task_run_id) {
            tracing::warn!(task_run_id = %task_run_id, %error, "failed to clear run bookkeeping");
        }
        if task.kind.is_sequential() {
            if let Err(error) = self
                .ctx
                .release_sequential(task.instance_id, &task.database_name)
            {
                tracing::warn!(%error, "failed to release sequential slot");
            }
        }
        if let Ok(count) = self.ctx.inflight_count() {
            self.metrics.set_inflight(count);
        }

        match target {
            TaskRunState::Done => {
                if let Err(error) = self.notifier.record_success(task.plan_id).await {
                    tracing::warn!(%error, "completion notification check failed");
                }
            }
            TaskRunState::Failed => {
                if let Err(error) = self.notifier.record_failure(task.plan_id, task.id) {
                    tracing::warn!(%error, "failed to record failure notification");
                }
            }
            _ => {}
        }

        // Finishing a run can unblock dependents (promotion) and deferred
        // sequential runs (a future dispatch tick picks those up).
        self.promotion_tickle.tickle();
    }

    /// Applies the terminal transition and records the result.
    async fn finish_run_state(
        &self,
        task_run_id: TaskRunId,
        target: TaskRunState,
        reason: TransitionReason,
        result: &TaskRunResult,
    ) {
        match self
            .store
            .cas_task_run_state(task_run_id, TaskRunState::Running, target, reason)
            .await
        {
            Ok(CasResult::Success) => {
                self.metrics.record_transition("RUNNING", &target.to_string());
            }
            Ok(CasResult::StateMismatch { actual }) => {
                tracing::warn!(
                    task_run_id = %task_run_id,
                    %actual,
                    intended = %target,
                    "run settled elsewhere first"
                );
                return;
            }
            Ok(CasResult::NotFound) => {
                tracing::error!(task_run_id = %task_run_id, "run vanished during settlement");
                return;
            }
            Err(error) => {
                tracing::error!(task_run_id = %task_run_id, %error, "terminal transition failed");
                return;
            }
        }

        if let Err(error) = self.store.record_task_run_result(task_run_id, result).await {
            tracing::warn!(task_run_id = %task_run_id, %error, "failed to record run result");
        }
        self.exec_ctx
            .log(
                task_run_id,
                format!("executor finished: {} ({target})", result.detail),
            )
            .await;

        if let Ok(Some(run)) = self.store.get_task_run(task_run_id).await {
            if let Some(duration) = run.duration() {
                if let Ok(duration) = duration.to_std() {
                    self.metrics
                        .observe_run_duration("task", &target.to_string(), duration);
                }
            }
        }

        let _ = self
            .store
            .append_task_run_log(&TaskRunLogEntry::new(
                task_run_id,
                format!("task run {target}: {reason}"),
            ))
            .await;
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverFactory, InMemoryDriverFactory};
    use crate::executor::Executor;
    use crate::ghost::{GhostConfig, GhostHandoffMap};
    use crate::plan::{ChangeKind, ChangeSpec, Plan, RolloutBuilder, TaskKind};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use strata_core::{InstanceId, ProjectId};
    use tokio_util::sync::CancellationToken;

    struct PanickingExecutor;

    #[async_trait]
    impl Executor for PanickingExecutor {
        async fn run_once(
            &self,
            _ctx: &ExecutionContext,
            _cancel: CancellationToken,
            _task: &Task,
            _task_run_id: TaskRunId,
        ) -> Result<TaskRunResult> {
            panic!("simulated executor bug");
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl Executor for HangingExecutor {
        async fn run_once(
            &self,
            _ctx: &ExecutionContext,
            cancel: CancellationToken,
            _task: &Task,
            _task_run_id: TaskRunId,
        ) -> Result<TaskRunResult> {
            cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }

    fn harness(registry: ExecutorRegistry) -> (Arc<DispatchLoop>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let drivers = Arc::new(InMemoryDriverFactory::new());
        let ctx = Arc::new(SchedulerContext::new());
        let sink = Arc::new(crate::notify::RecordingSink::new());
        let notifier: Arc<Notifier> = Arc::new(PipelineNotifier::new(
            Arc::clone(&store) as Arc<dyn Store>,
            sink as Arc<dyn NotificationSink>,
            Duration::from_millis(50),
        ));
        let exec_ctx = ExecutionContext {
            store: Arc::clone(&store) as Arc<dyn Store>,
            drivers: Arc::clone(&drivers) as Arc<dyn DriverFactory>,
            handoffs: Arc::new(GhostHandoffMap::new()),
            ghost: GhostConfig::default(),
            metrics: FlowMetrics::new(),
        };
        let (promotion_tickle, _rx) = Tickle::channel();
        let dispatch = Arc::new(DispatchLoop::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(registry),
            exec_ctx,
            ctx,
            notifier,
            "test-replica".into(),
            Duration::from_secs(10),
            promotion_tickle,
        ));
        (dispatch, store)
    }

    async fn seed_running(
        store: &InMemoryStore,
        kind: ChangeKind,
    ) -> (Plan, Vec<crate::plan::Task>, Vec<TaskRunId>) {
        let plan = Plan::new(
            ProjectId::generate(),
            "dispatch-test",
            vec![ChangeSpec {
                kind,
                instance_id: InstanceId::generate(),
                database_name: "orders".into(),
                statement: "ALTER TABLE orders ADD COLUMN note TEXT".into(),
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
        let mut run_ids = Vec::new();
        // Promote only runs without dependencies (the sync half of pairs).
        for (task, run) in rollout.tasks.iter().zip(&rollout.task_runs) {
            if task.depends_on.is_empty() {
                store
                    .cas_task_run_state(
                        run.id,
                        TaskRunState::Pending,
                        TaskRunState::Running,
                        TransitionReason::Promoted,
                    )
                    .await
                    .unwrap();
                run_ids.push(run.id);
            }
        }
        (plan, rollout.tasks, run_ids)
    }

    async fn wait_for_state(
        store: &InMemoryStore,
        run_id: TaskRunId,
        state: TaskRunState,
    ) -> crate::taskrun::TaskRun {
        for _ in 0..200 {
            let run = store.get_task_run(run_id).await.unwrap().unwrap();
            if run.state == state {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached {state}");
    }

    #[tokio::test]
    async fn missing_executor_fails_the_run_not_the_scheduler() {
        let (dispatch, store) = harness(ExecutorRegistry::new());
        let (_plan, _tasks, run_ids) = seed_running(&store, ChangeKind::DdlMigrate).await;

        dispatch.run_pass().await.unwrap();

        let run = store.get_task_run(run_ids[0]).await.unwrap().unwrap();
        assert_eq!(run.state, TaskRunState::Failed);
        assert!(run
            .result
            .unwrap()
            .detail
            .contains("no executor registered"));
        assert_eq!(
            run.last_transition_reason,
            Some(TransitionReason::ExecutorMissing)
        );
    }

    #[tokio::test]
    async fn executor_panic_is_recovered_and_run_failed() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskKind::DdlMigrate, Arc::new(PanickingExecutor));
        let (dispatch, store) = harness(registry);
        let (_plan, _tasks, run_ids) = seed_running(&store, ChangeKind::DdlMigrate).await;

        dispatch.run_pass().await.unwrap();

        let run = wait_for_state(&store, run_ids[0], TaskRunState::Failed).await;
        assert!(run.result.unwrap().detail.contains("simulated executor bug"));
        assert_eq!(
            run.last_transition_reason,
            Some(TransitionReason::ExecutorPanicked)
        );
        // The dispatch loop is still usable afterwards.
        dispatch.run_pass().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_lands_run_canceled() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskKind::DdlMigrate, Arc::new(HangingExecutor));
        let (dispatch, store) = harness(registry);
        let (_plan, _tasks, run_ids) = seed_running(&store, ChangeKind::DdlMigrate).await;

        dispatch.run_pass().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatch.ctx.cancel_run(run_ids[0]).unwrap());

        let run = wait_for_state(&store, run_ids[0], TaskRunState::Canceled).await;
        assert_eq!(
            run.last_transition_reason,
            Some(TransitionReason::UserRequested)
        );
    }

    #[tokio::test]
    async fn sequential_tasks_on_same_database_do_not_overlap() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskKind::DdlMigrate, Arc::new(HangingExecutor));
        let (dispatch, store) = harness(registry);

        // Two DDL tasks against the same database, both already RUNNING.
        let instance = InstanceId::generate();
        let spec = |v: &str| ChangeSpec {
            kind: ChangeKind::DdlMigrate,
            instance_id: instance,
            database_name: "orders".into(),
            statement: "ALTER TABLE t ADD COLUMN c INT".into(),
            schema_version: Some(v.into()),
            environment: "prod".into(),
            run_at: None,
        };
        let plan = Plan::new(ProjectId::generate(), "seq", vec![spec("0001"), spec("0002")]);
        store.save_plan(&plan).await.unwrap();
        let rollout = RolloutBuilder::new(&plan).build().unwrap();
        store
            .save_rollout(&rollout.pipeline, &rollout.tasks, &rollout.task_runs)
            .await
            .unwrap();
        for run in &rollout.task_runs {
            store
                .cas_task_run_state(
                    run.id,
                    TaskRunState::Pending,
                    TaskRunState::Running,
                    TransitionReason::Promoted,
                )
                .await
                .unwrap();
        }

        dispatch.run_pass().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Exactly one executor is in flight; the other run lost admission
        // and sits RUNNING-unclaimed.
        assert_eq!(dispatch.ctx.inflight_count().unwrap(), 1);
        let running = store
            .list_task_runs_by_state(TaskRunState::Running)
            .await
            .unwrap();
        let unclaimed: Vec<_> = running.iter().filter(|r| r.claimed_by.is_none()).collect();
        assert_eq!(unclaimed.len(), 1);

        // Re-running the pass does not sneak the second one in.
        dispatch.run_pass().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatch.ctx.inflight_count().unwrap(), 1);

        // Cancel the first; the second now gets the slot.
        let inflight_id = running
            .iter()
            .find(|r| r.claimed_by.is_some())
            .map(|r| r.id)
            .unwrap();
        dispatch.ctx.cancel_run(inflight_id).unwrap();
        wait_for_state(&store, inflight_id, TaskRunState::Canceled).await;

        dispatch.run_pass().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatch.ctx.inflight_count().unwrap(), 1);
    }
}
