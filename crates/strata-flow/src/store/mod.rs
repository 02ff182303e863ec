//! Storage abstraction for plans, pipelines, tasks, and task runs.
//!
//! The scheduler is written against the [`Store`] trait so that production
//! deployments can back it with a database while tests use the in-memory
//! implementation. All scheduling correctness rests on two primitives here:
//!
//! - [`Store::cas_task_run_state`]: compare-and-swap on a run's state, so
//!   concurrent schedulers racing on the same run resolve to exactly one
//!   winner.
//! - [`Store::claim_available_task_runs`]: atomically claims every `RUNNING`,
//!   unclaimed run for one scheduler replica. Two replicas calling this
//!   concurrently receive disjoint sets.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_core::{InstanceId, PlanId, TaskId, TaskRunId};

use crate::error::Result;
use crate::notify::NotificationKind;
use crate::plan::{Issue, Plan, PlanCheckRun, Pipeline, Task};
use crate::taskrun::{
    TaskRun, TaskRunLogEntry, TaskRunResult, TaskRunState, TransitionReason,
};

pub use memory::InMemoryStore;

/// The result of a compare-and-swap state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Success,
    /// The task run does not exist.
    NotFound,
    /// The run's current state did not match the expected state.
    StateMismatch {
        /// The state actually observed.
        actual: TaskRunState,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Persistent store for scheduler state.
///
/// Implementations must make every method atomic with respect to the others;
/// the scheduler performs no external locking.
#[async_trait]
pub trait Store: Send + Sync {
    // Plans and pipelines.

    /// Loads a plan by ID.
    async fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>>;

    /// Saves (inserts or replaces) a plan.
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    /// Atomically flips a plan's `has_rollout` flag from false to true.
    ///
    /// Returns true if this caller won the flip; false if the flag was
    /// already set (another replica materialized the rollout first).
    async fn mark_plan_has_rollout(&self, plan_id: PlanId) -> Result<bool>;

    /// Saves a pipeline together with its tasks and initial task runs, as
    /// one atomic write.
    async fn save_rollout(
        &self,
        pipeline: &Pipeline,
        tasks: &[Task],
        task_runs: &[TaskRun],
    ) -> Result<()>;

    /// Loads the pipeline materialized from a plan, if any.
    async fn get_pipeline_by_plan(&self, plan_id: PlanId) -> Result<Option<Pipeline>>;

    // Tasks and task runs.

    /// Loads a task by ID.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Lists all tasks belonging to a plan's pipeline.
    async fn list_tasks_by_plan(&self, plan_id: PlanId) -> Result<Vec<Task>>;

    /// Inserts new task runs.
    async fn create_task_runs(&self, runs: &[TaskRun]) -> Result<()>;

    /// Loads a task run by ID.
    async fn get_task_run(&self, task_run_id: TaskRunId) -> Result<Option<TaskRun>>;

    /// Lists all task runs currently in the given state, oldest first.
    async fn list_task_runs_by_state(&self, state: TaskRunState) -> Result<Vec<TaskRun>>;

    /// Returns the most recently created run for a task, if any.
    async fn latest_task_run_for_task(&self, task_id: TaskId) -> Result<Option<TaskRun>>;

    /// Compare-and-swap on a run's state.
    ///
    /// Applies `expected -> target` only if the run's current state equals
    /// `expected`, validating the transition through the state machine and
    /// stamping timestamps and the transition reason.
    async fn cas_task_run_state(
        &self,
        task_run_id: TaskRunId,
        expected: TaskRunState,
        target: TaskRunState,
        reason: TransitionReason,
    ) -> Result<CasResult>;

    /// Atomically claims every `RUNNING`, unclaimed task run for `claimant`.
    ///
    /// Returns the claimed (run, task) ID pairs. Concurrent calls with
    /// different claimants receive disjoint sets.
    async fn claim_available_task_runs(
        &self,
        claimant: &str,
    ) -> Result<Vec<(TaskRunId, TaskId)>>;

    /// Releases a claim without changing the run's state, so another pass
    /// (or replica) can pick the run up again.
    async fn release_claim(&self, task_run_id: TaskRunId) -> Result<()>;

    /// Records why a pending run is still waiting.
    ///
    /// Returns true if the cause changed from the previously recorded one,
    /// so callers can log transitions without repeating themselves every
    /// tick.
    async fn record_waiting_cause(&self, task_run_id: TaskRunId, cause: &str) -> Result<bool>;

    /// Records the durable outcome of a finished run.
    async fn record_task_run_result(
        &self,
        task_run_id: TaskRunId,
        result: &TaskRunResult,
    ) -> Result<()>;

    /// Records row-copy progress for a long-running run.
    async fn record_task_run_progress(
        &self,
        task_run_id: TaskRunId,
        copied: u64,
        total: u64,
    ) -> Result<()>;

    /// Finds a task on the same (plan, instance, database) carrying a
    /// strictly smaller schema version whose latest run is still
    /// non-terminal.
    ///
    /// The promotion pass uses this to apply migrations in version order.
    /// A terminally failed or cancelled earlier migration stops blocking;
    /// retrying it creates a fresh non-terminal run that blocks again.
    async fn find_blocking_task_by_version(
        &self,
        plan_id: PlanId,
        instance_id: InstanceId,
        database_name: &str,
        schema_version: &str,
    ) -> Result<Option<TaskId>>;

    // Execution logs.

    /// Appends an entry to a run's execution log.
    async fn append_task_run_log(&self, entry: &TaskRunLogEntry) -> Result<()>;

    /// Lists a run's execution log, oldest first.
    async fn list_task_run_logs(&self, task_run_id: TaskRunId) -> Result<Vec<TaskRunLogEntry>>;

    // Notifications and review surface.

    /// Atomically claims the right to send one notification of `kind` for a
    /// plan at `window_start`.
    ///
    /// Returns true if this caller won the claim. Repeat claims for the same
    /// (plan, kind, window) lose, which is what makes notifications
    /// at-most-once across replicas.
    async fn claim_notification(
        &self,
        plan_id: PlanId,
        kind: NotificationKind,
        window_start: DateTime<Utc>,
    ) -> Result<bool>;

    /// Loads the review issue bound to a plan, if any.
    async fn get_issue_by_plan(&self, plan_id: PlanId) -> Result<Option<Issue>>;

    /// Saves a review issue.
    async fn save_issue(&self, issue: &Issue) -> Result<()>;

    /// Returns the most recent plan-check run for a plan, if any.
    async fn latest_plan_check_run(&self, plan_id: PlanId) -> Result<Option<PlanCheckRun>>;

    /// Saves a plan-check run.
    async fn save_plan_check_run(&self, check: &PlanCheckRun) -> Result<()>;
}
