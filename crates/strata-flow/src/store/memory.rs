//! In-memory store implementation.
//!
//! Backs tests and single-process deployments. Every method takes the
//! collection locks for the full duration of its critical section, which
//! gives the same atomicity the trait demands of database-backed
//! implementations.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_core::{InstanceId, PipelineId, PlanId, TaskId, TaskRunId};

use super::{CasResult, Store};
use crate::error::{Error, Result};
use crate::notify::NotificationKind;
use crate::plan::{Issue, Plan, PlanCheckRun, Pipeline, Task};
use crate::taskrun::{
    TaskRun, TaskRunLogEntry, TaskRunResult, TaskRunState, TransitionReason,
};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory [`Store`] backed by `RwLock`-guarded maps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    plans: RwLock<HashMap<PlanId, Plan>>,
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    task_runs: RwLock<HashMap<TaskRunId, TaskRun>>,
    logs: RwLock<HashMap<TaskRunId, Vec<TaskRunLogEntry>>>,
    issues: RwLock<HashMap<PlanId, Issue>>,
    plan_checks: RwLock<HashMap<PlanId, Vec<PlanCheckRun>>>,
    notification_claims: RwLock<HashSet<(PlanId, NotificationKind, DateTime<Utc>)>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of task runs held, across all states.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_run_count(&self) -> Result<usize> {
        let runs = self.task_runs.read().map_err(poison_err)?;
        Ok(runs.len())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let plans = self.plans.read().map_err(poison_err)?;
        Ok(plans.get(&plan_id).cloned())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().map_err(poison_err)?;
        plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn mark_plan_has_rollout(&self, plan_id: PlanId) -> Result<bool> {
        let mut plans = self.plans.write().map_err(poison_err)?;
        let plan = plans
            .get_mut(&plan_id)
            .ok_or(Error::PlanNotFound { plan_id })?;
        if plan.has_rollout {
            return Ok(false);
        }
        plan.has_rollout = true;
        Ok(true)
    }

    async fn save_rollout(
        &self,
        pipeline: &Pipeline,
        tasks: &[Task],
        task_runs: &[TaskRun],
    ) -> Result<()> {
        let mut pipelines = self.pipelines.write().map_err(poison_err)?;
        let mut task_map = self.tasks.write().map_err(poison_err)?;
        let mut run_map = self.task_runs.write().map_err(poison_err)?;

        pipelines.insert(pipeline.id, pipeline.clone());
        for task in tasks {
            task_map.insert(task.id, task.clone());
        }
        for run in task_runs {
            run_map.insert(run.id, run.clone());
        }
        Ok(())
    }

    async fn get_pipeline_by_plan(&self, plan_id: PlanId) -> Result<Option<Pipeline>> {
        let pipelines = self.pipelines.read().map_err(poison_err)?;
        Ok(pipelines.values().find(|p| p.plan_id == plan_id).cloned())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.get(&task_id).cloned())
    }

    async fn list_tasks_by_plan(&self, plan_id: PlanId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.plan_id == plan_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    async fn create_task_runs(&self, runs: &[TaskRun]) -> Result<()> {
        let mut run_map = self.task_runs.write().map_err(poison_err)?;
        for run in runs {
            run_map.insert(run.id, run.clone());
        }
        Ok(())
    }

    async fn get_task_run(&self, task_run_id: TaskRunId) -> Result<Option<TaskRun>> {
        let runs = self.task_runs.read().map_err(poison_err)?;
        Ok(runs.get(&task_run_id).cloned())
    }

    async fn list_task_runs_by_state(&self, state: TaskRunState) -> Result<Vec<TaskRun>> {
        let runs = self.task_runs.read().map_err(poison_err)?;
        let mut out: Vec<TaskRun> = runs
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn latest_task_run_for_task(&self, task_id: TaskId) -> Result<Option<TaskRun>> {
        let runs = self.task_runs.read().map_err(poison_err)?;
        // ULIDs sort by creation time, so max by ID is the newest run.
        Ok(runs
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn cas_task_run_state(
        &self,
        task_run_id: TaskRunId,
        expected: TaskRunState,
        target: TaskRunState,
        reason: TransitionReason,
    ) -> Result<CasResult> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let Some(run) = runs.get_mut(&task_run_id) else {
            return Ok(CasResult::NotFound);
        };
        if run.state != expected {
            return Ok(CasResult::StateMismatch { actual: run.state });
        }
        run.transition_to(target, reason)?;
        if target.is_terminal() {
            run.claimed_by = None;
        }
        Ok(CasResult::Success)
    }

    async fn claim_available_task_runs(
        &self,
        claimant: &str,
    ) -> Result<Vec<(TaskRunId, TaskId)>> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let mut claimed = Vec::new();
        for run in runs.values_mut() {
            if run.state == TaskRunState::Running && run.claimed_by.is_none() {
                run.claimed_by = Some(claimant.to_owned());
                claimed.push((run.id, run.task_id));
            }
        }
        claimed.sort_by_key(|(run_id, _)| *run_id);
        Ok(claimed)
    }

    async fn release_claim(&self, task_run_id: TaskRunId) -> Result<()> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let run = runs
            .get_mut(&task_run_id)
            .ok_or(Error::TaskRunNotFound { task_run_id })?;
        run.claimed_by = None;
        Ok(())
    }

    async fn record_waiting_cause(&self, task_run_id: TaskRunId, cause: &str) -> Result<bool> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let run = runs
            .get_mut(&task_run_id)
            .ok_or(Error::TaskRunNotFound { task_run_id })?;
        let changed = run.waiting_cause.as_deref() != Some(cause);
        run.waiting_cause = Some(cause.to_owned());
        Ok(changed)
    }

    async fn record_task_run_result(
        &self,
        task_run_id: TaskRunId,
        result: &TaskRunResult,
    ) -> Result<()> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let run = runs
            .get_mut(&task_run_id)
            .ok_or(Error::TaskRunNotFound { task_run_id })?;
        run.result = Some(result.clone());
        Ok(())
    }

    async fn record_task_run_progress(
        &self,
        task_run_id: TaskRunId,
        copied: u64,
        total: u64,
    ) -> Result<()> {
        let mut runs = self.task_runs.write().map_err(poison_err)?;
        let run = runs
            .get_mut(&task_run_id)
            .ok_or(Error::TaskRunNotFound { task_run_id })?;
        run.progress = Some((copied, total));
        Ok(())
    }

    async fn find_blocking_task_by_version(
        &self,
        plan_id: PlanId,
        instance_id: InstanceId,
        database_name: &str,
        schema_version: &str,
    ) -> Result<Option<TaskId>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        let runs = self.task_runs.read().map_err(poison_err)?;

        let mut candidates: Vec<&Task> = tasks
            .values()
            .filter(|t| {
                t.plan_id == plan_id
                    && t.instance_id == instance_id
                    && t.database_name == database_name
                    && t.schema_version
                        .as_deref()
                        .is_some_and(|v| v < schema_version)
            })
            .collect();
        candidates.sort_by(|a, b| a.schema_version.cmp(&b.schema_version));

        for task in candidates {
            let latest = runs
                .values()
                .filter(|r| r.task_id == task.id)
                .max_by_key(|r| r.id);
            // Only a live run blocks; a retry creates a fresh run that
            // blocks again on its own.
            if latest.is_some_and(|r| !r.state.is_terminal()) {
                return Ok(Some(task.id));
            }
        }
        Ok(None)
    }

    async fn append_task_run_log(&self, entry: &TaskRunLogEntry) -> Result<()> {
        let mut logs = self.logs.write().map_err(poison_err)?;
        logs.entry(entry.task_run_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_task_run_logs(&self, task_run_id: TaskRunId) -> Result<Vec<TaskRunLogEntry>> {
        let logs = self.logs.read().map_err(poison_err)?;
        Ok(logs.get(&task_run_id).cloned().unwrap_or_default())
    }

    async fn claim_notification(
        &self,
        plan_id: PlanId,
        kind: NotificationKind,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let mut claims = self.notification_claims.write().map_err(poison_err)?;
        Ok(claims.insert((plan_id, kind, window_start)))
    }

    async fn get_issue_by_plan(&self, plan_id: PlanId) -> Result<Option<Issue>> {
        let issues = self.issues.read().map_err(poison_err)?;
        Ok(issues.get(&plan_id).cloned())
    }

    async fn save_issue(&self, issue: &Issue) -> Result<()> {
        let mut issues = self.issues.write().map_err(poison_err)?;
        issues.insert(issue.plan_id, issue.clone());
        Ok(())
    }

    async fn latest_plan_check_run(&self, plan_id: PlanId) -> Result<Option<PlanCheckRun>> {
        let checks = self.plan_checks.read().map_err(poison_err)?;
        Ok(checks
            .get(&plan_id)
            .and_then(|runs| runs.last())
            .cloned())
    }

    async fn save_plan_check_run(&self, check: &PlanCheckRun) -> Result<()> {
        let mut checks = self.plan_checks.write().map_err(poison_err)?;
        checks.entry(check.plan_id).or_default().push(check.clone());
        Ok(())
    }
}
