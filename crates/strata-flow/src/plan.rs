//! Plans, pipelines, and rollout materialization.
//!
//! A [`Plan`] is a proposed, project-scoped set of database changes. When a
//! plan passes review it is materialized exactly once into a [`Pipeline`]
//! (the rollout): one [`Stage`] per environment, one or more [`Task`]s per
//! change spec. Online schema changes expand into a sync/cutover task pair
//! linked through `depends_on` so the generic scheduler can sequence the two
//! halves without protocol-specific logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{InstanceId, IssueId, PipelineId, PlanId, ProjectId, StageId, TaskId};

use crate::error::{Error, Result};
use crate::taskrun::TaskRun;

/// The kind of change a plan spec requests for one target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Schema change applied directly (DDL).
    DdlMigrate,
    /// Data change applied directly (DML).
    DmlMigrate,
    /// Online schema change via the gh-ost shadow-table protocol.
    GhostMigrate,
    /// Create a new database on the instance.
    CreateDatabase,
    /// Export data from the database.
    Export,
    /// Take a backup of the database.
    Backup,
    /// Restore the database to a point in time.
    PointInTimeRecovery,
}

/// The kind of work a single task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Apply a schema migration statement.
    DdlMigrate,
    /// Apply a data migration statement.
    DmlMigrate,
    /// gh-ost phase one: shadow-table row copy up to the postpone point.
    GhostSync,
    /// gh-ost phase two: lock-bounded atomic rename.
    GhostCutover,
    /// Create a database.
    CreateDatabase,
    /// Export data.
    Export,
    /// Take a backup.
    Backup,
    /// PITR phase one: restore into a staging database.
    PitrRestore,
    /// PITR phase two: swap the staging database in.
    PitrCutover,
}

impl TaskKind {
    /// Returns true for migrate-class kinds that mutate schema or data and
    /// must therefore execute one-at-a-time per (instance, database).
    #[must_use]
    pub const fn is_sequential(&self) -> bool {
        matches!(
            self,
            Self::DdlMigrate
                | Self::DmlMigrate
                | Self::GhostSync
                | Self::GhostCutover
                | Self::PitrRestore
                | Self::PitrCutover
        )
    }

    /// Returns a label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::DdlMigrate => "ddl_migrate",
            Self::DmlMigrate => "dml_migrate",
            Self::GhostSync => "ghost_sync",
            Self::GhostCutover => "ghost_cutover",
            Self::CreateDatabase => "create_database",
            Self::Export => "export",
            Self::Backup => "backup",
            Self::PitrRestore => "pitr_restore",
            Self::PitrCutover => "pitr_cutover",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DdlMigrate => write!(f, "DDL_MIGRATE"),
            Self::DmlMigrate => write!(f, "DML_MIGRATE"),
            Self::GhostSync => write!(f, "GHOST_SYNC"),
            Self::GhostCutover => write!(f, "GHOST_CUTOVER"),
            Self::CreateDatabase => write!(f, "CREATE_DATABASE"),
            Self::Export => write!(f, "EXPORT"),
            Self::Backup => write!(f, "BACKUP"),
            Self::PitrRestore => write!(f, "PITR_RESTORE"),
            Self::PitrCutover => write!(f, "PITR_CUTOVER"),
        }
    }
}

/// One target database's worth of change within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSpec {
    /// The kind of change requested.
    pub kind: ChangeKind,
    /// Target instance.
    pub instance_id: InstanceId,
    /// Target database on the instance.
    pub database_name: String,
    /// The statement to apply (DDL/DML; empty for backup/export).
    pub statement: String,
    /// Schema version string; migrations on one database apply in
    /// non-decreasing version order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Environment the target database belongs to (e.g. "staging", "prod").
    pub environment: String,
    /// Earliest allowed start for the change; `None` = immediately eligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

/// A unit of proposed change for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Human-readable name.
    pub name: String,
    /// One spec per target database.
    pub specs: Vec<ChangeSpec>,
    /// Whether a rollout has been materialized for this plan.
    ///
    /// Monotonic: transitions false -> true exactly once and never reverts.
    pub has_rollout: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Creates a new plan with no rollout.
    #[must_use]
    pub fn new(project_id: ProjectId, name: impl Into<String>, specs: Vec<ChangeSpec>) -> Self {
        Self {
            id: PlanId::generate(),
            project_id,
            name: name.into(),
            specs,
            has_rollout: false,
            created_at: Utc::now(),
        }
    }
}

/// The execution graph materialized from a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Pipeline identifier.
    pub id: PipelineId,
    /// The plan this pipeline was materialized from.
    pub plan_id: PlanId,
    /// Human-readable name.
    pub name: String,
    /// Stages, one per environment, in rollout order.
    pub stages: Vec<Stage>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A pipeline stage grouping the tasks of one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Stage identifier.
    pub id: StageId,
    /// Environment tag.
    pub environment: String,
    /// Tasks belonging to this stage.
    pub task_ids: Vec<TaskId>,
}

/// One database-target unit of work within a pipeline.
///
/// Created once when a plan is materialized; immutable thereafter except for
/// status projections carried by its task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Owning plan (denormalized for ordering and notification queries).
    pub plan_id: PlanId,
    /// Owning pipeline.
    pub pipeline_id: PipelineId,
    /// Owning stage.
    pub stage_id: StageId,
    /// The kind of work to perform.
    pub kind: TaskKind,
    /// Target instance.
    pub instance_id: InstanceId,
    /// Target database name.
    pub database_name: String,
    /// The statement to apply, if any.
    pub statement: String,
    /// Schema version string for migrate-class tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Tasks that must reach terminal success before this one may run.
    /// The gh-ost cutover task references its sync task here.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Environment tag.
    pub environment: String,
    /// Earliest allowed start; `None` = immediately eligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

/// Status of a review issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    /// The issue is open and may proceed through review.
    Open,
    /// The issue is closed; no rollout may be created.
    Closed,
}

/// The review issue bound to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Issue identifier.
    pub id: IssueId,
    /// The plan under review.
    pub plan_id: PlanId,
    /// Current status.
    pub status: IssueStatus,
    /// Whether the required approvals have all been granted.
    pub approval_satisfied: bool,
}

/// Severity of a plan-check finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational.
    Info,
    /// Advisory; does not block a rollout.
    Warning,
    /// Blocking; a rollout must not be created.
    Error,
}

/// One finding produced by a plan check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCheckFinding {
    /// Severity of the finding.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

/// Completion state of a plan-check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanCheckState {
    /// Still running.
    Running,
    /// Finished; findings are final.
    Done,
    /// The check itself failed to complete.
    Failed,
}

/// One execution of the advisory checks against a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCheckRun {
    /// The plan that was checked.
    pub plan_id: PlanId,
    /// Completion state.
    pub state: PlanCheckState,
    /// Findings, if any.
    #[serde(default)]
    pub findings: Vec<PlanCheckFinding>,
    /// When the check ran.
    pub created_at: DateTime<Utc>,
}

impl PlanCheckRun {
    /// Returns true if the check finished without blocking findings.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.state == PlanCheckState::Done
            && !self.findings.iter().any(|f| f.severity == Severity::Error)
    }
}

/// Materializes a plan into a pipeline, its tasks, and the initial pending
/// task runs.
///
/// Stages are created per environment in first-appearance order. gh-ost and
/// PITR specs expand into a two-task pair where the second task depends on
/// the first.
#[derive(Debug)]
pub struct RolloutBuilder<'a> {
    plan: &'a Plan,
}

/// The output of rollout materialization.
#[derive(Debug)]
pub struct Rollout {
    /// The materialized pipeline.
    pub pipeline: Pipeline,
    /// All tasks across stages (flat, store-ready).
    pub tasks: Vec<Task>,
    /// The initial `PENDING` task run for every task.
    pub task_runs: Vec<TaskRun>,
}

impl<'a> RolloutBuilder<'a> {
    /// Creates a builder for the given plan.
    #[must_use]
    pub const fn new(plan: &'a Plan) -> Self {
        Self { plan }
    }

    /// Builds the rollout.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan has no specs.
    pub fn build(self) -> Result<Rollout> {
        if self.plan.specs.is_empty() {
            return Err(Error::configuration(format!(
                "plan {} has no change specs to materialize",
                self.plan.id
            )));
        }

        let pipeline_id = PipelineId::generate();
        let mut stages: Vec<Stage> = Vec::new();
        let mut tasks: Vec<Task> = Vec::new();

        for spec in &self.plan.specs {
            let stage_id = match stages.iter().position(|s| s.environment == spec.environment) {
                Some(idx) => stages[idx].id,
                None => {
                    let stage = Stage {
                        id: StageId::generate(),
                        environment: spec.environment.clone(),
                        task_ids: Vec::new(),
                    };
                    let id = stage.id;
                    stages.push(stage);
                    id
                }
            };

            let new_tasks = Self::tasks_for_spec(self.plan.id, pipeline_id, stage_id, spec);
            let stage = stages
                .iter_mut()
                .find(|s| s.id == stage_id)
                .ok_or_else(|| Error::storage("stage vanished during materialization"))?;
            for task in &new_tasks {
                stage.task_ids.push(task.id);
            }
            tasks.extend(new_tasks);
        }

        let task_runs = tasks.iter().map(|t| TaskRun::pending(t.id, t.run_at)).collect();

        Ok(Rollout {
            pipeline: Pipeline {
                id: pipeline_id,
                plan_id: self.plan.id,
                name: format!("rollout for {}", self.plan.name),
                stages,
                created_at: Utc::now(),
            },
            tasks,
            task_runs,
        })
    }

    fn tasks_for_spec(
        plan_id: PlanId,
        pipeline_id: PipelineId,
        stage_id: StageId,
        spec: &ChangeSpec,
    ) -> Vec<Task> {
        let base = |kind: TaskKind| Task {
            id: TaskId::generate(),
            plan_id,
            pipeline_id,
            stage_id,
            kind,
            instance_id: spec.instance_id,
            database_name: spec.database_name.clone(),
            statement: spec.statement.clone(),
            schema_version: spec.schema_version.clone(),
            depends_on: Vec::new(),
            environment: spec.environment.clone(),
            run_at: spec.run_at,
        };

        match spec.kind {
            ChangeKind::DdlMigrate => vec![base(TaskKind::DdlMigrate)],
            ChangeKind::DmlMigrate => vec![base(TaskKind::DmlMigrate)],
            ChangeKind::CreateDatabase => vec![base(TaskKind::CreateDatabase)],
            ChangeKind::Export => vec![base(TaskKind::Export)],
            ChangeKind::Backup => vec![base(TaskKind::Backup)],
            ChangeKind::GhostMigrate => {
                let sync = base(TaskKind::GhostSync);
                let mut cutover = base(TaskKind::GhostCutover);
                cutover.depends_on = vec![sync.id];
                vec![sync, cutover]
            }
            ChangeKind::PointInTimeRecovery => {
                let restore = base(TaskKind::PitrRestore);
                let mut cutover = base(TaskKind::PitrCutover);
                cutover.depends_on = vec![restore.id];
                vec![restore, cutover]
            }
        }
    }
}
