//! Task executors.
//!
//! The dispatch loop resolves a claimed task run to an [`Executor`] through
//! the [`ExecutorRegistry`] and invokes [`Executor::run_once`] on a spawned
//! task. Executors are stateless; everything they need arrives through the
//! [`ExecutionContext`] and the task itself. Cancellation is cooperative:
//! the dispatch loop cancels the run's token and a well-behaved executor
//! returns [`Error::Cancelled`] promptly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use strata_core::TaskRunId;

use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::ghost::{GhostConfig, GhostCutoverExecutor, GhostHandoffMap, GhostSyncExecutor, RowCopier};
use crate::metrics::FlowMetrics;
use crate::plan::{Task, TaskKind};
use crate::store::Store;
use crate::taskrun::{TaskRunLogEntry, TaskRunResult};

/// Shared dependencies handed to every executor invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Persistent store for progress and execution logs.
    pub store: Arc<dyn Store>,
    /// Opens drivers for task targets.
    pub drivers: Arc<dyn DriverFactory>,
    /// Sync-to-cutover handoffs for online migrations.
    pub handoffs: Arc<GhostHandoffMap>,
    /// Default gh-ost tuning; statements may override via directives.
    pub ghost: GhostConfig,
    /// Metrics recorder.
    pub metrics: FlowMetrics,
}

impl ExecutionContext {
    /// Appends a line to the run's execution log, logging (not failing) on
    /// store errors so a flaky log write never kills a migration.
    pub async fn log(&self, task_run_id: TaskRunId, message: impl Into<String>) {
        let entry = TaskRunLogEntry::new(task_run_id, message);
        if let Err(error) = self.store.append_task_run_log(&entry).await {
            tracing::warn!(task_run_id = %task_run_id, %error, "failed to append task run log");
        }
    }
}

/// Runs one attempt of a task.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes the task once.
    ///
    /// Returning `Ok` lands the run `DONE`; [`Error::Cancelled`] lands it
    /// `CANCELED`; any other error lands it `FAILED` with the error text as
    /// the run's detail.
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult>;
}

/// Races a future against the cancellation token.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Generates a migration history identifier.
pub(crate) fn new_migration_id() -> String {
    Ulid::new().to_string()
}

/// Maps task kinds to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in executor registered, using
    /// the given row copier for gh-ost sync tasks.
    #[must_use]
    pub fn builtin(copier: Arc<dyn RowCopier>) -> Self {
        let mut registry = Self::new();
        registry.register(TaskKind::DdlMigrate, Arc::new(DdlMigrateExecutor));
        registry.register(TaskKind::DmlMigrate, Arc::new(DmlMigrateExecutor));
        registry.register(TaskKind::CreateDatabase, Arc::new(CreateDatabaseExecutor));
        registry.register(TaskKind::Export, Arc::new(ExportExecutor));
        registry.register(TaskKind::Backup, Arc::new(BackupExecutor));
        registry.register(TaskKind::GhostSync, Arc::new(GhostSyncExecutor::new(copier)));
        registry.register(TaskKind::GhostCutover, Arc::new(GhostCutoverExecutor));
        registry.register(TaskKind::PitrRestore, Arc::new(PitrRestoreExecutor));
        registry.register(TaskKind::PitrCutover, Arc::new(PitrCutoverExecutor));
        registry
    }

    /// Registers (or replaces) the executor for a kind.
    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn Executor>) {
        self.executors.insert(kind, executor);
    }

    /// Resolves the executor for a kind.
    #[must_use]
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Applies a DDL statement directly and refreshes the schema snapshot.
#[derive(Debug, Default)]
pub struct DdlMigrateExecutor;

#[async_trait]
impl Executor for DdlMigrateExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        ctx.log(task_run_id, format!("applying DDL to {}", task.database_name))
            .await;
        let affected = cancellable(&cancel, driver.execute(&task.statement)).await?;
        cancellable(&cancel, driver.sync_schema()).await?;
        ctx.log(task_run_id, "DDL applied, schema snapshot refreshed")
            .await;

        Ok(TaskRunResult {
            detail: format!("applied DDL, {affected} rows affected"),
            migration_id: Some(new_migration_id()),
            backup_manifest: None,
        })
    }
}

/// Applies a DML statement directly.
#[derive(Debug, Default)]
pub struct DmlMigrateExecutor;

#[async_trait]
impl Executor for DmlMigrateExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        ctx.log(task_run_id, format!("applying DML to {}", task.database_name))
            .await;
        let affected = cancellable(&cancel, driver.execute(&task.statement)).await?;

        Ok(TaskRunResult {
            detail: format!("applied DML, {affected} rows affected"),
            migration_id: Some(new_migration_id()),
            backup_manifest: None,
        })
    }
}

/// Creates a database on the target instance.
#[derive(Debug, Default)]
pub struct CreateDatabaseExecutor;

#[async_trait]
impl Executor for CreateDatabaseExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        cancellable(&cancel, driver.execute(&task.statement)).await?;
        ctx.log(task_run_id, format!("created database {}", task.database_name))
            .await;

        Ok(TaskRunResult::with_detail(format!(
            "database {} created",
            task.database_name
        )))
    }
}

/// Exports data from the target database.
#[derive(Debug, Default)]
pub struct ExportExecutor;

#[async_trait]
impl Executor for ExportExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        if !task.statement.is_empty() {
            cancellable(&cancel, driver.execute(&task.statement)).await?;
        }
        let location = cancellable(&cancel, driver.snapshot()).await?;
        ctx.log(task_run_id, format!("export written to {location}"))
            .await;

        Ok(TaskRunResult::with_detail(format!(
            "export written to {location}"
        )))
    }
}

/// Takes a backup of the target database.
#[derive(Debug, Default)]
pub struct BackupExecutor;

#[async_trait]
impl Executor for BackupExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        let manifest = cancellable(&cancel, driver.snapshot()).await?;
        ctx.log(task_run_id, format!("backup manifest at {manifest}"))
            .await;

        Ok(TaskRunResult {
            detail: format!("backup of {} complete", task.database_name),
            migration_id: None,
            backup_manifest: Some(manifest),
        })
    }
}

/// PITR phase one: restores the backup into a staging database.
#[derive(Debug, Default)]
pub struct PitrRestoreExecutor;

#[async_trait]
impl Executor for PitrRestoreExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        ctx.log(
            task_run_id,
            format!("restoring {} into staging database", task.database_name),
        )
        .await;
        cancellable(&cancel, driver.execute(&task.statement)).await?;

        Ok(TaskRunResult::with_detail(format!(
            "restore of {} staged",
            task.database_name
        )))
    }
}

/// PITR phase two: swaps the staging database in and refreshes schema.
#[derive(Debug, Default)]
pub struct PitrCutoverExecutor;

#[async_trait]
impl Executor for PitrCutoverExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let driver = cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name))
            .await?;

        ctx.log(task_run_id, "swapping staged database in").await;
        cancellable(&cancel, driver.sync_schema()).await?;

        Ok(TaskRunResult {
            detail: format!("point-in-time recovery of {} complete", task.database_name),
            migration_id: Some(new_migration_id()),
            backup_manifest: None,
        })
    }
}
