//! gh-ost phase two: cutover.
//!
//! The cutover executor consumes the handoff published by its sync task,
//! waits for the lag gate to open, removes the postpone flag to release the
//! copier into its final catch-up and atomic rename, and then refreshes the
//! schema snapshot and sweeps the shadow tables.
//!
//! The handoff is consumed on entry and never restored. If the gate never
//! opens, or cancellation arrives first, the executor tears the migration
//! down instead: the copier's token is cancelled and the postpone flag is
//! removed. A retried cutover run then fails the missing-handoff invariant
//! rather than adopting a copier it did not release; the operator re-runs
//! the migration from the sync phase.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use strata_core::TaskRunId;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::executor::{cancellable, new_migration_id, ExecutionContext, Executor};
use crate::ghost::{table_name_from_statement, GhostConfig, GhostHandoff, MigrationHandle};
use crate::plan::Task;
use crate::taskrun::TaskRunResult;

/// Executor for `GHOST_CUTOVER` tasks.
#[derive(Debug, Default)]
pub struct GhostCutoverExecutor;

#[async_trait]
impl Executor for GhostCutoverExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        let [sync_task_id] = task.depends_on[..] else {
            return Err(Error::configuration(format!(
                "cutover task {} must depend on exactly one sync task",
                task.id
            )));
        };
        let Some(table) = table_name_from_statement(&task.statement) else {
            return Err(Error::InvalidStatement {
                message: format!("cannot determine target table from `{}`", task.statement),
            });
        };

        let config = ctx.ghost.with_directives(&task.statement)?;
        let driver =
            cancellable(&cancel, ctx.drivers.open(task.instance_id, &task.database_name)).await?;

        let handoff = ctx.handoffs.take(sync_task_id)?;
        let handle = Arc::clone(&handoff.handle);

        let outcome = release_copier(ctx, &config, driver.as_ref(), &cancel, task_run_id, handoff)
            .await;

        // Shadow table sweep is best effort and runs on every exit once the
        // handoff is consumed; a leftover _gho table is an operator chore,
        // not a failed migration.
        for shadow in [format!("_{table}_gho"), format!("_{table}_ghc")] {
            if let Err(error) = driver.drop_table_if_exists(&shadow).await {
                tracing::warn!(table = %shadow, %error, "shadow table cleanup failed");
            }
        }
        outcome?;

        driver.sync_schema().await?;
        ctx.log(task_run_id, "schema snapshot refreshed after cutover")
            .await;

        Ok(TaskRunResult {
            detail: format!(
                "online schema change on {} cut over ({} rows copied)",
                task.database_name,
                handle.copied_rows()
            ),
            migration_id: Some(new_migration_id()),
            backup_manifest: None,
        })
    }
}

/// Opens the gate, releases the copier, and waits for its outcome. Any exit
/// before the copier completes tears the migration down.
async fn release_copier(
    ctx: &ExecutionContext,
    config: &GhostConfig,
    driver: &dyn Driver,
    cancel: &CancellationToken,
    task_run_id: TaskRunId,
    handoff: GhostHandoff,
) -> Result<()> {
    let handle = Arc::clone(&handoff.handle);

    if let Err(error) = wait_for_gate(ctx, config, driver, &handle, cancel, task_run_id).await {
        tear_down(&handle).await;
        return Err(error);
    }

    if let Err(error) = tokio::fs::remove_file(handle.postpone_flag()).await {
        tear_down(&handle).await;
        return Err(Error::execution(format!(
            "failed to remove postpone flag {}: {error}",
            handle.postpone_flag().display()
        )));
    }

    ctx.log(task_run_id, "postpone flag removed, copier released")
        .await;

    // Final catch-up and atomic rename happen inside the copier; its exit is
    // the cutover outcome.
    match handoff.copier_done.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(Error::execution(
            "row copier vanished before completing cutover",
        )),
    }
}

/// Cancels the held copier and removes its postpone flag.
async fn tear_down(handle: &MigrationHandle) {
    handle.cancel_copier();
    if let Err(error) = tokio::fs::remove_file(handle.postpone_flag()).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                flag = %handle.postpone_flag().display(),
                %error,
                "failed to remove postpone flag during teardown"
            );
        }
    }
}

/// Waits until both heartbeat lag and replication lag are below the lag
/// ceiling and the lock budget, rechecking up to `cutover_retries` times.
async fn wait_for_gate(
    ctx: &ExecutionContext,
    config: &GhostConfig,
    driver: &dyn Driver,
    handle: &MigrationHandle,
    cancel: &CancellationToken,
    task_run_id: TaskRunId,
) -> Result<()> {
    for attempt in 1..=config.cutover_retries {
        // Heartbeat lag is the primary signal: a copier that stopped
        // heartbeating cannot catch up inside the lock window no matter how
        // healthy the replica looks.
        let heartbeat_lag = handle.heartbeat_lag();
        let replica_lag = cancellable(cancel, driver.replication_lag()).await?;
        let lag = heartbeat_lag.max(replica_lag);
        if lag < config.max_lag && lag < config.lock_timeout {
            ctx.log(
                task_run_id,
                format!("cutover gate open (lag {}ms)", lag.as_millis()),
            )
            .await;
            return Ok(());
        }

        tracing::debug!(
            task_run_id = %task_run_id,
            heartbeat_lag_ms = u64::try_from(heartbeat_lag.as_millis()).unwrap_or(u64::MAX),
            replica_lag_ms = u64::try_from(replica_lag.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "cutover gate closed, lag too high"
        );
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(config.gate_interval) => {}
        }
    }

    Err(Error::execution(format!(
        "cutover gate did not open within {} checks, heartbeat or replication lag stayed above {}ms",
        config.cutover_retries,
        config.max_lag.as_millis()
    )))
}
