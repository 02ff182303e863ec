//! gh-ost phase one: shadow-table sync.
//!
//! The sync executor creates the postpone flag file, starts the row copier,
//! and polls its progress into the store. When the copier reports that it
//! has caught up and is holding at the postpone point, the executor
//! publishes the handoff for the cutover task and returns success — the
//! copier keeps running in the background, replaying DML, until cutover
//! releases it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use strata_core::TaskRunId;

use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, Executor};
use crate::ghost::{table_name_from_statement, GhostHandoff, MigrationHandle, RowCopier};
use crate::plan::Task;
use crate::taskrun::TaskRunResult;

/// Executor for `GHOST_SYNC` tasks.
pub struct GhostSyncExecutor {
    copier: Arc<dyn RowCopier>,
}

impl GhostSyncExecutor {
    /// Creates a sync executor backed by the given row copier.
    #[must_use]
    pub fn new(copier: Arc<dyn RowCopier>) -> Self {
        Self { copier }
    }
}

impl std::fmt::Debug for GhostSyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostSyncExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for GhostSyncExecutor {
    async fn run_once(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
        task: &Task,
        task_run_id: TaskRunId,
    ) -> Result<TaskRunResult> {
        // A statement we cannot name the target table of would strand its
        // shadow tables at cutover; reject it before any copy starts.
        let Some(table) = table_name_from_statement(&task.statement) else {
            return Err(Error::InvalidStatement {
                message: format!("cannot determine target table from `{}`", task.statement),
            });
        };

        let config = ctx.ghost.with_directives(&task.statement)?;
        let flag = config
            .flag_dir
            .join(format!("ghost-postpone-{}", task.id));

        tokio::fs::write(&flag, b"").await.map_err(|e| {
            Error::execution(format!(
                "failed to create postpone flag {}: {e}",
                flag.display()
            ))
        })?;

        // The copier runs under a child of this run's token: cancelling the
        // sync run (or scheduler shutdown) stops it, and the cutover side can
        // tear it down on its own through the handle.
        let handle = Arc::new(MigrationHandle::new(flag.clone(), cancel.child_token()));
        let (done_tx, mut done_rx) = oneshot::channel();

        let copier = Arc::clone(&self.copier);
        let copier_handle = Arc::clone(&handle);
        let copier_cancel = handle.copier_cancel();
        tokio::spawn(async move {
            let outcome = copier.run(copier_handle, copier_cancel).await;
            // The cutover side may be gone; a dropped receiver is fine.
            let _ = done_tx.send(outcome);
        });

        ctx.log(
            task_run_id,
            format!(
                "shadow table copy started for {}.{table}",
                task.database_name
            ),
        )
        .await;

        let mut poll = tokio::time::interval(config.poll_interval);
        loop {
            tokio::select! {
                outcome = &mut done_rx => {
                    // The copier must hold at the postpone point; exiting
                    // before we observed it is a failure either way.
                    remove_flag(&flag).await;
                    return match outcome {
                        Ok(Err(error)) => Err(error),
                        Ok(Ok(())) => Err(Error::execution(
                            "row copier exited before the postpone point",
                        )),
                        Err(_) => Err(Error::execution("row copier task was dropped")),
                    };
                }
                () = cancel.cancelled() => {
                    remove_flag(&flag).await;
                    return Err(Error::Cancelled);
                }
                _ = poll.tick() => {
                    let copied = handle.copied_rows();
                    let total = handle.total_rows();
                    if let Err(error) = ctx
                        .store
                        .record_task_run_progress(task_run_id, copied, total)
                        .await
                    {
                        tracing::warn!(task_run_id = %task_run_id, %error, "progress write failed");
                    }
                    ctx.metrics.set_ghost_progress(copied, total);

                    if handle.postpone_reached() {
                        break;
                    }
                }
            }
        }

        let copied = handle.copied_rows();
        ctx.log(
            task_run_id,
            format!("row copy caught up ({copied} rows), holding for cutover"),
        )
        .await;

        ctx.handoffs.publish(
            task.id,
            GhostHandoff {
                handle,
                copier_done: done_rx,
            },
        )?;

        Ok(TaskRunResult::with_detail(format!(
            "shadow table in sync ({copied} rows), cutover postponed"
        )))
    }
}

async fn remove_flag(flag: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(flag).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(flag = %flag.display(), %error, "failed to remove postpone flag");
        }
    }
}
