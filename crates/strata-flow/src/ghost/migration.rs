//! Shared state of one in-flight online migration.
//!
//! The sync executor and the row copier communicate exclusively through a
//! [`MigrationHandle`]: the copier publishes progress and heartbeats into
//! its atomics, and the postpone flag file tells the copier whether cutover
//! has been released yet. The cutover executor later receives the same
//! handle through the handoff map.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ghost::GhostConfig;

/// Progress and coordination state shared between the sync phase, the row
/// copier, and the cutover phase.
#[derive(Debug)]
pub struct MigrationHandle {
    total_rows: AtomicU64,
    copied_rows: AtomicU64,
    last_heartbeat_ms: AtomicI64,
    postpone_reached: AtomicBool,
    postpone_flag: PathBuf,
    copier_cancel: CancellationToken,
}

impl MigrationHandle {
    /// Creates a handle whose copier will postpone at the given flag file
    /// and run under the given cancellation token.
    #[must_use]
    pub fn new(postpone_flag: PathBuf, copier_cancel: CancellationToken) -> Self {
        Self {
            total_rows: AtomicU64::new(0),
            copied_rows: AtomicU64::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
            postpone_reached: AtomicBool::new(false),
            postpone_flag,
            copier_cancel,
        }
    }

    /// Sets the estimated total row count.
    pub fn set_total_rows(&self, total: u64) {
        self.total_rows.store(total, Ordering::SeqCst);
    }

    /// Returns the estimated total row count.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::SeqCst)
    }

    /// Adds copied rows to the running count, returning the new total.
    pub fn add_copied_rows(&self, rows: u64) -> u64 {
        self.copied_rows.fetch_add(rows, Ordering::SeqCst) + rows
    }

    /// Returns the number of rows copied so far.
    #[must_use]
    pub fn copied_rows(&self) -> u64 {
        self.copied_rows.load(Ordering::SeqCst)
    }

    /// Records a copier heartbeat at the current wall clock.
    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Returns the last heartbeat as epoch milliseconds, 0 if never.
    #[must_use]
    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::SeqCst)
    }

    /// Time since the copier's last heartbeat. Unbounded if no heartbeat was
    /// ever recorded, since a copier that never started can never catch up.
    #[must_use]
    pub fn heartbeat_lag(&self) -> Duration {
        let last = self.last_heartbeat_ms.load(Ordering::SeqCst);
        if last == 0 {
            return Duration::MAX;
        }
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }

    /// The cancellation token the row copier runs under.
    #[must_use]
    pub fn copier_cancel(&self) -> CancellationToken {
        self.copier_cancel.clone()
    }

    /// Cancels the copier's token, tearing down a held copy process.
    pub fn cancel_copier(&self) {
        self.copier_cancel.cancel();
    }

    /// Marks the copier as caught up and waiting at the postpone point.
    pub fn mark_postpone_reached(&self) {
        self.postpone_reached.store(true, Ordering::SeqCst);
    }

    /// Returns true once the copier is caught up and holding at the
    /// postpone point.
    #[must_use]
    pub fn postpone_reached(&self) -> bool {
        self.postpone_reached.load(Ordering::SeqCst)
    }

    /// The flag file whose removal releases the copier into cutover.
    #[must_use]
    pub fn postpone_flag(&self) -> &Path {
        &self.postpone_flag
    }
}

/// Copies rows into the shadow table and replays DML until released.
///
/// Contract: the copier keeps the shadow table in sync and holds at the
/// postpone point (after calling [`MigrationHandle::mark_postpone_reached`])
/// until the postpone flag file disappears. It must not return `Ok` before
/// the flag has been removed; an early `Ok` is treated as a protocol error
/// by the sync executor.
#[async_trait]
pub trait RowCopier: Send + Sync {
    /// Runs the copy until released by cutover, failure, or cancellation.
    async fn run(&self, handle: Arc<MigrationHandle>, cancel: CancellationToken) -> Result<()>;
}

/// Row copier that simulates a gh-ost shadow-table copy in memory.
///
/// Copies `total_rows` in `chunk_size` chunks, one per heartbeat interval,
/// then holds at the postpone point until the flag file is removed. Used by
/// tests and the demo binary; production wires a binlog-backed copier here.
#[derive(Debug, Clone)]
pub struct SimulatedRowCopier {
    config: GhostConfig,
    total_rows: u64,
}

impl SimulatedRowCopier {
    /// Creates a copier that will copy `total_rows` rows.
    #[must_use]
    pub const fn new(config: GhostConfig, total_rows: u64) -> Self {
        Self { config, total_rows }
    }
}

#[async_trait]
impl RowCopier for SimulatedRowCopier {
    async fn run(&self, handle: Arc<MigrationHandle>, cancel: CancellationToken) -> Result<()> {
        handle.set_total_rows(self.total_rows);
        handle.record_heartbeat();

        let mut copied = 0u64;
        while copied < self.total_rows {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            let chunk = self.config.chunk_size.min(self.total_rows - copied);
            copied = handle.add_copied_rows(chunk);
            handle.record_heartbeat();
        }

        handle.mark_postpone_reached();
        tracing::debug!(
            flag = %handle.postpone_flag().display(),
            "row copy caught up, holding at postpone point"
        );

        // Hold until cutover removes the flag file.
        loop {
            if !handle.postpone_flag().exists() {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            handle.record_heartbeat();
        }
    }
}
