//! Sync-to-cutover handoff.
//!
//! The sync executor finishes while its row copier is still alive, holding
//! at the postpone point. The cutover executor, which runs later in the same
//! process, needs that copier's [`MigrationHandle`] and completion channel.
//! The [`GhostHandoffMap`] carries them across, keyed by the sync task's ID.
//!
//! The handoff is strictly one-producer/one-consumer: the sync executor
//! publishes exactly once and the cutover executor consumes by taking the
//! entry out of the map, so a duplicate cutover attempt observes an empty
//! slot instead of a stale copier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use strata_core::TaskId;

use crate::error::{Error, Result};
use crate::ghost::MigrationHandle;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Everything the cutover executor needs from the sync phase.
#[derive(Debug)]
pub struct GhostHandoff {
    /// Shared migration state, including the postpone flag path.
    pub handle: Arc<MigrationHandle>,
    /// Resolves when the row copier exits, with its final outcome.
    pub copier_done: oneshot::Receiver<Result<()>>,
}

/// Process-local registry of in-flight sync-to-cutover handoffs.
#[derive(Debug, Default)]
pub struct GhostHandoffMap {
    entries: Mutex<HashMap<TaskId, GhostHandoff>>,
}

impl GhostHandoffMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the handoff for a sync task. Replaces any stale entry from
    /// an earlier attempt of the same task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn publish(&self, sync_task_id: TaskId, handoff: GhostHandoff) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        if entries.insert(sync_task_id, handoff).is_some() {
            tracing::warn!(
                sync_task_id = %sync_task_id,
                "replaced stale ghost handoff from an earlier sync attempt"
            );
        }
        Ok(())
    }

    /// Takes the handoff for a sync task, consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GhostHandoffMissing`] if no handoff is present,
    /// which means the sync phase never reached the postpone point in this
    /// process or the handoff was already consumed.
    pub fn take(&self, sync_task_id: TaskId) -> Result<GhostHandoff> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        entries
            .remove(&sync_task_id)
            .ok_or(Error::GhostHandoffMissing { sync_task_id })
    }

    /// Returns true if a handoff is currently published for the sync task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, sync_task_id: TaskId) -> Result<bool> {
        let entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.contains_key(&sync_task_id))
    }
}
