//! Database driver abstraction.
//!
//! Executors never talk to a database directly; they go through a [`Driver`]
//! opened from a [`DriverFactory`] for the task's (instance, database)
//! target. Production wires real protocol drivers here; tests and the demo
//! binary use [`InMemoryDriver`], which records statements and simulates
//! replication lag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use strata_core::InstanceId;

use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// A connection-scoped handle to one database on one instance.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Executes a statement, returning the number of affected rows.
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Refreshes the stored schema snapshot from the live database.
    ///
    /// Called after any operation that changes schema out-of-band of a plain
    /// DDL statement (gh-ost cutover, PITR swap).
    async fn sync_schema(&self) -> Result<()>;

    /// Returns the current replication lag observed on the instance.
    async fn replication_lag(&self) -> Result<Duration>;

    /// Drops a table if it exists. Used for shadow-table cleanup; callers
    /// treat failures as non-fatal.
    async fn drop_table_if_exists(&self, table: &str) -> Result<()>;

    /// Produces a snapshot of the database, returning the manifest location.
    async fn snapshot(&self) -> Result<String>;
}

/// Opens drivers for task targets.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Opens a driver scoped to one database on one instance.
    async fn open(
        &self,
        instance_id: InstanceId,
        database_name: &str,
    ) -> Result<Arc<dyn Driver>>;
}

/// Shared mutable state behind an [`InMemoryDriver`].
#[derive(Debug, Default)]
struct DriverState {
    executed: Mutex<Vec<String>>,
    dropped_tables: Mutex<Vec<String>>,
    schema_syncs: AtomicU64,
    snapshots: AtomicU64,
    lag_ms: AtomicU64,
    fail_next: Mutex<Option<String>>,
}

/// In-memory [`Driver`] that records operations instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDriver {
    state: Arc<DriverState>,
}

impl InMemoryDriver {
    /// Creates a driver with zero simulated lag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the simulated replication lag.
    pub fn set_lag(&self, lag: Duration) {
        let ms = u64::try_from(lag.as_millis()).unwrap_or(u64::MAX);
        self.state.lag_ms.store(ms, Ordering::SeqCst);
    }

    /// Makes the next `execute` call fail with the given message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_execute(&self, message: impl Into<String>) -> Result<()> {
        let mut fail = self.state.fail_next.lock().map_err(poison_err)?;
        *fail = Some(message.into());
        Ok(())
    }

    /// Returns every statement executed so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn executed_statements(&self) -> Result<Vec<String>> {
        let executed = self.state.executed.lock().map_err(poison_err)?;
        Ok(executed.clone())
    }

    /// Returns every table dropped so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dropped_tables(&self) -> Result<Vec<String>> {
        let dropped = self.state.dropped_tables.lock().map_err(poison_err)?;
        Ok(dropped.clone())
    }

    /// Returns the number of schema syncs performed.
    #[must_use]
    pub fn schema_sync_count(&self) -> u64 {
        self.state.schema_syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    async fn execute(&self, statement: &str) -> Result<u64> {
        {
            let mut fail = self.state.fail_next.lock().map_err(poison_err)?;
            if let Some(message) = fail.take() {
                return Err(Error::execution(message));
            }
        }
        let mut executed = self.state.executed.lock().map_err(poison_err)?;
        executed.push(statement.to_owned());
        Ok(1)
    }

    async fn sync_schema(&self) -> Result<()> {
        self.state.schema_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replication_lag(&self) -> Result<Duration> {
        Ok(Duration::from_millis(
            self.state.lag_ms.load(Ordering::SeqCst),
        ))
    }

    async fn drop_table_if_exists(&self, table: &str) -> Result<()> {
        let mut dropped = self.state.dropped_tables.lock().map_err(poison_err)?;
        dropped.push(table.to_owned());
        Ok(())
    }

    async fn snapshot(&self) -> Result<String> {
        let n = self.state.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mem://snapshots/{n}"))
    }
}

/// Factory handing out one shared [`InMemoryDriver`] per (instance, database)
/// target.
#[derive(Debug, Default)]
pub struct InMemoryDriverFactory {
    drivers: Mutex<HashMap<(InstanceId, String), InMemoryDriver>>,
}

impl InMemoryDriverFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the driver for a target, creating it on first use. Tests use
    /// this to inspect or configure the same driver executors will see.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn driver_for(
        &self,
        instance_id: InstanceId,
        database_name: &str,
    ) -> Result<InMemoryDriver> {
        let mut drivers = self.drivers.lock().map_err(poison_err)?;
        Ok(drivers
            .entry((instance_id, database_name.to_owned()))
            .or_default()
            .clone())
    }
}

#[async_trait]
impl DriverFactory for InMemoryDriverFactory {
    async fn open(
        &self,
        instance_id: InstanceId,
        database_name: &str,
    ) -> Result<Arc<dyn Driver>> {
        let driver = self.driver_for(instance_id, database_name)?;
        Ok(Arc::new(driver))
    }
}
