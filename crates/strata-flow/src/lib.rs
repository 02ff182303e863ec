//! # strata-flow
//!
//! Task run scheduler and execution engine for the Strata schema-change
//! platform.
//!
//! This crate implements the rollout domain, providing:
//!
//! - **Rollout Materialization**: Approved plans become pipelines of tasks,
//!   one stage per environment
//! - **State Machine**: `PENDING -> RUNNING -> {DONE, FAILED, CANCELED}`
//!   task run lifecycle with CAS-guarded transitions
//! - **Claim-Based Dispatch**: Multiple scheduler replicas share a store
//!   safely; every run is executed by exactly one of them
//! - **Online Schema Changes**: gh-ost style two-phase sync/cutover with a
//!   replication-lag gate
//!
//! ## Core Concepts
//!
//! - **Plan**: A proposed set of database changes under review
//! - **Pipeline**: The execution graph materialized from an approved plan
//! - **Task**: One database-target unit of work within a pipeline
//! - **Task Run**: One attempt at executing a task
//!
//! ## Guarantees
//!
//! - **Ordered**: Migrations on one database apply in schema-version order,
//!   one at a time
//! - **At-most-once execution**: State CAS plus claims resolve every
//!   scheduling race to a single winner
//! - **Fault-isolated**: Executor panics fail their run, never the scheduler
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_flow::driver::InMemoryDriverFactory;
//! use strata_flow::executor::ExecutorRegistry;
//! use strata_flow::ghost::{GhostConfig, SimulatedRowCopier};
//! use strata_flow::notify::RecordingSink;
//! use strata_flow::scheduler::{Scheduler, SchedulerConfig};
//! use strata_flow::store::InMemoryStore;
//!
//! # async fn demo() {
//! let config = SchedulerConfig::default();
//! let copier = Arc::new(SimulatedRowCopier::new(config.ghost.clone(), 10_000));
//!
//! let scheduler = Scheduler::new(
//!     config,
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryDriverFactory::new()),
//!     Arc::new(ExecutorRegistry::builtin(copier)),
//!     Arc::new(RecordingSink::new()),
//! );
//! let handle = scheduler.start();
//!
//! // ... feed plan IDs into handle.plans ...
//!
//! handle.shutdown().await;
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod driver;
pub mod error;
pub mod executor;
pub mod ghost;
pub mod metrics;
pub mod notify;
pub mod plan;
pub mod scheduler;
pub mod store;
pub mod taskrun;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::driver::{Driver, DriverFactory, InMemoryDriver, InMemoryDriverFactory};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ExecutionContext, Executor, ExecutorRegistry};
    pub use crate::ghost::{GhostConfig, GhostHandoffMap, RowCopier, SimulatedRowCopier};
    pub use crate::metrics::FlowMetrics;
    pub use crate::notify::{Notification, NotificationKind, NotificationSink, RecordingSink};
    pub use crate::plan::{ChangeKind, ChangeSpec, Pipeline, Plan, RolloutBuilder, Task, TaskKind};
    pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerContext, SchedulerHandle};
    pub use crate::store::{CasResult, InMemoryStore, Store};
    pub use crate::taskrun::{TaskRun, TaskRunResult, TaskRunState, TransitionReason};
}
