//! # strata-core
//!
//! Core abstractions for the Strata schema-change orchestration platform.
//!
//! This crate provides the foundational types used across all Strata
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for plans, pipelines, tasks, and
//!   task runs
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `strata-core` is the **only** crate allowed to define shared primitives.
//! Domain logic lives in the component crates (e.g. `strata-flow`).
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let plan_id = PlanId::generate();
//! let task_id = TaskId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use strata_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        InstanceId, IssueId, PipelineId, PlanId, ProjectId, StageId, TaskId, TaskRunId,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{InstanceId, IssueId, PipelineId, PlanId, ProjectId, StageId, TaskId, TaskRunId};
pub use observability::{LogFormat, init_logging};
