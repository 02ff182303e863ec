//! Strongly-typed identifiers for Strata entities.
//!
//! All identifiers in Strata are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use strata_core::id::{PlanId, TaskRunId};
//!
//! let plan = PlanId::generate();
//! let task_run = TaskRunId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: PlanId = task_run;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$docs:meta])* $name:ident, $label:literal) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            #[allow(clippy::cast_possible_wrap)]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

define_id!(
    /// A unique identifier for a project.
    ///
    /// Projects group plans and their target databases under one owner.
    ProjectId,
    "project"
);

define_id!(
    /// A unique identifier for a change plan.
    ///
    /// A plan is a proposed, project-scoped set of database changes,
    /// prior to execution.
    PlanId,
    "plan"
);

define_id!(
    /// A unique identifier for a pipeline (a materialized rollout).
    ///
    /// Pipelines own the stage-structured execution graph for a plan.
    PipelineId,
    "pipeline"
);

define_id!(
    /// A unique identifier for a stage within a pipeline.
    StageId,
    "stage"
);

define_id!(
    /// A unique identifier for a task.
    ///
    /// Tasks are single database-target units of work within a pipeline.
    TaskId,
    "task"
);

define_id!(
    /// A unique identifier for a task run.
    ///
    /// Task runs represent one execution attempt of a task, carrying the
    /// state-machine status and the execution result.
    TaskRunId,
    "task run"
);

define_id!(
    /// A unique identifier for a database instance.
    InstanceId,
    "instance"
);

define_id!(
    /// A unique identifier for a review issue bound to a plan.
    IssueId,
    "issue"
);
