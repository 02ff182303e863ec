//! Error types for the scheduler and execution engine.

use strata_core::{PlanId, TaskId, TaskRunId};

/// The result type used throughout strata-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scheduler and executor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found in the store.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A task run was not found in the store.
    #[error("task run not found: {task_run_id}")]
    TaskRunNotFound {
        /// The task run ID that was not found.
        task_run_id: TaskRunId,
    },

    /// A plan was not found in the store.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The plan ID that was not found.
        plan_id: PlanId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// No executor is registered for a task kind.
    ///
    /// This indicates a deployment/registration bug, not a runtime fault.
    #[error("no executor registered for task kind {kind}")]
    MissingExecutor {
        /// The task kind label without a registration.
        kind: String,
    },

    /// The execution was cancelled through its driver context.
    #[error("execution cancelled")]
    Cancelled,

    /// An executor panicked; the panic was recovered at the dispatch boundary.
    #[error("executor panicked: {message}")]
    ExecutorPanic {
        /// The captured panic payload.
        message: String,
    },

    /// The gh-ost cutover task found no shared sync state for its sync task.
    ///
    /// Protocol invariant violation: the sync task never reached the handoff
    /// point, or the handoff was already consumed.
    #[error("gh-ost handoff state missing for sync task {sync_task_id}")]
    GhostHandoffMissing {
        /// The sync task whose handoff was expected.
        sync_task_id: TaskId,
    },

    /// A SQL statement could not be interpreted by the executor.
    #[error("invalid statement: {message}")]
    InvalidStatement {
        /// Description of the problem.
        message: String,
    },

    /// Task execution failed.
    #[error("task execution failed: {message}")]
    TaskExecutionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid configuration (deploy-time error).
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from strata-core.
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::TaskExecutionFailed {
            message: message.into(),
        }
    }

    /// Returns true if this error represents a cancellation rather than a
    /// failure. The dispatch loop maps cancellations to the `CANCELED`
    /// terminal state and suppresses failure notifications.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
