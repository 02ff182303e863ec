//! Task run state machine and execution records.
//!
//! A task run is one attempt at executing a task. Its lifecycle is a small,
//! strictly validated state machine:
//!
//! ```text
//!            promotion            executor returns Ok
//! PENDING ─────────────> RUNNING ───────────────────> DONE
//!    │                      │
//!    │                      ├── executor returns Err ──> FAILED
//!    │                      └── cancel / shutdown ─────> CANCELED
//!    └── cancel before start ──────────────────────────> CANCELED
//! ```
//!
//! `DONE`, `FAILED`, and `CANCELED` are terminal: once a run reaches one of
//! them no further transition is accepted, so retries always create a fresh
//! run rather than resurrecting an old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{TaskId, TaskRunId};

use crate::error::{Error, Result};

/// Why a task run transitioned between states.
///
/// Every transition carries an explicit reason so the audit trail never has
/// to infer intent from timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionReason {
    /// The promotion pass found the run eligible and scheduled it.
    Promoted,
    /// The executor finished successfully.
    ExecutionSucceeded,
    /// The executor returned an error.
    ExecutionFailed,
    /// The executor panicked and the panic was recovered.
    ExecutorPanicked,
    /// No executor is registered for the task's kind.
    ExecutorMissing,
    /// Cancelled by an operator request.
    UserRequested,
    /// Cancelled because the scheduler is shutting down.
    SchedulerShutdown,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Promoted => write!(f, "promoted"),
            Self::ExecutionSucceeded => write!(f, "execution succeeded"),
            Self::ExecutionFailed => write!(f, "execution failed"),
            Self::ExecutorPanicked => write!(f, "executor panicked"),
            Self::ExecutorMissing => write!(f, "executor missing"),
            Self::UserRequested => write!(f, "user requested"),
            Self::SchedulerShutdown => write!(f, "scheduler shutdown"),
        }
    }
}

/// Task run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunState {
    /// Created, waiting for the promotion pass to find it eligible.
    Pending,
    /// Scheduled; an executor owns it (or is about to).
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Canceled,
}

impl TaskRunState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Canceled),
            Self::Running => matches!(target, Self::Done | Self::Failed | Self::Canceled),
            Self::Done | Self::Failed | Self::Canceled => false,
        }
    }
}

impl Default for TaskRunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// The durable outcome of a finished task run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunResult {
    /// Human-readable summary; for failures, the verbatim executor error.
    pub detail: String,
    /// Migration history entry created by the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<String>,
    /// Backup manifest location, for backup tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_manifest: Option<String>,
}

impl TaskRunResult {
    /// Creates a result with just a detail message.
    #[must_use]
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Self::default()
        }
    }
}

/// One line of the append-only execution log attached to a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunLogEntry {
    /// The run this entry belongs to.
    pub task_run_id: TaskRunId,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
    /// The message.
    pub message: String,
}

impl TaskRunLogEntry {
    /// Creates a log entry stamped now.
    #[must_use]
    pub fn new(task_run_id: TaskRunId, message: impl Into<String>) -> Self {
        Self {
            task_run_id,
            recorded_at: Utc::now(),
            message: message.into(),
        }
    }
}

/// One attempt at executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    /// Run identifier.
    pub id: TaskRunId,
    /// The task this run executes.
    pub task_id: TaskId,
    /// Current state.
    pub state: TaskRunState,
    /// Earliest allowed start; `None` = immediately eligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    /// When the run entered `RUNNING`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the run is still waiting, when the promotion pass has blocked it.
    /// Cleared on promotion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_cause: Option<String>,
    /// Scheduler replica that currently holds the dispatch claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Row-copy progress for long-running migrations: (copied, total).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<(u64, u64)>,
    /// The durable outcome, present once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskRunResult>,
    /// Reason for the most recent transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TaskRun {
    /// Creates a fresh `PENDING` run for a task.
    #[must_use]
    pub fn pending(task_id: TaskId, run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: TaskRunId::generate(),
            task_id,
            state: TaskRunState::Pending,
            run_at,
            started_at: None,
            completed_at: None,
            waiting_cause: None,
            claimed_by: None,
            progress: None,
            result: None,
            last_transition_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Transitions to a new state, validating against the state machine and
    /// stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&mut self, target: TaskRunState, reason: TransitionReason) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: reason.to_string(),
            });
        }

        let now = Utc::now();
        match target {
            TaskRunState::Running => {
                self.started_at = Some(now);
                self.waiting_cause = None;
            }
            TaskRunState::Done | TaskRunState::Failed | TaskRunState::Canceled => {
                self.completed_at = Some(now);
            }
            TaskRunState::Pending => {}
        }

        tracing::debug!(
            task_run_id = %self.id,
            from = %self.state,
            to = %target,
            reason = %reason,
            "task run transition"
        );

        self.state = target;
        self.last_transition_reason = Some(reason);
        Ok(())
    }

    /// Returns the run duration, if both endpoints have been stamped.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Returns true if the run is eligible to start at `now`, considering
    /// only its earliest-start constraint.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at.map_or(true, |at| at <= now)
    }
}
