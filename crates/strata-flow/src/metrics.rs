//! Observability metrics for the scheduler and executors.
//!
//! Prometheus-compatible metrics exposed through the `metrics` crate facade.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strata_flow_task_runs_total` | Counter | `from_state`, `to_state` | Task run state transitions |
//! | `strata_flow_task_run_duration_seconds` | Histogram | `task_kind`, `state` | Task run execution duration |
//! | `strata_flow_scheduler_pass_duration_seconds` | Histogram | `pass` | Promotion/dispatch pass time |
//! | `strata_flow_inflight_task_runs` | Gauge | - | Executors currently running |
//! | `strata_flow_dispatches_total` | Counter | `result` | Dispatch attempts by outcome |
//! | `strata_flow_rollouts_total` | Counter | `result` | Rollout creation attempts |
//! | `strata_flow_notifications_total` | Counter | `kind` | Notifications sent |
//! | `strata_flow_ghost_copy_progress` | Gauge | - | gh-ost rows copied / total |
//!
//! ## Integration
//!
//! To export to Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Task run state transitions.
    pub const TASK_RUNS_TOTAL: &str = "strata_flow_task_runs_total";
    /// Histogram: Task run execution duration in seconds.
    pub const TASK_RUN_DURATION_SECONDS: &str = "strata_flow_task_run_duration_seconds";
    /// Histogram: Scheduler pass processing time in seconds.
    pub const SCHEDULER_PASS_DURATION_SECONDS: &str =
        "strata_flow_scheduler_pass_duration_seconds";
    /// Gauge: Executors currently running.
    pub const INFLIGHT_TASK_RUNS: &str = "strata_flow_inflight_task_runs";
    /// Counter: Dispatch attempts by outcome.
    pub const DISPATCHES_TOTAL: &str = "strata_flow_dispatches_total";
    /// Counter: Rollout creation attempts by outcome.
    pub const ROLLOUTS_TOTAL: &str = "strata_flow_rollouts_total";
    /// Counter: Notifications sent by kind.
    pub const NOTIFICATIONS_TOTAL: &str = "strata_flow_notifications_total";
    /// Gauge: gh-ost copy progress as a 0..1 ratio.
    pub const GHOST_COPY_PROGRESS: &str = "strata_flow_ghost_copy_progress";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task run state.
    pub const STATE: &str = "state";
    /// Previous state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Task kind label (ddl_migrate, ghost_sync, ...).
    pub const TASK_KIND: &str = "task_kind";
    /// Scheduler pass name (promotion, dispatch).
    pub const PASS: &str = "pass";
    /// Outcome status (dispatched, blocked, skipped, failed).
    pub const RESULT: &str = "result";
    /// Notification kind.
    pub const KIND: &str = "kind";
}

/// High-level interface for recording scheduler metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task run state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TASK_RUNS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a finished task run's duration.
    pub fn observe_run_duration(&self, task_kind: &str, final_state: &str, duration: Duration) {
        histogram!(
            names::TASK_RUN_DURATION_SECONDS,
            labels::TASK_KIND => task_kind.to_string(),
            labels::STATE => final_state.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a scheduler pass duration.
    pub fn observe_pass_duration(&self, pass: &'static str, duration: Duration) {
        histogram!(
            names::SCHEDULER_PASS_DURATION_SECONDS,
            labels::PASS => pass,
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the number of executors currently in flight.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_inflight(&self, count: usize) {
        gauge!(names::INFLIGHT_TASK_RUNS).set(count as f64);
    }

    /// Records a dispatch attempt.
    pub fn record_dispatch(&self, result: &'static str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a rollout creation attempt.
    pub fn record_rollout(&self, result: &'static str) {
        counter!(
            names::ROLLOUTS_TOTAL,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a sent notification.
    pub fn record_notification(&self, kind: &str) {
        counter!(
            names::NOTIFICATIONS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Publishes gh-ost copy progress as a 0..1 ratio.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_ghost_progress(&self, copied: u64, total: u64) {
        let ratio = if total == 0 {
            0.0
        } else {
            copied as f64 / total as f64
        };
        gauge!(names::GHOST_COPY_PROGRESS).set(ratio);
    }
}

/// RAII guard for timing operations; records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use strata_flow::metrics::{FlowMetrics, TimingGuard};
///
/// let metrics = FlowMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_pass_duration("promotion", duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(self.start.elapsed());
        }
    }
}
