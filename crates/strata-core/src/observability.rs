//! Logging setup and the spans shared across Strata services.
//!
//! Every binary calls [`init_logging`] once at startup; the span
//! constructors keep scheduler passes and migration executions traceable
//! end to end under consistent field names.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// Machine-readable JSON lines, one event per line.
    Json,
    /// Human-readable multi-line output for local runs.
    #[default]
    Pretty,
}

/// Installs the global tracing subscriber.
///
/// Idempotent, so binaries and test harnesses can both call it
/// unconditionally; only the first call installs anything. The level filter
/// comes from `RUST_LOG` when set and otherwise defaults to `info` with
/// `debug` for the scheduler crate.
///
/// ```rust
/// use strata_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Json);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,strata_flow=debug"));
        let base = tracing_subscriber::registry().with(filter);

        match format {
            LogFormat::Json => base.with(fmt::layer().json()).init(),
            LogFormat::Pretty => base.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Creates a span for scheduler loop passes with standard fields.
///
/// # Example
///
/// ```rust
/// use strata_core::observability::scheduler_span;
///
/// let span = scheduler_span("promotion_pass");
/// let _guard = span.enter();
/// // ... evaluate pending task runs
/// ```
#[must_use]
pub fn scheduler_span(operation: &str) -> Span {
    tracing::info_span!("scheduler", op = operation)
}

/// Creates a span for task run execution.
///
/// # Example
///
/// ```rust
/// use strata_core::observability::task_run_span;
///
/// let span = task_run_span("execute", "01J0TASKRUN", "DDL_MIGRATE");
/// let _guard = span.enter();
/// // ... run the executor
/// ```
#[must_use]
pub fn task_run_span(operation: &str, task_run_id: &str, task_kind: &str) -> Span {
    tracing::info_span!(
        "task_run",
        op = operation,
        task_run_id = task_run_id,
        task_kind = task_kind,
    )
}
