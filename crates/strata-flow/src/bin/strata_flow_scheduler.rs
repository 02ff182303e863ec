//! Strata task run scheduler service.
//!
//! Runs the rollout, promotion, and dispatch loops against the configured
//! store until interrupted. Configuration comes from `STRATA_FLOW_*`
//! environment variables (see [`SchedulerConfig::from_env`]); logging honors
//! `RUST_LOG` and `STRATA_FLOW_LOG_FORMAT` (`json` or `pretty`).

use std::sync::Arc;

use strata_core::observability::{init_logging, LogFormat};
use strata_flow::driver::InMemoryDriverFactory;
use strata_flow::error::Result;
use strata_flow::executor::ExecutorRegistry;
use strata_flow::ghost::SimulatedRowCopier;
use strata_flow::notify::{Notification, NotificationSink};
use strata_flow::scheduler::{Scheduler, SchedulerConfig};
use strata_flow::store::InMemoryStore;

/// Sink that logs notifications; deployments replace this with webhook or
/// chat integrations.
#[derive(Debug, Default)]
struct LogSink;

#[async_trait::async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            kind = ?notification.kind,
            plan_id = %notification.plan_id,
            failed_tasks = notification.failed_tasks.len(),
            "pipeline notification"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let format = match std::env::var("STRATA_FLOW_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_logging(format);

    let config = SchedulerConfig::from_env()?;
    tracing::info!(
        replica_id = %config.replica_id,
        tick_interval = ?config.tick_interval,
        "starting strata-flow scheduler"
    );

    let copier = Arc::new(SimulatedRowCopier::new(config.ghost.clone(), 10_000));
    let scheduler = Scheduler::new(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryDriverFactory::new()),
        Arc::new(ExecutorRegistry::builtin(copier)),
        Arc::new(LogSink),
    );
    let handle = scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| strata_flow::error::Error::configuration(format!("signal handler: {e}")))?;
    tracing::info!("interrupt received, shutting down");
    handle.shutdown().await;
    tracing::info!("scheduler stopped");
    Ok(())
}
