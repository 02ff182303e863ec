//! The task run scheduler.
//!
//! Three cooperating loops, each driven by a periodic tick plus a tickle
//! channel so state changes propagate in milliseconds instead of waiting for
//! the next tick:
//!
//! - [`AutoRolloutCreator`](rollout::AutoRolloutCreator): materializes
//!   approved plans into pipelines.
//! - [`PromotionLoop`](promotion::PromotionLoop): moves eligible `PENDING`
//!   runs to `RUNNING`.
//! - [`DispatchLoop`](dispatch::DispatchLoop): claims `RUNNING` runs and
//!   executes them.
//!
//! All per-process mutable state (cancel tokens, in-flight bookkeeping,
//! sequential occupancy) lives in the [`SchedulerContext`] each loop receives
//! at construction. Nothing here is a process global, so tests run as many
//! independent schedulers in one process as they like.

pub mod dispatch;
pub mod promotion;
pub mod rollout;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strata_core::{InstanceId, PlanId, TaskRunId};

use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::ghost::{GhostConfig, GhostHandoffMap};
use crate::metrics::FlowMetrics;
use crate::notify::{NotificationSink, PipelineNotifier};
use crate::store::{CasResult, Store};
use crate::taskrun::{TaskRunState, TransitionReason};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Identity used when claiming task runs; must be unique per replica.
    pub replica_id: String,
    /// Baseline interval between scheduler passes.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Failure notification aggregation window.
    #[serde(with = "humantime_serde")]
    pub notification_window: Duration,
    /// Default gh-ost tuning.
    pub ghost: GhostConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            replica_id: format!("scheduler-{}", std::process::id()),
            tick_interval: Duration::from_secs(5),
            notification_window: Duration::from_secs(300),
            ghost: GhostConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Builds a config from `STRATA_FLOW_*` environment variables, with
    /// defaults for anything unset.
    ///
    /// - `STRATA_FLOW_REPLICA_ID`
    /// - `STRATA_FLOW_TICK_INTERVAL` (humantime, e.g. `5s`)
    /// - `STRATA_FLOW_NOTIFICATION_WINDOW` (humantime, e.g. `5m`)
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(replica_id) = std::env::var("STRATA_FLOW_REPLICA_ID") {
            config.replica_id = replica_id;
        }
        if let Ok(value) = std::env::var("STRATA_FLOW_TICK_INTERVAL") {
            config.tick_interval = humantime::parse_duration(&value).map_err(|e| {
                Error::configuration(format!("STRATA_FLOW_TICK_INTERVAL `{value}`: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("STRATA_FLOW_NOTIFICATION_WINDOW") {
            config.notification_window = humantime::parse_duration(&value).map_err(|e| {
                Error::configuration(format!("STRATA_FLOW_NOTIFICATION_WINDOW `{value}`: {e}"))
            })?;
        }
        Ok(config)
    }
}

/// A non-blocking wake-up channel between scheduler loops.
///
/// The channel is bounded and sends never block: a tickle that finds the
/// buffer full is dropped, because a pending wake-up already guarantees the
/// receiver will run a pass.
#[derive(Debug, Clone)]
pub struct Tickle {
    tx: mpsc::Sender<()>,
}

impl Tickle {
    /// Creates a tickle channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Requests a wake-up. Never blocks; a full buffer means one is already
    /// pending.
    pub fn tickle(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Per-process scheduler state shared across loops.
#[derive(Debug)]
pub struct SchedulerContext {
    shutdown: CancellationToken,
    cancel_tokens: Mutex<HashMap<TaskRunId, CancellationToken>>,
    sequential: Mutex<HashSet<(InstanceId, String)>>,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerContext {
    /// Creates a fresh context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            cancel_tokens: Mutex::new(HashMap::new()),
            sequential: Mutex::new(HashSet::new()),
        }
    }

    /// The token cancelled when the scheduler shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals shutdown: every in-flight executor sees its token cancel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Registers an in-flight run, returning its cancellation token (a child
    /// of the shutdown token).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register_run(&self, task_run_id: TaskRunId) -> Result<CancellationToken> {
        let token = self.shutdown.child_token();
        let mut tokens = self.cancel_tokens.lock().map_err(poison_err)?;
        tokens.insert(task_run_id, token.clone());
        Ok(token)
    }

    /// Removes a finished run's bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn finish_run(&self, task_run_id: TaskRunId) -> Result<()> {
        let mut tokens = self.cancel_tokens.lock().map_err(poison_err)?;
        tokens.remove(&task_run_id);
        Ok(())
    }

    /// Cancels an in-flight run's token. Returns true if the run was
    /// in flight in this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn cancel_run(&self, task_run_id: TaskRunId) -> Result<bool> {
        let tokens = self.cancel_tokens.lock().map_err(poison_err)?;
        match tokens.get(&task_run_id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of runs currently in flight in this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn inflight_count(&self) -> Result<usize> {
        let tokens = self.cancel_tokens.lock().map_err(poison_err)?;
        Ok(tokens.len())
    }

    /// Tries to occupy the sequential slot for a (instance, database)
    /// target. Returns false if another migrate-class run already holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn try_occupy_sequential(
        &self,
        instance_id: InstanceId,
        database_name: &str,
    ) -> Result<bool> {
        let mut sequential = self.sequential.lock().map_err(poison_err)?;
        Ok(sequential.insert((instance_id, database_name.to_owned())))
    }

    /// Releases the sequential slot for a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn release_sequential(&self, instance_id: InstanceId, database_name: &str) -> Result<()> {
        let mut sequential = self.sequential.lock().map_err(poison_err)?;
        sequential.remove(&(instance_id, database_name.to_owned()));
        Ok(())
    }
}

/// Cancels a task run wherever it currently is.
///
/// In-flight runs are cancelled through their token (the executor lands the
/// run `CANCELED`); runs still `PENDING` are moved to `CANCELED` directly.
///
/// # Errors
///
/// Returns [`Error::InvalidStateTransition`] if the run is already terminal
/// or `RUNNING` somewhere this process cannot reach.
pub async fn cancel_task_run<S: Store + ?Sized>(
    store: &S,
    ctx: &SchedulerContext,
    task_run_id: TaskRunId,
) -> Result<()> {
    if ctx.cancel_run(task_run_id)? {
        return Ok(());
    }

    match store
        .cas_task_run_state(
            task_run_id,
            TaskRunState::Pending,
            TaskRunState::Canceled,
            TransitionReason::UserRequested,
        )
        .await?
    {
        CasResult::Success => Ok(()),
        CasResult::NotFound => Err(Error::TaskRunNotFound { task_run_id }),
        CasResult::StateMismatch { actual } => Err(Error::InvalidStateTransition {
            from: actual.to_string(),
            to: TaskRunState::Canceled.to_string(),
            reason: "run is not cancellable from this process".to_owned(),
        }),
    }
}

/// Everything needed to run the three scheduler loops.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    drivers: Arc<dyn DriverFactory>,
    registry: Arc<ExecutorRegistry>,
    sink: Arc<dyn NotificationSink>,
}

/// A running scheduler: channels in, join handles out.
pub struct SchedulerHandle {
    /// Feed plan IDs here to request rollout creation.
    pub plans: mpsc::Sender<PlanId>,
    /// Wakes the promotion loop.
    pub promotion_tickle: Tickle,
    /// Wakes the dispatch loop.
    pub dispatch_tickle: Tickle,
    ctx: Arc<SchedulerContext>,
    loops: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// The shared scheduler context (for cancellation and introspection).
    #[must_use]
    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Signals shutdown and waits for every loop to drain.
    pub async fn shutdown(self) {
        self.ctx.shutdown();
        for handle in self.loops {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "scheduler loop panicked during shutdown");
            }
        }
    }
}

impl Scheduler {
    /// Creates a scheduler ready to start.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        drivers: Arc<dyn DriverFactory>,
        registry: Arc<ExecutorRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            drivers,
            registry,
            sink,
        }
    }

    /// Spawns the rollout, promotion, and dispatch loops.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let ctx = Arc::new(SchedulerContext::new());
        let (promotion_tickle, promotion_rx) = Tickle::channel();
        let (dispatch_tickle, dispatch_rx) = Tickle::channel();
        let (plans_tx, plans_rx) = mpsc::channel(16);

        let notifier = Arc::new(PipelineNotifier::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            self.config.notification_window,
        ));

        let exec_ctx = ExecutionContext {
            store: Arc::clone(&self.store),
            drivers: Arc::clone(&self.drivers),
            handoffs: Arc::new(GhostHandoffMap::new()),
            ghost: self.config.ghost.clone(),
            metrics: FlowMetrics::new(),
        };

        let rollout = rollout::AutoRolloutCreator::new(
            Arc::clone(&self.store),
            promotion_tickle.clone(),
            Arc::clone(&ctx),
        );
        let promotion = promotion::PromotionLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&ctx),
            self.config.tick_interval,
            dispatch_tickle.clone(),
        );
        let dispatch = dispatch::DispatchLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            exec_ctx,
            Arc::clone(&ctx),
            notifier,
            self.config.replica_id.clone(),
            self.config.tick_interval,
            promotion_tickle.clone(),
        );

        let loops = vec![
            tokio::spawn(rollout.run(plans_rx)),
            tokio::spawn(promotion.run(promotion_rx)),
            tokio::spawn(dispatch.run(dispatch_rx)),
        ];

        SchedulerHandle {
            plans: plans_tx,
            promotion_tickle,
            dispatch_tickle,
            ctx,
            loops,
        }
    }
}
