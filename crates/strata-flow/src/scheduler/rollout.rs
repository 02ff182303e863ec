//! Automatic rollout creation.
//!
//! Listens for plan IDs (sent when a plan or its review state changes) and
//! materializes a pipeline once a plan clears every gate:
//!
//! - the plan has no rollout yet,
//! - its review issue is open and fully approved,
//! - its latest plan check finished without blocking findings.
//!
//! Idempotency across replicas comes from the store: whichever replica wins
//! the `has_rollout` flag flip materializes; everyone else backs off.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use strata_core::observability::scheduler_span;
use strata_core::PlanId;

use crate::error::Result;
use crate::metrics::FlowMetrics;
use crate::plan::{IssueStatus, RolloutBuilder};
use crate::scheduler::{SchedulerContext, Tickle};
use crate::store::Store;

/// The loop that turns approved plans into pipelines.
pub struct AutoRolloutCreator {
    store: Arc<dyn Store>,
    promotion_tickle: Tickle,
    ctx: Arc<SchedulerContext>,
    metrics: FlowMetrics,
}

impl AutoRolloutCreator {
    /// Creates the loop.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, promotion_tickle: Tickle, ctx: Arc<SchedulerContext>) -> Self {
        Self {
            store,
            promotion_tickle,
            ctx,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs until shutdown or the plan channel closes.
    pub async fn run(self, mut plans: mpsc::Receiver<PlanId>) {
        let shutdown = self.ctx.shutdown_token();
        loop {
            let plan_id = tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("rollout creator shutting down");
                    return;
                }
                plan_id = plans.recv() => match plan_id {
                    Some(plan_id) => plan_id,
                    None => {
                        tracing::info!("plan channel closed, rollout creator stopping");
                        return;
                    }
                },
            };

            if let Err(error) = self
                .consider_plan(plan_id)
                .instrument(scheduler_span("rollout_pass"))
                .await
            {
                tracing::warn!(plan_id = %plan_id, %error, "rollout creation failed");
                self.metrics.record_rollout("failed");
            }
        }
    }

    /// Evaluates one plan, materializing its rollout if every gate passes.
    /// Public for tests that drive the creator deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures or if materialization fails after
    /// the flag flip was won.
    pub async fn consider_plan(&self, plan_id: PlanId) -> Result<()> {
        let Some(plan) = self.store.get_plan(plan_id).await? else {
            tracing::warn!(plan_id = %plan_id, "rollout requested for unknown plan");
            return Ok(());
        };

        if plan.has_rollout {
            tracing::debug!(plan_id = %plan_id, "plan already has a rollout");
            self.metrics.record_rollout("skipped");
            return Ok(());
        }

        let Some(issue) = self.store.get_issue_by_plan(plan_id).await? else {
            tracing::debug!(plan_id = %plan_id, "plan has no review issue yet");
            self.metrics.record_rollout("gated");
            return Ok(());
        };
        if issue.status != IssueStatus::Open {
            tracing::info!(plan_id = %plan_id, "issue closed, no rollout");
            self.metrics.record_rollout("gated");
            return Ok(());
        }
        if !issue.approval_satisfied {
            tracing::info!(plan_id = %plan_id, "approval outstanding, no rollout");
            self.metrics.record_rollout("gated");
            return Ok(());
        }

        let check = self.store.latest_plan_check_run(plan_id).await?;
        let check_passed = check.as_ref().is_some_and(crate::plan::PlanCheckRun::passed);
        if !check_passed {
            tracing::info!(plan_id = %plan_id, "plan checks not passed, no rollout");
            self.metrics.record_rollout("gated");
            return Ok(());
        }

        // Single-winner gate across replicas.
        if !self.store.mark_plan_has_rollout(plan_id).await? {
            tracing::debug!(plan_id = %plan_id, "another replica materialized first");
            self.metrics.record_rollout("skipped");
            return Ok(());
        }

        let rollout = RolloutBuilder::new(&plan).build()?;
        self.store
            .save_rollout(&rollout.pipeline, &rollout.tasks, &rollout.task_runs)
            .await?;

        tracing::info!(
            plan_id = %plan_id,
            pipeline_id = %rollout.pipeline.id,
            tasks = rollout.tasks.len(),
            "rollout materialized"
        );
        self.metrics.record_rollout("created");
        self.promotion_tickle.tickle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{
        ChangeKind, ChangeSpec, Issue, Plan, PlanCheckFinding, PlanCheckRun, PlanCheckState,
        Severity,
    };
    use crate::store::InMemoryStore;
    use crate::taskrun::TaskRunState;
    use chrono::Utc;
    use strata_core::{InstanceId, IssueId, ProjectId};

    fn creator(store: Arc<InMemoryStore>) -> AutoRolloutCreator {
        let (promotion_tickle, _rx) = Tickle::channel();
        AutoRolloutCreator::new(store, promotion_tickle, Arc::new(SchedulerContext::new()))
    }

    fn plan() -> Plan {
        Plan::new(
            ProjectId::generate(),
            "release",
            vec![ChangeSpec {
                kind: ChangeKind::DdlMigrate,
                instance_id: InstanceId::generate(),
                database_name: "orders".into(),
                statement: "ALTER TABLE t ADD COLUMN c INT".into(),
                schema_version: Some("0001".into()),
                environment: "prod".into(),
                run_at: None,
            }],
        )
    }

    async fn approve(store: &InMemoryStore, plan_id: strata_core::PlanId) {
        store
            .save_issue(&Issue {
                id: IssueId::generate(),
                plan_id,
                status: IssueStatus::Open,
                approval_satisfied: true,
            })
            .await
            .unwrap();
        store
            .save_plan_check_run(&PlanCheckRun {
                plan_id,
                state: PlanCheckState::Done,
                findings: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approved_plan_materializes_once() {
        let store = Arc::new(InMemoryStore::new());
        let plan = plan();
        store.save_plan(&plan).await.unwrap();
        approve(&store, plan.id).await;

        let creator = creator(Arc::clone(&store));
        creator.consider_plan(plan.id).await.unwrap();

        let pipeline = store.get_pipeline_by_plan(plan.id).await.unwrap();
        assert!(pipeline.is_some());
        let pending = store
            .list_task_runs_by_state(TaskRunState::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        // A duplicate request creates nothing new.
        creator.consider_plan(plan.id).await.unwrap();
        assert_eq!(store.task_run_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn unapproved_plan_is_gated() {
        let store = Arc::new(InMemoryStore::new());
        let plan = plan();
        store.save_plan(&plan).await.unwrap();
        store
            .save_issue(&Issue {
                id: IssueId::generate(),
                plan_id: plan.id,
                status: IssueStatus::Open,
                approval_satisfied: false,
            })
            .await
            .unwrap();

        creator(Arc::clone(&store))
            .consider_plan(plan.id)
            .await
            .unwrap();

        assert!(store.get_pipeline_by_plan(plan.id).await.unwrap().is_none());
        assert!(!store.get_plan(plan.id).await.unwrap().unwrap().has_rollout);
    }

    #[tokio::test]
    async fn blocking_check_finding_prevents_rollout() {
        let store = Arc::new(InMemoryStore::new());
        let plan = plan();
        store.save_plan(&plan).await.unwrap();
        store
            .save_issue(&Issue {
                id: IssueId::generate(),
                plan_id: plan.id,
                status: IssueStatus::Open,
                approval_satisfied: true,
            })
            .await
            .unwrap();
        store
            .save_plan_check_run(&PlanCheckRun {
                plan_id: plan.id,
                state: PlanCheckState::Done,
                findings: vec![PlanCheckFinding {
                    severity: Severity::Error,
                    message: "drops a column still in use".into(),
                }],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        creator(Arc::clone(&store))
            .consider_plan(plan.id)
            .await
            .unwrap();

        assert!(store.get_pipeline_by_plan(plan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_issue_prevents_rollout() {
        let store = Arc::new(InMemoryStore::new());
        let plan = plan();
        store.save_plan(&plan).await.unwrap();
        store
            .save_issue(&Issue {
                id: IssueId::generate(),
                plan_id: plan.id,
                status: IssueStatus::Closed,
                approval_satisfied: true,
            })
            .await
            .unwrap();

        creator(Arc::clone(&store))
            .consider_plan(plan.id)
            .await
            .unwrap();

        assert!(store.get_pipeline_by_plan(plan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_creators_materialize_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let plan = plan();
        store.save_plan(&plan).await.unwrap();
        approve(&store, plan.id).await;

        let a = creator(Arc::clone(&store));
        let b = creator(Arc::clone(&store));
        let (ra, rb) = tokio::join!(a.consider_plan(plan.id), b.consider_plan(plan.id));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(store.task_run_count().unwrap(), 1);
    }
}
