//! End-to-end online schema change tests: sync, postpone, lag gate, cutover.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use strata_core::{InstanceId, IssueId, ProjectId};
use strata_flow::driver::InMemoryDriverFactory;
use strata_flow::executor::ExecutorRegistry;
use strata_flow::ghost::{GhostConfig, SimulatedRowCopier};
use strata_flow::notify::RecordingSink;
use strata_flow::plan::{
    ChangeKind, ChangeSpec, Issue, IssueStatus, Plan, PlanCheckRun, PlanCheckState, TaskKind,
};
use strata_flow::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use strata_flow::store::{InMemoryStore, Store};
use strata_flow::taskrun::{TaskRun, TaskRunState};

struct Harness {
    store: Arc<InMemoryStore>,
    drivers: Arc<InMemoryDriverFactory>,
    handle: SchedulerHandle,
    flag_dir: tempfile::TempDir,
}

fn start_scheduler(replica_id: &str, cutover_retries: u32) -> Harness {
    let flag_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let drivers = Arc::new(InMemoryDriverFactory::new());
    let config = SchedulerConfig {
        replica_id: replica_id.into(),
        tick_interval: Duration::from_millis(25),
        notification_window: Duration::from_millis(80),
        ghost: GhostConfig {
            chunk_size: 500,
            heartbeat_interval: Duration::from_millis(2),
            gate_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            cutover_retries,
            flag_dir: flag_dir.path().to_path_buf(),
            ..GhostConfig::default()
        },
    };
    let copier = Arc::new(SimulatedRowCopier::new(config.ghost.clone(), 2000));

    let handle = Scheduler::new(
        config,
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&drivers) as _,
        Arc::new(ExecutorRegistry::builtin(copier)),
        Arc::new(RecordingSink::new()) as _,
    )
    .start();

    Harness {
        store,
        drivers,
        handle,
        flag_dir,
    }
}

fn ghost_plan(instance: InstanceId) -> Plan {
    Plan::new(
        ProjectId::generate(),
        "online-change",
        vec![ChangeSpec {
            kind: ChangeKind::GhostMigrate,
            instance_id: instance,
            database_name: "orders".into(),
            statement: "ALTER TABLE orders ADD COLUMN note TEXT".into(),
            schema_version: Some("0001".into()),
            environment: "prod".into(),
            run_at: None,
        }],
    )
}

async fn approve(store: &InMemoryStore, plan: &Plan) {
    store.save_plan(plan).await.unwrap();
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
            findings: vec![],
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

async fn wait_until<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn ghost_migration_syncs_postpones_and_cuts_over() {
    let harness = start_scheduler("ghost-happy", 50);
    let instance = InstanceId::generate();
    let plan = ghost_plan(instance);
    approve(&harness.store, &plan).await;

    harness.handle.plans.send(plan.id).await.unwrap();

    let store = Arc::clone(&harness.store);
    wait_until("sync and cutover both DONE", || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_task_runs_by_state(TaskRunState::Done)
                .await
                .map_or(false, |runs| runs.len() == 2)
        }
    })
    .await;

    // The sync run recorded row-copy progress.
    let tasks = harness.store.list_tasks_by_plan(plan.id).await.unwrap();
    let sync_task = tasks.iter().find(|t| t.kind == TaskKind::GhostSync).unwrap();
    let sync_run = harness
        .store
        .latest_task_run_for_task(sync_task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync_run.progress, Some((2000, 2000)));

    // Cutover refreshed the schema snapshot and swept the shadow tables.
    let driver = harness.drivers.driver_for(instance, "orders").unwrap();
    assert!(driver.schema_sync_count() >= 1);
    let dropped = driver.dropped_tables().unwrap();
    assert!(dropped.contains(&"_orders_gho".to_owned()));
    assert!(dropped.contains(&"_orders_ghc".to_owned()));

    // No postpone flag left behind.
    let leftover = std::fs::read_dir(harness.flag_dir.path())
        .unwrap()
        .count();
    assert_eq!(leftover, 0);

    // The cutover run carries the migration record.
    let cutover_task = tasks
        .iter()
        .find(|t| t.kind == TaskKind::GhostCutover)
        .unwrap();
    let cutover_run = harness
        .store
        .latest_task_run_for_task(cutover_task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(cutover_run.result.unwrap().migration_id.is_some());

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn cutover_gate_stays_closed_under_replication_lag() {
    let harness = start_scheduler("ghost-lag", 3);
    let instance = InstanceId::generate();

    // Lag far above the 1500ms ceiling.
    let driver = harness.drivers.driver_for(instance, "orders").unwrap();
    driver.set_lag(Duration::from_secs(30));

    let plan = ghost_plan(instance);
    approve(&harness.store, &plan).await;
    harness.handle.plans.send(plan.id).await.unwrap();

    let store = Arc::clone(&harness.store);
    wait_until("cutover FAILED on closed gate", || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_task_runs_by_state(TaskRunState::Failed)
                .await
                .map_or(false, |runs| runs.len() == 1)
        }
    })
    .await;

    let failed = harness
        .store
        .list_task_runs_by_state(TaskRunState::Failed)
        .await
        .unwrap();
    let detail = failed[0].result.clone().unwrap().detail;
    assert!(detail.contains("cutover gate"), "got: {detail}");

    // The table was never renamed: no schema sync happened. The failed
    // attempt tore the migration down, so no postpone flag lingers either.
    assert_eq!(driver.schema_sync_count(), 0);
    let leftover = std::fs::read_dir(harness.flag_dir.path()).unwrap().count();
    assert_eq!(leftover, 0);

    // The teardown also consumed the handoff: a retried cutover run fails
    // the missing-handoff invariant instead of adopting the dead copier,
    // even once lag has recovered.
    driver.set_lag(Duration::ZERO);
    harness
        .store
        .create_task_runs(&[TaskRun::pending(failed[0].task_id, None)])
        .await
        .unwrap();
    harness.handle.promotion_tickle.tickle();

    let store = Arc::clone(&harness.store);
    wait_until("retried cutover FAILED on missing handoff", || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_task_runs_by_state(TaskRunState::Failed)
                .await
                .map_or(false, |runs| runs.len() == 2)
        }
    })
    .await;

    let failed = harness
        .store
        .list_task_runs_by_state(TaskRunState::Failed)
        .await
        .unwrap();
    let retry = failed.iter().max_by_key(|r| r.id).unwrap();
    let detail = retry.result.clone().unwrap().detail;
    assert!(detail.contains("handoff"), "got: {detail}");
    assert_eq!(driver.schema_sync_count(), 0);

    harness.handle.shutdown().await;
}
