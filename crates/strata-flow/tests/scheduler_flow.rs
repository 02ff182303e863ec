//! End-to-end scheduler tests: plan approval through terminal task runs,
//! driven through the real rollout/promotion/dispatch loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use strata_core::{InstanceId, IssueId, ProjectId};
use strata_flow::driver::InMemoryDriverFactory;
use strata_flow::executor::ExecutorRegistry;
use strata_flow::ghost::{GhostConfig, SimulatedRowCopier};
use strata_flow::notify::{NotificationKind, RecordingSink};
use strata_flow::plan::{
    ChangeKind, ChangeSpec, Issue, IssueStatus, Plan, PlanCheckRun, PlanCheckState,
};
use strata_flow::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use strata_flow::store::{InMemoryStore, Store};
use strata_flow::taskrun::{TaskRun, TaskRunState};

fn fast_ghost_config(flag_dir: std::path::PathBuf) -> GhostConfig {
    GhostConfig {
        chunk_size: 500,
        heartbeat_interval: Duration::from_millis(2),
        gate_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        cutover_retries: 50,
        flag_dir,
        ..GhostConfig::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    drivers: Arc<InMemoryDriverFactory>,
    sink: Arc<RecordingSink>,
    handle: SchedulerHandle,
    _flag_dir: tempfile::TempDir,
}

fn start_scheduler(replica_id: &str, copier_rows: u64) -> Harness {
    let flag_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let drivers = Arc::new(InMemoryDriverFactory::new());
    let sink = Arc::new(RecordingSink::new());
    let config = SchedulerConfig {
        replica_id: replica_id.into(),
        tick_interval: Duration::from_millis(25),
        notification_window: Duration::from_millis(80),
        ghost: fast_ghost_config(flag_dir.path().to_path_buf()),
    };
    let copier = Arc::new(SimulatedRowCopier::new(config.ghost.clone(), copier_rows));

    let handle = Scheduler::new(
        config,
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&drivers) as _,
        Arc::new(ExecutorRegistry::builtin(copier)),
        Arc::clone(&sink) as _,
    )
    .start();

    Harness {
        store,
        drivers,
        sink,
        handle,
        _flag_dir: flag_dir,
    }
}

fn ddl_spec(instance: InstanceId, environment: &str, version: &str) -> ChangeSpec {
    ChangeSpec {
        kind: ChangeKind::DdlMigrate,
        instance_id: instance,
        database_name: "orders".into(),
        statement: format!("ALTER TABLE orders ADD COLUMN c{version} INT"),
        schema_version: Some(version.into()),
        environment: environment.into(),
        run_at: None,
    }
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

async fn runs_in_state(store: &InMemoryStore, state: TaskRunState) -> usize {
    store
        .list_task_runs_by_state(state)
        .await
        .map_or(0, |runs| runs.len())
}

#[tokio::test]
async fn approved_plan_executes_to_done_and_notifies_completion() {
    let harness = start_scheduler("e2e-happy", 1000);
    let instance = InstanceId::generate();
    let plan = Plan::new(
        ProjectId::generate(),
        "release-1",
        vec![
            ddl_spec(instance, "staging", "0001"),
            ddl_spec(instance, "prod", "0002"),
        ],
    );
    approve(&harness.store, &plan).await;

    harness.handle.plans.send(plan.id).await.unwrap();

    let store = Arc::clone(&harness.store);
    wait_until("both runs DONE", || {
        let store = Arc::clone(&store);
        async move { runs_in_state(&store, TaskRunState::Done).await == 2 }
    })
    .await;

    // Both statements reached the driver, lower version first.
    let driver = harness.drivers.driver_for(instance, "orders").unwrap();
    let executed = driver.executed_statements().unwrap();
    assert_eq!(executed.len(), 2);
    assert!(executed[0].contains("c0001"));
    assert!(executed[1].contains("c0002"));

    let sink = Arc::clone(&harness.sink);
    wait_until("completion notification", || {
        let sink = Arc::clone(&sink);
        async move {
            sink.sent().map_or(false, |sent| {
                sent.iter()
                    .any(|n| n.kind == NotificationKind::PipelineCompleted)
            })
        }
    })
    .await;

    let sent = harness.sink.sent().unwrap();
    assert_eq!(sent.len(), 1, "exactly one completion notification");

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn failed_statement_fails_run_with_verbatim_detail_and_retry_succeeds() {
    let harness = start_scheduler("e2e-retry", 1000);
    let instance = InstanceId::generate();
    let plan = Plan::new(
        ProjectId::generate(),
        "release-2",
        vec![ddl_spec(instance, "prod", "0001")],
    );

    // Arrange the driver to reject the first attempt.
    let driver = harness.drivers.driver_for(instance, "orders").unwrap();
    driver
        .fail_next_execute("ERROR 1060 (42S21): Duplicate column name 'c0001'")
        .unwrap();

    approve(&harness.store, &plan).await;
    harness.handle.plans.send(plan.id).await.unwrap();

    let store = Arc::clone(&harness.store);
    wait_until("run FAILED", || {
        let store = Arc::clone(&store);
        async move { runs_in_state(&store, TaskRunState::Failed).await == 1 }
    })
    .await;

    let failed = harness
        .store
        .list_task_runs_by_state(TaskRunState::Failed)
        .await
        .unwrap();
    let detail = failed[0].result.clone().unwrap().detail;
    assert!(
        detail.contains("ERROR 1060 (42S21): Duplicate column name"),
        "driver error must surface verbatim, got: {detail}"
    );

    let sink = Arc::clone(&harness.sink);
    wait_until("failure notification", || {
        let sink = Arc::clone(&sink);
        async move {
            sink.sent().map_or(false, |sent| {
                sent.iter()
                    .any(|n| n.kind == NotificationKind::PipelineFailed)
            })
        }
    })
    .await;

    // Operator retry: a fresh PENDING run for the same task.
    let task_id = failed[0].task_id;
    harness
        .store
        .create_task_runs(&[TaskRun::pending(task_id, None)])
        .await
        .unwrap();
    harness.handle.promotion_tickle.tickle();

    let store = Arc::clone(&harness.store);
    wait_until("retry DONE", || {
        let store = Arc::clone(&store);
        async move { runs_in_state(&store, TaskRunState::Done).await == 1 }
    })
    .await;

    // The failed attempt is untouched; the retry is a separate run.
    assert_eq!(runs_in_state(&harness.store, TaskRunState::Failed).await, 1);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn scheduled_run_waits_for_its_start_time() {
    let harness = start_scheduler("e2e-run-at", 1000);
    let instance = InstanceId::generate();
    let mut spec = ddl_spec(instance, "prod", "0001");
    spec.run_at = Some(Utc::now() + chrono::Duration::milliseconds(400));
    let plan = Plan::new(ProjectId::generate(), "release-3", vec![spec]);
    approve(&harness.store, &plan).await;

    harness.handle.plans.send(plan.id).await.unwrap();

    // Materialized but held back.
    let store = Arc::clone(&harness.store);
    wait_until("pending run with waiting cause", || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_task_runs_by_state(TaskRunState::Pending)
                .await
                .map_or(false, |runs| {
                    runs.len() == 1 && runs[0].waiting_cause.is_some()
                })
        }
    })
    .await;

    let driver = harness.drivers.driver_for(instance, "orders").unwrap();
    assert!(driver.executed_statements().unwrap().is_empty());

    // After the start time passes, the run executes.
    let store = Arc::clone(&harness.store);
    wait_until("run DONE after run_at", || {
        let store = Arc::clone(&store);
        async move { runs_in_state(&store, TaskRunState::Done).await == 1 }
    })
    .await;

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_inflight_runs() {
    // A copier this large is still in its copy phase when shutdown lands.
    let harness = start_scheduler("e2e-shutdown", 100_000_000);
    let instance = InstanceId::generate();
    let plan = Plan::new(
        ProjectId::generate(),
        "release-4",
        vec![ChangeSpec {
            kind: ChangeKind::GhostMigrate,
            instance_id: instance,
            database_name: "orders".into(),
            statement: "ALTER TABLE orders ADD COLUMN note TEXT".into(),
            schema_version: Some("0001".into()),
            environment: "prod".into(),
            run_at: None,
        }],
    );
    approve(&harness.store, &plan).await;
    harness.handle.plans.send(plan.id).await.unwrap();

    let ctx = Arc::clone(harness.handle.context());
    wait_until("sync run in flight", || {
        let ctx = Arc::clone(&ctx);
        async move { ctx.inflight_count().unwrap_or(0) > 0 }
    })
    .await;

    let store = Arc::clone(&harness.store);
    harness.handle.shutdown().await;

    // Settlement happens on a detached task; poll for the terminal state.
    wait_until("in-flight run CANCELED", || {
        let store = Arc::clone(&store);
        async move { runs_in_state(&store, TaskRunState::Canceled).await == 1 }
    })
    .await;
}
