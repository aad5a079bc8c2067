// ABOUTME: End-to-end reconciliation scenarios against an in-memory substrate and SQLite store
// ABOUTME: Covers each drift type, failure isolation, run serialization and audit invariants

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use liteboxd_sandbox::{
    ControlError, InMemorySubstrate, ReconcilerSettings, Reconciler, SandboxLocks,
    SandboxManager, Workload, WorkloadPhase,
};
use liteboxd_storage::{
    DesiredState, DriftType, FixOutcome, HistorySource, LifecycleStatus, NewSandbox, RunStatus,
    Sandbox, SandboxStore, TransitionRequest,
};
use pretty_assertions::assert_eq;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    liteboxd_storage::migrate(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn reconciler(pool: &SqlitePool, substrate: Arc<InMemorySubstrate>) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        pool.clone(),
        substrate,
        Arc::new(SandboxLocks::new()),
        ReconcilerSettings::default(),
    ))
}

/// Insert a sandbox with a fixed id and move it to `status`
async fn seed(pool: &SqlitePool, id: &str, status: LifecycleStatus) -> Sandbox {
    let store = SandboxStore::new(pool.clone());
    let sandbox = store
        .insert_sandbox(NewSandbox {
            id: Some(id.to_string()),
            image: "nginx:1.27".to_string(),
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            ttl_seconds: 3600,
            env: HashMap::new(),
            ..Default::default()
        })
        .await
        .expect("Failed to insert sandbox");

    if status == LifecycleStatus::Pending {
        return sandbox;
    }
    store
        .record_lifecycle_transition(
            id,
            TransitionRequest::new(status, HistorySource::SubstrateEvent, "seeded"),
        )
        .await
        .expect("Failed to seed lifecycle status")
}

/// Shift every timestamp of a sandbox `secs` into the past
async fn backdate(pool: &SqlitePool, id: &str, secs: i64) {
    let sandbox = SandboxStore::new(pool.clone()).get_sandbox(id).await.unwrap();
    let shift = ChronoDuration::seconds(secs);
    let fmt = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Micros, true);

    sqlx::query(
        "UPDATE sandboxes SET created_at = ?1, updated_at = ?2, expires_at = ?3 WHERE id = ?4",
    )
    .bind(fmt(sandbox.created_at - shift))
    .bind(fmt(sandbox.updated_at - shift))
    .bind(fmt(sandbox.expires_at - shift))
    .bind(id)
    .execute(pool)
    .await
    .unwrap();
}

fn workload(id: &str, phase: WorkloadPhase, since_secs: i64) -> Workload {
    Workload {
        id: id.to_string(),
        phase,
        ip: Some("10.88.0.10".to_string()),
        last_transition_at: Utc::now() - ChronoDuration::seconds(since_secs),
    }
}

#[tokio::test]
async fn test_missing_workload_with_failed_recreate_is_isolated() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-a", 600).await;
    substrate.fail_create(Some("insufficient cpu on all nodes")).await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();

    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.run.drift_count, 1);
    assert_eq!(detail.run.fixed_count, 0);
    assert_eq!(detail.items.len(), 1);

    let item = &detail.items[0];
    assert_eq!(item.sandbox_id, "sbx-a");
    assert_eq!(item.drift_type, DriftType::MissingInSubstrate);
    assert_eq!(item.action, "recreate");
    assert_eq!(item.outcome, FixOutcome::Failed);
    assert!(item.detail.contains("insufficient cpu on all nodes"));

    let store = SandboxStore::new(pool.clone());
    let sandbox = store.get_sandbox("sbx-a").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Error);
    assert_eq!(
        sandbox.status_reason.as_deref(),
        Some("workload missing from substrate")
    );
}

#[tokio::test]
async fn test_missing_workload_is_recreated() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-a", 601).await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();
    assert_eq!(detail.run.fixed_count, 1);
    assert_eq!(detail.items[0].outcome, FixOutcome::Fixed);
    assert_eq!(substrate.created().await, vec!["sbx-a"]);

    let history = SandboxStore::new(pool.clone())
        .list_status_history("sbx-a", None, None)
        .await
        .unwrap();
    let path: Vec<_> = history.iter().rev().map(|h| h.to_status).collect();
    assert_eq!(
        path,
        vec![
            LifecycleStatus::Pending,
            LifecycleStatus::Running,
            LifecycleStatus::Error,
            LifecycleStatus::Pending,
        ]
    );
    assert_eq!(history[0].reason, "workload recreated");
    assert_eq!(history[0].source, HistorySource::Reconciler);
}

#[tokio::test]
async fn test_orphan_workload_is_terminated() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    substrate
        .insert_workload(workload("sbx-x", WorkloadPhase::Running, 5))
        .await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();

    assert_eq!(detail.run.total_db, 0);
    assert_eq!(detail.run.total_substrate, 1);
    assert_eq!(detail.items.len(), 1);
    assert_eq!(detail.items[0].drift_type, DriftType::OrphanInSubstrate);
    assert_eq!(detail.items[0].action, "terminate");
    assert_eq!(detail.items[0].outcome, FixOutcome::Fixed);
    assert_eq!(substrate.terminated().await, vec!["sbx-x"]);
}

#[tokio::test]
async fn test_stale_status_follows_substrate() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Pending).await;
    substrate
        .insert_workload(workload("sbx-a", WorkloadPhase::Running, 120))
        .await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();
    assert_eq!(detail.items[0].drift_type, DriftType::StaleStatus);
    assert_eq!(detail.items[0].outcome, FixOutcome::Fixed);

    let store = SandboxStore::new(pool.clone());
    let sandbox = store.get_sandbox("sbx-a").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Running);
    assert_eq!(sandbox.pod_phase.as_deref(), Some("Running"));
    assert_eq!(sandbox.pod_ip.as_deref(), Some("10.88.0.10"));
    assert!(sandbox.last_seen_at.is_some());

    let history = store.list_status_history("sbx-a", None, None).await.unwrap();
    assert_eq!(history[0].source, HistorySource::Reconciler);
    assert_eq!(history[0].payload["pod_phase"], "Running");
}

#[tokio::test]
async fn test_expired_sandbox_is_deleted_then_reclaimed() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-old", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-old", 7200).await;
    substrate
        .insert_workload(workload("sbx-old", WorkloadPhase::Running, 7000))
        .await;
    let reconciler = reconciler(&pool, substrate.clone());
    let store = SandboxStore::new(pool.clone());

    let first = reconciler.trigger_manual().await.unwrap();
    assert_eq!(first.items[0].drift_type, DriftType::Expired);
    assert_eq!(first.items[0].action, "mark-deleted");
    let sandbox = store.get_sandbox("sbx-old").await.unwrap();
    assert_eq!(sandbox.desired_state, DesiredState::Deleted);
    // intent changed, belief did not
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Running);

    let second = reconciler.trigger_manual().await.unwrap();
    assert_eq!(second.items[0].drift_type, DriftType::OrphanInSubstrate);
    assert!(substrate.workload("sbx-old").await.is_none());
    let sandbox = store.get_sandbox("sbx-old").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Terminating);

    let third = reconciler.trigger_manual().await.unwrap();
    assert_eq!(third.items[0].drift_type, DriftType::StaleStatus);
    let sandbox = store.get_sandbox("sbx-old").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Terminated);
    assert!(sandbox.deleted_at.is_some());

    // reclaimed records drop out of reconciliation
    let fourth = reconciler.trigger_manual().await.unwrap();
    assert_eq!(fourth.run.total_db, 0);
    assert!(fourth.items.is_empty());

    // one history row per lifecycle change, in order
    let history = store.list_status_history("sbx-old", None, None).await.unwrap();
    let path: Vec<_> = history
        .iter()
        .rev()
        .map(|h| (h.from_status, h.to_status))
        .collect();
    assert_eq!(
        path,
        vec![
            (None, LifecycleStatus::Pending),
            (Some(LifecycleStatus::Pending), LifecycleStatus::Running),
            (Some(LifecycleStatus::Running), LifecycleStatus::Terminating),
            (Some(LifecycleStatus::Terminating), LifecycleStatus::Terminated),
        ]
    );
}

#[tokio::test]
async fn test_manual_trigger_conflicts_with_active_pass() {
    let pool = setup_pool().await;
    let gate = Arc::new(Notify::new());
    let substrate = Arc::new(InMemorySubstrate::new().with_snapshot_gate(gate.clone()));
    let entered = substrate.snapshot_entered();
    let reconciler = reconciler(&pool, substrate.clone());

    let scheduled = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.trigger_scheduled().await })
    };
    entered.notified().await;

    let err = reconciler.trigger_manual().await.unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));
    assert!(reconciler.trigger_scheduled().await.is_none());

    gate.notify_one();
    let first = scheduled
        .await
        .unwrap()
        .expect("scheduled pass should have run")
        .unwrap();
    assert_eq!(first.run.status, RunStatus::Completed);

    let runs = reconciler.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_snapshot_failure_seals_failed_run() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    substrate.fail_snapshot(Some("connection refused")).await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();

    assert_eq!(detail.run.status, RunStatus::Failed);
    assert!(detail.run.finished_at.is_some());
    assert!(detail
        .run
        .error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(detail.run.total_db, 1);
    assert!(detail.items.is_empty());
}

#[tokio::test]
async fn test_incomplete_snapshot_proves_no_absence() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-a", 3000).await;
    substrate
        .mark_incomplete(Some(vec!["node-3: inspect timed out".to_string()]))
        .await;

    let detail = reconciler(&pool, substrate.clone())
        .trigger_manual()
        .await
        .unwrap();

    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.run.drift_count, 0);
    assert_eq!(
        detail.run.error.as_deref(),
        Some("snapshot incomplete: node-3: inspect timed out")
    );
    assert!(substrate.created().await.is_empty());
}

#[tokio::test]
async fn test_fix_skips_record_changed_since_detection() {
    let pool = setup_pool().await;
    let gate = Arc::new(Notify::new());
    let substrate = Arc::new(InMemorySubstrate::new().with_create_gate(gate.clone()));
    let create_entered = substrate.create_entered();
    for id in ["sbx-a", "sbx-b"] {
        seed(&pool, id, LifecycleStatus::Running).await;
        backdate(&pool, id, 900).await;
    }

    // fixes run one at a time, so sbx-b waits behind sbx-a's create
    let locks = Arc::new(SandboxLocks::new());
    let reconciler = Arc::new(Reconciler::new(
        pool.clone(),
        substrate.clone(),
        locks.clone(),
        ReconcilerSettings {
            fix_concurrency: 1,
            ..Default::default()
        },
    ));
    let manager = SandboxManager::new(
        pool.clone(),
        substrate.clone(),
        locks,
        Duration::from_secs(5),
    );

    let pass = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.trigger_manual().await })
    };
    create_entered.notified().await;
    manager.set_desired_state("sbx-b", "deleted").await.unwrap();
    gate.notify_one();

    let detail = pass.await.unwrap().unwrap();
    let outcomes: Vec<_> = detail
        .items
        .iter()
        .map(|i| (i.sandbox_id.as_str(), i.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![("sbx-a", FixOutcome::Fixed), ("sbx-b", FixOutcome::Skipped)]
    );
    assert!(detail.items[1].detail.contains("record changed since detection"));
    assert_eq!(detail.run.fixed_count, 1);
    assert_eq!(detail.run.drift_count, 2);
    assert_eq!(substrate.created().await, vec!["sbx-a"]);
}

#[tokio::test]
async fn test_fix_past_deadline_fails_once() {
    let pool = setup_pool().await;
    // the gate is never opened, so create never returns on its own
    let substrate = Arc::new(InMemorySubstrate::new().with_create_gate(Arc::new(Notify::new())));
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-a", 900).await;

    let reconciler = Arc::new(Reconciler::new(
        pool.clone(),
        substrate.clone(),
        Arc::new(SandboxLocks::new()),
        ReconcilerSettings {
            fix_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    let detail = reconciler.trigger_manual().await.unwrap();

    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.run.drift_count, 1);
    assert_eq!(detail.run.fixed_count, 0);
    assert_eq!(detail.items.len(), 1);
    assert_eq!(detail.items[0].outcome, FixOutcome::Failed);
    assert!(detail.items[0]
        .detail
        .ends_with("; failed: create exceeded deadline of 100ms"));
    assert_eq!(substrate.create_attempts(), 1);
    assert!(substrate.created().await.is_empty());

    let sandbox = SandboxStore::new(pool.clone()).get_sandbox("sbx-a").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Error);
}

#[tokio::test]
async fn test_failed_sandbox_recovers_when_workload_runs() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Error).await;
    backdate(&pool, "sbx-a", 900).await;
    // a create that outlived its deadline came up afterwards
    substrate
        .insert_workload(workload("sbx-a", WorkloadPhase::Running, 600))
        .await;
    let reconciler = reconciler(&pool, substrate.clone());

    let detail = reconciler.trigger_manual().await.unwrap();
    assert_eq!(detail.items.len(), 1);
    assert_eq!(detail.items[0].drift_type, DriftType::StaleStatus);
    assert_eq!(detail.items[0].outcome, FixOutcome::Fixed);
    assert_eq!(
        detail.items[0].detail,
        "db_status=error, pod_phase=Running; lifecycle_status error -> running"
    );

    let store = SandboxStore::new(pool.clone());
    let sandbox = store.get_sandbox("sbx-a").await.unwrap();
    assert_eq!(sandbox.lifecycle_status, LifecycleStatus::Running);

    let history = store.list_status_history("sbx-a", None, None).await.unwrap();
    let recovery: Vec<_> = history
        .iter()
        .take(2)
        .rev()
        .map(|h| (h.from_status, h.to_status, h.source))
        .collect();
    assert_eq!(
        recovery,
        vec![
            (
                Some(LifecycleStatus::Error),
                LifecycleStatus::Pending,
                HistorySource::Reconciler
            ),
            (
                Some(LifecycleStatus::Pending),
                LifecycleStatus::Running,
                HistorySource::Reconciler
            ),
        ]
    );

    // converged
    let again = reconciler.trigger_manual().await.unwrap();
    assert!(again.items.is_empty());
    assert!(substrate.created().await.is_empty());
}

#[tokio::test]
async fn test_runs_never_overlap_and_counts_hold() {
    let pool = setup_pool().await;
    let substrate = Arc::new(InMemorySubstrate::new());
    seed(&pool, "sbx-a", LifecycleStatus::Running).await;
    backdate(&pool, "sbx-a", 900).await;
    substrate
        .insert_workload(workload("sbx-orphan", WorkloadPhase::Failed, 30))
        .await;
    let reconciler = reconciler(&pool, substrate.clone());

    for _ in 0..3 {
        reconciler.trigger_manual().await.unwrap();
    }

    let runs = reconciler.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 3);
    for pair in runs.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        assert!(older.finished_at.unwrap() <= newer.started_at);
    }
    for run in &runs {
        let detail = reconciler.get_run_detail(&run.id).await.unwrap();
        assert!(run.fixed_count <= run.drift_count);
        assert_eq!(run.drift_count, detail.items.len() as i64);
    }
}
