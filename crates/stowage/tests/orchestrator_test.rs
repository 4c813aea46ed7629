mod common;

use chrono::{DateTime, Utc};
use common::{file_item, memory_store, seed_scan, MockConnector, Store};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stowage_lib::rules::TargetSpec;
use stowage_lib::{
    AuditDatabase, MappingRule, MigrationOptions, MigrationOrchestrator, MigrationState,
    OperationStatus, PlanStore, Rule, RulesEngine, StowageError,
};
use tokio_util::sync::CancellationToken;

fn txt_to_docs() -> RulesEngine {
    RulesEngine::with_rules(vec![MappingRule::new(
        "docs",
        Rule::extension(["txt"]),
        TargetSpec::new("Docs/"),
        50,
    )])
}

fn txt_items(count: usize) -> Vec<stowage_lib::Item> {
    (0..count)
        .map(|i| file_item(&format!("/inbox/f{:04}.txt", i), 10, 1))
        .collect()
}

fn orchestrator(
    store: &Store,
    rules: RulesEngine,
    options: MigrationOptions,
    connector: &Arc<MockConnector>,
) -> MigrationOrchestrator<stowage_lib::SqliteDatabase> {
    MigrationOrchestrator::new(store.clone(), rules, options).with_connector(connector.clone())
}

fn small_batches() -> MigrationOptions {
    MigrationOptions {
        batch_size: 2,
        ..MigrationOptions::default()
    }
}

fn batches_of(batch_size: usize) -> MigrationOptions {
    MigrationOptions {
        batch_size,
        ..MigrationOptions::default()
    }
}

/// Connector whose `at_call`-th operation pauses the plan stored in the
/// returned slot.
fn pausing_at(store: &Store, at_call: usize) -> (Arc<MockConnector>, Arc<Mutex<Option<String>>>) {
    let plan_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let hook_store = store.clone();
    let hook_slot = plan_slot.clone();
    let connector = Arc::new(MockConnector::new("mock").with_hook(move |call| {
        if call == at_call {
            let plan_id = hook_slot.lock().unwrap().clone().unwrap();
            MigrationOrchestrator::new(hook_store.clone(), RulesEngine::new(), MigrationOptions::default())
                .pause_migration(&plan_id)
                .unwrap();
        }
    }));
    (connector, plan_slot)
}

#[tokio::test]
async fn test_rules_drive_plan_and_execution() {
    let store = memory_store();
    let mut items: Vec<_> = (1..=5)
        .map(|i| file_item(&format!("/home/u/Downloads/report{}.pdf", i), 100, 120))
        .collect();
    items.extend((1..=5).map(|i| file_item(&format!("/home/u/notes/note{}.txt", i), 20, 1)));
    let scan_id = seed_scan(&store, &items);

    let rules = RulesEngine::with_rules(vec![
        MappingRule::new(
            "old-downloads",
            Rule::all(vec![
                Rule::extension(["pdf"]),
                Rule::regex_path("downloads").unwrap(),
                Rule::age_based(Some(90), None),
            ]),
            TargetSpec::new("Archive/"),
            100,
        ),
        MappingRule::new("docs", Rule::extension(["txt"]), TargetSpec::new("Docs/"), 50),
    ]);

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, rules, MigrationOptions::default(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(plan.operations.len(), 10);
    let archived = plan
        .operations
        .iter()
        .filter(|op| op.target_path.starts_with("Archive/"))
        .count();
    let docs = plan
        .operations
        .iter()
        .filter(|op| op.target_path.starts_with("Docs/"))
        .count();
    assert_eq!((archived, docs), (5, 5));
    assert_eq!(plan.metrics.total_files, 10);
    assert_eq!(plan.metrics.total_size_bytes, 600);
    assert!(plan.metrics.depth_reduction > 0.0);
    assert_eq!(orchestrator.plan_state(&plan.id).unwrap(), MigrationState::Ready);

    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.completed_operations, 10);
    assert_eq!(result.failed_operations, 0);
    assert_eq!(connector.calls(), 10);
    assert!(result.completed_at.is_some());

    let actions: Vec<String> = store
        .lock()
        .unwrap()
        .get_audit_entries_for_plan(&plan.id)
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    for expected in [
        "plan_created",
        "plan_execution_started",
        "batch_checkpointed",
        "plan_execution_completed",
    ] {
        assert!(actions.iter().any(|a| a == expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_large_plan_checkpoints_every_batch() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(1200));

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();

    assert_eq!(result.total_operations, 1200);
    assert_eq!(result.completed_operations, 1200);
    assert_eq!(result.checkpoints_written, 3);

    let db = store.lock().unwrap();
    assert_eq!(db.checkpoint_count(&plan.id).unwrap(), 3);
    assert_eq!(db.last_checkpoint(&plan.id).unwrap().unwrap().batch_index, 2);
    let stored = db.get_plan(&plan.id).unwrap().unwrap();
    assert!(stored
        .operations
        .iter()
        .all(|op| op.status == OperationStatus::Completed));
}

#[tokio::test]
async fn test_simulation_never_touches_storage() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(4));

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .simulate_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(plan.is_what_if);
    assert_eq!(plan.operations.len(), 4);

    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(connector.calls(), 0);
    assert_eq!(result.skipped_operations, 4);
    assert_eq!(result.completed_operations, 0);
    assert_eq!(result.final_state, MigrationState::Completed);
}

#[tokio::test]
async fn test_failures_are_recorded_per_operation() {
    let store = memory_store();
    let items = vec![
        file_item("/d/ok.txt", 1, 1),
        file_item("/d/flaky.txt", 1, 1),
        file_item("/d/dead.txt", 1, 1),
        file_item("/d/corrupt.txt", 1, 1),
    ];
    let scan_id = seed_scan(&store, &items);

    let connector = Arc::new(
        MockConnector::new("mock")
            .failing_transiently("/d/flaky.txt", 2)
            .failing_transiently("/d/dead.txt", 10)
            .corrupting("/d/corrupt.txt"),
    );
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();

    assert_eq!(result.final_state, MigrationState::Completed);
    assert_eq!(result.completed_operations, 2);
    assert_eq!(result.failed_operations, 2);
    // ok 1 + flaky 3 + dead 4 + corrupt 1
    assert_eq!(connector.calls(), 9);

    let stored = store.lock().unwrap().get_plan(&plan.id).unwrap().unwrap();
    let by_source = |path: &str| {
        stored
            .operations
            .iter()
            .find(|op| op.source_path == path)
            .cloned()
            .unwrap()
    };

    let flaky = by_source("/d/flaky.txt");
    assert_eq!(flaky.status, OperationStatus::Completed);
    assert_eq!(flaky.retry_count, 2);

    let dead = by_source("/d/dead.txt");
    assert_eq!(dead.status, OperationStatus::Failed);
    assert_eq!(dead.retry_count, 3);

    let corrupt = by_source("/d/corrupt.txt");
    assert_eq!(corrupt.status, OperationStatus::Failed);
    assert_eq!(corrupt.retry_count, 0);
    assert!(corrupt
        .error
        .unwrap()
        .to_lowercase()
        .contains("hash mismatch"));
    assert!(corrupt.executed_at.is_some());

    let failures = store
        .lock()
        .unwrap()
        .get_audit_entries(Some(plan.id.as_str()), Some("operation_failed"), None)
        .unwrap();
    assert_eq!(failures.len(), 2);
}

#[tokio::test]
async fn test_pause_takes_effect_at_batch_boundary_and_resumes() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(6));

    let plan_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let hook_store = store.clone();
    let hook_slot = plan_slot.clone();
    let connector = Arc::new(MockConnector::new("mock").with_hook(move |call| {
        if call == 3 {
            let plan_id = hook_slot.lock().unwrap().clone().unwrap();
            MigrationOrchestrator::new(hook_store.clone(), RulesEngine::new(), MigrationOptions::default())
                .pause_migration(&plan_id)
                .unwrap();
        }
    }));
    let orchestrator = orchestrator(&store, txt_to_docs(), small_batches(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    *plan_slot.lock().unwrap() = Some(plan.id.clone());

    let first = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(first.final_state, MigrationState::Paused);
    assert_eq!(first.completed_operations, 4);
    assert_eq!(first.checkpoints_written, 2);
    assert_eq!(connector.calls(), 4);
    assert_eq!(orchestrator.plan_state(&plan.id).unwrap(), MigrationState::Paused);

    let resumed = orchestrator.resume_migration(&plan.id, &cancel).await.unwrap();
    assert_eq!(resumed.final_state, MigrationState::Completed);
    assert_eq!(resumed.completed_operations, 6);
    assert_eq!(resumed.checkpoints_written, 1);
    assert_eq!(connector.calls(), 6);
    assert_eq!(store.lock().unwrap().checkpoint_count(&plan.id).unwrap(), 3);
}

#[tokio::test]
async fn test_cancellation_pauses_and_resume_finishes() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(6));

    let connector = Arc::new(MockConnector::new("mock").cancelling_at(3));
    let orchestrator = orchestrator(&store, txt_to_docs(), small_batches(), &connector);

    let cancel = CancellationToken::new();
    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();

    let first = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(first.final_state, MigrationState::Paused);
    assert_eq!(first.completed_operations, 2);
    assert_eq!(first.skipped_operations, 2);
    assert_eq!(first.checkpoints_written, 1);

    let stored = store.lock().unwrap().get_plan(&plan.id).unwrap().unwrap();
    let cancelled: Vec<_> = stored
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Skipped)
        .collect();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled
        .iter()
        .all(|op| op.error.as_deref() == Some("cancelled")));

    let resumed = orchestrator
        .resume_migration(&plan.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.final_state, MigrationState::Completed);
    assert_eq!(resumed.completed_operations, 6);
    assert_eq!(resumed.skipped_operations, 0);
    assert_eq!(resumed.checkpoints_written, 2);
    assert_eq!(connector.calls(), 7);
    assert_eq!(store.lock().unwrap().checkpoint_count(&plan.id).unwrap(), 3);
}

#[tokio::test]
async fn test_resume_with_larger_batches_finishes_every_operation() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(10));

    let (connector, plan_slot) = pausing_at(&store, 5);
    let cancel = CancellationToken::new();
    let first_run = orchestrator(&store, txt_to_docs(), small_batches(), &connector);
    let plan = first_run
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    *plan_slot.lock().unwrap() = Some(plan.id.clone());

    let first = first_run.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(first.final_state, MigrationState::Paused);
    assert_eq!(first.completed_operations, 6);
    assert_eq!(first.checkpoints_written, 3);

    let second_run = orchestrator(&store, txt_to_docs(), batches_of(5), &connector);
    let resumed = second_run.resume_migration(&plan.id, &cancel).await.unwrap();
    assert_eq!(resumed.final_state, MigrationState::Completed);
    assert_eq!(resumed.completed_operations, 10);
    assert_eq!(resumed.checkpoints_written, 1);
    assert_eq!(connector.calls(), 10);

    let db = store.lock().unwrap();
    let stored = db.get_plan(&plan.id).unwrap().unwrap();
    assert!(stored
        .operations
        .iter()
        .all(|op| op.status == OperationStatus::Completed));
    assert_eq!(db.checkpoint_count(&plan.id).unwrap(), 4);
    assert_eq!(db.last_checkpoint(&plan.id).unwrap().unwrap().batch_index, 3);
}

#[tokio::test]
async fn test_resume_with_smaller_batches_keeps_checkpoint_numbering() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(10));

    let (connector, plan_slot) = pausing_at(&store, 1);
    let cancel = CancellationToken::new();
    let first_run = orchestrator(&store, txt_to_docs(), batches_of(4), &connector);
    let plan = first_run
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    *plan_slot.lock().unwrap() = Some(plan.id.clone());

    let first = first_run.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(first.completed_operations, 4);

    let second_run = orchestrator(&store, txt_to_docs(), batches_of(3), &connector);
    let resumed = second_run.resume_migration(&plan.id, &cancel).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.completed_operations, 10);
    assert_eq!(resumed.checkpoints_written, 2);
    assert_eq!(connector.calls(), 10);

    let db = store.lock().unwrap();
    assert_eq!(db.checkpoint_count(&plan.id).unwrap(), 3);
    assert_eq!(db.last_checkpoint(&plan.id).unwrap().unwrap().batch_index, 2);
}

#[tokio::test]
async fn test_plan_left_running_by_a_dead_process_is_executed_again() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(6));

    let (connector, plan_slot) = pausing_at(&store, 3);
    let cancel = CancellationToken::new();
    let first_run = orchestrator(&store, txt_to_docs(), small_batches(), &connector);
    let plan = first_run
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    *plan_slot.lock().unwrap() = Some(plan.id.clone());
    first_run.execute_plan(&plan, &cancel).await.unwrap();

    // The process died mid-run: checkpoints are durable, the state is stale.
    store
        .lock()
        .unwrap()
        .update_plan_state(&plan.id, MigrationState::Running)
        .unwrap();

    let restarted = orchestrator(&store, txt_to_docs(), small_batches(), &connector);
    let result = restarted.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(result.final_state, MigrationState::Completed);
    assert_eq!(result.completed_operations, 6);
    assert_eq!(result.checkpoints_written, 1);
    assert_eq!(connector.calls(), 6);

    let recovered = store
        .lock()
        .unwrap()
        .get_audit_entries(Some(plan.id.as_str()), Some("plan_recovered"), None)
        .unwrap();
    assert_eq!(recovered.len(), 1);
}

#[tokio::test]
async fn test_resume_accepts_a_plan_left_running() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(4));

    let (connector, plan_slot) = pausing_at(&store, 1);
    let cancel = CancellationToken::new();
    let first_run = orchestrator(&store, txt_to_docs(), small_batches(), &connector);
    let plan = first_run
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    *plan_slot.lock().unwrap() = Some(plan.id.clone());
    first_run.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(connector.calls(), 2);

    store
        .lock()
        .unwrap()
        .update_plan_state(&plan.id, MigrationState::Running)
        .unwrap();

    let resumed = first_run.resume_migration(&plan.id, &cancel).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.completed_operations, 4);
    assert_eq!(connector.calls(), 4);
    assert_eq!(
        first_run.plan_state(&plan.id).unwrap(),
        MigrationState::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_batches_wait_for_execution_window() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(2));

    let checks = Arc::new(AtomicUsize::new(0));
    let policy_checks = checks.clone();
    let policy = move |_now: DateTime<Utc>| policy_checks.fetch_add(1, Ordering::SeqCst) >= 2;

    let connector = Arc::new(MockConnector::new("mock"));
    let options = MigrationOptions {
        window_poll_interval: Duration::from_secs(30),
        ..MigrationOptions::default()
    };
    let orchestrator = orchestrator(&store, txt_to_docs(), options, &connector)
        .with_execution_policy(Arc::new(policy));
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(result.completed_operations, 2);
    assert!(checks.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_window_pauses() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(3));

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector)
        .with_execution_policy(Arc::new(|_now: DateTime<Utc>| false));

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();

    assert_eq!(result.final_state, MigrationState::Paused);
    assert_eq!(connector.calls(), 0);
    assert_eq!(result.skipped_operations, 3);
}

#[tokio::test]
async fn test_illegal_transitions_are_rejected() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(1));

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector);
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();

    assert!(matches!(
        orchestrator.pause_migration(&plan.id),
        Err(StowageError::InvalidStatusTransition { .. })
    ));
    assert!(matches!(
        orchestrator.resume_migration(&plan.id, &cancel).await,
        Err(StowageError::InvalidStatusTransition { .. })
    ));

    orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert!(matches!(
        orchestrator.execute_plan(&plan, &cancel).await,
        Err(StowageError::InvalidStatusTransition { .. })
    ));
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_missing_connector_fails_operations_only() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(2));

    let orchestrator =
        MigrationOrchestrator::new(store.clone(), txt_to_docs(), MigrationOptions::default());
    let cancel = CancellationToken::new();

    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(plan.metrics.compliance_uplift, 0.0);

    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(result.final_state, MigrationState::Completed);
    assert_eq!(result.failed_operations, 2);
    assert!(result.failed_items[0]
        .error
        .as_deref()
        .unwrap()
        .contains("No connector"));
}

#[tokio::test]
async fn test_existing_target_gets_version_suffix() {
    let store = memory_store();
    let items = vec![
        file_item("/inbox/a.txt", 5, 1),
        file_item("Docs/a.txt", 5, 1),
    ];
    let scan_id = seed_scan(&store, &items);

    let connector = Arc::new(MockConnector::new("mock"));
    let orchestrator = orchestrator(&store, txt_to_docs(), MigrationOptions::default(), &connector);
    let plan = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(plan.operations.len(), 1);
    assert_eq!(plan.operations[0].source_path, "/inbox/a.txt");
    assert_eq!(plan.operations[0].target_path, "Docs/a (2).txt");
}

#[tokio::test]
async fn test_cancelled_planning_persists_nothing() {
    let store = memory_store();
    let scan_id = seed_scan(&store, &txt_items(3));

    let orchestrator =
        MigrationOrchestrator::new(store.clone(), txt_to_docs(), MigrationOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = orchestrator
        .create_plan(&scan_id, &MigrationOptions::default(), &cancel)
        .await;
    assert!(matches!(result, Err(StowageError::Cancelled)));
    assert!(store.lock().unwrap().list_plans().unwrap().is_empty());
}
