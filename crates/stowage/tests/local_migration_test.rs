use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use stowage_lib::rules::TargetSpec;
use stowage_lib::{
    scan_provider, Connector, EnumerationFilters, InventoryStore, Item, LocalConnector,
    MappingRule, MigrationOptions, MigrationOrchestrator, MigrationState, OperationStatus,
    OperationType, Rule, RulesEngine, SqliteDatabase,
};
use tokio_util::sync::CancellationToken;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn store() -> Arc<Mutex<SqliteDatabase>> {
    let mut db = SqliteDatabase::open_in_memory().unwrap();
    db.initialize().unwrap();
    Arc::new(Mutex::new(db))
}

#[tokio::test]
async fn test_excluded_directories_are_never_enumerated() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "keep/a.txt", "a");
    write(dir.path(), "node_modules/pkg/index.js", "x");
    write(dir.path(), "keep/.Git/config", "y");
    write(dir.path(), "keep/b.tmp", "z");

    let connector = LocalConnector::new("local", dir.path());
    let filters = EnumerationFilters {
        excluded_file_patterns: vec!["*.tmp".to_string()],
        ..EnumerationFilters::default()
    }
    .with_excluded_directories(&["node_modules".to_string()], &[".git".to_string()]);

    let items = connector
        .enumerate("", &filters, CancellationToken::new())
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    let paths: Vec<&str> = items.iter().map(|i| i.path.as_str()).collect();
    assert!(paths.iter().any(|p| p.ends_with("a.txt")));
    assert!(paths.iter().all(|p| !p.contains("node_modules")));
    assert!(paths.iter().all(|p| !p.contains(".Git")));
    assert!(paths.iter().all(|p| !p.ends_with(".tmp")));
}

#[tokio::test]
async fn test_scan_plan_and_move_local_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    write(&root, "inbox/report.pdf", "pdf body");
    write(&root, "inbox/notes.txt", "some notes");
    write(&root, "inbox/photo.jpg", "jpeg bytes");

    let store = store();
    let connector = Arc::new(LocalConnector::new("local", &root));
    let outcome = scan_provider(
        connector.as_ref(),
        &store,
        "",
        &EnumerationFilters::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.statistics.total_files, 3);

    let rules = RulesEngine::with_rules(vec![
        MappingRule::new("pdf", Rule::extension(["pdf"]), TargetSpec::new("Documents/PDF"), 10),
        MappingRule::new("text", Rule::extension(["txt"]), TargetSpec::new("Documents/Text"), 10),
    ]);
    let options = MigrationOptions {
        non_destructive: false,
        ..MigrationOptions::default()
    };
    let orchestrator = MigrationOrchestrator::new(store.clone(), rules, options.clone())
        .with_connector(connector.clone());

    let cancel = CancellationToken::new();
    let plan = orchestrator
        .create_plan(&outcome.scan_id, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(plan.operations.len(), 2);
    assert!(plan
        .operations
        .iter()
        .all(|op| op.operation_type == OperationType::Move));

    let result = orchestrator.execute_plan(&plan, &cancel).await.unwrap();
    assert_eq!(result.final_state, MigrationState::Completed);
    assert_eq!(result.completed_operations, 2);

    assert!(root.join("Documents/PDF/report.pdf").is_file());
    assert_eq!(
        fs::read_to_string(root.join("Documents/Text/notes.txt")).unwrap(),
        "some notes"
    );
    assert!(!root.join("inbox/report.pdf").exists());
    assert!(root.join("inbox/photo.jpg").exists());

    let stored = store
        .lock()
        .unwrap()
        .query_items(&outcome.scan_id, &|item: &Item| item.is_file())
        .unwrap();
    assert_eq!(stored.len(), 3);
}

/// Scan `root` with a local connector rooted there, plan with `rules` and
/// return everything needed to execute.
async fn scan_and_plan(
    root: &Path,
    rules: RulesEngine,
    options: MigrationOptions,
) -> (
    MigrationOrchestrator<SqliteDatabase>,
    stowage_lib::MigrationPlan,
) {
    let store = store();
    let connector = Arc::new(LocalConnector::new("local", root));
    let outcome = scan_provider(
        connector.as_ref(),
        &store,
        "",
        &EnumerationFilters::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let orchestrator =
        MigrationOrchestrator::new(store, rules, options.clone()).with_connector(connector);
    let plan = orchestrator
        .create_plan(&outcome.scan_id, &options, &CancellationToken::new())
        .await
        .unwrap();
    (orchestrator, plan)
}

fn age(root: &Path, relative: &str, days: u64) {
    let modified = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    fs::File::options()
        .write(true)
        .open(root.join(relative))
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

#[tokio::test]
async fn test_old_downloads_are_archived_and_notes_filed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let downloads = [
        "Downloads/invoice-01.pdf",
        "Downloads/2023/invoice-02.pdf",
        "Downloads/2023/q1/invoice-03.pdf",
        "Downloads/2023/q2/invoice-04.pdf",
        "Downloads/2024/q1/invoice-05.pdf",
    ];
    let notes = [
        "Notes/a.txt",
        "Notes/work/b.txt",
        "Notes/work/2024/c.txt",
        "Notes/home/d.txt",
        "Notes/home/lists/e.txt",
    ];
    for path in downloads {
        write(root, path, path);
        age(root, path, 120);
    }
    for path in notes {
        write(root, path, path);
    }

    let rules = RulesEngine::with_rules(vec![
        MappingRule::new(
            "archive",
            Rule::all(vec![
                Rule::regex_path("^Downloads/").unwrap(),
                Rule::age_based(Some(90), None),
            ]),
            TargetSpec::new("Archive/"),
            100,
        ),
        MappingRule::new("notes", Rule::extension(["txt"]), TargetSpec::new("Docs/"), 50),
    ]);
    let options = MigrationOptions {
        non_destructive: false,
        batch_size: 3,
        ..MigrationOptions::default()
    };
    let (orchestrator, plan) = scan_and_plan(root, rules, options).await;
    assert_eq!(plan.operations.len(), 10);
    assert!(plan
        .operations
        .iter()
        .all(|op| op.operation_type == OperationType::Move));

    let result = orchestrator
        .execute_plan(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.final_state, MigrationState::Completed);
    assert_eq!(result.completed_operations, 10);
    assert_eq!(result.checkpoints_written, 4);

    for path in downloads {
        let name = path.rsplit('/').next().unwrap();
        assert_eq!(fs::read_to_string(root.join("Archive").join(name)).unwrap(), path);
        assert!(!root.join(path).exists());
    }
    for path in notes {
        let name = path.rsplit('/').next().unwrap();
        assert_eq!(fs::read_to_string(root.join("Docs").join(name)).unwrap(), path);
        assert!(!root.join(path).exists());
    }
}

fn txt_to_out() -> RulesEngine {
    RulesEngine::with_rules(vec![MappingRule::new(
        "text",
        Rule::extension(["txt"]),
        TargetSpec::new("out"),
        1,
    )])
}

#[tokio::test]
async fn test_same_named_destination_gets_a_version_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "in/a.txt", "new");
    write(root, "out/a.txt", "old");

    let (orchestrator, plan) = scan_and_plan(root, txt_to_out(), MigrationOptions::default()).await;

    assert_eq!(plan.operations.len(), 1);
    let op = &plan.operations[0];
    assert_eq!(op.source_path, "in/a.txt");
    assert_eq!(op.target_path, "out/a (2).txt");

    let result = orchestrator
        .execute_plan(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.completed_operations, 1);
    assert_eq!(fs::read_to_string(root.join("out/a.txt")).unwrap(), "old");
    assert_eq!(fs::read_to_string(root.join("out/a (2).txt")).unwrap(), "new");
    assert_eq!(fs::read_to_string(root.join("in/a.txt")).unwrap(), "new");
}

#[tokio::test]
async fn test_destination_created_after_planning_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "in/a.txt", "new");
    write(root, "out/a.txt", "old");

    let options = MigrationOptions {
        max_retries: 0,
        ..MigrationOptions::default()
    };
    let (orchestrator, plan) = scan_and_plan(root, txt_to_out(), options).await;
    write(root, "out/a (2).txt", "arrived later");

    let result = orchestrator
        .execute_plan(&plan, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.failed_operations, 1);
    assert_eq!(result.failed_items[0].status, OperationStatus::Failed);
    assert_eq!(
        fs::read_to_string(root.join("out/a (2).txt")).unwrap(),
        "arrived later"
    );
    assert_eq!(fs::read_to_string(root.join("out/a.txt")).unwrap(), "old");
    assert_eq!(fs::read_to_string(root.join("in/a.txt")).unwrap(), "new");
}
