use crate::util::format::{format_bytes, format_elapsed};
use crate::util::progress::create_progress_bar;
use chrono::NaiveTime;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use console::style;
use dialoguer::Confirm;
use std::path::Path;
use std::sync::{Arc, Mutex};
use stowage_lib::{
    progress_channel, MigrationOrchestrator, MigrationResult, MigrationState, PlanStore, Result,
    RulesEngine, Settings, SqliteDatabase, StowageError,
};
use tokio_util::sync::CancellationToken;

pub struct ExecuteArgs<'a> {
    pub plan_id: &'a str,
    pub yes: bool,
    pub target_root: &'a Path,
    pub window_start: Option<&'a str>,
    pub window_end: Option<&'a str>,
    pub no_verify: bool,
}

fn parse_window_time(value: Option<&str>) -> Result<Option<NaiveTime>> {
    value
        .map(|v| {
            NaiveTime::parse_from_str(v, "%H:%M").map_err(|e| {
                StowageError::Config(format!("Invalid window time '{}': {}", v, e))
            })
        })
        .transpose()
}

pub fn handle_execute_command(
    db: SqliteDatabase,
    settings: &Settings,
    runtime: &tokio::runtime::Runtime,
    args: ExecuteArgs<'_>,
    _verbose: bool,
) -> Result<()> {
    let plan = db
        .get_plan(args.plan_id)?
        .ok_or_else(|| StowageError::PlanNotFound(args.plan_id.to_string()))?;
    let state = db.get_plan_state(args.plan_id)?;

    let mut options = settings.migration_options();
    options.off_hours_start = parse_window_time(args.window_start)?;
    options.off_hours_end = parse_window_time(args.window_end)?;
    if args.no_verify {
        options.verify_hashes = false;
    }
    if options.off_hours_start.is_some() != options.off_hours_end.is_some() {
        return Err(StowageError::Config(
            "Both --window-start and --window-end are required for an execution window".to_string(),
        ));
    }

    let resuming = matches!(state, MigrationState::Paused | MigrationState::Running);
    println!(
        "{} {} plan {} ({} operations, {})",
        style(">>>").cyan(),
        if resuming { "Resuming" } else { "Executing" },
        style(&plan.id).bold(),
        plan.total_operations(),
        format_bytes(plan.metrics.total_size_bytes)
    );
    if plan.is_what_if {
        println!("  {}", style("What-if plan: no changes will be made").yellow());
    }

    if !args.yes && !plan.is_what_if {
        let proceed = Confirm::new()
            .with_prompt("Proceed with the migration?")
            .default(false)
            .interact()?;
        if !proceed {
            println!("{}", style("Aborted").yellow());
            return Ok(());
        }
    }

    let (reporter, mut updates) = progress_channel(64);
    let bar = create_progress_bar(0, "Transferring");
    let bar_handle = bar.clone();

    let store = Arc::new(Mutex::new(db));
    let mut orchestrator =
        MigrationOrchestrator::new(store, RulesEngine::new(), options).with_progress(reporter);
    for connector in super::build_connectors(args.target_root, settings)? {
        orchestrator.register_connector(connector);
    }

    let cancel = CancellationToken::new();
    let result = super::block_on_cancellable(runtime, cancel.clone(), async move {
        let drain = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                bar_handle.set_length(update.total_bytes);
                bar_handle.set_position(update.bytes_transferred);
            }
        });

        let result = if resuming {
            orchestrator.resume_migration(&plan.id, &cancel).await
        } else {
            orchestrator.execute_plan(&plan, &cancel).await
        };

        drop(orchestrator);
        let _ = drain.await;
        result
    });
    bar.finish_and_clear();

    print_result(&result?);
    Ok(())
}

fn print_result(result: &MigrationResult) {
    let heading = match result.final_state {
        MigrationState::Completed => style("✓ Migration complete").green(),
        MigrationState::Paused => style("! Migration paused").yellow(),
        _ => style("✗ Migration stopped").red(),
    };
    println!("\n{}", heading);
    println!("  Completed: {}", style(result.completed_operations).cyan());
    println!("  Failed: {}", result.failed_operations);
    println!("  Skipped: {}", result.skipped_operations);
    println!("  Checkpoints this run: {}", result.checkpoints_written);
    if let Some(completed_at) = result.completed_at {
        println!("  Elapsed: {}", format_elapsed(result.started_at, completed_at));
    }

    if !result.failed_items.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Source", "Target", "Attempts", "Error"]);
        for op in &result.failed_items {
            table.add_row(vec![
                Cell::new(&op.source_path),
                Cell::new(&op.target_path),
                Cell::new(op.retry_count + 1),
                Cell::new(op.error.as_deref().unwrap_or("")),
            ]);
        }
        println!("{}", table);
    }

    if result.final_state == MigrationState::Paused {
        println!(
            "\nRun 'stowage execute {}' to resume",
            result.migration_id
        );
    }
}

pub fn handle_pause_command(db: SqliteDatabase, plan_id: &str) -> Result<()> {
    let orchestrator = MigrationOrchestrator::new(
        Arc::new(Mutex::new(db)),
        RulesEngine::new(),
        Default::default(),
    );
    orchestrator.pause_migration(plan_id)?;
    println!(
        "{} Plan {} will pause at its next batch boundary",
        style("✓").green(),
        style(plan_id).bold()
    );
    Ok(())
}
