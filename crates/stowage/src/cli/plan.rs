use crate::util::format::{format_bytes, format_timestamp};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use console::style;
use std::path::Path;
use std::sync::{Arc, Mutex};
use stowage_lib::{
    MigrationOrchestrator, PlanStore, Result, RulesEngine, Settings, SqliteDatabase, StowageError,
};
use tokio_util::sync::CancellationToken;

const PREVIEW_ROWS: usize = 20;

pub struct PlanArgs<'a> {
    pub scan_id: &'a str,
    pub rules: &'a Path,
    pub what_if: bool,
    pub allow_destructive: bool,
    pub target_root: &'a Path,
}

pub fn handle_plan_command(
    db: SqliteDatabase,
    settings: &Settings,
    runtime: &tokio::runtime::Runtime,
    args: PlanArgs<'_>,
    verbose: bool,
) -> Result<()> {
    let rules = RulesEngine::from_file(args.rules)?;
    if rules.is_empty() {
        return Err(StowageError::Config(format!(
            "No rules defined in {}",
            args.rules.display()
        )));
    }
    if verbose {
        println!(
            "{} Loaded {} rules from {}",
            style(">>>").cyan(),
            rules.len(),
            args.rules.display()
        );
    }

    let mut options = settings.migration_options();
    options.what_if = args.what_if;
    options.non_destructive = !args.allow_destructive;

    let store = Arc::new(Mutex::new(db));
    let mut orchestrator = MigrationOrchestrator::new(store, rules, options.clone());
    for connector in super::build_connectors(args.target_root, settings)? {
        orchestrator.register_connector(connector);
    }

    let cancel = CancellationToken::new();
    let plan = super::block_on_cancellable(
        runtime,
        cancel.clone(),
        orchestrator.create_plan(args.scan_id, &options, &cancel),
    )?;

    println!("{} Plan created", style("✓").green());
    println!("  Plan ID: {}", style(&plan.id).bold());
    if plan.is_what_if {
        println!("  Mode: {}", style("what-if").yellow());
    }
    println!("  Operations: {}", plan.total_operations());
    println!("  Files: {}", plan.metrics.total_files);
    println!("  Size: {}", format_bytes(plan.metrics.total_size_bytes));
    println!("  Duplicates eliminated: {}", plan.metrics.duplicates_eliminated);
    println!("  Depth reduction: {:.2}", plan.metrics.depth_reduction);
    println!("  Compliance uplift: {:.1}%", plan.metrics.compliance_uplift);

    if !plan.operations.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Action", "Source", "Target", "Rule", "Status"]);
        for op in plan.operations.iter().take(PREVIEW_ROWS) {
            table.add_row(vec![
                Cell::new(op.operation_type.as_str()),
                Cell::new(&op.source_path),
                Cell::new(&op.target_path),
                Cell::new(op.rule_name.as_deref().unwrap_or("-")),
                Cell::new(op.status.as_str()),
            ]);
        }
        println!("{}", table);
        if plan.operations.len() > PREVIEW_ROWS {
            println!("  ... and {} more operations", plan.operations.len() - PREVIEW_ROWS);
        }
    }

    println!("\nRun 'stowage execute {}' to run this plan", plan.id);
    Ok(())
}

pub fn handle_plans_command(db: &SqliteDatabase) -> Result<()> {
    let plans = db.list_plans()?;

    if plans.is_empty() {
        println!("{}", style("No migration plans found").yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Scan", "State", "Operations", "Done", "Size", "Created"]);

    for plan in &plans {
        let state = if plan.is_what_if {
            format!("{} (what-if)", plan.state.as_str())
        } else {
            plan.state.as_str().to_string()
        };
        table.add_row(vec![
            Cell::new(&plan.id),
            Cell::new(&plan.scan_id),
            Cell::new(state),
            Cell::new(plan.total_operations),
            Cell::new(plan.completed_operations),
            Cell::new(format_bytes(plan.metrics.total_size_bytes)),
            Cell::new(format_timestamp(&plan.created_at)),
        ]);
    }

    println!("{}", table);
    println!("\n{} plans total", plans.len());
    Ok(())
}
