use crate::util::format::{format_bytes, parse_size};
use crate::util::progress::create_spinner;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use console::style;
use std::sync::{Arc, Mutex};
use stowage_lib::{
    scan_provider, Connector, EnumerationFilters, InventoryStore, LocalConnector, Result, Settings,
    SqliteDatabase, StowageError,
};
use tokio_util::sync::CancellationToken;

pub struct ScanArgs {
    pub root: String,
    pub provider_id: String,
    pub drive: bool,
    pub hash: bool,
    pub exclude: Vec<String>,
    pub exclude_pattern: Vec<String>,
    pub min_size: Option<String>,
}

pub fn handle_scan_command(
    db: SqliteDatabase,
    settings: &Settings,
    runtime: &tokio::runtime::Runtime,
    args: ScanArgs,
    _verbose: bool,
) -> Result<()> {
    let min_size = args
        .min_size
        .as_deref()
        .map(parse_size)
        .transpose()
        .map_err(StowageError::Config)?;

    let filters = EnumerationFilters {
        compute_hash: args.hash,
        min_size,
        excluded_file_patterns: args.exclude_pattern,
        ..EnumerationFilters::default()
    }
    .with_excluded_directories(&settings.excluded_directories, &args.exclude);

    let connector: Box<dyn Connector> = if args.drive {
        let local_root = std::path::Path::new(".");
        let drive = super::drive_connector(settings, local_root)?.ok_or_else(|| {
            StowageError::Config(format!(
                "Set {} to scan Google Drive",
                super::DRIVE_TOKEN_ENV
            ))
        })?;
        Box::new(drive)
    } else {
        let root = std::path::Path::new(&args.root);
        if !root.exists() {
            return Err(StowageError::FileNotFound(root.to_path_buf()));
        }
        Box::new(LocalConnector::new(args.provider_id.as_str(), root))
    };

    println!(
        "{} Scanning '{}' ({})...",
        style(">>>").cyan(),
        style(&args.root).bold(),
        connector.provider_id()
    );

    let store = Arc::new(Mutex::new(db));
    let cancel = CancellationToken::new();
    let spinner = create_spinner("Enumerating");
    let scan_root = if args.drive { args.root.as_str() } else { "" };

    let outcome = super::block_on_cancellable(runtime, cancel.clone(), async {
        let auth = connector.authenticate(&cancel).await?;
        log::info!("Authenticated as {}", auth.user_id);
        scan_provider(connector.as_ref(), &store, scan_root, &filters, &cancel).await
    });
    spinner.finish_and_clear();
    connector.dispose();
    let outcome = outcome?;

    let stats = &outcome.statistics;
    println!("\n{} Scan completed", style("✓").green());
    println!("  Scan ID: {}", style(&outcome.scan_id).bold());
    println!("  Files: {}", style(stats.total_files).cyan());
    println!("  Folders: {}", style(stats.total_folders).cyan());
    println!("  Total size: {}", style(format_bytes(stats.total_bytes)).cyan());
    println!("  Max depth: {}", stats.max_depth);
    if stats.items_with_issues > 0 {
        println!("  Items with issues: {}", style(stats.items_with_issues).yellow());
    }
    if args.drive {
        println!(
            "\nRun 'stowage plan {} --rules <file>' to plan a migration",
            outcome.scan_id
        );
    } else {
        println!(
            "\nRun 'stowage plan {} --rules <file> --target-root {}' to plan a migration",
            outcome.scan_id, args.root
        );
    }

    Ok(())
}

pub fn handle_stats_command(db: &mut SqliteDatabase, scan_id: &str, show_duplicates: bool) -> Result<()> {
    let stats = db.get_statistics(scan_id)?;

    println!("{} Scan {}", style(">>>").cyan(), style(scan_id).bold());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("Items"), Cell::new(stats.total_items)]);
    table.add_row(vec![Cell::new("Files"), Cell::new(stats.total_files)]);
    table.add_row(vec![Cell::new("Folders"), Cell::new(stats.total_folders)]);
    table.add_row(vec![Cell::new("Total size"), Cell::new(format_bytes(stats.total_bytes))]);
    table.add_row(vec![Cell::new("Max depth"), Cell::new(stats.max_depth)]);
    table.add_row(vec![
        Cell::new("Average depth"),
        Cell::new(format!("{:.1}", stats.average_depth)),
    ]);
    table.add_row(vec![Cell::new("Hashed files"), Cell::new(stats.hashed_files)]);
    table.add_row(vec![Cell::new("Shared items"), Cell::new(stats.shared_items)]);
    for (provider, count) in &stats.items_by_provider {
        table.add_row(vec![Cell::new(format!("Items on {}", provider)), Cell::new(count)]);
    }
    println!("{}", table);

    let duplicates = db.find_duplicates(scan_id)?;
    let wasted: i64 = duplicates.iter().map(|set| set.wasted_bytes()).sum();
    println!(
        "\n{} duplicate sets ({} reclaimable)",
        duplicates.len(),
        format_bytes(wasted)
    );

    if show_duplicates && !duplicates.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Kind", "Size", "Copies", "Paths"]);
        for set in &duplicates {
            let paths: Vec<&str> = set.items.iter().map(|item| item.path.as_str()).collect();
            table.add_row(vec![
                Cell::new(format!("{:?}", set.kind)),
                Cell::new(format_bytes(set.size_bytes)),
                Cell::new(set.items.len()),
                Cell::new(paths.join("\n")),
            ]);
        }
        println!("{}", table);
    }

    let issues = db.validate(scan_id)?;
    if issues.is_empty() {
        println!("{} No validation issues", style("✓").green());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Severity", "Issue", "Path", "Description"]);
    for issue in issues.iter().take(50) {
        table.add_row(vec![
            Cell::new(format!("{:?}", issue.severity)),
            Cell::new(issue.kind.as_str()),
            Cell::new(&issue.path),
            Cell::new(&issue.description),
        ]);
    }
    println!("\n{}", table);
    if issues.len() > 50 {
        println!("  ... and {} more issues", issues.len() - 50);
    }

    Ok(())
}
