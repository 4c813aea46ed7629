mod cli;
mod util;

use clap::Parser;
use stowage_lib::Result;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let (mut db, settings) = cli::init_database(cli.db)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        cli::Commands::Scan {
            root,
            provider_id,
            drive,
            hash,
            exclude,
            exclude_pattern,
            min_size,
        } => cli::scan::handle_scan_command(
            db,
            &settings,
            &runtime,
            cli::scan::ScanArgs {
                root,
                provider_id,
                drive,
                hash,
                exclude,
                exclude_pattern,
                min_size,
            },
            cli.verbose,
        ),

        cli::Commands::Stats {
            scan_id,
            duplicates,
        } => cli::scan::handle_stats_command(&mut db, &scan_id, duplicates),

        cli::Commands::Plan {
            scan_id,
            rules,
            what_if,
            allow_destructive,
            target_root,
        } => cli::plan::handle_plan_command(
            db,
            &settings,
            &runtime,
            cli::plan::PlanArgs {
                scan_id: &scan_id,
                rules: &rules,
                what_if,
                allow_destructive,
                target_root: &target_root,
            },
            cli.verbose,
        ),

        cli::Commands::Execute {
            plan_id,
            yes,
            target_root,
            window_start,
            window_end,
            no_verify,
        } => cli::migrate::handle_execute_command(
            db,
            &settings,
            &runtime,
            cli::migrate::ExecuteArgs {
                plan_id: &plan_id,
                yes,
                target_root: &target_root,
                window_start: window_start.as_deref(),
                window_end: window_end.as_deref(),
                no_verify,
            },
            cli.verbose,
        ),

        cli::Commands::Pause { plan_id } => cli::migrate::handle_pause_command(db, &plan_id),

        cli::Commands::Plans => cli::plan::handle_plans_command(&db),
    }
}
