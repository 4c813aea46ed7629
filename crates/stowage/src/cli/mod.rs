pub mod migrate;
pub mod plan;
pub mod scan;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stowage_lib::connector::cloud::GoogleDriveConfig;
use stowage_lib::{
    Config, Connector, Credentials, GoogleDriveConnector, LocalConnector, Result, Settings,
    SqliteDatabase,
};

/// Environment variable holding an OAuth2 access token for Google Drive.
pub const DRIVE_TOKEN_ENV: &str = "STOWAGE_DRIVE_TOKEN";
pub const DRIVE_PROVIDER_ID: &str = "gdrive";

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Inventory storage providers and migrate items into a rule-driven layout", long_about = None)]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to database file")]
    pub db: Option<PathBuf>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Enumerate a provider into a new scan")]
    Scan {
        #[arg(help = "Directory (local) or folder path (Google Drive) to scan")]
        root: String,

        #[arg(long, default_value = "local", help = "Provider id recorded on scanned items")]
        provider_id: String,

        #[arg(long, help = "Scan Google Drive using the token in STOWAGE_DRIVE_TOKEN")]
        drive: bool,

        #[arg(long, help = "Compute content hashes while scanning")]
        hash: bool,

        #[arg(long, help = "Additional directory names to skip")]
        exclude: Vec<String>,

        #[arg(long, help = "Glob patterns of files to skip")]
        exclude_pattern: Vec<String>,

        #[arg(long, help = "Skip files smaller than this size (e.g. 10KB)")]
        min_size: Option<String>,
    },

    #[command(about = "Show statistics, duplicates and issues of a scan")]
    Stats {
        #[arg(help = "Scan ID")]
        scan_id: String,

        #[arg(long, help = "List duplicate sets")]
        duplicates: bool,
    },

    #[command(about = "Create a migration plan from a scan")]
    Plan {
        #[arg(help = "Scan ID")]
        scan_id: String,

        #[arg(long, help = "Path to rules file")]
        rules: PathBuf,

        #[arg(long, help = "Create a plan that is simulated instead of executed")]
        what_if: bool,

        #[arg(long, help = "Plan moves and renames instead of copies")]
        allow_destructive: bool,

        #[arg(long, default_value = ".", help = "Root of the scanned local tree; scanned paths and rule targets resolve against it")]
        target_root: PathBuf,
    },

    #[command(about = "Execute or resume a migration plan")]
    Execute {
        #[arg(help = "Plan ID")]
        plan_id: String,

        #[arg(long, short = 'y', help = "Skip the confirmation prompt")]
        yes: bool,

        #[arg(long, default_value = ".", help = "Root of the scanned local tree; scanned paths and rule targets resolve against it")]
        target_root: PathBuf,

        #[arg(long, help = "Start of the allowed execution window (HH:MM, local time)")]
        window_start: Option<String>,

        #[arg(long, help = "End of the allowed execution window (HH:MM, local time)")]
        window_end: Option<String>,

        #[arg(long, help = "Skip hash verification of transferred content")]
        no_verify: bool,
    },

    #[command(about = "Pause a running migration at its next batch boundary")]
    Pause {
        #[arg(help = "Plan ID")]
        plan_id: String,
    },

    #[command(about = "List migration plans")]
    Plans,
}

pub fn init_database(db_path: Option<PathBuf>) -> Result<(SqliteDatabase, Settings)> {
    let config = Config::new(db_path)?;
    config.ensure_db_directory()?;
    let settings = config.settings()?;

    let mut db = SqliteDatabase::open(&config.db_path)?;
    db.initialize()?;

    Ok((db, settings))
}

/// Connectors available to plans: the local filesystem rooted at
/// `local_root`, plus Google Drive when a token is configured.
pub fn build_connectors(
    local_root: &std::path::Path,
    settings: &Settings,
) -> Result<Vec<Arc<dyn Connector>>> {
    let mut connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(LocalConnector::new(
        stowage_lib::connector::LOCAL_PROVIDER_ID,
        local_root,
    ))];

    if let Some(drive) = drive_connector(settings, local_root)? {
        connectors.push(Arc::new(drive));
    }
    Ok(connectors)
}

pub fn drive_connector(
    settings: &Settings,
    local_root: &std::path::Path,
) -> Result<Option<GoogleDriveConnector>> {
    let Ok(token) = std::env::var(DRIVE_TOKEN_ENV) else {
        return Ok(None);
    };

    let mut config = GoogleDriveConfig::new(
        DRIVE_PROVIDER_ID,
        Credentials::OAuth2 {
            access_token: token,
        },
    )
    .with_local_root(local_root);
    config.rate_limit.max_calls = settings.rate_limit.max_calls;
    config.rate_limit.window = std::time::Duration::from_secs(settings.rate_limit.window_secs);
    config.retry = settings.retry_policy()?;

    GoogleDriveConnector::new(config).map(Some)
}

/// Runs until the future finishes, cancelling `token` on Ctrl-C.
pub fn block_on_cancellable<F, T>(
    runtime: &tokio::runtime::Runtime,
    token: tokio_util::sync::CancellationToken,
    future: F,
) -> T
where
    F: std::future::Future<Output = T>,
{
    runtime.block_on(async {
        let watcher = token.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, stopping at the next safe point");
                watcher.cancel();
            }
        });
        let output = future.await;
        signal.abort();
        output
    })
}
