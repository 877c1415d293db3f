//! Database backup-and-ship tool
//!
//! Dumps a PostgreSQL database with its filestore, packages it with a manifest and
//! optionally ships the archive to S3-compatible object storage.

// dbship/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use backup::report::write_failure_report;
use backup::{BackupFormat, BackupOutcome, BackupRequest, StageError};
use clap::Parser;
use config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
/// A failure after work began.
const EXIT_FAILED: u8 = 1;
/// Exit status for requests rejected before any work started.
const EXIT_REJECTED: u8 = 2;

/// Create a database backup from an existing one.
///
/// The database is dumped with pg_dump and its filestore is copied alongside.
/// Backups can be shipped to object storage, written as a single archive, as a
/// custom-format dump, or as a plain directory.
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Args {
    /// Database to back up
    dbname: String,

    /// Destination file or folder. For s3zip, the local path used for collision
    /// checks, failure reports and archives whose upload could not be confirmed.
    dest: PathBuf,

    /// Remove the destination first if it already exists
    #[arg(long)]
    force: bool,

    /// Don't report an error if the database does not exist
    #[arg(long)]
    if_exists: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = BackupFormat::S3Zip)]
    format: BackupFormat,

    /// Include the filestore in the backup (default)
    #[arg(long, overrides_with = "no_filestore")]
    filestore: bool,

    /// Leave the filestore out of the backup
    #[arg(long)]
    no_filestore: bool,

    /// Path to configuration file [default: $DBSHIP_CONFIG or config.json]
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = utils::logger::init(&args.log_level) {
        eprintln!("Failed to initialise logging: {e:#}");
    }

    match run_app(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("❌ Error: {:?}", e);
            ExitCode::from(EXIT_REJECTED)
        }
    }
}

async fn run_app(args: Args) -> Result<ExitCode> {
    let config_path = args
        .config
        .or_else(|| env::var_os("DBSHIP_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    // --filestore and --no-filestore override each other, the last one given wins.
    let include_filestore = args.filestore || !args.no_filestore;
    let request = BackupRequest::new(
        args.dbname,
        args.dest,
        args.format,
        include_filestore,
        args.force,
        args.if_exists,
    )?;

    let result = backup::run_backup_flow(&app_config, &request).await;
    Ok(ExitCode::from(exit_status(&request, result)))
}

/// Exit status of a finished run. Failures after work began leave a report next to `dest`.
fn exit_status(request: &BackupRequest, result: Result<BackupOutcome, StageError>) -> u8 {
    match result {
        Ok(BackupOutcome::Skipped) => {
            tracing::warn!("Nothing to back up for {}", request.db_name());
            EXIT_OK
        }
        Ok(BackupOutcome::Written(path)) => {
            tracing::info!("✅ Backup written to {}", path.display());
            EXIT_OK
        }
        Ok(BackupOutcome::Shipped(record)) => {
            tracing::info!(
                "✅ Backup shipped as {} ({} bytes)",
                record.key,
                record.size_bytes
            );
            EXIT_OK
        }
        Err(failure) if failure.error.is_validation() => {
            tracing::error!("❌ {}", failure);
            EXIT_REJECTED
        }
        Err(failure) => {
            tracing::error!("❌ {}", failure);
            match write_failure_report(request, &failure) {
                Ok(path) => tracing::error!("Failure report written to {}", path.display()),
                Err(e) => tracing::error!("Could not write failure report: {:#}", e),
            }
            EXIT_FAILED
        }
    }
}
