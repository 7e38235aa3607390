//! Backup Archiver - Main entry point
//!
//! Archives one directory tree into a zip file and reports the outcome.

use anyhow::{Context, Result};
use backup_archiver::executor::events::{BackupEvent, FnObserver};
use backup_archiver::{utils, BackendKind, BackupCoordinator, Config};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory to archive (overrides config)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Directory to write the archive to (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Archive file name (overrides config)
    #[arg(long)]
    archive_name: Option<String>,

    /// Preferred archive backend (overrides config)
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Path to the zip executable, "auto" to search PATH, "" to disable
    #[arg(long)]
    zip_command: Option<String>,

    /// Only archive files, no directory entries
    #[arg(long)]
    files_only: bool,

    /// Exclusion pattern (repeatable, added to configured ones)
    #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Do not fall back to other backends
    #[arg(long)]
    no_fallback: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Print lifecycle events as JSON lines
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };

    apply_overrides(&mut config, &args);

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting backup-archiver v{}", env!("CARGO_PKG_VERSION"));

    let job = config.build_job().context("Invalid backup job")?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT (Ctrl+C), cancelling backup...");
            ctrl_c_cancel.cancel();
        }
    });

    let mut coordinator = BackupCoordinator::new(job).with_cancel(cancel);
    if args.events {
        let observer = FnObserver(|event: &BackupEvent| {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        });
        coordinator = coordinator.with_observer(Arc::new(observer));
    }

    let report = coordinator.run().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Archive: {}", report.archive_path.display());
        if let Some(backend) = report.backend {
            println!("Backend: {}", backend);
        }
        println!("Members: {}", report.members);
        for warning in &report.warnings {
            println!("Warning: {}", warning);
        }
        for error in report.error_messages() {
            println!("Error: {}", error);
        }
    }

    if !report.is_clean() {
        std::process::exit(1);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(root) = &args.root {
        config.job.root = root.clone();
    }
    if let Some(output_dir) = &args.output_dir {
        config.job.output_dir = output_dir.clone();
    }
    if let Some(name) = &args.archive_name {
        config.job.archive_name = Some(name.clone());
    }
    if let Some(backend) = args.backend {
        config.backend.preferred = backend;
    }
    if let Some(command) = &args.zip_command {
        config.backend.zip_command = Some(command.clone());
    }
    if args.files_only {
        config.job.files_only = true;
    }
    if args.no_fallback {
        config.backend.fallback = false;
    }
    config.job.excludes.extend(args.excludes.iter().cloned());
}
