//! Training Data I/O (tdm-io) - inspection CLI
//!
//! Brings the persistence manager up against a data directory, runs one
//! command, then shuts it down the same way the chess application does.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tdm_common::config::TomlConfig;
use tdm_common::{feature_key, KNOWN_SUBSYSTEMS};
use tdm_io::{
    AssumeActive, IoRoute, LoadedPayload, PersistenceManager, SessionContext, TrainingDataIo,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tdm-io
#[derive(Parser, Debug)]
#[command(name = "tdm-io")]
#[command(about = "Inspect training data persisted by the learning subsystems")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "TDM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print how each known subsystem's I/O is routed
    Flags,

    /// Load files through the manager and describe their contents
    Inspect {
        /// File names relative to the data directory
        #[arg(required = true)]
        files: Vec<String>,

        /// Subsystem the loads are attributed to
        #[arg(short, long, default_value = "Inspector")]
        subsystem: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TomlConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir.clone() {
        config.data_dir = dir;
    }

    // Initialize tracing
    let level = &config.logging.level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tdm_io={level},tdm_common={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tdm-io against {}", config.data_dir.display());

    let manager = Arc::new(
        PersistenceManager::builder(config.data_dir.clone())
            .io_settings(config.io.clone())
            .status(Arc::new(AssumeActive))
            .context(SessionContext::new())
            .build()
            .context("Failed to initialize persistence manager")?,
    );
    let io = TrainingDataIo::new(
        Some(Arc::clone(&manager)),
        config.feature_flags(),
        config.data_dir.clone(),
    );

    io.startup().await.context("Startup phase failed")?;

    let outcome = match args.command {
        Command::Flags => {
            print_flags(&io);
            Ok(())
        }
        Command::Inspect { files, subsystem } => inspect(&io, &subsystem, &files).await,
    };

    let report = io.flush_all_data().await.context("Shutdown phase failed")?;
    info!(
        "Shutdown flushed {} files ({} failed)",
        report.flushed, report.failed
    );
    manager.metrics().log_metrics();

    outcome
}

fn print_flags(io: &TrainingDataIo) {
    println!("{:<22} {:<10} {:<8} {:<6} ROUTE", "SUBSYSTEM", "KEY", "ENABLED", "ASYNC");
    for name in KNOWN_SUBSYSTEMS {
        let route = match io.route(name) {
            IoRoute::Async => "async".to_string(),
            IoRoute::SyncFallback(reason) => format!("sync ({})", reason),
        };
        println!(
            "{:<22} {:<10} {:<8} {:<6} {}",
            name,
            feature_key(name),
            io.flags().is_enabled(name),
            io.flags().is_async_enabled(name),
            route
        );
    }
}

fn describe(loaded: &LoadedPayload) -> String {
    match loaded {
        LoadedPayload::Raw(bytes) => {
            let lines = String::from_utf8_lossy(bytes).lines().count();
            format!("raw, {} bytes, {} lines", bytes.len(), lines)
        }
        LoadedPayload::Structured(value) => {
            let entries = match value {
                serde_json::Value::Object(map) => map.len(),
                serde_json::Value::Array(items) => items.len(),
                _ => 1,
            };
            format!("structured, {} bytes, {} entries", loaded.len(), entries)
        }
        LoadedPayload::Model(archive) => format!("model archive, {} bytes", archive.len()),
    }
}

async fn inspect(io: &TrainingDataIo, subsystem: &str, files: &[String]) -> Result<()> {
    let mut failures = 0;
    for file in files {
        match io.load(subsystem, file).await {
            Ok(Some(loaded)) => println!("{}: {}", file, describe(&loaded)),
            Ok(None) => println!("{}: absent or empty", file),
            Err(e) => {
                warn!("Failed to inspect {}: {}", file, e);
                println!("{}: unreadable ({})", file, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} of {} files could not be read", failures, files.len());
    }
    Ok(())
}
