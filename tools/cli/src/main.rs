//! offsync CLI - operate a file-backed sync engine from the shell.
//!
//! Items are queued under a data directory and applied to a directory that
//! stands in for the remote system.

mod remote;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::ItemId;
use offsync_storage::BackendRegistry;
use offsync_sync::{
    ExportBundle, ItemKind, ManualNetworkMonitor, NetworkMonitor, NewItem, Priority, ProbeConfig,
    ProbeNetworkMonitor, SyncConfig, SyncEngine, SyncState, SyncSummary,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Offline-first mutation queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the queue and engine state.
    #[arg(short, long, default_value = ".offsync")]
    data_dir: PathBuf,

    /// Storage backend: "local" or "memory".
    #[arg(long, default_value = "local")]
    backend: String,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory items are applied to (default: <data-dir>/remote).
    #[arg(short, long)]
    remote: Option<PathBuf>,

    /// Treat the network as unreachable.
    #[arg(long, conflicts_with = "probe")]
    offline: bool,

    /// Decide reachability by connecting to this host:port.
    #[arg(long)]
    probe: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an item.
    Enqueue {
        /// Item kind: record-submit, profile-update, admin-action, full-resync.
        #[arg(short, long)]
        kind: String,

        /// JSON payload.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Priority: low, medium, or high.
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Failed attempts before the item is given up.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Use this id instead of a generated one.
        #[arg(long)]
        id: Option<String>,
    },

    /// Show the queue and sync state.
    Status {
        /// Print the raw state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run one drain pass now.
    Sync,

    /// Drop every queued item.
    Clear,

    /// Remove finished items and audit entries older than the given age.
    Cleanup {
        /// Days of history to keep.
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Show storage usage against the quota.
    Usage,

    /// Write all persisted state to a file.
    Export {
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace all persisted state from an export, then sync.
    Import {
        /// Export file.
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Keep syncing in the background until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli).await?;

    let result = match cli.command {
        Commands::Enqueue {
            kind,
            payload,
            priority,
            max_retries,
            id,
        } => cmd_enqueue(&engine, &kind, &payload, &priority, max_retries, id).await,

        Commands::Status { json } => cmd_status(&engine, json),

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Clear => cmd_clear(&engine).await,

        Commands::Cleanup { days } => cmd_cleanup(&engine, days).await,

        Commands::Usage => cmd_usage(&engine).await,

        Commands::Export { output } => cmd_export(&engine, &output).await,

        Commands::Import { input } => cmd_import(&engine, &input).await,

        Commands::Run => cmd_run(&engine).await,
    };

    engine.shutdown().await;
    result
}

/// Build the engine from command-line options.
async fn open_engine(cli: &Cli) -> Result<SyncEngine> {
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let backend_config = serde_json::json!({
        "root": "store",
        "base_dir": cli.data_dir.to_string_lossy()
    });
    let backend = BackendRegistry::default()
        .open(&cli.backend, &backend_config)
        .context("Failed to create storage backend")?;

    let monitor: Arc<dyn NetworkMonitor> = match &cli.probe {
        Some(address) => ProbeNetworkMonitor::spawn(ProbeConfig::new(address.clone())),
        None => Arc::new(ManualNetworkMonitor::new(!cli.offline)),
    };

    let remote_root = cli
        .remote
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("remote"));
    let processors =
        remote::directory_processors(&remote_root).context("Failed to register processors")?;

    SyncEngine::open(backend, monitor, processors, config)
        .await
        .context("Failed to open sync engine")
}

/// Queue an item.
async fn cmd_enqueue(
    engine: &SyncEngine,
    kind: &str,
    payload: &str,
    priority: &str,
    max_retries: Option<u32>,
    id: Option<String>,
) -> Result<()> {
    let kind: ItemKind = kind.parse().context("Invalid item kind")?;
    let priority: Priority = priority.parse().context("Invalid priority")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let mut request = NewItem::new(kind, payload).with_priority(priority);
    if let Some(max_retries) = max_retries {
        request = request.with_max_retries(max_retries);
    }
    if let Some(id) = id {
        request = request.with_id(ItemId::new(id).context("Invalid item id")?);
    }

    let id = engine.enqueue(request).await.context("Failed to enqueue item")?;
    println!("Queued {}", id);
    Ok(())
}

/// Show queue and sync state.
fn cmd_status(engine: &SyncEngine, json: bool) -> Result<()> {
    let state = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }
    print_state(&state);
    Ok(())
}

fn print_state(state: &SyncState) {
    println!("Network:      {}", if state.online { "online" } else { "offline" });
    let last_sync = match state.last_sync_time {
        Some(t) => format!("{} ({}s ago)", t.to_rfc3339(), (Utc::now() - t).num_seconds()),
        None => "never".to_string(),
    };
    println!("Last sync:    {}", last_sync);
    println!("Data version: {}", state.data_version);

    if state.queued_items.is_empty() {
        println!("Queue is empty.");
        return;
    }

    println!("Queued items:");
    for item in &state.queued_items {
        let error = item
            .last_error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  {} {:<15} {:<7} {:<11} {}/{}{}",
            item.id,
            item.kind.as_str(),
            format!("{:?}", item.priority),
            format!("{:?}", item.status),
            item.retry_count,
            item.max_retries,
            error
        );
    }
}

fn print_summary(summary: &SyncSummary) {
    if summary.skipped {
        println!("Sync skipped (offline or already running).");
        return;
    }
    println!(
        "Sync finished in {:?}: {} processed, {} failed, {} given up",
        summary.duration, summary.processed, summary.failed, summary.exhausted
    );
    for error in &summary.errors {
        println!("  {}", error);
    }
}

/// Run one drain pass.
async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    let summary = engine.force_sync_now().await;
    print_summary(&summary);
    Ok(())
}

/// Drop every queued item.
async fn cmd_clear(engine: &SyncEngine) -> Result<()> {
    let cleared = engine.clear_queue().await.context("Failed to clear queue")?;
    println!("Cleared {} items.", cleared);
    Ok(())
}

/// Prune old finished items.
async fn cmd_cleanup(engine: &SyncEngine, days: u32) -> Result<()> {
    let report = engine.cleanup(days).await.context("Failed to clean up")?;
    println!(
        "Removed {} items and {} audit entries older than {} days.",
        report.items_removed, report.audit_entries_removed, days
    );
    Ok(())
}

/// Show storage usage.
async fn cmd_usage(engine: &SyncEngine) -> Result<()> {
    let usage = engine.usage().await.context("Failed to measure storage")?;
    println!(
        "Used {} bytes, {} available ({:.1}%)",
        usage.used, usage.available, usage.percentage
    );
    Ok(())
}

/// Export all persisted state.
async fn cmd_export(engine: &SyncEngine, output: &Path) -> Result<()> {
    let bundle = engine.export().await.context("Failed to export")?;
    tokio::fs::write(output, bundle.to_json()?)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Exported {} keys to {}", bundle.entries.len(), output.display());
    Ok(())
}

/// Replace persisted state from an export.
async fn cmd_import(engine: &SyncEngine, input: &Path) -> Result<()> {
    let data = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let bundle = ExportBundle::from_json(&data).context("Invalid export file")?;
    let summary = engine.import(bundle).await.context("Failed to import")?;
    println!("Import complete.");
    print_summary(&summary);
    Ok(())
}

/// Sync in the background until Ctrl-C.
async fn cmd_run(engine: &SyncEngine) -> Result<()> {
    let _subscription = engine.subscribe(|state| {
        info!(
            "{} queued, {}{}",
            state.queued_items.len(),
            if state.online { "online" } else { "offline" },
            if state.sync_in_progress { ", syncing" } else { "" }
        );
    });
    engine.start().context("Failed to start sync worker")?;
    info!("Syncing; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Stopping");
    Ok(())
}
