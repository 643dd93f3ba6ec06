use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use turbo_server::config::{self, Settings, StorageBackend};
use turbo_store::{Database, MemoryStore, SqliteStore, Storage};
use turbo_telemetry::{init_telemetry, spawn_snapshot_task, ServerMetrics};

/// Real-time hierarchical data sync server.
#[derive(Debug, Parser)]
#[command(name = "turbo", version)]
struct Cli {
    /// Settings file (default: ~/.turbo/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Keep data in memory only.
    #[arg(long, conflicts_with = "db")]
    memory: bool,
    /// SQLite database file.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Serve files from this directory for unknown routes.
    #[arg(long)]
    static_dir: Option<PathBuf>,
    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.memory {
            settings.storage.backend = StorageBackend::Memory;
        }
        if let Some(db) = self.db {
            settings.storage.backend = StorageBackend::Sqlite;
            settings.storage.path = db;
        }
        if let Some(dir) = self.static_dir {
            settings.server.static_dir = Some(dir);
        }
        if let Some(level) = self.log_level {
            settings.telemetry.level = level;
        }
    }
}

fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match settings.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let db = Database::open(&settings.storage.path).with_context(|| {
                format!("failed to open database at {}", settings.storage.path.display())
            })?;
            Arc::new(SqliteStore::new(db))
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => config::load_settings_from_path(path),
        None => config::load_settings(),
    }
    .context("failed to load settings")?;
    cli.apply(&mut settings);

    let telemetry_config = settings.telemetry.to_config()?;
    let telemetry = init_telemetry(&telemetry_config);

    let store = open_store(&settings)?;
    tracing::info!(
        backend = store.backend(),
        path = %settings.storage.path.display(),
        "storage opened"
    );

    let metrics = Arc::new(ServerMetrics::new());
    let snapshots = CancellationToken::new();
    let snapshot_task = telemetry.metrics_store().map(|store| {
        spawn_snapshot_task(
            Arc::clone(&metrics),
            store,
            std::time::Duration::from_secs(telemetry_config.metrics_snapshot_interval_secs.max(1)),
            telemetry_config.metrics_retention_days,
            snapshots.clone(),
        )
    });

    let handle = turbo_server::start(&settings.server, store, metrics)
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.addr(), "turbo ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    snapshots.cancel();
    if let Some(task) = snapshot_task {
        let _ = task.await;
    }
    Ok(())
}
