use std::sync::Arc;
use std::time::Duration;

use cronctl_core::{CronControlConfig, MemoryCache};
use cronctl_events::{ActionRegistry, Events, EventsStore, Runner};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronctl_runner=info,cronctl_events=info".into()),
        )
        .init();

    // load config: CRONCTL_CONFIG env > ~/.cronctl/cronctl.toml
    let config_path = std::env::var("CRONCTL_CONFIG").ok();
    let config = CronControlConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CronControlConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    // several runners may share the file
    db.busy_timeout(Duration::from_secs(5))?;

    let store = Arc::new(EventsStore::with_config(
        db,
        Arc::new(MemoryCache::new()),
        &config.events,
    ));
    let registry = Arc::new(ActionRegistry::new());
    let events = Arc::new(Events::new(store, registry, &config));

    match events.schedule_internal_events() {
        Ok(n) => info!(scheduled = n, "internal events ready"),
        Err(e) => warn!(code = e.code(), "scheduling internal events failed: {e}"),
    }

    let runner = Runner::new(events, &config.runner);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping runner");

    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
