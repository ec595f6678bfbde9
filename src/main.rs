use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tether_server::{AppState, ServerConfig};
use tether_session::loopback::LoopbackFactory;
use tether_session::{BackoffPolicy, ManagerConfig, SessionManager};
use tether_settings::{resolve_path, TetherSettings};
use tether_store::{Durability, FsCredentialStore, KeyedStore, ReadPolicy, RegistryFile, StoreConfig};
use tether_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Multi-session connection manager")]
struct Args {
    /// Settings file (defaults to ~/.tether/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Start every registered session at boot.
    #[arg(long)]
    start_all: bool,
    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings_file = args
        .settings
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&settings_file)
        .with_context(|| format!("failed to load settings from {}", settings_file.display()))?;
    apply_args(&mut settings, &args);

    let log_level = settings
        .logging
        .level
        .parse::<tracing::Level>()
        .with_context(|| format!("invalid log level {:?}", settings.logging.level))?;
    let _telemetry = tether_telemetry::init_telemetry(TelemetryConfig {
        log_level,
        module_levels: Vec::new(),
        json: settings.logging.json,
    })?;

    tracing::info!(settings = %settings_file.display(), "starting tether");

    let home = tether_settings::tether_home();
    let store = KeyedStore::open(store_config(&settings, &home)).context("failed to open keyed store")?;

    // No protocol client is linked into this binary.
    tracing::warn!("using in-process loopback connections");
    let manager = SessionManager::new(
        manager_config(&settings),
        Arc::new(LoopbackFactory::new()),
        Arc::new(FsCredentialStore::new(resolve_path(
            &home,
            &settings.sessions.credentials_dir,
        ))),
        RegistryFile::new(resolve_path(&home, &settings.sessions.registry_path)),
    );

    if args.start_all {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.start_all().await;
        });
    }

    let server = tether_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        AppState {
            manager: manager.clone(),
            store: store.clone(),
        },
    )
    .await
    .with_context(|| {
        format!(
            "failed to bind {}:{}",
            settings.server.host, settings.server.port
        )
    })?;

    tracing::info!(addr = %server.addr, "tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    server.shutdown().await;
    manager.shutdown().await;
    if let Err(e) = store.close() {
        tracing::error!(error = %e, "final store flush failed");
    }
    Ok(())
}

fn apply_args(settings: &mut TetherSettings, args: &Args) {
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(host) = &args.host {
        settings.server.host = host.clone();
    }
    if let Some(level) = &args.log_level {
        settings.logging.level = level.clone();
    }
}

fn manager_config(settings: &TetherSettings) -> ManagerConfig {
    let sessions = &settings.sessions;
    ManagerConfig {
        concurrency: sessions.concurrency,
        settle_delay: Duration::from_millis(sessions.settle_delay_ms),
        backoff: BackoffPolicy::new(
            Duration::from_millis(sessions.backoff_base_ms),
            Duration::from_millis(sessions.backoff_max_ms),
        ),
        start_timeout: sessions.start_timeout_ms.map(Duration::from_millis),
    }
}

fn store_config(settings: &TetherSettings, home: &std::path::Path) -> StoreConfig {
    let store = &settings.store;
    StoreConfig {
        path: resolve_path(home, &store.path),
        max_owners: store.max_owners,
        max_keys_per_owner: store.max_keys_per_owner,
        debounce: Duration::from_millis(store.debounce_ms),
        durability: match store.durability {
            tether_settings::Durability::Atomic => Durability::Atomic,
            tether_settings::Durability::Direct => Durability::Direct,
        },
        read_policy: match store.read_policy {
            tether_settings::ReadPolicy::Shared => ReadPolicy::Shared,
            tether_settings::ReadPolicy::Copy => ReadPolicy::Copy,
        },
    }
}
