mod hub;

use clap::Parser;
use fleet_coord::{CoordinatorConfig, FleetCoordinator, PositionPolicy};
use fleet_core::FleetStore;
use fleet_storage::SqliteFleetStore;
use hub::HubConfig;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:42100";
const DEFAULT_DB_PATH: &str = ".fleet/fleet.db";
const DEFAULT_LOG_DIR: &str = ".fleet/logs";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: Option<PathBuf>,
    debug: bool,
    log_dir: String,
    hub: HubConfig,
    coordinator: CoordinatorConfig,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// SQLite database file; `:memory:` keeps everything in process.
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = PositionPolicy::SourceTimestamp)]
    policy: PositionPolicy,
    #[arg(long, default_value_t = 2000)]
    debounce_ms: u64,
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,
    #[arg(long, default_value_t = 5)]
    poll_timeout: u64,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !config.hub.allow_remote && !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "remote bind needs --allow-remote");
        return;
    }

    let store = match open_store(config.db_path.as_deref()) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", error = %err);
            return;
        }
    };
    let coordinator = Arc::new(FleetCoordinator::new(store, config.coordinator.clone()));
    let booting = coordinator.clone();
    match tokio::task::spawn_blocking(move || booting.bootstrap()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(event = "bootstrap_failed", code = err.code(), error = %err);
            return;
        }
        Err(err) => {
            error!(event = "bootstrap_failed", error = %err);
            return;
        }
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = hub::run(config.hub, coordinator, listener, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
    }
}

fn open_store(db_path: Option<&std::path::Path>) -> Result<Arc<dyn FleetStore>, String> {
    let store = match db_path {
        None => SqliteFleetStore::open_in_memory(),
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|err| format!("{}: {err}", parent.display()))?;
            }
            SqliteFleetStore::open(path)
        }
    };
    let store = store.map_err(|err| err.to_string())?;
    info!(
        event = "store_open",
        path = %db_path.map(|path| path.display().to_string()).unwrap_or_else(|| ":memory:".to_string())
    );
    Ok(Arc::new(store))
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = setting(&args.addr, "FLEET_HUB_ADDR", DEFAULT_HUB_ADDR);
    let debug = args.debug || env_true("FLEET_HUB_DEBUG");
    let log_dir = setting(&args.log_dir, "FLEET_LOG_DIR", DEFAULT_LOG_DIR);
    let stale_after = (args.stale_seconds > 0).then(|| Duration::from_secs(args.stale_seconds));
    Config {
        addr,
        db_path: resolve_db_path(&args.db),
        debug,
        log_dir,
        hub: HubConfig {
            debug,
            allow_remote: args.allow_remote || env_true("FLEET_HUB_ALLOW_REMOTE"),
            stale_after,
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            ..HubConfig::default()
        },
        coordinator: CoordinatorConfig {
            policy: args.policy,
            debounce_window: Duration::from_millis(args.debounce_ms),
            poll_interval: Duration::from_secs(args.poll_interval),
            poll_timeout: Duration::from_secs(args.poll_timeout),
            ..CoordinatorConfig::default()
        },
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        setting("", "FLEET_LOG_LEVEL", "info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

/// One append-only file per hub process; an empty dir disables file logs.
fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("fleet-hub-{}.log", std::process::id()));
    OpenOptions::new().create(true).append(true).open(path).map(Some)
}

/// Flag, then environment, then the built-in default. Blank values are unset.
fn setting(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// `None` selects the in-memory database.
fn resolve_db_path(db_flag: &str) -> Option<PathBuf> {
    let raw = setting(db_flag, "FLEET_DB", DEFAULT_DB_PATH);
    (raw != ":memory:").then(|| PathBuf::from(raw))
}
