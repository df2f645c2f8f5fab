mod console;
mod device;
mod input;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::FleetStore;
use fleet_storage::SqliteFleetStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:42100/ws";
const DEFAULT_DB_PATH: &str = ".fleet/fleet.db";

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet delivery hub clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Stream an agent's samples and commands from stdin to the hub
    Agent(device::AgentArgs),
    /// Watch the fleet and issue commands read from stdin
    Console(console::ConsoleArgs),
    /// Create an agent in the fleet database
    RegisterAgent {
        name: String,
        #[arg(long, default_value = "")]
        db: String,
    },
    /// Create a pending package in the fleet database
    AddPackage {
        destination: String,
        #[arg(long, default_value = "")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(args) => device::run(args).await,
        Commands::Console(args) => console::run(args).await,
        Commands::RegisterAgent { name, db } => {
            let name = name.trim();
            if name.is_empty() {
                bail!("Agent name must not be empty");
            }
            let store = open_store(&db)?;
            let agent = store.register_agent(name).context("Failed to register agent")?;
            println!("{}", serde_json::to_string(&agent)?);
            Ok(())
        }
        Commands::AddPackage { destination, db } => {
            let destination = destination.trim();
            if destination.is_empty() {
                bail!("Destination must not be empty");
            }
            let store = open_store(&db)?;
            let package = store
                .create_package(destination)
                .context("Failed to create package")?;
            println!("{}", serde_json::to_string(&package)?);
            Ok(())
        }
    }
}

/// Logs go to stderr; stdout carries the command output.
fn init_logging() {
    let level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_store(db_flag: &str) -> Result<SqliteFleetStore> {
    let path = resolve_db_path(db_flag);
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    SqliteFleetStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn resolve_db_path(db_flag: &str) -> PathBuf {
    if !db_flag.trim().is_empty() {
        return PathBuf::from(db_flag.trim());
    }
    match std::env::var("FLEET_DB") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(DEFAULT_DB_PATH),
    }
}

/// Flag, then `FLEET_HUB_URL`, then `FLEET_HUB_ADDR` as `ws://<addr>/ws`.
pub(crate) fn resolve_hub_url(hub_flag: &str) -> Result<Url> {
    let raw = if !hub_flag.trim().is_empty() {
        hub_flag.trim().to_string()
    } else if let Some(url) = env_value("FLEET_HUB_URL") {
        url
    } else if let Some(addr) = env_value("FLEET_HUB_ADDR") {
        format!("ws://{addr}/ws")
    } else {
        DEFAULT_HUB_URL.to_string()
    };
    let url = Url::parse(&raw).with_context(|| format!("Invalid hub url: {raw}"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("Hub url must use ws:// or wss://, got {raw}");
    }
    Ok(url)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
