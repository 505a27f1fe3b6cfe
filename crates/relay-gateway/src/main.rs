use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_agent::ProviderRegistry;
use relay_core::RelayConfig;
use relay_store::{KvStore, SqliteKv};
use relay_telegram::Pipeline;

mod app;
mod http;

#[derive(Parser, Debug)]
#[command(name = "relay-gateway", version, about = "Telegram webhook relay to LLM backends")]
struct Cli {
    /// Config file. Falls back to RELAY_CONFIG, then ~/.relay/relay.toml.
    #[arg(long, short)]
    config: Option<String>,

    /// Override gateway.port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_gateway=info,relay_telegram=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > RELAY_CONFIG env > ~/.relay/relay.toml
    let config_path = cli.config.or_else(|| std::env::var("RELAY_CONFIG").ok());
    let mut config = RelayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        RelayConfig::default()
    });
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let store = open_store(&config)?;
    let http = reqwest::Client::new();
    let registry = ProviderRegistry::with_defaults(http.clone());
    info!(
        bots = config.telegram.available_tokens.len(),
        default_provider = %config.defaults.ai_provider,
        stream = config.telegram.stream_mode,
        "relay configured"
    );

    let shutdown = CancellationToken::new();
    let pipeline =
        Pipeline::new(&config, store, Arc::new(registry)).with_shutdown(shutdown.clone());
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, pipeline, http));
    let router = app::build_router(state);

    info!("Relay gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

/// Resolves on Ctrl-C. In-flight requests skip any remaining rate-limit wait
/// and deliver their final answer before the server exits.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, draining in-flight requests");
    shutdown.cancel();
}

/// SQLite store at `database.path`; no path means no store, and every chat
/// gets the "DATABASE Not Set" diagnostic.
fn open_store(config: &RelayConfig) -> anyhow::Result<Option<Arc<dyn KvStore>>> {
    let Some(path) = config.database.store_path() else {
        warn!("database.path is empty, running without a store");
        return Ok(None);
    };
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");
    let store = SqliteKv::open(path)?;
    Ok(Some(Arc::new(store)))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create database directory");
            }
        }
    }
}
