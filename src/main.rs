//! kubebridge - per-cluster Kubernetes connection proxy
//!
//! Fronts a set of clusters on one local listener. Requests addressed to a
//! cluster (by `<id>.localhost` subdomain, `?clusterId=`, or a loopback
//! `/<id>/...` path) are proxied to its API server with the cluster's
//! credentials. The same listener serves browser shells and a small
//! internal API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use kubebridge::api::{self, AppState, Dispatcher};
use kubebridge::cluster::{ClusterStore, InMemoryClusterStore};
use kubebridge::config::{self, Config, ConfigError};
use kubebridge::route::RouteError;
use kubebridge::{health, kubeconfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// kubebridge - per-cluster Kubernetes connection proxy
#[derive(ClapParser, Debug)]
#[command(name = "kubebridge", version, about, long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = "KUBEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy (default)
    Serve {
        /// Address to bind; overrides the config file
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bearer token for the internal API; overrides the config file
        #[arg(long, env = "KUBEBRIDGE_TOKEN")]
        token: Option<String>,
    },
    /// List configured clusters
    Clusters,
}

#[derive(Error, Debug)]
pub enum KubebridgeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("route table error: {0}")]
    Route(#[from] RouteError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), KubebridgeError> {
    let cli = Cli::parse();
    init_tracing();

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let config = match Config::load(&path)? {
        Some(config) => config,
        None => {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Config::default()
        }
    };

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        token: None,
    }) {
        Commands::Serve { bind, token } => run_server(config, bind, token).await,
        Commands::Clusters => {
            for cluster in config.build_clusters() {
                println!("{}\t{}\t{}", cluster.id, cluster.display_name(), cluster.api.server);
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kubebridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Non-loopback listeners always get a token; one is generated when none
/// is configured.
fn resolve_token(bind: &SocketAddr, configured: Option<String>) -> Option<String> {
    if configured.is_some() || bind.ip().is_loopback() {
        return configured;
    }
    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    eprintln!("kubebridge: API token (required for non-localhost): {}", token);
    Some(token)
}

async fn run_server(
    mut config: Config,
    bind: Option<SocketAddr>,
    token: Option<String>,
) -> Result<(), KubebridgeError> {
    if let Some(bind) = bind {
        config.bind = bind;
    }
    config.auth_token = resolve_token(&config.bind, token.or(config.auth_token.take()));

    let shutdown = CancellationToken::new();
    let store: Arc<dyn ClusterStore> = Arc::new(InMemoryClusterStore::new(config.build_clusters()));
    let state = AppState::new(&config, Arc::clone(&store), shutdown.clone())?;
    let dispatcher = Dispatcher::new(state.clone())?;

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, clusters = store.list().len(), "kubebridge listening");

    for cluster in store.list() {
        if let Err(e) = kubeconfig::write_proxy_kubeconfig(&cluster, addr) {
            tracing::warn!(cluster = %cluster.id, %e, "failed to write proxy kubeconfig");
        }
    }

    let server = tokio::spawn(api::serve(listener, dispatcher, shutdown.clone()));
    let monitor = tokio::spawn(health::run(
        Arc::clone(&store),
        Arc::clone(&state.proxy),
        Duration::from_secs(config.health_interval_secs.max(1)),
        shutdown.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "failed to listen for Ctrl+C");
    }
    tracing::info!("shutting down");

    // Open shell sockets see this and send close frames.
    shutdown.cancel();

    if let Some(reaper) = state.shells.registry.drain() {
        if let Err(e) = reaper.await {
            tracing::warn!(?e, "shell reaper task failed");
        }
    }
    state.port_forwards.stop_all().await;

    if let Err(e) = server.await {
        tracing::warn!(?e, "listener task panicked");
    }
    monitor.abort();

    tracing::info!("kubebridge exiting");
    Ok(())
}
