use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ruralguru_throttle::config::{GatewayConfig, LogFormat, LoggingConfig, StoreBackend};
use ruralguru_throttle::http::{GatewayServer, Upstream};
use ruralguru_throttle::store::{MemoryStore, RedisStore, RedisStoreConfig, ThrottleStore};
use ruralguru_throttle::throttle::RequestThrottle;

#[derive(Parser, Debug)]
#[command(name = "ruralguru-throttle")]
#[command(about = "Fixed-window request throttling gateway for RuralGuru", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the upstream marketplace URL
    #[arg(short, long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.server.upstream_url = upstream;
    }

    init_tracing(&config.logging);

    info!("Starting RuralGuru throttle gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        path = ?args.config,
        listen_addr = %config.server.listen_addr,
        backend = ?config.throttle.backend,
        consistency = ?config.throttle.consistency,
        "Configuration loaded"
    );

    let store: Arc<dyn ThrottleStore> = match config.throttle.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::with_retention(
            config.throttle.categories.max_window(),
        )),
        StoreBackend::Redis => {
            let store = RedisStore::new(RedisStoreConfig {
                url: config.throttle.redis_url.clone(),
                key_prefix: config.throttle.key_prefix.clone(),
                connect_timeout: config.throttle.redis_connect_timeout(),
                ..RedisStoreConfig::default()
            })?;
            // Warm the connection; if Redis is down the gateway still starts
            // and requests fail open until it comes back.
            if store.connection().await.is_err() {
                warn!("Redis unreachable at startup, throttling fails open until it recovers");
            }
            Arc::new(store)
        }
    };

    let throttle = Arc::new(
        RequestThrottle::new(store)
            .with_categories(config.throttle.categories.clone())
            .with_consistency(config.throttle.consistency),
    );
    info!(categories = ?config.throttle.categories, "Request throttle initialized");

    let server = GatewayServer::new(
        config.server.listen_addr,
        throttle,
        Upstream::new(config.server.upstream_url.clone()),
        config.server.protect_all_paths,
    );

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("RuralGuru throttle gateway stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
