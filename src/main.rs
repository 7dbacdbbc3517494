use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewall::config::{LogFormat, Settings, StoreBackend};
use ratewall::http::HttpServer;
use ratewall::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "ratewall", version, about = "Per-IP and per-token HTTP rate limiting")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Counter store backend, overriding the configuration
    #[arg(long, value_enum)]
    store: Option<StoreArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreArg {
    Redis,
    Memory,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Redis => StoreBackend::Redis,
            StoreArg::Memory => StoreBackend::Memory,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    if let Some(store) = args.store {
        settings.store.backend = store.into();
    }

    init_tracing(&settings);

    info!("Starting Ratewall");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&settings).await?;
    let rate_limiter = RateLimiter::new(store.clone(), settings.limits.clone());

    let limits = rate_limiter.policies();
    info!(
        backend = ?settings.store.backend,
        ip_requests_per_second = limits.ip.requests_per_second,
        ip_block_duration_secs = limits.ip.block_duration_secs,
        token_requests_per_second = limits.token.requests_per_second,
        token_block_duration_secs = limits.token.block_duration_secs,
        "Rate limiter initialized"
    );

    let server = HttpServer::new(
        settings.server.listen_addr,
        rate_limiter,
        settings.server.store_timeout(),
    );

    info!("Starting HTTP server on {}", settings.server.listen_addr);

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close counter store");
    }
    served?;

    info!("Ratewall stopped");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match settings.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Acquire the process-wide counter store.
async fn open_store(settings: &Settings) -> ratewall::error::Result<Arc<dyn CounterStore>> {
    match settings.store.backend {
        StoreBackend::Redis => {
            let redis = &settings.store.redis;
            info!(addr = %redis.addr, db = redis.db, "Connecting to Redis");
            let store = RedisStore::connect(&redis.url(), redis.connect_timeout()).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-process counter store; limits are not shared between instances");
            let memory = Arc::new(MemoryStore::new());
            spawn_sweeper(memory.clone(), settings.store.sweep_interval());
            let store: Arc<dyn CounterStore> = memory;
            Ok(store)
        }
    }
}

/// Periodically drop expired records so idle identities do not pile up.
fn spawn_sweeper(store: Arc<MemoryStore>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
