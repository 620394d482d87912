//! webInk server — entry point.
//!
//! ```text
//! webink-server                    Run with ./webink.toml
//! webink-server --config <path>    Load a specific config file
//! webink-server --gen-config       Write default config to stdout
//! ```
//!
//! `WEBINK_CONFIG_PATH` selects the config file when `--config` is
//! not given. Startup fails with a non-zero exit on config errors or
//! unbindable ports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webink_core::clients::ClientTracker;
use webink_core::logbook::LogBook;
use webink_core::registry::DeviceRegistry;
use webink_core::render::{ChromiumPool, Renderer};
use webink_core::snapshot::SnapshotCache;

use webink_server::config::ServerConfig;
use webink_server::socket::SocketConfig;
use webink_server::{http, socket, AppState};

/// How long teardown waits for the front-ends to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "webink-server", about = "webInk snapshot server for e-ink devices")]
struct Cli {
    /// Path to the configuration TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config: --config, then WEBINK_CONFIG_PATH, then ./webink.toml.
    let path = cli
        .config
        .or_else(|| std::env::var_os("WEBINK_CONFIG_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("webink.toml"));
    let config = ServerConfig::load(&path)?;

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("webink-server v{}", env!("CARGO_PKG_VERSION"));
    info!("config: {}", path.display());
    info!("http port: {}", config.server.http_port);
    info!("socket port: {}", config.server.socket_port);

    // Registry → render engine → snapshot cache → front-ends.
    let registry = Arc::new(DeviceRegistry::new(config.build_devices()?)?);
    info!("registered {} device(s)", registry.len());

    let pool = Arc::new(ChromiumPool::new(config.to_pool_config()));
    let renderer: Arc<dyn Renderer> = pool.clone();
    let cache = Arc::new(SnapshotCache::new(
        renderer,
        &registry,
        config.to_cache_config(),
    ));

    let state = AppState {
        registry,
        cache,
        logbook: Arc::new(LogBook::new(config.logging.device_log_capacity)),
        clients: Arc::new(ClientTracker::new()),
    };

    // Bind both listeners before serving so a taken port fails fast.
    let http_addr = format!("{}:{}", config.server.bind, config.server.http_port);
    let http_listener = TcpListener::bind(&http_addr).await.map_err(|e| {
        error!("cannot bind {http_addr}: {e}");
        e
    })?;
    let socket_addr = format!("{}:{}", config.server.bind, config.server.socket_port);
    let socket_listener = TcpListener::bind(&socket_addr).await.map_err(|e| {
        error!("cannot bind {socket_addr}: {e}");
        e
    })?;

    let shutdown = CancellationToken::new();

    let http_task = tokio::spawn({
        let app = http::router(state.clone());
        let token = shutdown.clone();
        async move {
            let result = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("http server error: {e}");
            }
        }
    });

    let socket_task = tokio::spawn(socket::run(
        socket_listener,
        state.clone(),
        SocketConfig {
            max_connections: config.server.max_socket_connections,
            request_deadline: Duration::from_secs(config.server.socket_request_deadline_s),
        },
        shutdown.clone(),
    ));

    info!("serving on http://{http_addr} and tcp://{socket_addr}");

    // Ctrl-C → cancel → drain front-ends → stop the browser pool.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let drain = async {
        let _ = http_task.await;
        let _ = socket_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("front-ends did not drain within grace period");
    }

    pool.shutdown();
    info!("bye");
    Ok(())
}
