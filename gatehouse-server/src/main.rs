// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Gatehouse: resilient routing gateway
//
//  Runtime:  tokio multi-thread, axum HTTP surface
//  Config:   defaults → YAML file → GATEHOUSE_* env vars
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use gatehouse_core::config::GatewayConfig;
use gatehouse_proxy::Gateway;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about = "Gatehouse: resilient routing gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/gatehouse.yaml")]
    config: PathBuf,

    /// Log level (overrides the config file; RUST_LOG overrides both)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Config ──
    let config = GatewayConfig::load(&cli.config)?;

    // ── Tracing ──
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log.level.clone());
    init_tracing(&level, cli.json_logs || config.observability.log.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "Gatehouse starting"
    );

    #[cfg(unix)]
    raise_fd_limit();

    // ── Gateway ──
    let gateway = match Gateway::new(config) {
        Ok(gw) => Arc::new(gw),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };
    gateway.start();

    #[cfg(unix)]
    tokio::spawn(reload_routes_on_hangup(Arc::clone(&gateway), cli.config.clone()));

    // ── HTTP surface ──
    let addr = gateway.config().server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = gatehouse_admin::build_router(Arc::clone(&gateway));

    info!(addr = %addr, "Gatehouse is ready, serving traffic");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Draining complete, stopping background tasks");
    gateway.shutdown().await;
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM (docker stop).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Re-read the route table from the config file on every SIGHUP. A file
/// that fails to load or validate leaves the current table in place.
#[cfg(unix)]
async fn reload_routes_on_hangup(gateway: Arc<Gateway>, path: PathBuf) {
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "Failed to listen for SIGHUP, route reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!(config = %path.display(), "SIGHUP received, reloading routes");
        let routes = match GatewayConfig::load(&path) {
            Ok(cfg) => cfg.routes,
            Err(e) => {
                error!(error = %e, "Config reload failed, keeping current routes");
                continue;
            }
        };
        if let Err(e) = gateway.reload_routes(routes) {
            error!(error = %e, "Route reload rejected, keeping current routes");
        }
    }
}

/// Raise RLIMIT_NOFILE to min(hard limit, 65536): every proxied request
/// may hold a client socket and a pooled backend socket.
#[cfg(unix)]
fn raise_fd_limit() {
    unsafe {
        let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) != 0 {
            tracing::warn!("getrlimit(RLIMIT_NOFILE) failed, fd limit unchanged");
            return;
        }
        let hard = rl.rlim_max;
        let target: libc::rlim_t = if hard == libc::RLIM_INFINITY || hard > 65536 {
            65536
        } else {
            hard
        };
        if rl.rlim_cur >= target {
            tracing::debug!(limit = rl.rlim_cur, "fd limit already sufficient");
            return;
        }
        rl.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rl) != 0 {
            tracing::warn!(tried = target, "setrlimit(RLIMIT_NOFILE) failed");
        } else {
            tracing::info!(limit = target, "File descriptor limit raised");
        }
    }
}
