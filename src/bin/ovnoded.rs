//! OpenVPN node daemon (ovnoded)
//!
//! Serves the HTTP management API and runs the background health monitor.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo ovnoded --config /etc/ovnode/ovnode.toml
//!
//! # Start with verbose logging and no background repairs
//! sudo ovnoded --verbose --no-monitor
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use libovnode::api::{self, AppState};
use libovnode::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// OpenVPN node daemon
#[derive(Parser, Debug)]
#[command(name = "ovnoded")]
#[command(version)]
#[command(about = "OpenVPN node daemon - management API and self-healing health monitor", long_about = None)]
struct Args {
    /// Configuration file (defaults to $OVNODE_CONFIG or /etc/ovnode/ovnode.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Do not start the background health monitor
    #[arg(long)]
    no_monitor: bool,

    /// Listen address, e.g. 127.0.0.1:9090; overrides the config file
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = NodeConfig::resolve_path(args.config.as_deref());
    let config = NodeConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&args, &config.server.log_level);

    info!("Starting OpenVPN node daemon (ovnoded)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if config_path.exists() {
        info!("Configuration: {}", config_path.display());
    } else {
        info!("No configuration at {}, using defaults", config_path.display());
    }

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - service control and user management will fail");
        }
    }

    let api_key = match config.server.api_key.clone() {
        Some(key) if !key.trim().is_empty() => key,
        _ => {
            error!("No API key configured; set [server].api_key or OVNODE_API_KEY");
            bail!("refusing to start without an API key");
        }
    };

    let addr = match args.bind {
        Some(addr) => addr,
        None => format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", config.server.bind, config.server.port))?,
    };
    let monitor_enabled = config.monitor.enabled && !args.no_monitor;

    let node = Arc::new(Node::new(config)?);

    if monitor_enabled {
        node.background().start().await?;
    } else {
        info!("Background health monitor disabled");
    }

    let app = api::router(AppState::new(node.clone(), &api_key));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down OpenVPN node daemon...");
    node.background().stop().await;
    info!("OpenVPN node daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments and config
fn init_logging(args: &Args, configured_level: &str) {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured_level)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ovnoded={},libovnode={},tower_http={}",
            log_level, log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Resolve on SIGTERM or SIGINT. SIGHUP is logged and ignored.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            error!("Failed to register signal handlers, falling back to Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                return;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return;
            }
            _ = sighup.recv() => {
                warn!("Received SIGHUP; configuration reload is not supported, restart the daemon instead");
            }
        }
    }
}
