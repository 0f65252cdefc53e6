//! rgate-gateway: ephemeral reverse-proxy gateway, development runner.
//!
//! Wires one in-memory session entry to a direct-TCP tunnel transport so a
//! local service can be exposed through the gateway end to end: one-time
//! code handshake, cookie session, response rewriting.

use clap::Parser;
use rgate_gateway::{
    BasicPages, GatewayConfig, GatewaySession, MemoryRegistry, SessionEntry, TcpTransport,
    UpstreamAuth,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// rgate-gateway — ephemeral reverse-proxy gateway
#[derive(Parser, Debug)]
#[command(name = "rgate-gateway", version, about = "Ephemeral reverse-proxy gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.rgate/config.toml")]
    config: String,

    /// Public origin, e.g. https://gw.example.com
    #[arg(long)]
    origin: Option<String>,

    /// Low end of the public port range
    #[arg(long)]
    port_low: Option<u16>,

    /// High end of the public port range
    #[arg(long)]
    port_high: Option<u16>,

    /// Device identifier for the dev session
    #[arg(long, default_value = "dev-device")]
    device: String,

    /// Session key for the dev session
    #[arg(long, default_value = "dev-session")]
    session: String,

    /// Local service to expose, as host:port
    #[arg(long, default_value = "127.0.0.1:80")]
    target: String,

    /// Basic-auth username the target requires
    #[arg(long)]
    auth_user: Option<String>,

    /// Basic-auth password the target requires
    #[arg(long)]
    auth_pass: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %cli.device,
        "starting rgate-gateway"
    );

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        cli.origin.as_deref(),
        cli.port_low,
        cli.port_high,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let (target_host, target_port) = match parse_target(&cli.target) {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "invalid --target");
            std::process::exit(1);
        }
    };

    let auth = match (cli.auth_user, cli.auth_pass) {
        (Some(username), Some(password)) => Some(UpstreamAuth { username, password }),
        (None, None) => None,
        _ => {
            error!("--auth-user and --auth-pass must be given together");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(MemoryRegistry::new());
    registry.insert(
        cli.session.clone(),
        SessionEntry {
            device_id: cli.device.clone(),
            secret: rgate_core::generate_secret(),
            forwarded_host: target_host.clone(),
            forwarded_port: target_port,
            auth,
        },
    );

    let transport = Arc::new(TcpTransport::new(target_host, target_port));
    let session = GatewaySession::new(
        config,
        registry,
        transport,
        Arc::new(BasicPages),
        cli.device,
        cli.session,
    );

    match session.handshake_url().await {
        Ok(url) => info!(url = %url, "gateway ready, open the handshake URL"),
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    session.stop().await;
    info!("rgate-gateway stopped");
}

/// Split a `host:port` target string.
fn parse_target(target: &str) -> Result<(String, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {target}"))?;
    let port: u16 = port.parse().map_err(|e| format!("bad port: {e}"))?;
    if host.is_empty() {
        return Err(format!("expected host:port, got {target}"));
    }
    Ok((host.to_string(), port))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
