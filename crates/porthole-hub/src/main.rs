//! portholed — the porthole hub daemon.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use porthole_hub::{Hub, HubConfig};
use porthole_proto::{
    envfile, RoutingMode, DEFAULT_HUB_PORT, DEFAULT_TCP_PORT_END, DEFAULT_TCP_PORT_START,
};

/// Self-hosted tunnel hub: accepts agent tunnels, routes public traffic.
#[derive(Parser, Debug)]
#[command(name = "portholed", version)]
struct Cli {
    /// Listening port for the control and ingress endpoint.
    #[arg(long, env = "PORTHOLE_PORT")]
    port: Option<u16>,

    /// Shared secret agents must present (required).
    #[arg(long, env = "PORTHOLE_SECRET")]
    secret: Option<String>,

    /// DNS suffix tunnels are published under (required).
    #[arg(long, env = "PORTHOLE_BASE_DOMAIN")]
    base_domain: Option<String>,

    /// Routing mode: "path" or "subdomain".
    #[arg(long, env = "PORTHOLE_ROUTING_MODE")]
    routing_mode: Option<String>,

    /// First port of the public TCP range.
    #[arg(long, env = "PORTHOLE_TCP_PORT_START")]
    tcp_port_start: Option<u16>,

    /// Last port of the public TCP range.
    #[arg(long, env = "PORTHOLE_TCP_PORT_END")]
    tcp_port_end: Option<u16>,

    /// Per-tunnel requests per minute; 0 disables rate limiting.
    #[arg(long, env = "PORTHOLE_RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// KEY=value config file consulted for options not set by flag or env.
    #[arg(long, env = "PORTHOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_key<T>(value: Option<&String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} in config file: {e}")),
        None => Ok(default),
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<HubConfig> {
    let file: HashMap<String, String> = match &cli.config {
        Some(path) => envfile::parse(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?,
        ),
        None => HashMap::new(),
    };

    let port = match cli.port {
        Some(port) => port,
        None => parse_key(file.get("PORT"), "PORT", DEFAULT_HUB_PORT)?,
    };
    let routing_mode = match &cli.routing_mode {
        Some(raw) => raw
            .parse::<RoutingMode>()
            .map_err(|e| anyhow::anyhow!("invalid routing mode: {e}"))?,
        None => parse_key(file.get("ROUTING_MODE"), "ROUTING_MODE", RoutingMode::Path)?,
    };
    let tcp_port_start = match cli.tcp_port_start {
        Some(port) => port,
        None => parse_key(file.get("TCP_PORT_START"), "TCP_PORT_START", DEFAULT_TCP_PORT_START)?,
    };
    let tcp_port_end = match cli.tcp_port_end {
        Some(port) => port,
        None => parse_key(file.get("TCP_PORT_END"), "TCP_PORT_END", DEFAULT_TCP_PORT_END)?,
    };
    let rate_limit_per_minute = match cli.rate_limit {
        Some(rate) => rate,
        None => parse_key(file.get("RATE_LIMIT"), "RATE_LIMIT", 0)?,
    };

    let secret = cli
        .secret
        .clone()
        .or_else(|| file.get("SECRET").cloned())
        .unwrap_or_default();
    let base_domain = cli
        .base_domain
        .clone()
        .or_else(|| file.get("BASE_DOMAIN").cloned())
        .unwrap_or_default();

    Ok(HubConfig {
        port,
        secret,
        base_domain,
        routing_mode,
        tcp_port_start,
        tcp_port_end,
        rate_limit_per_minute,
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = resolve_config(&cli)?;
    let hub = Hub::bind(config).await?;
    let handle = hub.handle();
    let server = tokio::spawn(hub.run());

    wait_for_signal().await;
    info!("signal received, shutting down");
    handle.shutdown();
    server.await.context("hub task panicked")??;
    Ok(())
}
