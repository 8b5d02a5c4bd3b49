//! porthole — the tunnel agent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use porthole_agent::{Agent, AgentConfig, LogObserver, NullObserver, RequestObserver};
use porthole_proto::{envfile, TunnelKind};

/// Expose a local service through a porthole hub.
#[derive(Parser, Debug)]
#[command(name = "porthole", version)]
struct Cli {
    /// Hub endpoint, e.g. https://tunnel.example.com (required).
    #[arg(long, env = "PORTHOLE_HUB_URL")]
    hub_url: Option<String>,

    /// Shared secret for the hub (required).
    #[arg(long, env = "PORTHOLE_SECRET")]
    secret: Option<String>,

    /// Requested tenant id; generated when omitted.
    #[arg(long, env = "PORTHOLE_TENANT_ID")]
    tenant_id: Option<String>,

    /// Local host to forward to.
    #[arg(long, env = "PORTHOLE_LOCAL_HOST")]
    local_host: Option<String>,

    /// Local port to forward to (required).
    #[arg(long, env = "PORTHOLE_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Tunnel kind: "http" or "tcp".
    #[arg(long, env = "PORTHOLE_KIND")]
    kind: Option<String>,

    /// Rewrite the Host header to the local endpoint.
    #[arg(long, env = "PORTHOLE_REWRITE_HOST")]
    rewrite_host: bool,

    /// Enforce basic auth (user:pass) on HTTP tunnels.
    #[arg(long, env = "PORTHOLE_BASIC_AUTH")]
    basic_auth: Option<String>,

    /// KEY=value config file consulted for options not set by flag or env.
    #[arg(long, env = "PORTHOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Suppress per-request logging.
    #[arg(short, long)]
    quiet: bool,

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

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}

fn resolve_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let file: HashMap<String, String> = match &cli.config {
        Some(path) => envfile::parse(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?,
        ),
        None => HashMap::new(),
    };

    let hub_url = cli
        .hub_url
        .clone()
        .or_else(|| file.get("HUB_URL").cloned())
        .context("hub url is required (--hub-url or PORTHOLE_HUB_URL)")?;
    let secret = cli
        .secret
        .clone()
        .or_else(|| file.get("SECRET").cloned())
        .context("secret is required (--secret or PORTHOLE_SECRET)")?;
    let local_port = match cli.local_port {
        Some(port) => port,
        None => file
            .get("LOCAL_PORT")
            .context("local port is required (--local-port or PORTHOLE_LOCAL_PORT)")?
            .parse()
            .context("invalid LOCAL_PORT in config file")?,
    };

    let kind = match cli.kind.clone().or_else(|| file.get("KIND").cloned()) {
        Some(raw) => raw
            .parse::<TunnelKind>()
            .map_err(|e| anyhow::anyhow!("invalid tunnel kind: {e}"))?,
        None => TunnelKind::Http,
    };

    let defaults = AgentConfig::default();
    Ok(AgentConfig {
        hub_url,
        secret,
        tenant_id: cli
            .tenant_id
            .clone()
            .or_else(|| file.get("TENANT_ID").cloned())
            .unwrap_or_default(),
        local_host: cli
            .local_host
            .clone()
            .or_else(|| file.get("LOCAL_HOST").cloned())
            .unwrap_or(defaults.local_host),
        local_port,
        kind,
        rewrite_host: cli.rewrite_host
            || file.get("REWRITE_HOST").map(|v| truthy(v)).unwrap_or(false),
        basic_auth: cli
            .basic_auth
            .clone()
            .or_else(|| file.get("BASIC_AUTH").cloned()),
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
    let observer: Arc<dyn RequestObserver> = if cli.quiet {
        Arc::new(NullObserver)
    } else {
        Arc::new(LogObserver)
    };

    let agent = Agent::connect(config, observer).await?;
    info!(url = %agent.public_url(), "public URL ready");

    let handle = agent.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        handle.shutdown();
    });

    agent.run().await?;

    let stats = agent.stats();
    info!(
        requests = stats.requests,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "tunnel closed"
    );
    Ok(())
}
