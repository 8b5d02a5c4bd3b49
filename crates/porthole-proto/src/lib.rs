//! Protocol definitions shared by the porthole hub and agent.
//!
//! This crate holds the wire-level constants, the tenant identifier rules,
//! the ingress routing helpers, and the HTTP/1.1 head parsing used on both
//! ends of a tunnel. It is deliberately transport-free: everything here
//! operates on strings and byte buffers.

pub mod envfile;
pub mod http1;
pub mod routing;
pub mod tenant;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use routing::{extract_subdomain, strip_tenant_prefix, strip_tenant_target, tenant_from_path, tenant_from_referer};
pub use tenant::{generate_tenant_id, normalize_tenant_id, validate_tenant_id, TenantIdError};

/// Upgrade endpoint for tunnel control connections.
pub const CONNECT_PATH: &str = "/_connect";

/// Read-only endpoint advertising the hub's routing mode and base domain.
pub const CONFIG_PATH: &str = "/_config";

/// Query parameter carrying the requested tenant identifier.
pub const TENANT_QUERY_PARAM: &str = "tenant-id";

/// Query parameter carrying the tunnel kind.
pub const KIND_QUERY_PARAM: &str = "kind";

/// Response header carrying the allocated public TCP port.
pub const TUNNEL_PORT_HEADER: &str = "X-Tunnel-Port";

/// Routing cookie emitted for path-resolved requests.
pub const ROUTING_COOKIE: &str = "x-tunnel";

/// Lifetime of the routing cookie.
pub const ROUTING_COOKIE_MAX_AGE: Duration = Duration::from_secs(3600);

/// Interval between transport liveness probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single transport write (and for a probe round-trip).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay during the initial connect loop.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Deadline for dialing the agent's local endpoint.
pub const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the hub waits for in-flight ingress handlers at shutdown.
pub const HUB_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the agent waits for in-flight workers at shutdown.
pub const AGENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default hub listening port.
pub const DEFAULT_HUB_PORT: u16 = 8080;

/// Default public TCP port allocation range.
pub const DEFAULT_TCP_PORT_START: u16 = 10000;
pub const DEFAULT_TCP_PORT_END: u16 = 10100;

/// Kind of service carried by a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Tcp => "tcp",
        }
    }
}

impl Default for TunnelKind {
    fn default() -> Self {
        TunnelKind::Http
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TunnelKind::Http),
            "tcp" => Ok(TunnelKind::Tcp),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How the hub maps a public HTTP request to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Path,
    Subdomain,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Path => "path",
            RoutingMode::Subdomain => "subdomain",
        }
    }
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::Path
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "path" => Ok(RoutingMode::Path),
            "subdomain" => Ok(RoutingMode::Subdomain),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Error for unrecognized enum spellings.
#[derive(Debug, thiserror::Error)]
#[error("unknown value: {0:?}")]
pub struct UnknownVariant(pub String);

/// Document served by the hub's `/_config` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubInfo {
    pub routing_mode: RoutingMode,
    pub base_domain: String,
}

/// One completed HTTP exchange, as seen by the agent's observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub bytes_out: u64,
}

/// Assemble the externally visible URL for a tunnel.
pub fn public_url(
    kind: TunnelKind,
    mode: RoutingMode,
    base_domain: &str,
    tenant_id: &str,
    tcp_port: Option<u16>,
) -> String {
    match kind {
        TunnelKind::Tcp => {
            format!("tcp://{}:{}", base_domain, tcp_port.unwrap_or(0))
        }
        TunnelKind::Http => match mode {
            RoutingMode::Path => format!("https://{base_domain}/{tenant_id}/"),
            RoutingMode::Subdomain => format!("https://{tenant_id}.{base_domain}"),
        },
    }
}
