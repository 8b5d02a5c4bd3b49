//! Tunnel handshake: authenticate, validate, allocate, upgrade, register.
//!
//! Everything that can reject the tunnel happens inside the WebSocket
//! handshake callback, so failures surface to the agent as plain HTTP
//! status codes before any upgrade takes place.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tracing::{info, warn};

use porthole_auth::AUTHORIZATION_HEADER;
use porthole_proto::{
    normalize_tenant_id, public_url, validate_tenant_id, TunnelKind, KIND_QUERY_PARAM,
    TENANT_QUERY_PARAM, TUNNEL_PORT_HEADER,
};
use porthole_transport::TunnelSession;

use crate::error::HubError;
use crate::limiter::RateLimiter;
use crate::registry::SessionEntry;
use crate::server::{HubState, ReplayStream};
use crate::tcp;

/// Handshake outcome captured from the validation callback.
struct PendingTunnel {
    tenant_id: String,
    kind: TunnelKind,
    tcp_port: Option<u16>,
    listener: Option<tokio::net::TcpListener>,
}

fn to_error_response(e: &HubError) -> ErrorResponse {
    let status =
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .body(Some(e.to_string()))
        .unwrap()
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Run the checks of the handshake: auth, tenant syntax, kind, collision,
/// and (for TCP tunnels) port allocation plus listener bind.
fn validate_connect(state: &HubState, request: &Request) -> Result<PendingTunnel, HubError> {
    let bearer = request
        .headers()
        .get(AUTHORIZATION_HEADER)
        .and_then(|value| value.to_str().ok());
    state.secret.validate_bearer(bearer)?;

    let query = request.uri().query().unwrap_or_default();

    // A missing tenant-id param validates as an empty id and fails there.
    let tenant_id = normalize_tenant_id(query_param(query, TENANT_QUERY_PARAM).unwrap_or_default());
    validate_tenant_id(&tenant_id)?;

    let kind = match query_param(query, KIND_QUERY_PARAM) {
        None | Some("") => TunnelKind::Http,
        Some(raw) => raw
            .parse::<TunnelKind>()
            .map_err(|_| HubError::InvalidKind(raw.to_string()))?,
    };

    if state.registry.exists(&tenant_id) {
        return Err(HubError::TenantTaken(tenant_id));
    }

    let mut tcp_port = None;
    let mut listener = None;
    if kind == TunnelKind::Tcp {
        let port = state.registry.allocate_tcp_port(&tenant_id)?;

        // Bound synchronously so a bind failure can still fail the
        // handshake; converted to a tokio listener for the accept loop.
        let bound = std::net::TcpListener::bind(("0.0.0.0", port))
            .and_then(|std_listener| {
                std_listener.set_nonblocking(true)?;
                tokio::net::TcpListener::from_std(std_listener)
            })
            .map_err(|e| {
                state.registry.release_tcp_port(port);
                HubError::Bind {
                    address: "0.0.0.0".into(),
                    port,
                    reason: e.to_string(),
                }
            })?;

        tcp_port = Some(port);
        listener = Some(bound);
    }

    Ok(PendingTunnel {
        tenant_id,
        kind,
        tcp_port,
        listener,
    })
}

pub(crate) async fn handle_connect(stream: ReplayStream, state: Arc<HubState>) {
    let mut pending: Option<PendingTunnel> = None;

    let callback = |request: &Request, mut response: Response| {
        let tunnel = match validate_connect(&state, request) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(error = %e, "tunnel handshake rejected");
                return Err(to_error_response(&e));
            }
        };
        if let Some(port) = tunnel.tcp_port {
            if let Ok(value) = HeaderValue::from_str(&port.to_string()) {
                response.headers_mut().insert(TUNNEL_PORT_HEADER, value);
            }
        }
        pending = Some(tunnel);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            // Rejections logged in the callback land here too; release any
            // port reserved before the handshake fell over.
            if let Some(tunnel) = pending {
                if let Some(port) = tunnel.tcp_port {
                    state.registry.release_tcp_port(port);
                }
            }
            warn!(error = %e, "tunnel handshake did not complete");
            return;
        }
    };

    let Some(tunnel) = pending else {
        // accept_hdr_async succeeded without running the callback; nothing
        // sane to do with such a connection.
        return;
    };

    let PendingTunnel {
        tenant_id,
        kind,
        tcp_port,
        listener,
    } = tunnel;

    let session = TunnelSession::server(ws);
    let limiter = (state.config.rate_limit_per_minute > 0)
        .then(|| RateLimiter::per_minute(state.config.rate_limit_per_minute));
    let entry = Arc::new(SessionEntry::new(
        tenant_id.clone(),
        kind,
        session,
        tcp_port,
        limiter,
    ));

    // The collision check in the callback was advisory; this insert is the
    // authoritative one. Losing the race tears the tunnel down.
    if let Err(e) = state.registry.register(entry.clone()) {
        warn!(tenant = %tenant_id, error = %e, "registration lost a race, closing tunnel");
        entry.session.close();
        entry.close_tcp_listener();
        if let Some(port) = tcp_port {
            state.registry.release_tcp_port(port);
        }
        return;
    }

    if let Some(listener) = listener {
        let task = tokio::spawn(tcp::serve_tcp_ingress(listener, entry.clone()));
        entry.set_tcp_task(task);
    }

    let url = public_url(
        kind,
        state.config.routing_mode,
        &state.config.base_domain,
        &tenant_id,
        tcp_port,
    );
    info!(tenant = %tenant_id, kind = %kind, url = %url, "tunnel established");

    // Stay alive until the session ends, then drop the registration.
    let mut closed = entry.session.closed();
    let _ = closed.wait_for(|c| *c).await;
    state.registry.unregister(&tenant_id);
    info!(tenant = %tenant_id, "tunnel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        let query = "tenant-id=myapp&kind=tcp";
        assert_eq!(query_param(query, "tenant-id"), Some("myapp"));
        assert_eq!(query_param(query, "kind"), Some("tcp"));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param("", "tenant-id"), None);
    }
}
