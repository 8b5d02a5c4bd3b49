//! Public HTTP ingress: resolve a tenant, then proxy the exchange over a
//! fresh tunnel stream.
//!
//! Each inbound connection carries one exchange. The request head is parsed
//! and rewritten (path-prefix strip), the rest of the traffic is copied
//! verbatim; the response end is delimited by the agent closing the stream.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use porthole_proto::http1::{read_response_head, RequestHead};
use porthole_proto::{
    extract_subdomain, strip_tenant_target, tenant_from_path, tenant_from_referer, RoutingMode,
    ROUTING_COOKIE, ROUTING_COOKIE_MAX_AGE,
};

use porthole_transport::TunnelStream;

use crate::error::{http_reason, HubError};
use crate::registry::SessionEntry;
use crate::server::HubState;

/// Write a minimal HTTP/1.1 response and leave the connection closing.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

pub(crate) async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    write_response(writer, status, reason, "text/plain; charset=utf-8", body.as_bytes()).await
}

/// First value of `name` across all Cookie headers.
fn cookie_value<'a>(head: &'a RequestHead, name: &str) -> Option<&'a str> {
    head.headers
        .iter()
        .filter(|(header, _)| header.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn routing_cookie(tenant_id: &str) -> String {
    format!(
        "{ROUTING_COOKIE}={tenant_id}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        ROUTING_COOKIE_MAX_AGE.as_secs()
    )
}

/// Map a request onto a live tunnel. The flag reports whether the tenant
/// came from the path prefix (which triggers stripping and the cookie).
fn resolve_tenant(state: &HubState, head: &RequestHead) -> Option<(Arc<SessionEntry>, bool)> {
    match state.config.routing_mode {
        RoutingMode::Path => {
            if let Some(candidate) = tenant_from_path(head.path()) {
                if let Some(entry) = state.registry.get(candidate) {
                    return Some((entry, true));
                }
            }
            if let Some(candidate) = cookie_value(head, ROUTING_COOKIE) {
                if let Some(entry) = state.registry.get(candidate) {
                    debug!(tenant = candidate, "cookie routing");
                    return Some((entry, false));
                }
            }
            if let Some(candidate) = head.header("referer").and_then(tenant_from_referer) {
                if let Some(entry) = state.registry.get(candidate) {
                    debug!(tenant = candidate, "referer routing");
                    return Some((entry, false));
                }
            }
            None
        }
        RoutingMode::Subdomain => {
            let host = head.header("host")?;
            let candidate = extract_subdomain(host, &state.config.base_domain)?;
            state.registry.get(candidate).map(|entry| (entry, false))
        }
    }
}

/// Resolve, admit, rewrite, and open the tunnel stream for an exchange.
/// Everything that can fail before any response bytes are written funnels
/// through the error taxonomy here.
async fn prepare_exchange(
    state: &HubState,
    head: &mut RequestHead,
) -> Result<(Arc<SessionEntry>, bool, TunnelStream), HubError> {
    let (entry, from_path) = resolve_tenant(state, head).ok_or(HubError::NotFound)?;
    let tenant_id = entry.tenant_id.clone();

    if !entry.admit() {
        return Err(HubError::RateLimited);
    }
    entry.request_count.fetch_add(1, Ordering::SeqCst);

    if from_path {
        let original = head.target.clone();
        head.target = strip_tenant_target(&head.target, &tenant_id);
        debug!(tenant = %tenant_id, from = %original, to = %head.target, "path routing");
    }

    // A tunnel that vanished after resolution surfaces here as a failed
    // open and is reported as a bad gateway.
    let stream = entry
        .session
        .open_stream()
        .await
        .map_err(|e| HubError::Upstream(format!("stream open failed: {e}")))?;

    Ok((entry, from_path, stream))
}

pub(crate) async fn handle_ingress(
    mut client: TcpStream,
    mut head: RequestHead,
    leftover: Vec<u8>,
    state: Arc<HubState>,
) {
    let (entry, from_path, mut stream) = match prepare_exchange(&state, &mut head).await {
        Ok(prepared) => prepared,
        Err(e) => {
            let status = e.status();
            if status >= 500 {
                warn!(error = %e, "ingress exchange failed");
            }
            let _ = write_error(&mut client, status, http_reason(status), &e.to_string()).await;
            return;
        }
    };
    let tenant_id = entry.tenant_id.clone();

    let is_upgrade = head.is_upgrade();

    if stream.write_all(&head.encode()).await.is_err()
        || stream.write_all(&leftover).await.is_err()
    {
        let e = HubError::Upstream("tunnel write failed".into());
        let _ = write_error(&mut client, e.status(), http_reason(e.status()), &e.to_string()).await;
        return;
    }

    if is_upgrade {
        // Hijack: from here the connection is a raw byte pipe in both
        // directions; the agent relays the 101 and everything after it.
        match tokio::io::copy_bidirectional(&mut client, &mut stream).await {
            Ok((to_agent, to_client)) => {
                debug!(tenant = %tenant_id, to_agent, to_client, "upgrade passthrough finished")
            }
            Err(e) => debug!(tenant = %tenant_id, error = %e, "upgrade passthrough ended"),
        }
        return;
    }

    let (mut client_read, mut client_write) = client.into_split();
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    // Remaining request body bytes flow to the agent while the response is
    // being produced; the pump idles harmlessly for bodyless requests.
    let body_pump = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut stream_write).await;
    });

    let (mut response, response_leftover) = match read_response_head(&mut stream_read).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(tenant = %tenant_id, error = %e, "failed to read tunnel response");
            let e = HubError::Upstream(format!("tunnel read failed: {e}"));
            let _ = write_error(&mut client_write, e.status(), http_reason(e.status()), &e.to_string()).await;
            body_pump.abort();
            return;
        }
    };

    if from_path {
        response.add_header("Set-Cookie", &routing_cookie(&tenant_id));
    }
    // This server speaks one exchange per connection.
    response.set_header("Connection", "close");

    let relay = async {
        client_write.write_all(&response.encode()).await?;
        client_write.write_all(&response_leftover).await?;
        // The agent closes the stream once the body is done.
        tokio::io::copy(&mut stream_read, &mut client_write).await?;
        client_write.shutdown().await
    };
    if let Err(e) = relay.await {
        debug!(tenant = %tenant_id, error = %e, "response relay ended early");
    }
    body_pump.abort();
}
