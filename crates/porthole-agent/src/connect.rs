//! Hub discovery and the tunnel connect loop.

use std::time::Duration;

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use porthole_auth::{SharedSecret, AUTHORIZATION_HEADER};
use porthole_proto::{
    HubInfo, RoutingMode, CONFIG_PATH, CONNECT_PATH, INITIAL_RECONNECT_DELAY, KIND_QUERY_PARAM,
    MAX_RECONNECT_DELAY, TENANT_QUERY_PARAM, TUNNEL_PORT_HEADER,
};
use porthole_transport::TunnelSession;

use crate::config::AgentConfig;
use crate::error::AgentError;

/// A successfully established tunnel.
pub(crate) struct Established {
    pub session: TunnelSession,
    pub tcp_port: Option<u16>,
    pub hub_info: HubInfo,
}

/// Fetch the hub's routing configuration. Any failure falls back to
/// subdomain routing with the base domain taken from the hub URL, so agents
/// keep working against hubs that do not serve the endpoint.
pub(crate) async fn fetch_hub_info(hub_url: &Url) -> HubInfo {
    let fallback = HubInfo {
        routing_mode: RoutingMode::Subdomain,
        base_domain: hub_url.host_str().unwrap_or("localhost").to_string(),
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(_) => return fallback,
    };
    let Ok(config_url) = hub_url.join(CONFIG_PATH) else {
        return fallback;
    };

    match client.get(config_url).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<HubInfo>().await {
                Ok(info) => info,
                Err(e) => {
                    warn!(error = %e, "malformed hub config, assuming subdomain routing");
                    fallback
                }
            }
        }
        Ok(response) => {
            warn!(
                status = response.status().as_u16(),
                "hub config endpoint unavailable, assuming subdomain routing"
            );
            fallback
        }
        Err(e) => {
            warn!(error = %e, "could not fetch hub config, assuming subdomain routing");
            fallback
        }
    }
}

fn build_ws_url(config: &AgentConfig) -> Result<Url, AgentError> {
    let mut url = Url::parse(&config.hub_url)
        .map_err(|e| AgentError::Config(format!("invalid hub url: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AgentError::Config(format!(
                "unsupported hub url scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AgentError::Config("unsupported hub url".into()))?;
    url.set_path(CONNECT_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair(TENANT_QUERY_PARAM, &config.tenant_id)
        .append_pair(KIND_QUERY_PARAM, config.kind.as_str());
    Ok(url)
}

/// Dial the hub until it either accepts the tunnel or rejects it for a
/// reason retrying cannot fix. Transport failures back off exponentially,
/// 1 s doubling to a 30 s ceiling.
pub(crate) async fn establish(
    config: &AgentConfig,
    secret: &SharedSecret,
    cancel: &CancellationToken,
) -> Result<Established, AgentError> {
    let hub_url = Url::parse(&config.hub_url)
        .map_err(|e| AgentError::Config(format!("invalid hub url: {e}")))?;
    let hub_info = fetch_hub_info(&hub_url).await;

    let ws_url = build_ws_url(config)?;
    let auth_value = HeaderValue::from_str(&secret.authorization_value())
        .map_err(|_| AgentError::Config("secret contains invalid header characters".into()))?;

    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut request = ws_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION_HEADER, auth_value.clone());

        info!(url = %ws_url, "connecting to hub");
        match connect_async(request).await {
            Ok((ws, response)) => {
                let tcp_port = response
                    .headers()
                    .get(TUNNEL_PORT_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u16>().ok());

                return Ok(Established {
                    session: TunnelSession::client(ws),
                    tcp_port,
                    hub_info,
                });
            }
            Err(WsError::Http(response)) => match response.status().as_u16() {
                401 => return Err(AgentError::AuthRejected),
                409 => return Err(AgentError::TenantTaken(config.tenant_id.clone())),
                400 => return Err(AgentError::TenantRejected(config.tenant_id.clone())),
                503 => return Err(AgentError::PortsExhausted),
                status => {
                    warn!(status, "hub refused the handshake, retrying");
                }
            },
            Err(e) => {
                warn!(error = %e, "connection failed, retrying");
            }
        }

        debug!(delay_secs = delay.as_secs(), "backing off before reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porthole_proto::TunnelKind;

    #[test]
    fn ws_url_swaps_scheme_and_carries_params() {
        let config = AgentConfig {
            hub_url: "https://tunnel.example.com".into(),
            secret: "s".into(),
            tenant_id: "myapp".into(),
            local_port: 3000,
            kind: TunnelKind::Tcp,
            ..AgentConfig::default()
        };
        let url = build_ws_url(&config).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/_connect");
        assert_eq!(url.query(), Some("tenant-id=myapp&kind=tcp"));

        let config = AgentConfig {
            hub_url: "http://127.0.0.1:8080".into(),
            ..config
        };
        let url = build_ws_url(&config).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(8080));
    }
}
