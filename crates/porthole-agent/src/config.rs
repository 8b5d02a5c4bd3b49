//! Agent configuration.

use porthole_proto::{validate_tenant_id, TunnelKind};
use url::Url;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hub endpoint, e.g. `https://tunnel.example.com`.
    pub hub_url: String,
    /// Shared secret for the hub.
    pub secret: String,
    /// Requested tenant id; a slug is generated when left empty.
    pub tenant_id: String,
    /// Local endpoint traffic is forwarded to.
    pub local_host: String,
    pub local_port: u16,
    pub kind: TunnelKind,
    /// Rewrite the Host header to the local endpoint.
    pub rewrite_host: bool,
    /// Optional `user:pass` the agent enforces on HTTP tunnels.
    pub basic_auth: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_url: String::new(),
            secret: String::new(),
            tenant_id: String::new(),
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            kind: TunnelKind::Http,
            rewrite_host: false,
            basic_auth: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        let url = Url::parse(&self.hub_url)
            .map_err(|e| AgentError::Config(format!("invalid hub url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(AgentError::Config(format!(
                "unsupported hub url scheme {:?}",
                url.scheme()
            )));
        }
        if self.secret.is_empty() {
            return Err(AgentError::Config("secret is required".into()));
        }
        validate_tenant_id(&self.tenant_id)
            .map_err(|e| AgentError::Config(format!("invalid tenant id: {e}")))?;
        if self.local_host.is_empty() {
            return Err(AgentError::Config("local host is required".into()));
        }
        if self.local_port == 0 {
            return Err(AgentError::Config("local port is required".into()));
        }
        if let Some(credentials) = &self.basic_auth {
            if !credentials.contains(':') {
                return Err(AgentError::Config(
                    "basic auth must be in user:pass form".into(),
                ));
            }
        }
        Ok(())
    }

    /// Dial target for the local service.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Host header value for rewrites; the port is omitted when it is 80.
    pub fn local_host_header(&self) -> String {
        if self.local_port == 80 {
            self.local_host.clone()
        } else {
            self.local_addr()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            hub_url: "https://tunnel.example.com".into(),
            secret: "s3cr3t".into(),
            tenant_id: "myapp".into(),
            local_port: 3000,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(AgentConfig { hub_url: "not a url".into(), ..valid() }.validate().is_err());
        assert!(AgentConfig { hub_url: "ftp://x".into(), ..valid() }.validate().is_err());
        assert!(AgentConfig { secret: String::new(), ..valid() }.validate().is_err());
        assert!(AgentConfig { tenant_id: "ab".into(), ..valid() }.validate().is_err());
        assert!(AgentConfig { local_port: 0, ..valid() }.validate().is_err());
        assert!(AgentConfig { basic_auth: Some("nopass".into()), ..valid() }.validate().is_err());
        assert!(AgentConfig { basic_auth: Some("user:pass".into()), ..valid() }.validate().is_ok());
    }

    #[test]
    fn host_header_omits_default_http_port() {
        let mut config = valid();
        config.local_port = 80;
        assert_eq!(config.local_host_header(), "127.0.0.1");
        config.local_port = 8080;
        assert_eq!(config.local_host_header(), "127.0.0.1:8080");
    }
}
