//! Hub configuration.

use porthole_proto::{RoutingMode, DEFAULT_HUB_PORT, DEFAULT_TCP_PORT_END, DEFAULT_TCP_PORT_START};

use crate::error::HubError;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Port the control and ingress listener binds to.
    pub port: u16,
    /// Shared secret agents must present. Required.
    pub secret: String,
    /// DNS suffix tunnels are published under. Required.
    pub base_domain: String,
    pub routing_mode: RoutingMode,
    /// Public TCP port allocation range, inclusive.
    pub tcp_port_start: u16,
    pub tcp_port_end: u16,
    /// Per-tunnel requests per minute; 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HUB_PORT,
            secret: String::new(),
            base_domain: String::new(),
            routing_mode: RoutingMode::default(),
            tcp_port_start: DEFAULT_TCP_PORT_START,
            tcp_port_end: DEFAULT_TCP_PORT_END,
            rate_limit_per_minute: 0,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.secret.is_empty() {
            return Err(porthole_auth::AuthError::NotConfigured.into());
        }
        if self.base_domain.is_empty() {
            return Err(HubError::Config("base domain is required".into()));
        }
        if self.tcp_port_start > self.tcp_port_end {
            return Err(HubError::Config(format!(
                "tcp port range start {} is above end {}",
                self.tcp_port_start, self.tcp_port_end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HubConfig {
        HubConfig {
            secret: "s".into(),
            base_domain: "tunnel.example.com".into(),
            ..HubConfig::default()
        }
    }

    #[test]
    fn accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn refuses_missing_secret() {
        let config = HubConfig {
            secret: String::new(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refuses_missing_base_domain() {
        let config = HubConfig {
            base_domain: String::new(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refuses_inverted_port_range() {
        let config = HubConfig {
            tcp_port_start: 10100,
            tcp_port_end: 10000,
            ..valid()
        };
        assert!(config.validate().is_err());
    }
}
