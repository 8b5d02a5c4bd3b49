//! Hub error categories and their HTTP mapping.

use porthole_auth::AuthError;
use porthole_proto::TenantIdError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid tenant id: {0}")]
    InvalidTenant(#[from] TenantIdError),

    #[error("unknown tunnel kind: {0:?}")]
    InvalidKind(String),

    #[error("tenant id {0:?} is already in use")]
    TenantTaken(String),

    #[error("no free TCP port in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("no tunnel matches this request")]
    NotFound,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("tunnel stream failed: {0}")]
    Upstream(String),

    #[error("failed to bind {address}:{port}: {reason}")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// HTTP status this category is reported as.
    pub fn status(&self) -> u16 {
        match self {
            HubError::Auth(_) => 401,
            HubError::InvalidTenant(_) | HubError::InvalidKind(_) => 400,
            HubError::TenantTaken(_) => 409,
            HubError::PortsExhausted { .. } => 503,
            HubError::NotFound => 404,
            HubError::RateLimited => 429,
            HubError::Upstream(_) => 502,
            HubError::Config(_) | HubError::Bind { .. } | HubError::Io(_) => 500,
        }
    }
}

/// Canonical reason phrase for the statuses the hub emits.
pub(crate) fn http_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(HubError::Auth(AuthError::Missing).status(), 401);
        assert_eq!(HubError::InvalidKind("udp".into()).status(), 400);
        assert_eq!(HubError::TenantTaken("x".into()).status(), 409);
        assert_eq!(HubError::PortsExhausted { start: 1, end: 2 }.status(), 503);
        assert_eq!(HubError::NotFound.status(), 404);
        assert_eq!(HubError::RateLimited.status(), 429);
        assert_eq!(HubError::Upstream("open failed".into()).status(), 502);
    }
}
