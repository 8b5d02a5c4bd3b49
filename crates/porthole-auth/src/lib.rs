//! Shared-secret authentication for tunnel handshakes.
//!
//! A hub deployment has a single pre-shared secret. Agents present it as a
//! bearer token; the hub compares in constant time so a wrong token reveals
//! nothing about how much of it matched.

use subtle::ConstantTimeEq;

/// HTTP header carrying the tunnel credential.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no shared secret configured")]
    NotConfigured,

    #[error("missing authentication token")]
    Missing,

    #[error("malformed authorization header")]
    Malformed,

    #[error("invalid authentication token")]
    Invalid,
}

/// Validates bearer credentials against the deployment's shared secret.
#[derive(Clone)]
pub struct SharedSecret {
    secret: String,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret in logs.
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// A deployment without a secret must refuse to start.
    pub fn new(secret: impl Into<String>) -> Result<Self, AuthError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        Ok(Self { secret })
    }

    /// Compare a presented token against the secret in constant time.
    pub fn validate(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if self.secret.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }

    /// Validate a full `Authorization` header value.
    pub fn validate_bearer(&self, header: Option<&str>) -> Result<(), AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let token = header.strip_prefix(BEARER_PREFIX).ok_or(AuthError::Malformed)?;
        self.validate(token)
    }

    /// The `Authorization` header value an agent should send.
    pub fn authorization_value(&self) -> String {
        format!("{BEARER_PREFIX}{}", self.secret)
    }
}
