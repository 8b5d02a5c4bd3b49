//! Agent error categories.
//!
//! During connect, statuses that mean the hub will never accept this
//! configuration map to their own variants; everything else is retried
//! inside the connect loop and never surfaces here.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: invalid secret")]
    AuthRejected,

    #[error("tenant id {0:?} is already in use")]
    TenantTaken(String),

    #[error("hub rejected tenant id {0:?} as invalid")]
    TenantRejected(String),

    #[error("hub has no free public TCP port")]
    PortsExhausted,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect cancelled")]
    Cancelled,
}
