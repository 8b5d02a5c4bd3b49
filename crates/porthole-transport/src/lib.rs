//! Tunnel transport: many concurrent byte streams over one WebSocket.
//!
//! The layering mirrors the wire: a single authenticated WebSocket carries
//! binary frames ([`frame`]), a [`TunnelSession`] multiplexes logical
//! streams over those frames, and each [`TunnelStream`] behaves like an
//! ordinary `AsyncRead + AsyncWrite` socket with its own flow-control
//! window.

mod frame;
mod session;
mod stream;

pub use frame::{
    Frame, FrameError, FrameFlags, FrameType, StreamId, ACCEPT_BACKLOG, DATA_CHUNK,
    INITIAL_WINDOW, MAX_FRAME_SIZE,
};
pub use session::TunnelSession;
pub use stream::TunnelStream;

/// Transport errors.
///
/// Socket-level failures never surface here directly: the session's reader
/// and writer tasks own the socket, and anything that kills it collapses
/// into the session being closed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session is closed; opens and accepts fail fast with this.
    #[error("session closed")]
    SessionClosed,

    /// A stream open could not be queued within its deadline.
    #[error("stream open timed out")]
    Timeout,
}
