//! The porthole agent: dials the hub once, outbound, then serves every
//! tunneled stream against a local endpoint.
//!
//! HTTP tunnels reconstruct each exchange (optionally enforcing basic auth
//! and rewriting the Host header); TCP tunnels bridge raw bytes. One
//! [`RequestRecord`](porthole_proto::RequestRecord) is emitted per
//! completed HTTP exchange through the [`RequestObserver`] capability.
//!
//! If an established session later breaks, the agent tears down and
//! returns; the reconnect-with-backoff loop applies only to the initial
//! connect. Relaunching is the caller's decision.

mod agent;
mod bridge;
mod config;
mod connect;
mod error;
mod observer;
mod worker;

pub use agent::{Agent, AgentStats, ShutdownHandle, StatsSnapshot};
pub use config::AgentConfig;
pub use error::AgentError;
pub use observer::{CountingWriter, LogObserver, NullObserver, RequestObserver};
