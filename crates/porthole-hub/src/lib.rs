//! The porthole hub: accepts outbound tunnel connections from agents and
//! routes public HTTP and TCP traffic onto them.
//!
//! One listener serves three surfaces:
//!
//! - `/_connect` — the authenticated WebSocket handshake agents dial
//! - `/_config` — a read-only JSON document with routing mode + base domain
//! - everything else — public ingress, resolved to a tenant and proxied
//!   over a fresh tunnel stream
//!
//! TCP tunnels additionally get a dedicated public port with its own
//! accept loop.

mod config;
mod connect;
mod error;
mod ingress;
mod limiter;
mod registry;
mod server;
mod tasks;
mod tcp;

pub use config::HubConfig;
pub use error::HubError;
pub use limiter::RateLimiter;
pub use registry::{SessionEntry, SessionRegistry};
pub use server::{Hub, HubHandle};
pub use tasks::TaskSet;
