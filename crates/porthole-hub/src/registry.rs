//! The authoritative index of live tunnels.
//!
//! Tenant lookups sit on the ingress hot path, so the tenant map is a
//! `DashMap` (lock-free reads, atomic inserts). TCP port allocation scans a
//! range and must pair the scan with the reservation, so the port table
//! lives under its own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use porthole_proto::{normalize_tenant_id, validate_tenant_id, TunnelKind};
use porthole_transport::TunnelSession;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::HubError;
use crate::limiter::RateLimiter;

/// One registered tunnel.
pub struct SessionEntry {
    pub tenant_id: String,
    pub kind: TunnelKind,
    pub session: TunnelSession,
    pub connected_at: DateTime<Utc>,
    pub request_count: AtomicI64,
    pub limiter: Option<RateLimiter>,
    /// Allocated public port, TCP tunnels only.
    pub tcp_port: Option<u16>,
    /// Accept-loop task for the public port; aborting it closes the listener.
    tcp_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    pub fn new(
        tenant_id: String,
        kind: TunnelKind,
        session: TunnelSession,
        tcp_port: Option<u16>,
        limiter: Option<RateLimiter>,
    ) -> Self {
        Self {
            tenant_id,
            kind,
            session,
            connected_at: Utc::now(),
            request_count: AtomicI64::new(0),
            limiter,
            tcp_port,
            tcp_task: Mutex::new(None),
        }
    }

    pub fn set_tcp_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.tcp_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Close the public listener by aborting its accept loop.
    pub fn close_tcp_listener(&self) {
        let mut slot = self.tcp_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Check the rate limiter; unlimited when none is configured.
    pub fn admit(&self) -> bool {
        self.limiter.as_ref().map(RateLimiter::allow).unwrap_or(true)
    }
}

/// Registry of live sessions keyed by tenant id.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    count: AtomicI64,
    tcp_port_start: u16,
    tcp_port_end: u16,
    /// port → tenant. The mutex covers the scan plus the reservation.
    tcp_ports: Mutex<HashMap<u16, String>>,
}

impl SessionRegistry {
    pub fn new(tcp_port_start: u16, tcp_port_end: u16) -> Self {
        Self {
            sessions: DashMap::new(),
            count: AtomicI64::new(0),
            tcp_port_start,
            tcp_port_end,
            tcp_ports: Mutex::new(HashMap::new()),
        }
    }

    fn lock_ports(&self) -> MutexGuard<'_, HashMap<u16, String>> {
        self.tcp_ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a session under its tenant id. Atomic: of concurrent
    /// registrations for one id, exactly one wins.
    pub fn register(&self, entry: Arc<SessionEntry>) -> Result<(), HubError> {
        let tenant_id = normalize_tenant_id(&entry.tenant_id);
        validate_tenant_id(&tenant_id)?;

        match self.sessions.entry(tenant_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HubError::TenantTaken(tenant_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(&normalize_tenant_id(tenant_id))
            .map(|entry| entry.value().clone())
    }

    pub fn exists(&self, tenant_id: &str) -> bool {
        self.sessions.contains_key(&normalize_tenant_id(tenant_id))
    }

    /// Remove a tenant; closes its public listener and releases its port.
    /// A no-op for unknown tenants.
    pub fn unregister(&self, tenant_id: &str) -> Option<Arc<SessionEntry>> {
        let (_, entry) = self.sessions.remove(&normalize_tenant_id(tenant_id))?;
        self.count.fetch_sub(1, Ordering::SeqCst);

        entry.close_tcp_listener();
        if let Some(port) = entry.tcp_port {
            self.release_tcp_port(port);
        }
        debug!(tenant = %entry.tenant_id, "unregistered tunnel");
        Some(entry)
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Reserve the first free port of the range, ascending.
    pub fn allocate_tcp_port(&self, tenant_id: &str) -> Result<u16, HubError> {
        let mut ports = self.lock_ports();
        for port in self.tcp_port_start..=self.tcp_port_end {
            if let std::collections::hash_map::Entry::Vacant(slot) = ports.entry(port) {
                slot.insert(tenant_id.to_string());
                return Ok(port);
            }
        }
        Err(HubError::PortsExhausted {
            start: self.tcp_port_start,
            end: self.tcp_port_end,
        })
    }

    /// Idempotent.
    pub fn release_tcp_port(&self, port: u16) {
        self.lock_ports().remove(&port);
    }

    /// Tear down every tunnel and drain the registry: each entry has its
    /// public listener closed first (to unblock its accept loop), is
    /// removed with its port released, and has its session closed. Count
    /// is 0 on return; lifecycle tasks observing the session close find
    /// their tenant already gone. Safe to call repeatedly.
    pub fn close_all(&self) {
        let tenants: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for tenant in tenants {
            if let Some(entry) = self.unregister(&tenant) {
                entry.session.close();
            }
        }
    }
}
