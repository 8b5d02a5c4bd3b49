//! The agent: owns the session, dispatches workers, and drains on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use porthole_auth::SharedSecret;
use porthole_proto::{
    generate_tenant_id, normalize_tenant_id, public_url, HubInfo, TunnelKind, AGENT_DRAIN_TIMEOUT,
};
use porthole_transport::TunnelSession;

use crate::bridge;
use crate::config::AgentConfig;
use crate::connect;
use crate::error::AgentError;
use crate::observer::RequestObserver;
use crate::worker::{self, WorkerContext};

/// Aggregate tunnel statistics.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub requests: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl AgentStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// The active-worker set: every in-flight stream worker is tracked here so
/// shutdown can wait for the lot and force-close stragglers. Aborting a
/// worker drops its sockets, which is the sweep that unblocks pending I/O.
#[derive(Clone, Default)]
struct ActiveSet {
    inner: Arc<ActiveInner>,
}

#[derive(Default)]
struct ActiveInner {
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    finished: Notify,
}

impl ActiveSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            inner
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
            inner.finished.notify_waiters();
        });
        if !handle.is_finished() {
            self.lock().insert(id, handle);
        }
    }

    async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Register for wakeups before checking, so a worker finishing
            // in between cannot be missed.
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut workers = self.lock();
                workers.retain(|_, handle| !handle.is_finished());
                if workers.is_empty() {
                    return;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut workers = self.lock();
        let remaining = workers.len();
        if remaining > 0 {
            debug!(remaining, "drain deadline reached, force-closing workers");
        }
        for (_, handle) in workers.drain() {
            handle.abort();
        }
    }
}

/// Detached shutdown trigger for a running agent.
///
/// Requesting shutdown only cancels the top-level context: the accept loop
/// stops dispatching and in-flight workers get the drain grace before the
/// session itself is torn down at the end of [`Agent::run`].
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One connected tunnel agent.
pub struct Agent {
    config: Arc<AgentConfig>,
    session: Arc<TunnelSession>,
    hub_info: HubInfo,
    public_url: String,
    tcp_port: Option<u16>,
    cancel: CancellationToken,
    stats: Arc<AgentStats>,
    observer: Arc<dyn RequestObserver>,
    workers: ActiveSet,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("hub_info", &self.hub_info)
            .field("public_url", &self.public_url)
            .field("tcp_port", &self.tcp_port)
            .finish()
    }
}

impl Agent {
    /// Establish the tunnel. Fatal rejections (bad secret, tenant taken,
    /// invalid tenant, no free port) surface as errors; transient failures
    /// are retried with capped exponential backoff.
    pub async fn connect(
        mut config: AgentConfig,
        observer: Arc<dyn RequestObserver>,
    ) -> Result<Self, AgentError> {
        if config.tenant_id.is_empty() {
            config.tenant_id = generate_tenant_id();
            info!(tenant = %config.tenant_id, "generated tenant id");
        }
        config.tenant_id = normalize_tenant_id(&config.tenant_id);
        config.validate()?;

        let secret = SharedSecret::new(config.secret.clone())
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let cancel = CancellationToken::new();
        let established = connect::establish(&config, &secret, &cancel).await?;

        let public_url = public_url(
            config.kind,
            established.hub_info.routing_mode,
            &established.hub_info.base_domain,
            &config.tenant_id,
            established.tcp_port,
        );
        info!(
            url = %public_url,
            target = %config.local_addr(),
            "tunnel established"
        );

        Ok(Self {
            config: Arc::new(config),
            session: Arc::new(established.session),
            hub_info: established.hub_info,
            public_url,
            tcp_port: established.tcp_port,
            cancel,
            stats: Arc::new(AgentStats::default()),
            observer,
            workers: ActiveSet::default(),
        })
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    pub fn hub_info(&self) -> &HubInfo {
        &self.hub_info
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// Accept streams and dispatch workers until the session ends or
    /// shutdown is requested, then drain in-flight workers.
    pub async fn run(&self) -> Result<(), AgentError> {
        let ctx = WorkerContext {
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
            observer: self.observer.clone(),
        };

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.session.accept_stream() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    let ctx = ctx.clone();
                    match self.config.kind {
                        TunnelKind::Http => self
                            .workers
                            .spawn(worker::handle_http_stream(stream, ctx)),
                        TunnelKind::Tcp => self
                            .workers
                            .spawn(bridge::handle_tcp_stream(stream, ctx)),
                    }
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() && !self.session.is_closed() {
                        warn!(error = %e, "failed to accept stream");
                        continue;
                    }
                    if !self.cancel.is_cancelled() {
                        info!("hub connection lost");
                    }
                    break;
                }
            }
        }

        // Workers get the grace period on a still-open session, so replies
        // already in flight can finish; stragglers are force-closed and the
        // session goes down last.
        self.workers.drain(AGENT_DRAIN_TIMEOUT).await;
        self.session.close();
        Ok(())
    }
}
