//! Public TCP ingress: one accept loop per TCP tunnel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::registry::SessionEntry;

/// Accept loop for a tunnel's allocated public port. Runs until the session
/// closes or the task is aborted (which is how the listener is closed).
pub(crate) async fn serve_tcp_ingress(listener: TcpListener, entry: Arc<SessionEntry>) {
    let mut closed = entry.session.closed();

    loop {
        let accepted = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                if !entry.admit() {
                    debug!(tenant = %entry.tenant_id, %peer, "tcp connection dropped by rate limit");
                    continue;
                }
                entry.request_count.fetch_add(1, Ordering::SeqCst);

                let entry = entry.clone();
                tokio::spawn(async move {
                    bridge(socket, entry).await;
                });
            }
            Err(e) => {
                if entry.session.is_closed() {
                    break;
                }
                warn!(tenant = %entry.tenant_id, error = %e, "tcp accept failed");
            }
        }
    }

    debug!(tenant = %entry.tenant_id, "tcp ingress loop ended");
}

async fn bridge(mut socket: TcpStream, entry: Arc<SessionEntry>) {
    let mut stream = match entry.session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(tenant = %entry.tenant_id, error = %e, "failed to open stream for tcp bridge");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((to_agent, to_client)) => {
            debug!(tenant = %entry.tenant_id, to_agent, to_client, "tcp bridge finished")
        }
        Err(e) => debug!(tenant = %entry.tenant_id, error = %e, "tcp bridge ended"),
    }
}
