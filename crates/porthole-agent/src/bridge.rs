//! Per-stream TCP worker: a blind byte bridge to the local service.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use porthole_transport::TunnelStream;

use crate::worker::{dial_local, DialError, WorkerContext};

pub(crate) async fn handle_tcp_stream(mut stream: TunnelStream, ctx: WorkerContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }

    let mut local = match dial_local(&ctx).await {
        Ok(conn) => conn,
        Err(DialError::Cancelled) => return,
        Err(DialError::Failed(e)) => {
            if !ctx.cancel.is_cancelled() {
                warn!(error = %e, target = %ctx.config.local_addr(), "failed to reach local service");
            }
            return;
        }
    };

    ctx.stats.requests.fetch_add(1, Ordering::Relaxed);
    debug!(target = %ctx.config.local_addr(), "tcp connection bridged");

    match tokio::io::copy_bidirectional(&mut stream, &mut local).await {
        Ok((from_hub, to_hub)) => {
            ctx.stats.bytes_in.fetch_add(from_hub, Ordering::Relaxed);
            ctx.stats.bytes_out.fetch_add(to_hub, Ordering::Relaxed);
            debug!(from_hub, to_hub, "tcp bridge finished");
        }
        Err(e) => {
            if !ctx.cancel.is_cancelled() {
                debug!(error = %e, "tcp bridge ended");
            }
        }
    }
}
