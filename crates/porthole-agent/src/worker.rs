//! Per-stream HTTP worker: reconstructs the tunneled exchange against the
//! local service.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use porthole_proto::http1::{
    read_request_head, read_response_head, BodyLen, ChunkedTracker, RequestHead, ResponseHead,
};
use porthole_proto::{RequestRecord, LOCAL_DIAL_TIMEOUT};
use porthole_transport::TunnelStream;

use crate::agent::AgentStats;
use crate::config::AgentConfig;
use crate::observer::{CountingWriter, RequestObserver};

/// Everything a worker needs, cloned per accepted stream.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub config: Arc<AgentConfig>,
    pub cancel: CancellationToken,
    pub stats: Arc<AgentStats>,
    pub observer: Arc<dyn RequestObserver>,
}

pub(crate) enum DialError {
    Cancelled,
    Failed(io::Error),
}

/// Dial the local endpoint with the 5 s deadline, honoring shutdown.
pub(crate) async fn dial_local(ctx: &WorkerContext) -> Result<TcpStream, DialError> {
    let addr = ctx.config.local_addr();
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(DialError::Cancelled),
        dialed = timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr)) => match dialed {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(DialError::Failed(e)),
            Err(_) => Err(DialError::Failed(io::Error::new(
                io::ErrorKind::TimedOut,
                "local dial timed out",
            ))),
        }
    }
}

async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.shutdown().await
}

async fn write_unauthorized<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    let body = "Unauthorized";
    let head = format!(
        "HTTP/1.1 401 Unauthorized\r\nContent-Type: text/plain; charset=utf-8\r\nWWW-Authenticate: Basic realm=\"porthole\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.shutdown().await
}

fn basic_auth_matches(head: &RequestHead, expected: &str) -> bool {
    let Some(value) = head.header("authorization") else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    match BASE64.decode(encoded.trim()) {
        Ok(decoded) => decoded == expected.as_bytes(),
        Err(_) => false,
    }
}

/// Copy the response body from the local service, honoring its framing.
async fn relay_response_body<R, W>(
    response: &ResponseHead,
    leftover: Vec<u8>,
    local: &mut R,
    out: &mut W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match response.body() {
        BodyLen::None => {}
        BodyLen::Len(total) => {
            let buffered = (leftover.len() as u64).min(total);
            out.write_all(&leftover[..buffered as usize]).await?;
            if total > buffered {
                let mut limited = (&mut *local).take(total - buffered);
                tokio::io::copy(&mut limited, out).await?;
            }
        }
        BodyLen::Chunked => {
            let mut tracker = ChunkedTracker::new();
            let consumed = tracker.feed(&leftover);
            out.write_all(&leftover[..consumed]).await?;

            let mut buf = [0u8; 16 * 1024];
            while !tracker.is_done() {
                let n = local.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let consumed = tracker.feed(&buf[..n]);
                out.write_all(&buf[..consumed]).await?;
            }
        }
        BodyLen::UntilClose => {
            out.write_all(&leftover).await?;
            tokio::io::copy(local, out).await?;
        }
    }
    Ok(())
}

/// Handle one tunneled HTTP exchange end to end.
pub(crate) async fn handle_http_stream(mut stream: TunnelStream, ctx: WorkerContext) {
    let started = Instant::now();
    let timestamp = Utc::now();

    let (mut head, request_leftover) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            if !ctx.cancel.is_cancelled() {
                debug!(error = %e, "failed to read tunneled request");
            }
            return;
        }
    };
    let method = head.method.clone();
    let path = head.path().to_string();
    debug!(%method, %path, "inbound request");

    if let Some(expected) = &ctx.config.basic_auth {
        if !basic_auth_matches(&head, expected) {
            let _ = write_unauthorized(&mut stream).await;
            return;
        }
    }

    let original_host = head.header("host").unwrap_or_default().to_string();
    head.set_header("X-Forwarded-Host", &original_host);
    head.set_header("X-Forwarded-Proto", "https");
    if ctx.config.rewrite_host {
        head.set_header("Host", &ctx.config.local_host_header());
    }

    let local = match dial_local(&ctx).await {
        Ok(conn) => conn,
        Err(DialError::Cancelled) => return,
        Err(DialError::Failed(e)) => {
            warn!(error = %e, target = %ctx.config.local_addr(), "failed to reach local service");
            let _ = write_error(&mut stream, 502, "Bad Gateway", "failed to reach local service")
                .await;
            return;
        }
    };

    if let Some(len) = head
        .header("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        ctx.stats.bytes_in.fetch_add(len, Ordering::Relaxed);
    }

    let (mut local_read, mut local_write) = local.into_split();
    let forward = async {
        local_write.write_all(&head.encode()).await?;
        local_write.write_all(&request_leftover).await?;
        io::Result::Ok(())
    };
    if let Err(e) = forward.await {
        if !ctx.cancel.is_cancelled() {
            warn!(error = %e, "failed to forward request to local service");
            let _ = write_error(&mut stream, 502, "Bad Gateway", "failed to forward request").await;
        }
        return;
    }

    // Remaining request body bytes (and upgraded traffic) keep flowing to
    // the local service while the response is relayed back.
    let (mut stream_read, stream_write) = tokio::io::split(stream);
    let request_pump = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stream_read, &mut local_write).await;
    });

    let bytes_out = Arc::new(AtomicU64::new(0));
    let mut counting = CountingWriter::new(stream_write, bytes_out.clone());

    let (response, response_leftover) = match read_response_head(&mut local_read).await {
        Ok(parsed) => parsed,
        Err(e) => {
            if !ctx.cancel.is_cancelled() {
                warn!(error = %e, "failed to read response from local service");
                let _ = write_error(&mut counting, 502, "Bad Gateway", "failed to read response")
                    .await;
            }
            request_pump.abort();
            return;
        }
    };
    let status = response.code;

    let relay = async {
        counting.write_all(&response.encode()).await?;
        if response.is_upgrade() {
            // From here the exchange is a raw pipe in both directions.
            counting.write_all(&response_leftover).await?;
            tokio::io::copy(&mut local_read, &mut counting).await?;
        } else {
            relay_response_body(&response, response_leftover, &mut local_read, &mut counting)
                .await?;
        }
        counting.shutdown().await
    };
    if let Err(e) = relay.await {
        if !ctx.cancel.is_cancelled() {
            debug!(error = %e, "response relay ended early");
        }
    }
    request_pump.abort();

    let out = bytes_out.load(Ordering::Relaxed);
    ctx.stats.requests.fetch_add(1, Ordering::Relaxed);
    ctx.stats.bytes_out.fetch_add(out, Ordering::Relaxed);
    ctx.observer.emit(RequestRecord {
        timestamp,
        method,
        path,
        status,
        duration: started.elapsed(),
        bytes_out: out,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &[u8]) -> RequestHead {
        RequestHead::parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn basic_auth_validation() {
        // "user:pass" base64-encoded.
        let ok = request(
            b"GET / HTTP/1.1\r\nHost: h\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n",
        );
        assert!(basic_auth_matches(&ok, "user:pass"));
        assert!(!basic_auth_matches(&ok, "user:other"));

        let missing = request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(!basic_auth_matches(&missing, "user:pass"));

        let wrong_scheme =
            request(b"GET / HTTP/1.1\r\nHost: h\r\nAuthorization: Bearer tok\r\n\r\n");
        assert!(!basic_auth_matches(&wrong_scheme, "user:pass"));

        let garbage =
            request(b"GET / HTTP/1.1\r\nHost: h\r\nAuthorization: Basic !!!\r\n\r\n");
        assert!(!basic_auth_matches(&garbage, "user:pass"));
    }

    #[tokio::test]
    async fn relays_content_length_bodies() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let (response, _) = ResponseHead::parse(raw).unwrap().unwrap();

        // Half the body arrived with the head, half is still in the reader.
        let leftover = b"01234".to_vec();
        let mut local: &[u8] = b"56789EXTRA";
        let mut out = Vec::new();
        relay_response_body(&response, leftover, &mut local, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn relays_chunked_bodies_to_the_terminator() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (response, _) = ResponseHead::parse(raw).unwrap().unwrap();

        let leftover = b"4\r\nWiki\r\n".to_vec();
        let mut local: &[u8] = b"5\r\npedia\r\n0\r\n\r\n";
        let mut out = Vec::new();
        relay_response_body(&response, leftover, &mut local, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn bodyless_statuses_relay_nothing() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let (response, _) = ResponseHead::parse(raw).unwrap().unwrap();
        let mut local: &[u8] = b"should not be read as body";
        let mut out = Vec::new();
        relay_response_body(&response, Vec::new(), &mut local, &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
