//! The hub server: one TCP listener multiplexing three surfaces — the
//! tunnel handshake, the config document, and public ingress.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use porthole_auth::SharedSecret;
use porthole_proto::http1::{Http1Error, RequestHead, MAX_HEAD_BYTES};
use porthole_proto::{HubInfo, CONFIG_PATH, CONNECT_PATH, HUB_DRAIN_TIMEOUT};

use crate::config::HubConfig;
use crate::connect;
use crate::error::HubError;
use crate::ingress;
use crate::registry::SessionRegistry;
use crate::tasks::TaskSet;

/// How long a client may take to deliver a complete request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared hub state reachable from every handler.
pub(crate) struct HubState {
    pub config: HubConfig,
    pub secret: SharedSecret,
    pub registry: SessionRegistry,
    pub handlers: TaskSet,
    pub shutdown: watch::Sender<bool>,
}

/// The hub server. Bind first, then [`Hub::run`] until shutdown.
pub struct Hub {
    state: Arc<HubState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Detached shutdown trigger for a running hub.
pub struct HubHandle {
    state: Arc<HubState>,
}

impl HubHandle {
    pub fn shutdown(&self) {
        let _ = self.state.shutdown.send(true);
    }
}

impl Hub {
    pub async fn bind(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        let secret = SharedSecret::new(config.secret.clone())?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| HubError::Bind {
                address: "0.0.0.0".into(),
                port: config.port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let registry = SessionRegistry::new(config.tcp_port_start, config.tcp_port_end);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state: Arc::new(HubState {
                config,
                secret,
                registry,
                handlers: TaskSet::new(),
                shutdown,
            }),
            listener,
            local_addr,
        })
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            state: self.state.clone(),
        }
    }

    /// Accept connections until shutdown, then close all sessions and wait
    /// for in-flight handlers to drain.
    pub async fn run(self) -> Result<(), HubError> {
        info!(
            addr = %self.local_addr,
            base_domain = %self.state.config.base_domain,
            routing_mode = %self.state.config.routing_mode,
            "hub listening"
        );

        let mut shutdown_rx = self.state.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|s| *s) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let state = self.state.clone();
                        self.state.handlers.spawn(async move {
                            handle_connection(socket, peer, state).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!("shutting down: closing tunnels and draining handlers");
        drop(self.listener);
        self.state.registry.close_all();
        self.state.handlers.drain(HUB_DRAIN_TIMEOUT).await;
        info!("hub shutdown complete");
        Ok(())
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, state: Arc<HubState>) {
    // The raw head bytes are kept so the WebSocket handshake can re-read
    // them when this turns out to be a tunnel connect.
    let mut raw = Vec::with_capacity(2048);
    let (head, head_len) =
        match tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(&mut socket, &mut raw)).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "failed to read request head");
                return;
            }
            Err(_) => {
                debug!(%peer, "request head timed out");
                return;
            }
        };

    match head.path() {
        CONNECT_PATH => {
            connect::handle_connect(ReplayStream::new(raw, socket), state).await;
        }
        CONFIG_PATH => {
            let info = HubInfo {
                routing_mode: state.config.routing_mode,
                base_domain: state.config.base_domain.clone(),
            };
            let body = serde_json::to_vec(&info).unwrap_or_default();
            let _ =
                ingress::write_response(&mut socket, 200, "OK", "application/json", &body).await;
        }
        _ => {
            let leftover = raw.split_off(head_len);
            ingress::handle_ingress(socket, head, leftover, state).await;
        }
    }
}

async fn read_head(
    socket: &mut TcpStream,
    raw: &mut Vec<u8>,
) -> Result<(RequestHead, usize), Http1Error> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(parsed) = RequestHead::parse(raw)? {
            return Ok(parsed);
        }
        if raw.len() > MAX_HEAD_BYTES {
            return Err(Http1Error::HeadTooLarge);
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(Http1Error::TruncatedHead);
        }
        raw.extend_from_slice(&chunk[..n]);
    }
}

/// A TcpStream with already-consumed bytes stitched back in front, so the
/// WebSocket handshake can parse the request it never saw on the wire.
pub(crate) struct ReplayStream {
    prefix: Vec<u8>,
    offset: usize,
    inner: TcpStream,
}

impl ReplayStream {
    pub(crate) fn new(prefix: Vec<u8>, inner: TcpStream) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for ReplayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let n = (self.prefix.len() - self.offset).min(buf.remaining());
            let offset = self.offset;
            buf.put_slice(&self.prefix[offset..offset + n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener as TestListener;

    #[tokio::test]
    async fn replay_stream_serves_prefix_then_socket() {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b" tail").await.unwrap();
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut replay = ReplayStream::new(b"head".to_vec(), socket);

        let mut buf = vec![0u8; 9];
        replay.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"head tail");
        writer.await.unwrap();
    }
}
