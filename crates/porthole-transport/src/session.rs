//! Multiplexed tunnel session over a single WebSocket connection.
//!
//! The socket is split once: a writer task serializes every outbound frame
//! (one message at a time) and emits liveness probes; a reader task decodes
//! inbound messages and routes them to per-stream buffers. The reader never
//! awaits a slow stream, so one stalled consumer cannot block the others —
//! inbound buffering is bounded by the flow-control window instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use porthole_proto::{KEEPALIVE_INTERVAL, WRITE_TIMEOUT};

use crate::frame::{Frame, FrameType, StreamId, ACCEPT_BACKLOG, INITIAL_WINDOW};
use crate::stream::{StreamEvent, TunnelStream};
use crate::TransportError;

/// Deadline for getting a stream-open frame onto the wire queue.
const STREAM_OPEN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Per-stream bookkeeping owned by the session.
pub(crate) struct StreamSlot {
    /// Delivers inbound events to the stream. Unbounded on purpose: the
    /// peer can only have `INITIAL_WINDOW` unacknowledged bytes in flight.
    pub(crate) event_tx: mpsc::UnboundedSender<StreamEvent>,
    /// Byte credits this side may still send on the stream.
    pub(crate) send_window: Arc<Semaphore>,
}

/// State shared between the session handle, its streams, and its tasks.
pub(crate) struct Shared {
    session_id: String,
    frame_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Best-effort frame enqueue from non-async contexts.
    pub(crate) fn try_send_frame(&self, frame: Frame) -> bool {
        !self.is_closed() && self.frame_tx.try_send(frame).is_ok()
    }

    pub(crate) fn unregister_stream(&self, id: StreamId) {
        self.lock_streams().remove(&id);
    }

    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.session_id, reason, "session closed");
        let _ = self.close_tx.send(true);

        let mut streams = self.lock_streams();
        for (_, slot) in streams.drain() {
            let _ = slot.event_tx.send(StreamEvent::Fin);
            slot.send_window.close();
        }
    }
}

/// One live agent ↔ hub connection carrying multiplexed streams.
///
/// `close` is idempotent and wakes every blocked open and accept; dropping
/// the session closes it too.
pub struct TunnelSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<TunnelStream>>,
    next_stream_id: AtomicU32,
    close_rx: watch::Receiver<bool>,
    connected_at: Instant,
}

impl TunnelSession {
    /// Agent side. Opens odd stream ids.
    pub fn client<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(ws, 1)
    }

    /// Hub side. Opens even stream ids.
    pub fn server<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(ws, 2)
    }

    fn new<S>(ws: WebSocketStream<S>, first_stream_id: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = format!("sess-{}", Uuid::new_v4());
        let (sink, source) = ws.split();

        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (close_tx, close_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            session_id,
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_tx,
        });

        // Milliseconds since `connected_at` of the last proof of life.
        let connected_at = Instant::now();
        let liveness = Arc::new(AtomicU64::new(0));

        tokio::spawn(writer_task(
            sink,
            frame_rx,
            shared.clone(),
            close_rx.clone(),
            liveness.clone(),
            connected_at,
        ));
        tokio::spawn(reader_task(
            source,
            shared.clone(),
            accept_tx,
            close_rx.clone(),
            liveness,
            connected_at,
        ));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(first_stream_id),
            close_rx,
            connected_at,
        }
    }

    /// Open a new stream towards the peer.
    pub async fn open_stream(&self) -> Result<TunnelStream, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));

        self.shared.lock_streams().insert(
            id,
            StreamSlot {
                event_tx,
                send_window: send_window.clone(),
            },
        );

        let enqueue = timeout(STREAM_OPEN_TIMEOUT, self.shared.send_frame(Frame::open(id))).await;
        match enqueue {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.shared.unregister_stream(id);
                return Err(e);
            }
            Err(_) => {
                self.shared.unregister_stream(id);
                return Err(TransportError::Timeout);
            }
        }

        trace!(session = %self.shared.session_id, stream = id, "opened stream");
        Ok(TunnelStream::new(id, self.shared.clone(), event_rx, send_window))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<TunnelStream, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let mut accept_rx = self.accept_rx.lock().await;
        let mut close_rx = self.close_rx.clone();
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(TransportError::SessionClosed),
            _ = close_rx.changed() => Err(TransportError::SessionClosed),
        }
    }

    /// Close the session and abort all streams. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown("closed by caller");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close signal for dependents; resolves via `wait_for(|c| *c)`.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shared.shutdown("session dropped");
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("session_id", &self.shared.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frame_rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
    liveness: Arc<AtomicU64>,
    started: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session = %shared.session_id, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                match timeout(WRITE_TIMEOUT, sink.send(Message::Binary(encoded.to_vec()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(session = %shared.session_id, error = %e, "websocket send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(session = %shared.session_id, "write deadline exceeded");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                let now_ms = started.elapsed().as_millis() as u64;
                let last_ms = liveness.load(Ordering::Relaxed);
                let allowed = (KEEPALIVE_INTERVAL + WRITE_TIMEOUT).as_millis() as u64;
                if now_ms.saturating_sub(last_ms) > allowed {
                    warn!(session = %shared.session_id, "keep-alive round-trip missed, dropping connection");
                    break;
                }
                match timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => trace!(session = %shared.session_id, "sent keep-alive ping"),
                    _ => break,
                }
            }
            _ = close_rx.changed() => {
                // Flush whatever was already queued before the close.
                while let Ok(frame) = frame_rx.try_recv() {
                    let Ok(encoded) = frame.encode() else { continue };
                    match timeout(WRITE_TIMEOUT, sink.send(Message::Binary(encoded.to_vec()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
    shared.shutdown("writer task ended");
}

async fn reader_task<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<TunnelStream>,
    mut close_rx: watch::Receiver<bool>,
    liveness: Arc<AtomicU64>,
    started: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = close_rx.changed() => break,
        };
        let Some(message) = message else { break };

        match message {
            Ok(Message::Binary(data)) => {
                liveness.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                match Frame::decode(Bytes::from(data)) {
                    Ok(frame) => dispatch_frame(&shared, &accept_tx, frame),
                    Err(e) => {
                        warn!(session = %shared.session_id, error = %e, "ignoring undecodable frame");
                    }
                }
            }
            Ok(Message::Pong(_)) => {
                liveness.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                trace!(session = %shared.session_id, "keep-alive pong");
            }
            // Pings are answered by tungstenite itself.
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(session = %shared.session_id, "peer closed the connection");
                break;
            }
            // Text and other message kinds are not part of the protocol.
            Ok(_) => {}
            Err(e) => {
                debug!(session = %shared.session_id, error = %e, "websocket read ended");
                break;
            }
        }
    }

    shared.shutdown("reader task ended");
}

fn dispatch_frame(shared: &Arc<Shared>, accept_tx: &mpsc::Sender<TunnelStream>, frame: Frame) {
    match frame.frame_type {
        FrameType::Open => {
            if shared.is_closed() {
                return;
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let send_window = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
            {
                let mut streams = shared.lock_streams();
                if streams.contains_key(&frame.stream_id) {
                    warn!(
                        session = %shared.session_id,
                        stream = frame.stream_id,
                        "duplicate stream open, resetting"
                    );
                    drop(streams);
                    shared.try_send_frame(Frame::reset(frame.stream_id));
                    return;
                }
                streams.insert(
                    frame.stream_id,
                    StreamSlot {
                        event_tx,
                        send_window: send_window.clone(),
                    },
                );
            }

            let stream =
                TunnelStream::new(frame.stream_id, shared.clone(), event_rx, send_window);
            match accept_tx.try_send(stream) {
                Ok(()) => trace!(
                    session = %shared.session_id,
                    stream = frame.stream_id,
                    "accepted inbound stream"
                ),
                Err(TrySendError::Full(stream)) => {
                    warn!(
                        session = %shared.session_id,
                        stream = frame.stream_id,
                        "accept backlog full, resetting inbound stream"
                    );
                    stream.reject();
                }
                // Session is tearing down; the stream cleans up on drop.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        FrameType::Data => {
            let streams = shared.lock_streams();
            match streams.get(&frame.stream_id) {
                Some(slot) => {
                    let _ = slot.event_tx.send(StreamEvent::Data(frame.payload));
                }
                None => trace!(
                    session = %shared.session_id,
                    stream = frame.stream_id,
                    "data for unknown stream"
                ),
            }
        }
        FrameType::Close => {
            let mut streams = shared.lock_streams();
            if frame.flags.has_rst() {
                if let Some(slot) = streams.remove(&frame.stream_id) {
                    let _ = slot.event_tx.send(StreamEvent::Reset);
                    slot.send_window.close();
                }
            } else if let Some(slot) = streams.get(&frame.stream_id) {
                // Half-close: the peer stops sending, our direction stays
                // open, so the slot survives for window updates.
                let _ = slot.event_tx.send(StreamEvent::Fin);
            }
        }
        FrameType::WindowUpdate => {
            let Some(delta) = frame.window_delta() else {
                return;
            };
            let streams = shared.lock_streams();
            if let Some(slot) = streams.get(&frame.stream_id) {
                slot.send_window.add_permits(delta as usize);
            }
        }
    }
}
