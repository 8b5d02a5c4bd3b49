//! A logical bidirectional byte stream carried inside a session.
//!
//! Reads drain frames the session's reader task queued for this stream and
//! grant the peer fresh window as bytes are consumed. Writes acquire send
//! window first, so a stalled peer consumer exerts backpressure on exactly
//! this stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Semaphore};

use crate::frame::{Frame, StreamId, DATA_CHUNK, INITIAL_WINDOW};
use crate::session::Shared;
use crate::TransportError;

/// Inbound events routed to a stream by the session reader task.
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

type SendFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

pub struct TunnelStream {
    id: StreamId,
    shared: Arc<Shared>,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    send_window: Arc<Semaphore>,

    read_buf: Bytes,
    read_eof: bool,
    reset: bool,
    /// Consumed bytes not yet granted back to the peer.
    window_debt: u32,

    pending: Option<(SendFuture, usize)>,
    /// Length of a write completed by `poll_flush` before the caller retried.
    pending_done: Option<usize>,
    write_closed: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        id: StreamId,
        shared: Arc<Shared>,
        event_rx: mpsc::UnboundedReceiver<StreamEvent>,
        send_window: Arc<Semaphore>,
    ) -> Self {
        Self {
            id,
            shared,
            event_rx,
            send_window,
            read_buf: Bytes::new(),
            read_eof: false,
            reset: false,
            window_debt: 0,
            pending: None,
            pending_done: None,
            write_closed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Refuse an inbound stream (accept backlog overflow).
    pub(crate) fn reject(mut self) {
        self.write_closed = true;
        self.shared.try_send_frame(Frame::reset(self.id));
    }

    fn credit_consumed(&mut self, n: u32) {
        self.window_debt = self.window_debt.saturating_add(n);
        if self.window_debt >= INITIAL_WINDOW / 2 {
            // Best effort: on a full frame queue the debt is carried over
            // and retried on the next read.
            if self
                .shared
                .try_send_frame(Frame::window_update(self.id, self.window_debt))
            {
                self.window_debt = 0;
            }
        }
    }

    fn half_close(&mut self) {
        if self.write_closed {
            return;
        }
        self.write_closed = true;
        if !self.shared.try_send_frame(Frame::close(self.id)) {
            let shared = self.shared.clone();
            let id = self.id;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = shared.send_frame(Frame::close(id)).await;
                });
            }
        }
    }

    fn drive_pending(&mut self, cx: &mut Context<'_>) -> Option<Poll<io::Result<usize>>> {
        let (fut, len) = self.pending.as_mut()?;
        let len = *len;
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {
                self.pending = None;
                Some(Poll::Ready(Ok(len)))
            }
            Poll::Ready(Err(e)) => {
                self.pending = None;
                Some(Poll::Ready(Err(into_io(e))))
            }
            Poll::Pending => Some(Poll::Pending),
        }
    }
}

fn into_io(e: TransportError) -> io::Error {
    match e {
        TransportError::SessionClosed => io::Error::new(io::ErrorKind::BrokenPipe, e),
        other => io::Error::other(other),
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.reset {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset by peer",
                )));
            }

            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf.split_to(n));
                self.credit_consumed(n as u32);
                return Poll::Ready(Ok(()));
            }

            if self.read_eof {
                return Poll::Ready(Ok(()));
            }

            match self.event_rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // Session torn down underneath us.
                Poll::Ready(None) => self.read_eof = true,
                Poll::Ready(Some(StreamEvent::Data(bytes))) => self.read_buf = bytes,
                Poll::Ready(Some(StreamEvent::Fin)) => self.read_eof = true,
                Poll::Ready(Some(StreamEvent::Reset)) => self.reset = true,
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream write side closed",
            )));
        }

        // A previous write that completed inside poll_flush: report it now.
        if let Some(n) = self.pending_done.take() {
            return Poll::Ready(Ok(n));
        }

        // The caller is retrying the same data; finishing the stored send
        // is finishing this write.
        if let Some(result) = self.drive_pending(cx) {
            return result;
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = data.len().min(DATA_CHUNK);
        let payload = Bytes::copy_from_slice(&data[..len]);
        let shared = self.shared.clone();
        let window = self.send_window.clone();
        let id = self.id;

        let fut: SendFuture = Box::pin(async move {
            let permit = window
                .acquire_many(payload.len() as u32)
                .await
                .map_err(|_| TransportError::SessionClosed)?;
            permit.forget();
            shared.send_frame(Frame::data(id, payload)).await
        });
        self.pending = Some((fut, len));

        match self.drive_pending(cx) {
            Some(result) => result,
            None => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some((fut, len)) = self.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let len = *len;
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {
                self.pending = None;
                self.pending_done = Some(len);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.pending = None;
                Poll::Ready(Err(into_io(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        self.half_close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.shared.unregister_stream(self.id);
        self.half_close();
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("read_eof", &self.read_eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}
