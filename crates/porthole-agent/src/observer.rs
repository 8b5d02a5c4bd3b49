//! Request observation: a side channel for per-exchange records, plus the
//! byte-counting writer that feeds it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use porthole_proto::RequestRecord;
use tokio::io::AsyncWrite;
use tracing::info;

/// Consumer of completed-exchange records. External UIs implement this;
/// the agent never depends on what happens to a record.
pub trait RequestObserver: Send + Sync {
    fn emit(&self, record: RequestRecord);
}

/// Discards every record.
pub struct NullObserver;

impl RequestObserver for NullObserver {
    fn emit(&self, _record: RequestRecord) {}
}

/// Logs one line per exchange.
pub struct LogObserver;

impl RequestObserver for LogObserver {
    fn emit(&self, record: RequestRecord) {
        info!(
            method = %record.method,
            path = %record.path,
            status = record.status,
            duration_ms = record.duration.as_millis() as u64,
            bytes_out = record.bytes_out,
            "request"
        );
    }
}

/// AsyncWrite adapter adding written byte counts to a shared counter.
pub struct CountingWriter<W> {
    inner: W,
    counter: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                self.counter.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
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
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn counting_writer_tracks_bytes() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut writer = CountingWriter::new(Vec::new(), counter.clone());
        writer.write_all(b"hello").await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 11);
        assert_eq!(writer.inner, b"hello world");
    }

    struct Recording(Mutex<Vec<RequestRecord>>);

    impl RequestObserver for Recording {
        fn emit(&self, record: RequestRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn observer_is_object_safe() {
        let observer: Arc<dyn RequestObserver> = Arc::new(Recording(Mutex::new(Vec::new())));
        observer.emit(RequestRecord {
            timestamp: chrono::Utc::now(),
            method: "GET".into(),
            path: "/".into(),
            status: 200,
            duration: std::time::Duration::from_millis(12),
            bytes_out: 42,
        });
    }
}
