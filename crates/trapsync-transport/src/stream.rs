//! Generic [`Connection`] over any split async byte stream.
//!
//! TCP sockets and in-memory duplex pipes share this implementation;
//! only construction differs.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::sync::{Mutex, watch};

use crate::{Connection, ConnectionId, TransportError};

/// Buffer size of each direction of an in-memory pair.
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// A connection built from a read half and a write half.
///
/// The halves sit behind separate locks so a reader task and a writer
/// task never contend. Closing flips a watch flag that wakes any blocked
/// `recv`/`send`.
pub struct StreamConnection<R, W> {
    id: ConnectionId,
    reader: Mutex<R>,
    writer: Mutex<W>,
    local: SocketAddr,
    peer: SocketAddr,
    timeout_ms: AtomicU64,
    closed: watch::Sender<bool>,
}

/// One end of an in-memory connection pair.
pub type MemoryConnection =
    StreamConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

impl<R, W> StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps the given halves. The I/O deadline starts disabled.
    pub fn new(reader: R, writer: W, local: SocketAddr, peer: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::next(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            peer,
            timeout_ms: AtomicU64::new(0),
            closed,
        }
    }
}

/// Creates two connected in-memory connections.
///
/// `a` is the local address of the first end and the peer address of the
/// second, and vice versa.
pub fn memory_pair(
    a: SocketAddr,
    b: SocketAddr,
) -> (MemoryConnection, MemoryConnection) {
    let (left, right) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        StreamConnection::new(left_read, left_write, a, b),
        StreamConnection::new(right_read, right_write, b, a),
    )
}

impl<R, W> Connection for StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(format!(
                "{} closed locally",
                self.id
            )));
        }

        let timeout = self.timeout();
        let closed = self.closed.subscribe();
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = wait_closed(closed) => Err(TransportError::ConnectionClosed(
                format!("{} closed during send", self.id),
            )),
            res = with_deadline(timeout, write) => match res {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => Err(TransportError::SendFailed(e)),
                None => Err(TransportError::TimedOut(timeout)),
            },
        }
    }

    async fn recv(&self, max: usize) -> Result<Option<Vec<u8>>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }

        let timeout = self.timeout();
        let closed = self.closed.subscribe();
        let read = async {
            let mut reader = self.reader.lock().await;
            let mut buf = vec![0u8; max.max(1)];
            let n = reader.read(&mut buf).await?;
            buf.truncate(n);
            Ok::<_, io::Error>(buf)
        };

        tokio::select! {
            _ = wait_closed(closed) => Ok(None),
            res = with_deadline(timeout, read) => match res {
                Some(Ok(buf)) if buf.is_empty() => Ok(None),
                Some(Ok(buf)) => Ok(Some(buf)),
                Some(Err(e)) => Err(TransportError::ReceiveFailed(e)),
                None => Err(TransportError::TimedOut(timeout)),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        tracing::debug!(id = %self.id, peer = %self.peer, "closing connection");

        // Blocked senders observe the flag and release the writer lock.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(id = %self.id, error = %e, "shutdown after close");
        }
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn set_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Runs `fut` under `timeout`, or unbounded when it is zero.
/// Returns `None` when the deadline elapsed.
async fn with_deadline<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}

/// Resolves once the close flag is set.
async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
