//! TCP transport using `tokio::net`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::{Connection, StreamConnection, Transport, TransportError};

/// A TCP connection split into independently locked halves.
pub type TcpConnection = StreamConnection<OwnedReadHalf, OwnedWriteHalf>;

/// A TCP-based [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(%addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let conn = wrap(stream).map_err(TransportError::AcceptFailed)?;
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

/// Dials `addr`, giving up after `timeout`.
///
/// The returned connection carries `timeout` as its initial I/O deadline.
pub async fn dial(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpConnection, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::DialFailed { addr, source }),
        Err(_) => return Err(TransportError::TimedOut(timeout)),
    };

    let conn =
        wrap(stream).map_err(|source| TransportError::DialFailed { addr, source })?;
    conn.set_timeout(timeout);
    tracing::debug!(id = %conn.id(), %addr, "dialed TCP connection");
    Ok(conn)
}

fn wrap(stream: TcpStream) -> std::io::Result<TcpConnection> {
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    let (read, write) = stream.into_split();
    Ok(StreamConnection::new(read, write, local, peer))
}
