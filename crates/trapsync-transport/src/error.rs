use std::net::SocketAddr;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Dialing a remote peer failed.
    #[error("dial to {addr} failed: {source}")]
    DialFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The connection deadline elapsed before the I/O completed.
    #[error("i/o timed out after {0:?}")]
    TimedOut(std::time::Duration),
}
