//! The accept side: a TCP listener and its loop.
//!
//! Every accepted connection becomes an acceptor [`Session`] registered in
//! a shared [`SessionRegistry`]. A per-connection task serves it until the
//! peer leaves; a drop guard then takes it out of the registry, however
//! the task ended.
//!
//! ```text
//! accept ─▶ Session(Acceptor) ─▶ register ─▶ serve(controller::acceptor)
//!                                               │
//!                                   guard drop ─┴─▶ unregister
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use trapsync_session::{AcceptorHooks, Role, Session, SessionConfig, SessionRegistry, controller};
use trapsync_transport::{Connection, ConnectionId, TcpConnection, TcpTransport, Transport};

use crate::TrapError;

/// Sessions accepted by a [`SyncServer`].
pub type ServerSessions = SessionRegistry<TcpConnection>;

/// Takes a session out of the registry when its task ends, including when
/// the task is aborted.
struct SessionGuard {
    id: ConnectionId,
    sessions: Arc<ServerSessions>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.sessions.unregister(self.id).is_ok() {
            debug!(conn = %self.id, "session unregistered");
        }
    }
}

/// A running accept loop.
///
/// Dropping the server does not stop the loop; call
/// [`shutdown`](Self::shutdown).
pub struct SyncServer {
    local_addr: SocketAddr,
    sessions: Arc<ServerSessions>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncServer {
    /// Binds `addr` and starts accepting.
    ///
    /// Accepted connections get `connection_timeout` as their I/O deadline
    /// until the dialer authenticates, then the hooks' loose timeout.
    pub async fn bind<H: AcceptorHooks>(
        addr: SocketAddr,
        connection_timeout: Duration,
        config: SessionConfig,
        sessions: Arc<ServerSessions>,
        hooks: Arc<H>,
    ) -> Result<Self, TrapError> {
        let transport = TcpTransport::bind(addr).await?;
        let local_addr = transport.local_addr()?;
        let (shutdown, stop) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            transport,
            stop,
            connection_timeout,
            config,
            Arc::clone(&sessions),
            hooks,
        ));
        info!(listen = %local_addr, "sync server running");

        Ok(Self {
            local_addr,
            sessions,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &Arc<ServerSessions> {
        &self.sessions
    }

    /// Stops accepting, then says `BYE` to every accepted session.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "accept loop ended abnormally");
        }
        self.sessions.clear().await;
        info!(listen = %self.local_addr, "sync server stopped");
    }
}

async fn accept_loop<H: AcceptorHooks>(
    mut transport: TcpTransport,
    mut stop: watch::Receiver<bool>,
    connection_timeout: Duration,
    config: SessionConfig,
    sessions: Arc<ServerSessions>,
    hooks: Arc<H>,
) {
    loop {
        let conn = tokio::select! {
            _ = stop.changed() => return,
            accepted = transport.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        conn.set_timeout(connection_timeout);
        let session = Session::new(conn, Role::Acceptor, config);
        let id = session.id();
        if let Err(e) = sessions.register(Arc::clone(&session)) {
            error!(conn = %id, error = %e, "cannot register session");
            session.close().await;
            continue;
        }

        let responders = controller::acceptor(&session, Arc::clone(&hooks));
        let guard = SessionGuard {
            id,
            sessions: Arc::clone(&sessions),
        };
        tokio::spawn(async move {
            let _guard = guard;
            debug!(conn = %id, peer = %session.peer_addr(), "serving accepted session");
            if let Err(e) = session.serve(responders).await {
                debug!(conn = %id, error = %e, "accepted session ended with error");
            }
        });
    }
}
