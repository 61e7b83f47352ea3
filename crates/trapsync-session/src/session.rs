//! One authenticated (or authenticating) link to a peer.
//!
//! A [`Session`] wraps a [`Messager`] with the trapsync vocabulary: it
//! knows how to say `HELLO`, `HEARTBEAT`, `PARTNER_ADD` and friends, and
//! turns `_DENIED` answers into typed errors. The inbound side of the
//! vocabulary lives in [`crate::controller`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use trapsync_messager::{
    Messager, MessagerConfig, MessagerError, Reply, ReplyFlag, Responders, Stats,
};
use trapsync_protocol::{
    ClientMark, ClientRecord, ClientUnmark, Code, Empty, Hello, HelloAccept, HelloConflict,
    PartnerChange, Payload, PeerSet,
};
use trapsync_transport::{Connection, ConnectionId};

use crate::SessionError;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long each request waits for its reply.
    pub request_timeout: Duration,

    /// Largest message we accept, advertised to the peer in `HELLO` /
    /// `HELLO_ACCEPT`.
    pub max_receive_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(6),
            max_receive_length: 4096,
        }
    }
}

// ---------------------------------------------------------------------------
// Role / SessionState
// ---------------------------------------------------------------------------

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// We accepted the connection and answer `HELLO`.
    Acceptor,
    /// We dialed the connection and send `HELLO`.
    Dialer,
}

/// Lifecycle of a session.
///
/// ```text
///   Unauthenticated ──(HELLO accepted)──→ Authenticated
///          │                                    │
///          └─────────────(close / EOF)──────────┴──→ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// What a successful `HELLO` tells the dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// How often to send `HEARTBEAT`.
    pub heartbeat_period: Duration,
    /// Addresses the acceptor is connected with.
    pub partners: PeerSet,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A session over connection `C`.
pub struct Session<C: Connection> {
    messager: Arc<Messager<C>>,
    role: Role,
    request_timeout: Duration,
    authed: Arc<AtomicBool>,
    closed: AtomicBool,
    delay_nanos: AtomicU64,
}

impl<C: Connection> Session<C> {
    /// Wraps `conn`. Nothing is read or written until [`serve`](Self::serve)
    /// runs.
    pub fn new(conn: C, role: Role, config: SessionConfig) -> Arc<Self> {
        let messager = Messager::new(
            Arc::new(conn),
            MessagerConfig {
                max_receive_length: config.max_receive_length,
                ..MessagerConfig::default()
            }
            .validated(),
        );
        Arc::new(Self {
            messager,
            role,
            request_timeout: config.request_timeout,
            authed: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            delay_nanos: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.messager.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.messager.connection().peer_addr()
    }

    pub fn connection(&self) -> &Arc<C> {
        self.messager.connection()
    }

    pub fn messager(&self) -> &Arc<Messager<C>> {
        &self.messager
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stats(&self) -> Stats {
        self.messager.stats()
    }

    /// Round-trip of the last answered heartbeat.
    pub fn delay(&self) -> Duration {
        Duration::from_nanos(self.delay_nanos.load(Ordering::Relaxed))
    }

    pub fn is_authed(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) || self.connection().is_closed() {
            SessionState::Closed
        } else if self.authed.load(Ordering::Acquire) {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    pub(crate) fn set_authed(&self) {
        self.authed.store(true, Ordering::Release);
    }

    /// Our receive limit as advertised on the wire.
    pub(crate) fn advertised_length(&self) -> u16 {
        u16::try_from(self.messager.max_receive_length()).unwrap_or(u16::MAX)
    }

    /// Runs the read loop until the connection ends. The session is
    /// `Closed` afterwards.
    pub async fn serve(&self, responders: Responders<C>) -> Result<(), SessionError> {
        let result = self.messager.listen(responders).await;
        self.closed.store(true, Ordering::Release);
        debug!(conn = %self.id(), peer = %self.peer_addr(), "session ended");
        Ok(result?)
    }

    /// Closes the connection without saying goodbye.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.messager.close().await;
    }

    /// Sends `BYE` and closes. Waits at most one request timeout for the
    /// write.
    pub async fn bye(&self) -> Result<(), SessionError> {
        let sent = tokio::time::timeout(
            self.request_timeout,
            self.messager.notify(Code::Bye, &Empty),
        )
        .await;
        self.close().await;
        match sent {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::Messager(MessagerError::MessageExpired)),
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Introduces ourselves with `passphrase` and our current `partners`.
    ///
    /// On `HELLO_ACCEPT` the connection deadline becomes the acceptor's
    /// timeout, our send limit becomes its receive limit, and the session
    /// is authenticated. The read loop marks the session authenticated as
    /// it routes the accept, before any later request from the acceptor is
    /// handled.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailedDenied`] on `HELLO_DENIED`
    /// - [`SessionError::AuthFailedConflicted`] on `HELLO_CONFLICT`
    pub async fn auth(&self, passphrase: &str, partners: PeerSet) -> Result<Accepted, SessionError> {
        let hello = Hello {
            max_length: self.advertised_length(),
            passphrase: passphrase.to_owned(),
            partners,
        };
        let reply = self
            .messager
            .query_flagged(
                Code::Hello,
                &hello,
                &[Code::HelloAccept, Code::HelloDenied, Code::HelloConflict],
                self.messager.max_receive_length(),
                self.request_timeout,
                ReplyFlag::new(Code::HelloAccept, Arc::clone(&self.authed)),
            )
            .await?;
        let peer = self.peer_addr();

        match reply.code {
            Code::HelloAccept => {
                let accept: HelloAccept = match reply.parse() {
                    Ok(accept) => accept,
                    Err(e) => {
                        self.authed.store(false, Ordering::Release);
                        self.close().await;
                        return Err(e.into());
                    }
                };
                self.connection().set_timeout(accept.timeout);
                self.messager.set_max_send_length(usize::from(accept.max_length));
                info!(
                    conn = %self.id(),
                    %peer,
                    heartbeat = ?accept.heartbeat_period,
                    partners = accept.partners.len(),
                    "authenticated"
                );
                Ok(Accepted {
                    heartbeat_period: accept.heartbeat_period,
                    partners: accept.partners,
                })
            }
            Code::HelloConflict => {
                let conflict: HelloConflict = reply.parse()?;
                Err(SessionError::AuthFailedConflicted {
                    peer,
                    partners: conflict.partners,
                })
            }
            _ => Err(SessionError::AuthFailedDenied(peer)),
        }
    }

    /// Sends `HEARTBEAT` and returns the measured round-trip, which also
    /// becomes [`delay`](Self::delay).
    pub async fn heartbeat(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        let reply = self
            .query(Code::Heartbeat, &Empty, &[Code::Heartbeat, Code::HeartbeatDenied])
            .await?;
        if reply.code != Code::Heartbeat {
            return Err(SessionError::HeartbeatDenied(self.peer_addr()));
        }
        let elapsed = started.elapsed();
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.delay_nanos.store(nanos, Ordering::Relaxed);
        Ok(elapsed)
    }

    /// Tells the peer we gained `partners`.
    pub async fn add_partners(&self, partners: PeerSet) -> Result<(), SessionError> {
        self.request(Code::PartnerAdd, &PartnerChange::added(partners))
            .await
    }

    /// Tells the peer we lost `partners`.
    pub async fn remove_partners(&self, partners: PeerSet) -> Result<(), SessionError> {
        self.request(Code::PartnerRemove, &PartnerChange::removed(partners))
            .await
    }

    pub async fn mark_clients(&self, records: Vec<ClientRecord>) -> Result<(), SessionError> {
        self.request(Code::ClientMark, &ClientMark { records }).await
    }

    pub async fn unmark_clients(&self, ips: Vec<IpAddr>) -> Result<(), SessionError> {
        self.request(Code::ClientUnmark, &ClientUnmark { ips }).await
    }

    /// Sends a request whose only answers are `<code>_ACCEPT` and
    /// `<code>_DENIED`.
    async fn request<P: Payload + Sync>(&self, code: Code, payload: &P) -> Result<(), SessionError> {
        let (accept, denied) = answers(code);
        let reply = self.query(code, payload, &[accept, denied]).await?;
        if reply.code == accept {
            Ok(())
        } else {
            Err(self.denial(code))
        }
    }

    async fn query<P: Payload + Sync>(
        &self,
        code: Code,
        payload: &P,
        expects: &[Code],
    ) -> Result<Reply, SessionError> {
        let reply = self
            .messager
            .query(
                code,
                payload,
                expects,
                self.messager.max_receive_length(),
                self.request_timeout,
            )
            .await?;
        Ok(reply)
    }

    fn denial(&self, code: Code) -> SessionError {
        let peer = self.peer_addr();
        match code {
            Code::PartnerAdd => SessionError::PartnerAddDenied(peer),
            Code::PartnerRemove => SessionError::PartnerRemoveDenied(peer),
            Code::ClientMark => SessionError::ClientMarkDenied(peer),
            Code::ClientUnmark => SessionError::ClientUnmarkDenied(peer),
            Code::Heartbeat => SessionError::HeartbeatDenied(peer),
            _ => SessionError::AuthFailedDenied(peer),
        }
    }
}

/// Accept and deny codes answering a request code.
fn answers(code: Code) -> (Code, Code) {
    match code {
        Code::PartnerAdd => (Code::PartnerAddAccept, Code::PartnerAddDenied),
        Code::PartnerRemove => (Code::PartnerRemoveAccept, Code::PartnerRemoveDenied),
        Code::ClientMark => (Code::ClientMarkAccept, Code::ClientMarkDenied),
        Code::ClientUnmark => (Code::ClientUnmarkAccept, Code::ClientUnmarkDenied),
        Code::Heartbeat => (Code::Heartbeat, Code::HeartbeatDenied),
        _ => (Code::HelloAccept, Code::HelloDenied),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trapsync_transport::memory_pair;

    fn session(role: Role) -> Arc<Session<trapsync_transport::MemoryConnection>> {
        let (a, _b) = memory_pair(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        );
        Session::new(a, role, SessionConfig::default())
    }

    #[test]
    fn test_answers_pairs_accept_and_deny_codes() {
        assert_eq!(
            answers(Code::ClientMark),
            (Code::ClientMarkAccept, Code::ClientMarkDenied)
        );
        assert_eq!(
            answers(Code::PartnerRemove),
            (Code::PartnerRemoveAccept, Code::PartnerRemoveDenied)
        );
    }

    #[tokio::test]
    async fn test_state_new_session_is_unauthenticated() {
        let s = session(Role::Dialer);

        assert_eq!(s.state(), SessionState::Unauthenticated);
        assert_eq!(s.role(), Role::Dialer);
        assert_eq!(s.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_state_after_close_is_closed() {
        let s = session(Role::Acceptor);
        s.set_authed();
        assert!(s.is_authed());

        s.close().await;

        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.is_authed());
    }

    #[tokio::test]
    async fn test_advertised_length_saturates_at_u16_max() {
        let (a, _b) = memory_pair(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        );
        let s = Session::new(
            a,
            Role::Dialer,
            SessionConfig {
                max_receive_length: 1 << 20,
                ..SessionConfig::default()
            },
        );

        assert_eq!(s.advertised_length(), u16::MAX);
    }
}
