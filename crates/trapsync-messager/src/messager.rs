//! Request/reply engine over one connection.
//!
//! A [`Messager`] runs two tasks per connection: the read loop inside
//! [`Messager::listen`] and a writer task it spawns. Outgoing messages go
//! through a bounded FIFO queue to the writer; requests additionally hold
//! a correlation slot so the read loop can route the reply back to the
//! waiting caller.
//!
//! ```text
//! query() ──hold──▶ SlotTable ◀──take── read loop ──▶ Responders
//!    │                                     ▲
//!    └──────▶ outbox ──▶ writer ──▶ conn ──┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use trapsync_protocol::{Code, END, Frame, FrameParser, MessageId, Payload, ProtocolError, pack, pad};
use trapsync_transport::{Connection, ConnectionId, TransportError};

use crate::config::clamp_length;
use crate::responder::{Request, Responders};
use crate::slots::{DeleteReason, Occupant, SlotTable};
use crate::{MessagerConfig, MessagerError};

/// Capacity of the outgoing queue; one per slot.
pub const OUTBOX_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Reply / Stats
// ---------------------------------------------------------------------------

/// A reply to one of our requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub fields: Vec<Vec<u8>>,
}

impl Reply {
    /// Decodes the fields as payload `P`.
    pub fn parse<P: Payload>(&self) -> Result<P, MessagerError> {
        Ok(P::parse(&self.fields)?)
    }
}

/// Byte counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Bytes written, padding included.
    pub tx: u64,
    /// Bytes read.
    pub rx: u64,
}

/// A flag the read loop raises when it routes a reply with `code`.
///
/// The flag is set before the next inbound message is handled, so a
/// responder never observes the state from before the reply.
#[derive(Debug, Clone)]
pub struct ReplyFlag {
    pub code: Code,
    pub flag: Arc<AtomicBool>,
}

impl ReplyFlag {
    pub fn new(code: Code, flag: Arc<AtomicBool>) -> Self {
        Self { code, flag }
    }
}

#[derive(Debug, Default)]
struct Counters {
    tx: AtomicU64,
    rx: AtomicU64,
}

// ---------------------------------------------------------------------------
// Slot occupant / queue entries
// ---------------------------------------------------------------------------

/// A request waiting for its reply.
struct Pending {
    expects: Vec<Code>,
    max_reply_len: usize,
    sent: Arc<AtomicBool>,
    flag: Option<ReplyFlag>,
    reply: oneshot::Sender<Result<Reply, MessagerError>>,
}

impl Pending {
    fn resolve(self, frame: Frame) {
        let result = if !self.sent.load(Ordering::Acquire) {
            Err(MessagerError::MessageRespondNotReady)
        } else if frame.len > self.max_reply_len {
            Err(MessagerError::MessageTooLong {
                len: frame.len,
                limit: self.max_reply_len,
            })
        } else {
            if let Some(flag) = self.flag.as_ref().filter(|f| f.code == frame.code) {
                flag.flag.store(true, Ordering::Release);
            }
            Ok(Reply {
                code: frame.code,
                fields: frame.fields,
            })
        };
        let _ = self.reply.send(result);
    }
}

impl Occupant for Pending {
    fn on_delete(self, reason: DeleteReason, err: Option<MessagerError>) {
        let err = match (reason, err) {
            (_, Some(err)) => err,
            (DeleteReason::Expire, None) => MessagerError::MessageExpired,
            (DeleteReason::Clear, None) => MessagerError::MessageCleared,
            (DeleteReason::Drop, None) => MessagerError::MessageDropped,
        };
        let _ = self.reply.send(Err(err));
    }
}

enum Delivery {
    /// A request holding a slot. `sent` flips once it reaches the wire.
    Held(Arc<AtomicBool>),
    /// An unheld message; the caller waits for the local write result.
    Unheld(oneshot::Sender<Result<(), MessagerError>>),
}

struct Outgoing {
    id: MessageId,
    code: Code,
    bytes: Vec<u8>,
    delivery: Delivery,
}

// ---------------------------------------------------------------------------
// Messager
// ---------------------------------------------------------------------------

/// Correlated request/reply exchange over one connection.
pub struct Messager<C: Connection> {
    conn: Arc<C>,
    slots: Arc<SlotTable<Pending>>,
    outbox: mpsc::Sender<Outgoing>,
    inbox: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    shutdown: watch::Sender<bool>,
    writable: AtomicBool,
    max_receive_length: usize,
    max_send_length: AtomicUsize,
    counters: Counters,
    write_error: std::sync::Mutex<Option<TransportError>>,
}

impl<C: Connection> Messager<C> {
    /// Wraps `conn`. Nothing is read or written until [`listen`](Self::listen).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(conn: Arc<C>, config: MessagerConfig) -> Arc<Self> {
        let config = config.validated();
        let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
        Arc::new(Self {
            conn,
            slots: SlotTable::new(),
            outbox,
            inbox: Mutex::new(Some(inbox)),
            shutdown: watch::Sender::new(false),
            writable: AtomicBool::new(true),
            max_receive_length: config.max_receive_length,
            max_send_length: AtomicUsize::new(config.max_send_length),
            counters: Counters::default(),
            write_error: std::sync::Mutex::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tx: self.counters.tx.load(Ordering::Relaxed),
            rx: self.counters.rx.load(Ordering::Relaxed),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn max_send_length(&self) -> usize {
        self.max_send_length.load(Ordering::Relaxed)
    }

    /// Adopts the peer's receive limit as our send limit.
    pub fn set_max_send_length(&self, length: usize) {
        self.max_send_length
            .store(clamp_length(length), Ordering::Relaxed);
    }

    pub fn max_receive_length(&self) -> usize {
        self.max_receive_length
    }

    /// Sends a request and waits for one of the `expects` reply codes.
    ///
    /// `timeout` bounds both the wait for a free slot and the wait for the
    /// reply. A reply longer than `max_reply_len` raw bytes is rejected.
    ///
    /// # Errors
    /// - [`MessagerError::MessageExpired`] when no reply came in time
    /// - [`MessagerError::MessageCleared`] / transport errors on teardown
    /// - [`MessagerError::MessageTooLong`] for oversized requests or replies
    /// - [`MessagerError::MessageUnwritable`] once the writer has stopped
    pub async fn query<P: Payload>(
        &self,
        code: Code,
        payload: &P,
        expects: &[Code],
        max_reply_len: usize,
        timeout: Duration,
    ) -> Result<Reply, MessagerError> {
        self.exchange(code, payload, expects, max_reply_len, timeout, None)
            .await
    }

    /// Like [`query`](Self::query), and raises `flag` from the read loop
    /// when the reply carries `flag.code`.
    pub async fn query_flagged<P: Payload>(
        &self,
        code: Code,
        payload: &P,
        expects: &[Code],
        max_reply_len: usize,
        timeout: Duration,
        flag: ReplyFlag,
    ) -> Result<Reply, MessagerError> {
        self.exchange(code, payload, expects, max_reply_len, timeout, Some(flag))
            .await
    }

    async fn exchange<P: Payload>(
        &self,
        code: Code,
        payload: &P,
        expects: &[Code],
        max_reply_len: usize,
        timeout: Duration,
        flag: Option<ReplyFlag>,
    ) -> Result<Reply, MessagerError> {
        if !self.is_writable() {
            return Err(MessagerError::MessageUnwritable);
        }
        let fields = payload.build()?;
        let deadline = Instant::now() + timeout;

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = Arc::new(AtomicBool::new(false));
        let pending = Pending {
            expects: expects.to_vec(),
            max_reply_len,
            sent: Arc::clone(&sent),
            flag,
            reply: reply_tx,
        };
        let id = self.slots.hold(pending, timeout).await?;
        let ours = |p: &Pending| Arc::ptr_eq(&p.sent, &sent);

        let bytes = pack(id, code, &fields);
        let limit = self.max_send_length();
        if bytes.len() > limit {
            let _ = self.slots.take_if(id, ours);
            return Err(MessagerError::MessageTooLong {
                len: bytes.len(),
                limit,
            });
        }

        let outgoing = Outgoing {
            id,
            code,
            bytes,
            delivery: Delivery::Held(Arc::clone(&sent)),
        };
        if self.outbox.send(outgoing).await.is_err() {
            let _ = self.slots.take_if(id, ours);
            return Err(MessagerError::MessageUnwritable);
        }
        trace!(conn = %self.id(), %id, %code, "request queued");

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessagerError::MessageCleared),
            Err(_) => {
                let _ = self.slots.take_if(id, ours);
                Err(MessagerError::MessageExpired)
            }
        }
    }

    /// Answers request `id`. Returns once the reply was written, or with a
    /// local error. No reply to the reply is expected.
    pub async fn reply<P: Payload>(
        &self,
        id: MessageId,
        code: Code,
        payload: &P,
    ) -> Result<(), MessagerError> {
        let fields = payload.build()?;
        self.send_unheld(id, code, pack(id, code, &fields)).await
    }

    /// Sends a one-way message that is not a reply to anything, such as
    /// `BYE`. It uses the reserved id so it never matches a held slot.
    pub async fn notify<P: Payload>(&self, code: Code, payload: &P) -> Result<(), MessagerError> {
        let fields = payload.build()?;
        let id = MessageId::RESERVED;
        self.send_unheld(id, code, pack(id, code, &fields)).await
    }

    async fn send_unheld(
        &self,
        id: MessageId,
        code: Code,
        bytes: Vec<u8>,
    ) -> Result<(), MessagerError> {
        if !self.is_writable() {
            return Err(MessagerError::MessageUnwritable);
        }
        let limit = self.max_send_length();
        if bytes.len() > limit {
            return Err(MessagerError::MessageTooLong {
                len: bytes.len(),
                limit,
            });
        }

        let (done_tx, done_rx) = oneshot::channel();
        let outgoing = Outgoing {
            id,
            code,
            bytes,
            delivery: Delivery::Unheld(done_tx),
        };
        self.outbox
            .send(outgoing)
            .await
            .map_err(|_| MessagerError::MessageUnwritable)?;
        done_rx.await.map_err(|_| MessagerError::MessageDropped)?
    }

    /// Closes the connection, which ends [`listen`](Self::listen).
    pub async fn close(&self) {
        if let Err(e) = self.conn.close().await {
            debug!(conn = %self.id(), error = %e, "close failed");
        }
    }

    /// Runs the read loop until the connection ends, dispatching inbound
    /// requests to `responders`.
    ///
    /// Spawns the writer on entry. On exit the connection is closed, the
    /// writer drained, and every held request fails. Returns `Ok(())` on a
    /// clean end-of-stream, and the write error when the writer failed
    /// first.
    pub async fn listen(self: &Arc<Self>, responders: Responders<C>) -> Result<(), MessagerError> {
        let inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or(MessagerError::AlreadyListening)?;

        let writer = tokio::spawn(Arc::clone(self).write_loop(inbox));
        debug!(conn = %self.id(), peer = %self.conn.peer_addr(), "messager listening");

        let result = self.read_loop(&responders).await;

        self.close().await;
        self.shutdown.send_replace(true);
        if let Err(e) = writer.await {
            warn!(conn = %self.id(), error = %e, "writer task failed");
            self.writable.store(false, Ordering::Release);
            self.slots.deinit().await;
        }

        let result = match (result, self.write_error().take()) {
            (Ok(()), Some(e)) => Err(e.into()),
            (result, _) => result,
        };

        match &result {
            Ok(()) => debug!(conn = %self.id(), "messager stopped"),
            Err(e) => debug!(conn = %self.id(), error = %e, "messager stopped with error"),
        }
        result
    }

    async fn read_loop(self: &Arc<Self>, responders: &Responders<C>) -> Result<(), MessagerError> {
        let mut parser = FrameParser::new(self.max_receive_length);
        loop {
            let result = parser.read_frame(&*self.conn).await;
            self.counters.rx.store(parser.received(), Ordering::Relaxed);

            let frame = match result {
                Ok(frame) => frame,
                Err(ProtocolError::EofReached) => return Ok(()),
                Err(ProtocolError::Transport(e)) => {
                    if self.conn.is_closed() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
                Err(ProtocolError::FrameTooLong { id, code, limit }) => {
                    warn!(conn = %self.id(), limit, "discarding oversized message");
                    if let (Some(id), Some(code)) = (id, code) {
                        self.reject_oversized(id, code, limit);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(conn = %self.id(), error = %e, "discarding malformed message");
                    continue;
                }
            };

            self.route(frame, responders).await?;
        }
    }

    /// Fails the request held under `id` when the discarded message was
    /// its reply. Only the first `limit + 1` bytes of it were counted.
    fn reject_oversized(&self, id: MessageId, code: Code, limit: usize) {
        if let Ok(Some(pending)) = self.slots.take_if(id, |p| p.expects.contains(&code)) {
            debug!(conn = %self.id(), %id, %code, "reply over receive limit");
            pending.on_delete(
                DeleteReason::Drop,
                Some(MessagerError::MessageTooLong {
                    len: limit + 1,
                    limit,
                }),
            );
        }
    }

    fn write_error(&self) -> MutexGuard<'_, Option<TransportError>> {
        self.write_error.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn route(
        self: &Arc<Self>,
        frame: Frame,
        responders: &Responders<C>,
    ) -> Result<(), MessagerError> {
        let (id, code) = (frame.id, frame.code);
        let responder = responders.get(code);

        match self.slots.take_if(id, |p| p.expects.contains(&code)) {
            Ok(Some(pending)) => {
                trace!(conn = %self.id(), %id, %code, "reply received");
                pending.resolve(frame);
                return Ok(());
            }
            Ok(None) if responder.is_none() => {
                warn!(conn = %self.id(), %id, %code, "unexpected response");
                let _ = self
                    .slots
                    .drop_message(id, Some(MessagerError::UnexpectedResponse(code)));
                return Ok(());
            }
            _ => {}
        }

        let Some(handler) = responder else {
            debug!(conn = %self.id(), %id, %code, "unsupported request ignored");
            return Ok(());
        };

        trace!(conn = %self.id(), %id, %code, "request received");
        let request = Request {
            id,
            code,
            fields: frame.fields,
        };
        handler.handle(Arc::clone(self), request).await
    }

    async fn write_loop(self: Arc<Self>, mut inbox: mpsc::Receiver<Outgoing>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut written: u64 = 0;

        loop {
            let outgoing = tokio::select! {
                biased;
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.wait_for(|down| *down) => break,
            };

            let mut bytes = outgoing.bytes;
            if inbox.is_empty() {
                pad(&mut bytes, written as usize, END);
            }

            if let Delivery::Held(sent) = &outgoing.delivery {
                sent.store(true, Ordering::Release);
            }

            match self.conn.send(&bytes).await {
                Ok(()) => {
                    written += bytes.len() as u64;
                    self.counters.tx.store(written, Ordering::Relaxed);
                    if let Delivery::Unheld(done) = outgoing.delivery {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(
                        conn = %self.id(),
                        id = %outgoing.id,
                        code = %outgoing.code,
                        error = %e,
                        "write failed"
                    );
                    let failed = || TransportError::ConnectionClosed(format!("write failed: {e}"));
                    match outgoing.delivery {
                        Delivery::Held(_) => {
                            let _ = self.slots.drop_message(outgoing.id, Some(failed().into()));
                        }
                        Delivery::Unheld(done) => {
                            let _ = done.send(Err(failed().into()));
                        }
                    }
                    // A write cut short by our own close is not a failure.
                    if !self.conn.is_closed() {
                        self.write_error().get_or_insert(e);
                    }
                    self.close().await;
                    break;
                }
            }
        }

        self.writable.store(false, Ordering::Release);
        inbox.close();
        while let Ok(outgoing) = inbox.try_recv() {
            match outgoing.delivery {
                Delivery::Held(_) => {
                    let _ = self
                        .slots
                        .drop_message(outgoing.id, Some(MessagerError::MessageDropped));
                }
                Delivery::Unheld(done) => {
                    let _ = done.send(Err(MessagerError::MessageDropped));
                }
            }
        }
        self.slots.deinit().await;
        trace!(conn = %self.id(), "writer stopped");
    }
}
