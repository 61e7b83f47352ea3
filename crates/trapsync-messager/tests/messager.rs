//! End-to-end request/reply tests over an in-memory connection pair.
//!
//! Each test wires two messagers back to back, gives the "server" side a
//! responder table, and drives queries from the "client" side.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncWrite, DuplexStream, ReadHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use trapsync_messager::{
    DeleteReason, Messager, MessagerConfig, MessagerError, Occupant, ReplyFlag, Request,
    Responders, SlotTable,
};
use trapsync_protocol::{Code, Empty, HelloConflict, MessageId, Payload, PeerSet, ProtocolError};
use trapsync_transport::{MemoryConnection, StreamConnection, TransportError, memory_pair};

type Conn = MemoryConnection;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Echoes the request fields back unchanged.
struct Echo(Vec<Vec<u8>>);

impl Payload for Echo {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(self.0.clone())
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        Ok(Echo(fields.to_vec()))
    }
}

fn pair_with(config: MessagerConfig) -> (Arc<Messager<Conn>>, Arc<Messager<Conn>>) {
    let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
    let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
    let (left, right) = memory_pair(a, b);
    (
        Messager::new(Arc::new(left), config),
        Messager::new(Arc::new(right), config),
    )
}

fn pair() -> (Arc<Messager<Conn>>, Arc<Messager<Conn>>) {
    pair_with(MessagerConfig::default())
}

fn start(messager: &Arc<Messager<Conn>>, responders: Responders<Conn>) -> tokio::task::JoinHandle<Result<(), MessagerError>> {
    let messager = Arc::clone(messager);
    tokio::spawn(async move { messager.listen(responders).await })
}

fn echo_server() -> Responders<Conn> {
    let mut responders = Responders::new();
    responders.on(Code::Hello, |m: Arc<Messager<Conn>>, req: Request| async move {
        m.reply(req.id, Code::HelloAccept, &Echo(req.fields)).await
    });
    responders
}

#[tokio::test]
async fn test_query_returns_matching_reply() {
    let (client, server) = pair();
    start(&client, Responders::new());
    start(&server, echo_server());

    let reply = client
        .query(Code::Hello, &Echo(vec![b"ping".to_vec()]), &[Code::HelloAccept], 4096, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(reply.code, Code::HelloAccept);
    assert_eq!(reply.fields, vec![b"ping".to_vec()]);
}

#[tokio::test]
async fn test_query_concurrent_replies_route_to_their_callers() {
    let (client, server) = pair();
    start(&client, Responders::new());
    start(&server, echo_server());

    let queries = (0..100u32).map(|i| {
        let client = Arc::clone(&client);
        async move {
            let payload = Echo(vec![i.to_le_bytes().to_vec()]);
            let reply = client
                .query(Code::Hello, &payload, &[Code::HelloAccept], 4096, TIMEOUT)
                .await
                .unwrap();
            (i, reply.fields)
        }
    });

    for (i, fields) in join_all(queries).await {
        assert_eq!(fields, vec![i.to_le_bytes().to_vec()]);
    }
}

#[tokio::test]
async fn test_query_pads_stream_to_chunk_boundary() {
    let (client, server) = pair();
    start(&client, Responders::new());
    start(&server, echo_server());

    client
        .query(Code::Hello, &Echo(vec![b"x".to_vec()]), &[Code::HelloAccept], 4096, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(client.stats().tx % 256, 0);
    assert!(client.stats().tx > 0);
    assert_eq!(server.stats().tx % 256, 0);
}

#[tokio::test]
async fn test_query_without_responder_expires() {
    let (client, server) = pair();
    start(&client, Responders::new());
    start(&server, Responders::new());

    let err = client
        .query(Code::Hello, &Empty, &[Code::HelloAccept], 4096, Duration::from_millis(150))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagerError::MessageExpired));
}

#[tokio::test]
async fn test_query_unexpected_reply_code_fails() {
    let (client, server) = pair();
    start(&client, Responders::new());
    let mut responders = Responders::new();
    responders.on(Code::Hello, |m: Arc<Messager<Conn>>, req: Request| async move {
        m.reply(req.id, Code::ClientMarkDenied, &Empty).await
    });
    start(&server, responders);

    let err = client
        .query(Code::Hello, &Empty, &[Code::HelloAccept, Code::HelloDenied], 4096, TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, MessagerError::UnexpectedResponse(Code::ClientMarkDenied)));
}

#[tokio::test]
async fn test_query_oversized_request_is_not_sent() {
    let (client, server) = pair_with(MessagerConfig {
        max_receive_length: 4096,
        max_send_length: 256,
    });
    start(&client, Responders::new());
    start(&server, echo_server());

    let err = client
        .query(Code::Hello, &Echo(vec![vec![b'a'; 1000]]), &[Code::HelloAccept], 4096, TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, MessagerError::MessageTooLong { limit: 256, .. }));
    assert_eq!(client.stats().tx, 0);
}

#[tokio::test]
async fn test_query_reply_over_limit_fails() {
    let (client, server) = pair();
    start(&client, Responders::new());

    let big: PeerSet = (1..=20u16)
        .map(|p| SocketAddr::from(([10, 0, 0, 1], p)))
        .collect();
    let mut responders = Responders::new();
    responders.on(Code::Hello, move |m: Arc<Messager<Conn>>, req: Request| {
        let partners = big.clone();
        async move {
            m.reply(req.id, Code::HelloConflict, &HelloConflict { partners }).await
        }
    });
    start(&server, responders);

    let err = client
        .query(Code::Hello, &Empty, &[Code::HelloConflict], 64, TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, MessagerError::MessageTooLong { limit: 64, .. }));
}

#[tokio::test]
async fn test_listen_end_clears_pending_queries() {
    let (client, server) = pair();
    let listening = start(&client, Responders::new());

    let query = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .query(Code::Hello, &Empty, &[Code::HelloAccept], 4096, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The far end goes away without answering.
    server.close().await;

    let err = query.await.unwrap().unwrap_err();
    assert!(matches!(err, MessagerError::MessageCleared));
    assert!(listening.await.unwrap().is_ok());
    assert!(!client.is_writable());

    let err = client.notify(Code::Bye, &Empty).await.unwrap_err();
    assert!(matches!(err, MessagerError::MessageUnwritable));
}

#[tokio::test]
async fn test_listen_twice_returns_already_listening() {
    let (client, _server) = pair();
    start(&client, Responders::new());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = client.listen(Responders::new()).await.unwrap_err();

    assert!(matches!(err, MessagerError::AlreadyListening));
}

#[tokio::test]
async fn test_handler_error_closes_connection() {
    let (client, server) = pair();
    let client_done = start(&client, Responders::new());
    let mut responders = Responders::new();
    responders.on(Code::ClientMark, |_m: Arc<Messager<Conn>>, req: Request| async move {
        req.parse::<trapsync_protocol::ClientMark>().map(|_| ())
    });
    let server_done = start(&server, responders);

    client.notify(Code::ClientMark, &Echo(vec![b"junk".to_vec()])).await.unwrap();

    let result = server_done.await.unwrap();
    assert!(matches!(result, Err(MessagerError::Protocol(_))));
    assert!(client_done.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_query_reply_over_receive_limit_fails_without_waiting() {
    let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
    let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
    let (left, right) = memory_pair(a, b);
    let client = Messager::new(
        Arc::new(left),
        MessagerConfig {
            max_receive_length: 256,
            max_send_length: 4096,
        },
    );
    let server = Messager::new(Arc::new(right), MessagerConfig::default());
    start(&client, Responders::new());

    let mut responders = Responders::new();
    responders.on(Code::Hello, |m: Arc<Messager<Conn>>, req: Request| async move {
        let size = if req.fields.is_empty() { 1000 } else { 4 };
        m.reply(req.id, Code::HelloAccept, &Echo(vec![vec![b'r'; size]])).await
    });
    start(&server, responders);

    let started = Instant::now();
    let err = client
        .query(Code::Hello, &Empty, &[Code::HelloAccept], 4096, Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagerError::MessageTooLong { limit: 256, .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The oversized reply is skipped and the connection keeps working.
    let reply = client
        .query(Code::Hello, &Echo(vec![b"small".to_vec()]), &[Code::HelloAccept], 4096, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply.fields, vec![vec![b'r'; 4]]);
}

#[tokio::test]
async fn test_query_flagged_raises_flag_before_next_request_is_handled() {
    let (client, server) = pair();
    let flag = Arc::new(AtomicBool::new(false));

    // Records whether the flag was already up when the server's follow-up
    // request reached the client.
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let mut client_responders = Responders::new();
    let observed = Arc::clone(&flag);
    client_responders.on(Code::ClientMark, move |m: Arc<Messager<Conn>>, req: Request| {
        let _ = seen_tx.send(observed.load(Ordering::Acquire));
        async move { m.reply(req.id, Code::ClientMarkAccept, &Empty).await }
    });
    start(&client, client_responders);

    let mut responders = Responders::new();
    responders.on(Code::Hello, |m: Arc<Messager<Conn>>, req: Request| async move {
        m.reply(req.id, Code::HelloAccept, &Empty).await?;
        let pusher = Arc::clone(&m);
        tokio::spawn(async move {
            pusher
                .query(Code::ClientMark, &Empty, &[Code::ClientMarkAccept], 4096, TIMEOUT)
                .await
        });
        Ok(())
    });
    start(&server, responders);

    let flagged = ReplyFlag::new(Code::HelloAccept, Arc::clone(&flag));
    client
        .query_flagged(Code::Hello, &Empty, &[Code::HelloAccept], 4096, TIMEOUT, flagged)
        .await
        .unwrap();

    assert_eq!(seen_rx.recv().await, Some(true));
}

#[tokio::test]
async fn test_query_flagged_leaves_flag_down_on_other_code() {
    let (client, server) = pair();
    start(&client, Responders::new());
    let mut responders = Responders::new();
    responders.on(Code::Hello, |m: Arc<Messager<Conn>>, req: Request| async move {
        m.reply(req.id, Code::HelloDenied, &Empty).await
    });
    start(&server, responders);

    let flag = Arc::new(AtomicBool::new(false));
    let flagged = ReplyFlag::new(Code::HelloAccept, Arc::clone(&flag));
    let reply = client
        .query_flagged(
            Code::Hello,
            &Empty,
            &[Code::HelloAccept, Code::HelloDenied],
            4096,
            TIMEOUT,
            flagged,
        )
        .await
        .unwrap();

    assert_eq!(reply.code, Code::HelloDenied);
    assert!(!flag.load(Ordering::Acquire));
}

// ---------------------------------------------------------------------------
// Write failures
// ---------------------------------------------------------------------------

/// A writer whose every write fails.
struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type BrokenConn = StreamConnection<ReadHalf<DuplexStream>, BrokenPipe>;

#[tokio::test]
async fn test_listen_after_write_failure_returns_error() {
    let (near, _far) = tokio::io::duplex(1024);
    let (reader, _unused) = tokio::io::split(near);
    let conn: BrokenConn = StreamConnection::new(
        reader,
        BrokenPipe,
        "10.0.0.1:1000".parse().unwrap(),
        "10.0.0.2:2000".parse().unwrap(),
    );
    let messager = Messager::new(Arc::new(conn), MessagerConfig::default());
    let listening = {
        let messager = Arc::clone(&messager);
        tokio::spawn(async move { messager.listen(Responders::new()).await })
    };

    let err = messager.notify(Code::Bye, &Empty).await.unwrap_err();
    assert!(matches!(err, MessagerError::Transport(_)));

    let result = listening.await.unwrap();
    assert!(matches!(
        result,
        Err(MessagerError::Transport(TransportError::SendFailed(_)))
    ));
    assert!(!messager.is_writable());
}

#[tokio::test]
async fn test_listen_after_local_close_is_clean() {
    let (client, _server) = pair();
    let listening = start(&client, Responders::new());
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.close().await;

    assert!(listening.await.unwrap().is_ok());
}

// ---------------------------------------------------------------------------
// Slot exhaustion
// ---------------------------------------------------------------------------

/// Slot occupant that reports how it left.
struct Held(mpsc::UnboundedSender<DeleteReason>);

impl Occupant for Held {
    fn on_delete(self, reason: DeleteReason, _err: Option<MessagerError>) {
        let _ = self.0.send(reason);
    }
}

const HOLD_EXPIRY: Duration = Duration::from_secs(2);

async fn exhausted_table(tx: &mpsc::UnboundedSender<DeleteReason>) -> Arc<SlotTable<Held>> {
    let table = SlotTable::new();
    for _ in 0..255 {
        table.hold(Held(tx.clone()), HOLD_EXPIRY).await.unwrap();
    }
    assert_eq!(table.free(), 0);
    table
}

#[tokio::test(start_paused = true)]
async fn test_hold_when_exhausted_blocks_until_take() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let table = exhausted_table(&tx).await;
    let started = Instant::now();

    let waiter = {
        let table = Arc::clone(&table);
        let tx = tx.clone();
        tokio::spawn(async move { table.hold(Held(tx), HOLD_EXPIRY).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!waiter.is_finished(), "the 256th hold must block");

    table.take(MessageId(0)).unwrap();

    let id = waiter.await.unwrap().unwrap();
    assert_eq!(id, MessageId(0));
    assert!(started.elapsed() < HOLD_EXPIRY);
    assert_eq!(table.remains(), 255);
}

#[tokio::test(start_paused = true)]
async fn test_hold_when_exhausted_unblocks_on_expiry() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let table = exhausted_table(&tx).await;
    let started = Instant::now();

    let waiter = {
        let table = Arc::clone(&table);
        let tx = tx.clone();
        tokio::spawn(async move { table.hold(Held(tx), HOLD_EXPIRY).await })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!waiter.is_finished(), "the 256th hold must block");

    let id = waiter.await.unwrap().unwrap();

    assert_eq!(id, MessageId(0));
    let waited = started.elapsed();
    assert!(waited >= HOLD_EXPIRY, "unblocked after {waited:?}");
    assert!(waited < HOLD_EXPIRY + Duration::from_secs(1), "unblocked after {waited:?}");
    assert_eq!(rx.recv().await, Some(DeleteReason::Expire));
}
