//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on an OS-assigned port and dial it,
//! verifying bytes flow both ways and that deadlines and close behave.

#[cfg(feature = "tcp")]
mod tcp {
    use std::net::SocketAddr;
    use std::time::Duration;

    use trapsync_transport::{Connection, TcpTransport, Transport, TransportError, dial};

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_accept_and_send_receive() {
        let mut transport = TcpTransport::bind(any_port()).await.expect("should bind");
        let addr = transport.local_addr().unwrap();

        let server = tokio::spawn(async move { transport.accept().await.expect("accept") });
        let client = dial(addr, Duration::from_secs(2)).await.expect("dial");
        let server_conn = server.await.unwrap();

        // The two ends must agree on each other's addresses.
        assert_eq!(client.peer_addr(), addr);
        assert_eq!(server_conn.peer_addr(), client.local_addr());
        assert_ne!(client.id(), server_conn.id());

        client.send(b"ping").await.unwrap();
        let got = server_conn.recv(256).await.unwrap().unwrap();
        assert_eq!(got, b"ping");

        server_conn.send(b"pong").await.unwrap();
        let got = client.recv(256).await.unwrap().unwrap();
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn test_tcp_close_gives_peer_eof() {
        let mut transport = TcpTransport::bind(any_port()).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let server = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = dial(addr, Duration::from_secs(2)).await.unwrap();
        let server_conn = server.await.unwrap();

        client.close().await.unwrap();

        let got = server_conn.recv(256).await.unwrap();
        assert!(got.is_none(), "peer should observe end of stream");
    }

    #[tokio::test]
    async fn test_dial_sets_initial_deadline() {
        let mut transport = TcpTransport::bind(any_port()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        let server = tokio::spawn(async move { transport.accept().await.unwrap() });

        let client = dial(addr, Duration::from_millis(300)).await.unwrap();
        let _server_conn = server.await.unwrap();

        assert_eq!(client.timeout(), Duration::from_millis(300));
        // Nothing is ever sent, so the read deadline trips.
        let err = client.recv(16).await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_returns_dial_failed() {
        // Bind then drop to get a port that is very likely closed.
        let transport = TcpTransport::bind(any_port()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        drop(transport);

        let Err(err) = dial(addr, Duration::from_secs(2)).await else {
            panic!("dialing a closed port must fail");
        };
        assert!(matches!(
            err,
            TransportError::DialFailed { .. } | TransportError::TimedOut(_)
        ));
    }
}
