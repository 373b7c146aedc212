//! Multiplexer line protocol against a local TCP server

use labconsole_core::{
    ConnectionState, Connector, ConnectorConfig, ErrorKind, ExclusivityArbiter, LifecycleEvent, LinkOptions,
    MemorySink, MultiplexerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Accept one client, check its control line, answer with `reply`
async fn serve_once(reply: &'static str) -> (u16, tokio::task::JoinHandle<(String, BufReader<TcpStream>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut request = String::new();
        socket.read_line(&mut request).await.unwrap();
        socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
        (request, socket)
    });
    (port, server)
}

fn connector(port: u16, force: bool, events: &Arc<MemorySink>) -> Connector {
    let config = MultiplexerConfig::new(&format!("127.0.0.1:{port}"), "board3").force_takeover(force);
    Connector::builder(ConnectorConfig::Multiplexer(config))
        .arbiter(ExclusivityArbiter::shared())
        .events(events.clone())
        .options(
            LinkOptions::default()
                .holder("ci-runner")
                .handshake_timeout(Duration::from_secs(2))
                .teardown_grace(Duration::from_millis(500)),
        )
        .build()
}

#[tokio::test]
async fn test_attach_keeps_bytes_sent_with_reply() {
    let (port, server) = serve_once("ok\r\nU-Boot> ").await;
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(port, false, &events);

    let channel = connector.open().await.unwrap();
    let seen = channel.read_until(b"U-Boot> ", Duration::from_secs(2)).await.unwrap();
    assert_eq!(seen, b"U-Boot> ");

    let (request, mut socket) = server.await.unwrap();
    assert_eq!(request.trim_end(), "attach board3 ci-runner");

    channel.write_all(b"version\n").await.unwrap();
    let mut line = String::new();
    socket.read_line(&mut line).await.unwrap();
    assert_eq!(line, "version\n");

    connector.close().await;
    let mut rest = Vec::new();
    socket.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"\x05c.");
    assert_eq!(events.names(), vec!["opened", "closed"]);
}

#[tokio::test]
async fn test_busy_reply_is_device_busy() {
    let (port, server) = serve_once("busy alice\n").await;
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(port, false, &events);

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("alice"));
    assert_eq!(connector.state(), ConnectionState::Failed);
    server.await.unwrap();
}

#[tokio::test]
async fn test_preempted_reply_reports_previous_holder() {
    let (port, server) = serve_once("preempted alice\n").await;
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(port, true, &events);

    connector.open().await.unwrap();
    let (request, _socket) = server.await.unwrap();
    assert_eq!(request.trim_end(), "force-attach board3 ci-runner");
    assert_eq!(
        events.events()[0].event,
        LifecycleEvent::ForcedTakeover {
            previous_holder: "alice".to_string()
        }
    );
    connector.close().await;
}

#[tokio::test]
async fn test_error_reply_is_io_fault() {
    let (port, server) = serve_once("error no such console\n").await;
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(port, false, &events);

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFault);
    assert!(err.to_string().contains("no such console"), "{err}");
    server.await.unwrap();
}

#[tokio::test]
async fn test_silent_service_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // hold the connection open without answering
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let events = Arc::new(MemorySink::new());
    let config = MultiplexerConfig::new(&format!("127.0.0.1:{port}"), "board3");
    let mut connector = Connector::builder(ConnectorConfig::Multiplexer(config))
        .events(events.clone())
        .options(LinkOptions::default().handshake_timeout(Duration::from_millis(100)))
        .build();

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
    assert_eq!(events.names(), vec!["failed"]);
    server.abort();
}

#[tokio::test]
async fn test_refused_connection_is_io_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let events = Arc::new(MemorySink::new());
    let mut connector = connector(port, false, &events);
    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFault);

    connector.close().await;
    assert_eq!(connector.state(), ConnectionState::Closed);
}
