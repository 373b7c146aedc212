//! Terminal emulator transport with shell scripts standing in for kermit

#![cfg(unix)]

use labconsole_core::{
    ConnectionState, Connector, ConnectorConfig, EmulatorConfig, ErrorKind, LinkOptions, MemorySink,
};
use std::sync::Arc;
use std::time::Duration;

fn script(body: &str) -> EmulatorConfig {
    EmulatorConfig::new(["/bin/sh", "-c", body])
}

fn connector(config: EmulatorConfig, events: &Arc<MemorySink>) -> Connector {
    Connector::builder(ConnectorConfig::Emulator(config))
        .events(events.clone())
        .options(
            LinkOptions::default()
                .handshake_timeout(Duration::from_secs(5))
                .teardown_grace(Duration::from_millis(300)),
        )
        .build()
}

#[tokio::test]
async fn test_ready_marker_then_echo() {
    let events = Arc::new(MemorySink::new());
    let config = script("echo 'Connecting to /dev/ttyUSB0, speed 115200'; echo '----'; exec cat")
        .ready_marker("----\n");
    let mut connector = connector(config, &events);

    let channel = connector.open().await.unwrap();
    channel.write_all(b"printenv\n").await.unwrap();
    let seen = channel.read_until(b"printenv\n", Duration::from_secs(2)).await.unwrap();
    assert_eq!(seen, b"printenv\n");

    connector.close().await;
    assert_eq!(connector.state(), ConnectionState::Closed);
    assert_eq!(events.names(), vec!["opened", "closed"]);
}

#[tokio::test]
async fn test_settle_without_marker() {
    let events = Arc::new(MemorySink::new());
    let config = script("echo 'C-Kermit 9.0.302'; exec cat").settle(Duration::from_millis(100));
    let mut connector = connector(config, &events);

    let channel = connector.open().await.unwrap();
    channel.write_all(b"x").await.unwrap();
    let seen = channel.read_until(b"x", Duration::from_secs(2)).await.unwrap();
    assert!(seen.ends_with(b"x"));
    connector.close().await;
}

#[tokio::test]
async fn test_locked_line_is_device_busy() {
    let events = Arc::new(MemorySink::new());
    let config = script("echo '/dev/ttyUSB0 is Locked by pid 4242'; sleep 10").ready_marker("----");
    let mut connector = connector(config, &events);

    let started = std::time::Instant::now();
    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    assert!(err.to_string().contains("4242"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(connector.state(), ConnectionState::Failed);

    connector.close().await;
    assert_eq!(events.names(), vec!["failed", "closed"]);
}

#[tokio::test]
async fn test_missing_marker_times_out() {
    let events = Arc::new(MemorySink::new());
    let config = script("echo 'dialing'; sleep 10").ready_marker("Connected");
    let mut connector = Connector::builder(ConnectorConfig::Emulator(config))
        .events(events.clone())
        .options(LinkOptions::default().handshake_timeout(Duration::from_millis(200)))
        .build();

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
}

#[tokio::test]
async fn test_early_exit_is_io_fault() {
    let events = Arc::new(MemorySink::new());
    let config = script("echo 'cannot open line'; exit 1").ready_marker("Connected");
    let mut connector = connector(config, &events);

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFault);
}

#[tokio::test]
async fn test_missing_program_then_close() {
    let events = Arc::new(MemorySink::new());
    let config = EmulatorConfig::new(["/nonexistent/kermit"]).ready_marker("Connected");
    let mut connector = connector(config, &events);

    let err = connector.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFault);

    connector.close().await;
    assert_eq!(connector.state(), ConnectionState::Closed);
    assert_eq!(events.names(), vec!["failed", "closed"]);
}

#[tokio::test]
async fn test_graceful_exit_through_prompt() {
    // answers the escape with a prompt and quits on "exit"
    let body = r#"
        echo Connected
        while IFS= read -r line; do
            case "$line" in
                *C) printf 'C-Kermit>' ;;
                exit) echo bye >&2; exit 0 ;;
            esac
        done
    "#;
    let mut config = script(body).ready_marker("Connected\n");
    config.escape_sequence = "\u{1c}C\n".to_string();
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(config, &events);

    connector.open().await.unwrap();
    let started = std::time::Instant::now();
    connector.close().await;

    assert_eq!(connector.state(), ConnectionState::Closed);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_stubborn_emulator_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("pid");
    let body = format!(
        "trap '' TERM HUP; echo $$ > {}; echo Connected; while true; do sleep 1; done",
        pidfile.display()
    );
    let events = Arc::new(MemorySink::new());
    let mut connector = connector(script(&body).ready_marker("Connected\n"), &events);

    connector.open().await.unwrap();
    let pid = std::fs::read_to_string(&pidfile).unwrap().trim().to_string();
    connector.close().await;

    let alive = std::process::Command::new("/bin/sh")
        .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "emulator {pid} survived close");
}
