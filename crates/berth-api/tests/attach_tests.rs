//! Attach hijacking over a real TCP connection.
//!
//! The server runs the full accept loop with upgrades enabled; the client
//! speaks raw HTTP/1.1 so the hijacked byte stream can be read directly.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use berth_api::server::{Listener, serve};
use berth_api::{RouterOptions, create_router};
use berth_common::config::DaemonConfig;
use berth_common::types::ContainerConfig;
use berth_runtime::engine::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Daemon {
    _dir: tempfile::TempDir,
    engine: Arc<Engine>,
    addr: std::net::SocketAddr,
}

async fn daemon() -> Daemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(Engine::new(&DaemonConfig::with_data_dir(dir.path())));
    let _ = engine
        .create_image("base", "latest", None)
        .await
        .expect("base image");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = create_router(Arc::clone(&engine), RouterOptions::default());
    let _ = tokio::spawn(serve(Listener::Tcp(listener), app, std::future::pending()));
    Daemon {
        _dir: dir,
        engine,
        addr,
    }
}

async fn running_cat(engine: &Engine, stdin_once: bool) -> String {
    let config = ContainerConfig {
        image: "base".into(),
        cmd: vec!["cat".into()],
        open_stdin: true,
        stdin_once,
        ..ContainerConfig::default()
    };
    let (container, _) = engine.create(config, None).await.expect("create");
    engine.start(container.id.as_str(), None).await.expect("start");
    container.id.to_string()
}

/// Sends an upgrade request and returns the connection positioned right
/// after the response head, plus the head itself.
async fn hijack(addr: std::net::SocketAddr, path: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Length: 0\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.expect("request");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut byte))
            .await
            .expect("response head")
            .expect("read");
        assert_eq!(n, 1, "connection closed before response head");
        head.push(byte[0]);
    }
    (stream, String::from_utf8(head).expect("utf-8 head"))
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let _ = tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read in time")
        .expect("read");
    buf
}

// ── Hijack ───────────────────────────────────────────────────────────

#[tokio::test]
async fn multiplexed_echo_and_half_close_keeps_container_running() {
    let d = daemon().await;
    let id = running_cat(&d.engine, false).await;

    let (mut stream, head) = hijack(
        d.addr,
        &format!("/v1.6/containers/{id}/attach?stream=1&stdin=1&stdout=1&stderr=1"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_lowercase().contains("application/vnd.docker.multiplexed-stream"));

    stream.write_all(b"hello\n").await.expect("write");
    let frame = read_exact(&mut stream, 14).await;
    assert_eq!(&frame[..8], &[1, 0, 0, 0, 0, 0, 0, 6]);
    assert_eq!(&frame[8..], b"hello\n");

    stream.shutdown().await.expect("half-close");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let container = d.engine.get(&id).expect("container");
    assert!(container.state.is_running());

    d.engine.kill(&id).await.expect("kill");
    assert_eq!(d.engine.wait(&id).await.expect("wait"), 137);
}

#[tokio::test]
async fn raw_stream_for_older_clients() {
    let d = daemon().await;
    let id = running_cat(&d.engine, false).await;

    let (mut stream, head) = hijack(
        d.addr,
        &format!("/v1.5/containers/{id}/attach?stream=1&stdin=1&stdout=1"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_lowercase().contains("application/vnd.docker.raw-stream"));

    stream.write_all(b"ping\n").await.expect("write");
    assert_eq!(read_exact(&mut stream, 5).await, b"ping\n");

    d.engine.kill(&id).await.expect("kill");
}

#[tokio::test]
async fn stdin_once_closes_container_stdin_on_disconnect() {
    let d = daemon().await;
    let id = running_cat(&d.engine, true).await;

    let (mut stream, head) = hijack(
        d.addr,
        &format!("/containers/{id}/attach?stream=1&stdin=1&stdout=1"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    stream.write_all(b"bye\n").await.expect("write");
    stream.shutdown().await.expect("half-close");

    // cat sees EOF, echoes what it has and exits; the session then closes.
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("session ends")
        .expect("read");
    assert_eq!(&rest[..8], &[1, 0, 0, 0, 0, 0, 0, 4]);
    assert_eq!(&rest[8..], b"bye\n");
    assert_eq!(d.engine.wait(&id).await.expect("wait"), 0);

    let (_stream, head) = hijack(
        d.addr,
        &format!("/containers/{id}/attach?stream=1&stdin=1&stdout=1"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
}

#[tokio::test]
async fn attach_to_unknown_container_is_not_found() {
    let d = daemon().await;
    let (_stream, head) = hijack(d.addr, "/containers/nope/attach?stream=1&stdout=1").await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");
}
