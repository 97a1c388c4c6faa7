//! Version, info and event stream handlers.

use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use berth_common::constants::{API_VERSION, DAEMON_VERSION, DEFAULT_LISTENER_BUFFER};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Result;
use crate::params::{JSON_MEDIA_TYPE, QueryParams};
use crate::router::AppState;
use crate::types::{InfoResponse, VersionResponse};

/// `GET /version`.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: DAEMON_VERSION.to_string(),
        api_version: API_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        git_commit: option_env!("BERTH_GIT_COMMIT").map(str::to_string),
    })
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(Path::new(path))
        .ok()
        .map(|s| s.trim().to_string())
}

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").map_or(0, Iterator::count)
}

/// `GET /info`.
pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let counters = state.engine.info();
    Json(InfoResponse {
        debug: state.debug,
        containers: counters.containers,
        images: counters.images,
        n_fd: open_fds(),
        n_goroutines: tokio::runtime::Handle::current().metrics().num_alive_tasks(),
        n_events_listener: counters.event_listeners,
        kernel_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        ipv4_forwarding: read_trimmed("/proc/sys/net/ipv4/ip_forward").as_deref() == Some("1"),
    })
}

/// `GET /events?since=<unix-seconds>`.
///
/// Streams newline-terminated JSON events until the client disconnects. A
/// positive `since` replays the buffered events stamped at or after it first.
///
/// # Errors
///
/// Returns a bad request for a non-numeric `since`.
pub async fn events(State(state): State<AppState>, query: QueryParams) -> Result<Response> {
    let since = query.number::<i64>("since")?.filter(|since| *since > 0);
    let (tx, rx) = mpsc::channel(DEFAULT_LISTENER_BUFFER);
    let bus = Arc::clone(state.engine.events());
    let disconnected = tx.clone();
    let _ = tokio::spawn(async move {
        bus.stream_since(since, tx, async move { disconnected.closed().await })
            .await;
    });

    let lines = ReceiverStream::new(rx).map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });
    Ok(([(CONTENT_TYPE, JSON_MEDIA_TYPE)], Body::from_stream(lines)).into_response())
}
