//! `POST /containers/{name}/attach`.
//!
//! Without `stream` the response is a plain 200 carrying the logged output
//! when `logs` is set. With `stream` the connection is hijacked: the handler
//! answers `101 Switching Protocols` and, once hyper hands the connection
//! over, replays the logs and bridges it to the container with an
//! [`AttachSession`](berth_runtime::attach::AttachSession).

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use berth_common::constants::MULTIPLEXED_STREAMS_VERSION;
use berth_runtime::attach::{AttachOptions, buffered_output};
use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;

use crate::error::{ApiError, Result};
use crate::params::QueryParams;
use crate::router::AppState;
use crate::version::RequestedVersion;

/// Media type of an unframed attach stream.
pub const RAW_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.raw-stream";

/// Media type of a multiplexed attach stream.
pub const MULTIPLEXED_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.multiplexed-stream";

/// Attaches to a container's streams.
///
/// # Errors
///
/// Returns not-found for unknown containers, a bad request for malformed
/// flags, a conflict when stdin was already consumed by a `StdinOnce`
/// session, and a transport error when `stream` is requested on a connection
/// that cannot be upgraded.
pub async fn attach(
    State(state): State<AppState>,
    Path(name): Path<String>,
    RequestedVersion(version): RequestedVersion,
    query: QueryParams,
    mut req: Request,
) -> Result<Response> {
    let container = state.engine.get(&name)?;
    let logs = query.flag("logs")?;
    let stream = query.flag("stream")?;
    let options = AttachOptions {
        stdin: query.flag("stdin")?,
        stdout: query.flag("stdout")?,
        stderr: query.flag("stderr")?,
        multiplex: version >= MULTIPLEXED_STREAMS_VERSION && !container.config.tty,
    };
    let media_type = if options.multiplex {
        MULTIPLEXED_STREAM_MEDIA_TYPE
    } else {
        RAW_STREAM_MEDIA_TYPE
    };

    // Refused before the container is touched.
    let on_upgrade = if stream {
        Some(
            req.extensions_mut()
                .remove::<OnUpgrade>()
                .ok_or_else(|| ApiError::Transport("connection does not support upgrades".into()))?,
        )
    } else {
        None
    };

    let backlog = if logs {
        buffered_output(&state.engine.logs(&container).await?, options)
    } else {
        Bytes::new()
    };

    let Some(on_upgrade) = on_upgrade else {
        return Ok(([(CONTENT_TYPE, media_type)], Body::from(backlog)).into_response());
    };

    // Subscribe before responding; output produced during the upgrade is kept.
    let session = container.attach(options)?;
    let id = container.id.clone();
    let _ = tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "attach upgrade failed");
                return;
            }
        };
        let mut conn = TokioIo::new(upgraded);
        if !backlog.is_empty() {
            if let Err(e) = conn.write_all(&backlog).await {
                tracing::debug!(id = %id, error = %e, "attach log replay failed");
                return;
            }
        }
        session.run(conn).await;
    });

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    let _ = headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    let _ = headers.insert(UPGRADE, HeaderValue::from_static("tcp"));
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type));
    Ok(response)
}
