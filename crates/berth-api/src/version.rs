//! API version negotiation.
//!
//! A request path may start with `/v<major>.<minor>`. The prefix is stripped
//! before routing and the parsed version travels in the request extensions;
//! without a prefix the request is served at [`API_VERSION`].

use std::convert::Infallible;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::Uri;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use berth_common::constants::{API_VERSION, MIN_API_VERSION};
use berth_common::types::ApiVersion;

use crate::error::{ApiError, Result};

/// API version a request was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedVersion(pub ApiVersion);

impl<S: Send + Sync> FromRequestParts<S> for RequestedVersion {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Infallible> {
        Ok(parts
            .extensions
            .get::<Self>()
            .copied()
            .unwrap_or(Self(API_VERSION)))
    }
}

/// Splits a `/v<major>.<minor>` prefix off `path`.
///
/// Returns the requested version and, when a prefix was present, the path
/// without it. A first segment that is not `v` followed by digits and dots is
/// not a version prefix.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] for a prefix that does not parse.
pub fn split_version(path: &str) -> Result<(ApiVersion, Option<String>)> {
    let Some(rest) = path.strip_prefix("/v") else {
        return Ok((API_VERSION, None));
    };
    let (segment, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Ok((API_VERSION, None));
    }
    let version: ApiVersion = segment.parse()?;
    Ok((version, Some(format!("/{tail}"))))
}

fn rewrite_path(uri: &Uri, path: &str) -> Result<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ApiError::bad_request(format!("invalid path: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| ApiError::bad_request(format!("invalid path: {e}")))
}

/// Middleware that strips the version prefix and rejects unsupported
/// versions before routing.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] for a malformed prefix or a version
/// outside `MIN_API_VERSION..=API_VERSION`.
pub async fn negotiate_version(mut req: Request, next: Next) -> Result<Response> {
    let (version, stripped) = split_version(req.uri().path())?;
    if version > API_VERSION {
        return Err(ApiError::bad_request(format!(
            "client and server don't have same version (client : {version}, server: {API_VERSION})"
        )));
    }
    if version < MIN_API_VERSION {
        return Err(ApiError::bad_request(format!(
            "client version {version} is too old, minimum supported API version is {MIN_API_VERSION}"
        )));
    }
    if let Some(path) = stripped {
        *req.uri_mut() = rewrite_path(req.uri(), &path)?;
    }
    tracing::debug!(method = %req.method(), path = %req.uri().path(), %version, "calling");
    let _ = req.extensions_mut().insert(RequestedVersion(version));
    Ok(next.run(req).await)
}

/// Route middleware rejecting requests older than the route's minimum.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] when the requested version is below
/// `minimum`.
pub async fn require_version(
    State(minimum): State<ApiVersion>,
    RequestedVersion(version): RequestedVersion,
    req: Request,
    next: Next,
) -> Result<Response> {
    if version < minimum {
        return Err(ApiError::bad_request(format!(
            "client version {version} is too old for {}, minimum is {minimum}",
            req.uri().path()
        )));
    }
    Ok(next.run(req).await)
}
