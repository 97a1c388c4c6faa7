//! CORS headers and `OPTIONS` short-circuit.

use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "GET, POST, DELETE, PUT, OPTIONS";
const ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept";

fn write_headers(headers: &mut HeaderMap) {
    let _ = headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(ALLOW_ORIGIN));
    let _ = headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
    let _ = headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
}

/// Answers every `OPTIONS` request with an empty 200 and, when `enabled`,
/// adds the CORS headers to every response.
pub async fn cors(State(enabled): State<bool>, req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        tracing::debug!(path = %req.uri().path(), "options request");
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    if enabled {
        write_headers(response.headers_mut());
    }
    response
}
