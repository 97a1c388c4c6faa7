//! Query and body parameter helpers.
//!
//! Handlers read query strings through [`QueryParams`] and JSON bodies through
//! [`JsonBody`] or [`OptionalJsonBody`], so every malformed input surfaces as
//! an [`ApiError::BadRequest`] with a JSON error body.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{ApiError, Result};

/// Media type of JSON request bodies.
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// Parses a boolean query value.
///
/// `1`, `true` and `True` are true; empty, `0` and `false` are false.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] naming the value for anything else.
pub fn parse_bool_param(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "" | "0" | "false" => Ok(false),
        other => Err(ApiError::bad_request(format!(
            "bad parameter value {other:?}: expected 1, true, True, 0, false or empty"
        ))),
    }
}

/// Whether `content_type` names the media type `expected`, ignoring
/// parameters such as `charset` and letter case.
#[must_use]
pub fn matches_content_type(content_type: &str, expected: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    media_type.eq_ignore_ascii_case(expected)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| matches_content_type(value, JSON_MEDIA_TYPE))
}

/// Decoded query string.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(HashMap<String, String>);

impl QueryParams {
    /// Decodes the query string of `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::BadRequest`] for a malformed query string.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        Query::<HashMap<String, String>>::try_from_uri(uri)
            .map(|Query(map)| Self(map))
            .map_err(|e| ApiError::bad_request(e.body_text()))
    }

    /// Raw value of `key`, `None` when absent or empty.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Boolean value of `key`, false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::BadRequest`] for a value [`parse_bool_param`]
    /// rejects.
    pub fn flag(&self, key: &str) -> Result<bool> {
        self.0.get(key).map_or(Ok(false), |v| parse_bool_param(v))
    }

    /// Numeric value of `key`, `None` when absent or empty.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::BadRequest`] when the value is not a number.
    pub fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| {
                    ApiError::bad_request(format!("bad parameter {key}: {value:?} is not a number"))
                })
            })
            .transpose()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for QueryParams {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        Self::from_uri(&parts.uri)
    }
}

/// A JSON request body; the request must declare a JSON content type.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        if !is_json(req.headers()) {
            let given = req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(ApiError::bad_request(format!(
                "Content-Type not supported: {given:?}, expected {JSON_MEDIA_TYPE}"
            )));
        }
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        serde_json::from_slice(&body)
            .map(Self)
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
    }
}

/// A JSON body that may be omitted.
///
/// The body is decoded only when the request declares a JSON content type and
/// the body is not empty.
#[derive(Debug, Clone)]
pub struct OptionalJsonBody<T>(pub Option<T>);

impl<T, S> FromRequest<S> for OptionalJsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        if !is_json(req.headers()) {
            return Ok(Self(None));
        }
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(None));
        }
        serde_json::from_slice(&body)
            .map(|value| Self(Some(value)))
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
    }
}
