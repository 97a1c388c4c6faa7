//! Image handlers.
//!
//! Image names may contain `/`, so everything under `/images/` other than the
//! fixed `json` and `viz` endpoints arrives as one wildcard path and is
//! dispatched on its suffix.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use berth_common::error::BerthError;
use berth_common::types::ContainerConfig;
use berth_runtime::engine::{CommitOptions, ImageDelete};

use crate::error::{ApiError, Result};
use crate::params::{OptionalJsonBody, QueryParams};
use crate::router::AppState;
use crate::types::{DeleteEntry, HistoryEntry, IdResponse, ImageInspect, ImageSummary, signed_size};

/// Repository and tag shown for untagged images.
const NONE: &str = "<none>";

fn unknown_route(path: &str) -> ApiError {
    ApiError::Berth(BerthError::NotFound {
        kind: "route",
        id: format!("/images/{path}"),
    })
}

/// `GET /images/json?all&filter`.
///
/// # Errors
///
/// Returns a bad request for a malformed `all`.
pub async fn list(
    State(state): State<AppState>,
    query: QueryParams,
) -> Result<Json<Vec<ImageSummary>>> {
    let all = query.flag("all")?;
    let filter = query.get("filter").unwrap_or_default();
    let rows = state
        .engine
        .images(all, filter)?
        .into_iter()
        .map(|row| {
            let (repository, tag) = row.reference.map_or_else(
                || (NONE.to_string(), NONE.to_string()),
                |reference| (reference.repository, reference.tag),
            );
            ImageSummary {
                repository,
                tag,
                id: row.image.id.to_string(),
                created: row.image.created.timestamp(),
                size: signed_size(row.image.size),
                virtual_size: signed_size(row.virtual_size),
            }
        })
        .collect();
    Ok(Json(rows))
}

/// `GET /images/viz`: the image graph in graphviz syntax.
pub async fn viz(State(state): State<AppState>) -> Response {
    ([(CONTENT_TYPE, "text/plain")], state.engine.viz()).into_response()
}

/// `GET /images/{name}/json` and `GET /images/{name}/history`.
///
/// # Errors
///
/// Returns not-found for unknown images or actions.
pub async fn get_image(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    if let Some(name) = path.strip_suffix("/json") {
        let image = state.engine.image(name)?;
        return Ok(Json(ImageInspect::from(image)).into_response());
    }
    if let Some(name) = path.strip_suffix("/history") {
        let history: Vec<HistoryEntry> = state
            .engine
            .history(name)?
            .into_iter()
            .map(|image| HistoryEntry {
                tags: state
                    .engine
                    .image_references(&image.id)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                id: image.id.to_string(),
                created: image.created.timestamp(),
                created_by: image
                    .container_config
                    .map(|config| config.cmd.join(" "))
                    .unwrap_or_default(),
            })
            .collect();
        return Ok(Json(history).into_response());
    }
    Err(unknown_route(&path))
}

/// `POST /images/{name}/tag?repo&tag&force`.
///
/// # Errors
///
/// Returns a bad request without `repo`, not-found for unknown images and a
/// conflict for a taken tag without `force`.
pub async fn post_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    query: QueryParams,
) -> Result<StatusCode> {
    let Some(name) = path.strip_suffix("/tag") else {
        return Err(unknown_route(&path));
    };
    let repository = query
        .get("repo")
        .ok_or_else(|| ApiError::bad_request("repository name is required"))?;
    let tag = query.get("tag").unwrap_or_default();
    let force = query.flag("force")?;
    state.engine.tag(name, repository, tag, force)?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /images/{name}`.
///
/// Responds 204 when nothing was untagged or deleted.
///
/// # Errors
///
/// Returns not-found for unknown images and a conflict for images still in
/// use.
pub async fn remove(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response> {
    let entries: Vec<DeleteEntry> = state
        .engine
        .delete_image(&name)
        .await?
        .into_iter()
        .map(|step| match step {
            ImageDelete::Untagged(reference) => DeleteEntry {
                untagged: Some(reference),
                ..DeleteEntry::default()
            },
            ImageDelete::Deleted(id) => DeleteEntry {
                deleted: Some(id.to_string()),
                ..DeleteEntry::default()
            },
        })
        .collect();
    if entries.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(entries).into_response())
}

/// `POST /commit?container&repo&tag&m&author` with an optional JSON run
/// configuration for the new image.
///
/// # Errors
///
/// Returns not-found for an unknown container.
pub async fn commit(
    State(state): State<AppState>,
    query: QueryParams,
    OptionalJsonBody(config): OptionalJsonBody<ContainerConfig>,
) -> Result<(StatusCode, Json<IdResponse>)> {
    let container = query.get("container").unwrap_or_default();
    let options = CommitOptions {
        repository: query.get("repo").map(str::to_string),
        tag: query.get("tag").map(str::to_string),
        comment: query.get("m").unwrap_or_default().to_string(),
        author: query.get("author").unwrap_or_default().to_string(),
        config,
    };
    let id = state.engine.commit(container, options).await?;
    Ok((StatusCode::CREATED, Json(IdResponse { id: id.to_string() })))
}
