//! Container handlers.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use berth_common::types::{ApiVersion, Change, ContainerConfig, HostConfig};
use berth_runtime::container::Container;
use berth_runtime::engine::{Engine, ListOptions};
use berth_runtime::top::{DEFAULT_PS_ARGS, TopResult};

use crate::error::Result;
use crate::params::{JsonBody, OptionalJsonBody, QueryParams};
use crate::router::AppState;
use crate::types::{
    ContainerInspect, ContainerSummary, CopyRequest, CreateResponse, NetworkSettings,
    WaitResponse, signed_size,
};
use crate::version::RequestedVersion;

/// First API version honoring `ps_args` on top.
const PS_ARGS_VERSION: ApiVersion = ApiVersion::new(1, 4);

/// Media type of exported archives.
const TAR_MEDIA_TYPE: &str = "application/x-tar";

/// Reference shown for a container's image: its first tag, else its short id.
fn image_name(engine: &Engine, container: &Container) -> String {
    engine
        .image_references(&container.image)
        .first()
        .map_or_else(|| container.image.short().to_string(), ToString::to_string)
}

/// Grace period from the `t` parameter; negative or absent means the default.
fn timeout_param(query: &QueryParams) -> Result<Option<Duration>> {
    Ok(query
        .number::<i64>("t")?
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs))
}

fn tar_response(stream: berth_runtime::backend::ByteStream) -> Response {
    ([(CONTENT_TYPE, TAR_MEDIA_TYPE)], Body::from_stream(stream)).into_response()
}

/// `GET /containers/json?all&limit&since&before&size`.
///
/// # Errors
///
/// Returns a bad request for malformed parameters and not-found when `since`
/// or `before` names an unknown container.
pub async fn list(
    State(state): State<AppState>,
    query: QueryParams,
) -> Result<Json<Vec<ContainerSummary>>> {
    let options = ListOptions {
        all: query.flag("all")?,
        limit: query
            .number::<i64>("limit")?
            .and_then(|limit| usize::try_from(limit).ok()),
        since: query.get("since").map(str::to_string),
        before: query.get("before").map(str::to_string),
    };
    let with_size = query.flag("size")?;
    let engine = &state.engine;

    let mut summaries = Vec::new();
    for container in engine.list(&options)? {
        let (size_rw, size_root_fs) = if with_size {
            engine.size(&container).await?
        } else {
            (0, 0)
        };
        summaries.push(ContainerSummary {
            id: container.id.to_string(),
            names: container.name.iter().map(|name| format!("/{name}")).collect(),
            image: image_name(engine, &container),
            command: container.command(),
            created: container.created.timestamp(),
            status: container.state.description(),
            ports: container.config.port_specs.join(", "),
            size_rw: signed_size(size_rw),
            size_root_fs: signed_size(size_root_fs),
        });
    }
    Ok(Json(summaries))
}

/// `POST /containers/create?name`.
///
/// # Errors
///
/// Returns a bad request for a non-JSON body, and the engine's error for an
/// invalid configuration, unknown image or taken name.
pub async fn create(
    State(state): State<AppState>,
    query: QueryParams,
    JsonBody(config): JsonBody<ContainerConfig>,
) -> Result<(StatusCode, Json<CreateResponse>)> {
    let name = query.get("name").map(str::to_string);
    let (container, warnings) = state.engine.create(config, name).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            id: container.id.to_string(),
            warnings,
        }),
    ))
}

/// `GET /containers/{name}/json`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerInspect>> {
    let container = state.engine.get(&name)?;
    Ok(Json(ContainerInspect {
        id: container.id.to_string(),
        name: container.name.clone().unwrap_or_default(),
        created: container.created,
        path: container.path.clone(),
        args: container.args.clone(),
        config: container.config.clone(),
        state: container.state.snapshot(),
        image: container.image.to_string(),
        network_settings: NetworkSettings::default(),
        volumes: BTreeMap::new(),
        volumes_rw: BTreeMap::new(),
        host_config: container.host_config(),
    }))
}

/// `DELETE /containers/{name}?v`.
///
/// `v` is validated but volumes are not managed, so there is nothing extra to
/// remove.
///
/// # Errors
///
/// Returns not-found for unknown containers and a conflict for running ones.
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: QueryParams,
) -> Result<StatusCode> {
    let _volumes = query.flag("v")?;
    state.engine.destroy(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{name}/start` with an optional JSON host config.
///
/// # Errors
///
/// Returns not-found for unknown containers and a conflict for running ones.
pub async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    OptionalJsonBody(host_config): OptionalJsonBody<HostConfig>,
) -> Result<StatusCode> {
    state.engine.start(&name, host_config).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{name}/stop?t`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: QueryParams,
) -> Result<StatusCode> {
    let timeout = timeout_param(&query)?;
    state.engine.stop(&name, timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{name}/kill`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn kill(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode> {
    state.engine.kill(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{name}/restart?t`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: QueryParams,
) -> Result<StatusCode> {
    let timeout = timeout_param(&query)?;
    state.engine.restart(&name, timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{name}/wait`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn wait(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WaitResponse>> {
    let status_code = state.engine.wait(&name).await?;
    Ok(Json(WaitResponse { status_code }))
}

/// `GET /containers/{name}/top?ps_args`.
///
/// # Errors
///
/// Returns a conflict for a container that is not running.
pub async fn top(
    State(state): State<AppState>,
    Path(name): Path<String>,
    RequestedVersion(version): RequestedVersion,
    query: QueryParams,
) -> Result<Json<TopResult>> {
    let ps_args = if version >= PS_ARGS_VERSION {
        query.get("ps_args").unwrap_or(DEFAULT_PS_ARGS)
    } else {
        DEFAULT_PS_ARGS
    };
    Ok(Json(state.engine.top(&name, ps_args).await?))
}

/// `GET /containers/{name}/changes`.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn changes(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Change>>> {
    Ok(Json(state.engine.changes(&name).await?))
}

/// `GET /containers/{name}/export`: the container filesystem as a tar stream.
///
/// # Errors
///
/// Returns not-found for unknown containers.
pub async fn export(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response> {
    Ok(tar_response(state.engine.export(&name).await?))
}

/// `POST /containers/{name}/copy` with body `{"Resource": path}`.
///
/// # Errors
///
/// Returns a bad request for a non-JSON body or empty resource and
/// not-found for an unknown container or path.
pub async fn copy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(request): JsonBody<CopyRequest>,
) -> Result<Response> {
    Ok(tar_response(state.engine.copy(&name, &request.resource).await?))
}
