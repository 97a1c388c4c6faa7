//! Route table.
//!
//! Unversioned routes and their `/v<major>.<minor>` aliases share one table:
//! [`negotiate_version`] strips the prefix before routing. Routes newer than
//! the oldest API version are wrapped by [`since`].

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, Uri};
use axum::middleware;
use axum::routing::{delete, get, post};
use berth_common::error::BerthError;
use berth_common::types::ApiVersion;
use berth_runtime::engine::Engine;
use tower_http::trace::TraceLayer;

use crate::cors::cors;
use crate::error::ApiError;
use crate::handlers;
use crate::version::{negotiate_version, require_version};

/// First API version serving `/events` and `/containers/{name}/top`.
pub const EVENTS_VERSION: ApiVersion = ApiVersion::new(1, 3);

/// Application state shared with handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Container engine.
    pub engine: Arc<Engine>,
    /// Reported by `/info`.
    pub debug: bool,
}

/// Router-wide switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterOptions {
    /// Add CORS headers to every response.
    pub enable_cors: bool,
    /// Report debug mode in `/info`.
    pub debug: bool,
}

/// Restricts every route of `router` to requests made with `minimum` or
/// newer.
pub fn since<S>(minimum: ApiVersion, router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(minimum, require_version))
}

/// Creates the API router with all endpoints.
#[must_use]
pub fn create_router(engine: Arc<Engine>, options: RouterOptions) -> Router {
    let state = AppState {
        engine,
        debug: options.debug,
    };
    let routes = api_routes()
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state);

    Router::new()
        .fallback_service(routes)
        .layer(middleware::from_fn(negotiate_version))
        .layer(middleware::from_fn_with_state(options.enable_cors, cors))
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/version", get(handlers::system::version))
        .route("/info", get(handlers::system::info))
        .route("/containers/json", get(handlers::containers::list))
        .route("/containers/create", post(handlers::containers::create))
        .route(
            "/containers/{name}",
            get(handlers::containers::inspect).delete(handlers::containers::remove),
        )
        .route("/containers/{name}/json", get(handlers::containers::inspect))
        .route("/containers/{name}/start", post(handlers::containers::start))
        .route("/containers/{name}/stop", post(handlers::containers::stop))
        .route("/containers/{name}/kill", post(handlers::containers::kill))
        .route("/containers/{name}/restart", post(handlers::containers::restart))
        .route("/containers/{name}/wait", post(handlers::containers::wait))
        .route("/containers/{name}/attach", post(handlers::attach::attach))
        .route("/containers/{name}/changes", get(handlers::containers::changes))
        .route("/containers/{name}/export", get(handlers::containers::export))
        .route("/containers/{name}/copy", post(handlers::containers::copy))
        .route("/commit", post(handlers::images::commit))
        .route("/images/json", get(handlers::images::list))
        .route("/images/viz", get(handlers::images::viz))
        // Image names may contain `/`, so the action is the path suffix.
        .route(
            "/images/{*path}",
            get(handlers::images::get_image)
                .post(handlers::images::post_image)
                .delete(handlers::images::remove),
        )
        .merge(since(
            EVENTS_VERSION,
            Router::new()
                .route("/events", get(handlers::system::events))
                .route("/containers/{name}/top", get(handlers::containers::top)),
        ))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::Berth(BerthError::NotFound {
        kind: "route",
        id: uri.path().to_string(),
    })
}

async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::MethodNotAllowed {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}
