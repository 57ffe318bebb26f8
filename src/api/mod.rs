mod handlers;
pub mod middleware;

use axum::{
    extract::FromRequestParts,
    http::{header::HeaderValue, request::Parts},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::Database;
use crate::registry::ClientRegistry;
use middleware::SecurityConfig;

/// Everything the handlers need: durable storage, the live session
/// registry, and the security settings.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: ClientRegistry,
    pub security: SecurityConfig,
}

/// The caller identity stamped as `author` on publishes and rollbacks.
///
/// Identity management is an external collaborator; this extractor only
/// carries the opaque name it supplies via the `X-Operator` header.
pub struct Principal(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let who = parts
            .headers
            .get("x-operator")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("anonymous");
        Ok(Principal(who.to_string()))
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Apps
        .route("/apps", get(handlers::list_apps))
        .route("/apps", post(handlers::create_app))
        .route("/apps/{id}", get(handlers::get_app))
        .route("/apps/{id}", put(handlers::update_app))
        .route("/apps/{id}", delete(handlers::disable_app))
        .route("/apps/{id}/configs", get(handlers::list_entries))
        .route("/apps/{id}/configs", post(handlers::create_entry))
        .route("/apps/{id}/effective", get(handlers::get_effective))
        .route("/apps/{id}/publish", post(handlers::publish))
        // Entries (by entry id)
        .route("/configs/{id}", get(handlers::get_entry))
        .route("/configs/{id}", put(handlers::update_entry))
        .route("/configs/{id}", delete(handlers::archive_entry))
        .route("/configs/batch/import", post(handlers::batch_import))
        .route("/configs/batch/delete", post(handlers::batch_delete))
        // Publish history
        .route("/publishHistory", get(handlers::list_publish_history))
        .route("/publishHistory/{id}/compare", get(handlers::compare_snapshot))
        .route("/publishHistory/{id}/rollback", post(handlers::rollback_snapshot))
        // Client sessions
        .route("/clients", get(handlers::list_clients))
        .route("/clients/stats", get(handlers::client_stats))
        .route("/clients/connect", post(handlers::client_connect))
        .route("/clients/{connectionId}/heartbeat", post(handlers::client_heartbeat))
        .route("/clients/{connectionId}", delete(handlers::client_disconnect))
        // Health
        .route("/health", get(handlers::health));

    let cors = match &state.security.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    Router::new()
        .nest("/api/v1", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
