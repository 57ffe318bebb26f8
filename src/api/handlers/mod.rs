use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{AppState, Principal};
use crate::error::CoreError;
use crate::models::*;

// ============================================================
// Error Handling
// ============================================================

/// Maps core failures onto caller-visible status + JSON body. Internal
/// errors are logged server-side with full detail but sanitized for the
/// client; a version conflict carries the current server version so the
/// caller can re-fetch and retry.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_version: Option<i64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::VersionMismatch { .. }
            | CoreError::DuplicateKey { .. }
            | CoreError::PublishBusy { .. }
            | CoreError::UnresolvableDiff { .. } => StatusCode::CONFLICT,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::InheritanceTooDeep { .. } | CoreError::NothingToPublish { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::Storage(_) | CoreError::Encoding(_) => {
                tracing::error!("Internal error: {}", err);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "Internal server error".to_string(),
                        code: "internal",
                        current_version: None,
                    }),
                )
                    .into_response();
            }
        };

        tracing::warn!("Request failed ({}): {}", err.code(), err);
        let current_version = match &err {
            CoreError::VersionMismatch { current, .. } => Some(*current),
            _ => None,
        };
        (
            status,
            Json(ErrorBody {
                error: err.to_string(),
                code: err.code(),
                current_version,
            }),
        )
            .into_response()
    }
}

fn not_found(resource: &'static str, id: impl ToString) -> ApiError {
    ApiError(CoreError::not_found(resource, id))
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Apps
// ============================================================

pub async fn list_apps(State(state): State<AppState>) -> Result<Json<Vec<App>>, ApiError> {
    state.db.list_apps().map(Json).map_err(ApiError::from)
}

pub async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<App>, ApiError> {
    state
        .db
        .get_app(id)?
        .map(Json)
        .ok_or_else(|| not_found("app", id))
}

pub async fn create_app(
    State(state): State<AppState>,
    Json(input): Json<CreateAppInput>,
) -> Result<(StatusCode, Json<App>), ApiError> {
    let app = state.db.create_app(input)?;
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn update_app(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateAppInput>,
) -> Result<Json<App>, ApiError> {
    state.db.update_app(id, input).map(Json).map_err(ApiError::from)
}

/// Apps are disabled, never deleted: entries and publish history remain.
pub async fn disable_app(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<App>, ApiError> {
    state.db.disable_app(id).map(Json).map_err(ApiError::from)
}

// ============================================================
// Entries
// ============================================================

#[derive(Debug, Deserialize)]
pub struct EnvQuery {
    pub env: Environment,
}

/// Draft view: what editors see, including unpublished `init` entries.
pub async fn list_entries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EnvQuery>,
) -> Result<Json<Vec<ConfigEntry>>, ApiError> {
    state
        .db
        .list_entries(id, query.env)
        .map(Json)
        .map_err(ApiError::from)
}

pub async fn create_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
    Json(input): Json<CreateEntryInput>,
) -> Result<(StatusCode, Json<ConfigEntry>), ApiError> {
    let env = input.environment;
    let entry = state.db.create_entry(id, input)?;
    maybe_auto_publish(&state, id, env, &principal.0);
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConfigEntry>, ApiError> {
    state
        .db
        .get_entry(id)?
        .map(Json)
        .ok_or_else(|| not_found("entry", id))
}

pub async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
    Json(input): Json<UpdateEntryInput>,
) -> Result<Json<ConfigEntry>, ApiError> {
    let entry = state.db.update_entry(id, input)?;
    maybe_auto_publish(&state, entry.app_id, entry.environment, &principal.0);
    Ok(Json(entry))
}

pub async fn archive_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
) -> Result<Json<ConfigEntry>, ApiError> {
    let entry = state.db.archive_entry(id)?;
    maybe_auto_publish(&state, entry.app_id, entry.environment, &principal.0);
    Ok(Json(entry))
}

pub async fn batch_import(
    State(state): State<AppState>,
    principal: Principal,
    Json(input): Json<BatchImportInput>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let (app_id, env) = (input.app_id, input.environment);
    let outcome = state.db.batch_import(input)?;
    if outcome.success_count > 0 {
        maybe_auto_publish(&state, app_id, env, &principal.0);
    }
    Ok(Json(outcome))
}

pub async fn batch_delete(
    State(state): State<AppState>,
    principal: Principal,
    Json(input): Json<BatchDeleteInput>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let (app_id, env) = (input.app_id, input.environment);
    let outcome = state.db.batch_delete(input)?;
    if outcome.success_count > 0 {
        maybe_auto_publish(&state, app_id, env, &principal.0);
    }
    Ok(Json(outcome))
}

/// Publish immediately after a successful mutation when the app opted in.
/// "Nothing changed" is normal here (e.g. an import where every item
/// failed); real failures are logged, never surfaced to the edit response.
fn maybe_auto_publish(state: &AppState, app_id: Uuid, env: Environment, author: &str) {
    let auto = matches!(state.db.get_app(app_id), Ok(Some(app)) if app.auto_publish);
    if !auto {
        return;
    }
    match state
        .db
        .publish(app_id, env, Some("auto publish".to_string()), author)
    {
        Ok(snapshot) => {
            tracing::debug!("auto-published v{} for app {}", snapshot.version, app_id)
        }
        Err(CoreError::NothingToPublish { .. }) => {}
        Err(err) => tracing::warn!("auto publish for app {} failed: {}", app_id, err),
    }
}

// ============================================================
// Effective configuration
// ============================================================

pub async fn get_effective(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EnvQuery>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    state
        .db
        .resolve_effective(id, query.env)
        .map(Json)
        .map_err(ApiError::from)
}

// ============================================================
// Publish & history
// ============================================================

pub async fn publish(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EnvQuery>,
    principal: Principal,
    Json(body): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishSnapshot>), ApiError> {
    let snapshot = state
        .db
        .publish(id, query.env, body.description, &principal.0)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(alias = "appId")]
    pub app_id: Uuid,
    pub env: Environment,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_publish_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PublishSnapshot>>, ApiError> {
    let snapshots = state.db.list_snapshots(query.app_id, query.env)?;

    // Newest-first pagination, applied handler-side
    let offset = query.offset.unwrap_or(0) as usize;
    let snapshots: Vec<_> = snapshots.into_iter().skip(offset).collect();
    let snapshots: Vec<_> = match query.limit {
        Some(limit) => snapshots.into_iter().take(limit as usize).collect(),
        None => snapshots,
    };

    Ok(Json(snapshots))
}

pub async fn compare_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SnapshotCompare>, ApiError> {
    state
        .db
        .compare_snapshot(id)
        .map(Json)
        .map_err(ApiError::from)
}

pub async fn rollback_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
) -> Result<Json<RollbackOutcome>, ApiError> {
    state
        .db
        .rollback(id, &principal.0)
        .map(Json)
        .map_err(ApiError::from)
}

// ============================================================
// Client sessions
// ============================================================

#[derive(Debug, Deserialize)]
pub struct ClientsQuery {
    #[serde(alias = "appId")]
    pub app_id: Option<Uuid>,
    pub env: Option<Environment>,
}

/// Live sessions with staleness classification and, where something has
/// been published for the session's scope, the latest snapshot version so
/// operators can spot drift.
pub async fn list_clients(
    State(state): State<AppState>,
    Query(query): Query<ClientsQuery>,
) -> Result<Json<Vec<ClientSessionView>>, ApiError> {
    let sessions = state.registry.query(query.app_id, query.env);

    let mut latest_by_scope: HashMap<(Uuid, Environment), Option<i64>> = HashMap::new();
    let mut views = Vec::with_capacity(sessions.len());
    for (session, liveness) in sessions {
        let scope = (session.app_id, session.environment);
        let latest_version = match latest_by_scope.get(&scope) {
            Some(cached) => *cached,
            None => {
                let latest = state
                    .db
                    .latest_snapshot_version(session.app_id, session.environment)?;
                latest_by_scope.insert(scope, latest);
                latest
            }
        };
        views.push(ClientSessionView {
            session,
            liveness,
            latest_version,
        });
    }

    Ok(Json(views))
}

pub async fn client_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

pub async fn client_connect(
    State(state): State<AppState>,
    Json(input): Json<ConnectInput>,
) -> Result<StatusCode, ApiError> {
    if input.connection_id.trim().is_empty() || input.client_id.trim().is_empty() {
        return Err(ApiError(CoreError::Validation(
            "connection_id and client_id must not be empty".into(),
        )));
    }
    state.registry.connect(input);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn client_heartbeat(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Json(body): Json<HeartbeatInput>,
) -> Result<StatusCode, ApiError> {
    if state.registry.heartbeat(&connection_id, body.version) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("client session", connection_id))
    }
}

pub async fn client_disconnect(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.disconnect(&connection_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("client session", connection_id))
    }
}
