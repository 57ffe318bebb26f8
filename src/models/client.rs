use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Environment;

/// A connected runtime client.
///
/// Sessions are **ephemeral**: they exist only in the memory of the serving
/// node. A process restart loses them all, which is acceptable: this is
/// observability and notification-routing state, not configuration state.
/// Clients reconnect and re-heartbeat on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSession {
    /// Transport-level connection handle, unique per live connection.
    pub connection_id: String,
    /// Logical client identity; one client may hold several connections.
    pub client_id: String,
    pub app_id: Uuid,
    pub environment: Environment,
    /// The snapshot version the client last reported as applied.
    pub version: Option<i64>,
    pub host: Option<String>,
    pub address: Option<String>,
    pub build_version: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Input for registering a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInput {
    pub connection_id: String,
    pub client_id: String,
    pub app_id: Uuid,
    pub environment: Environment,
    pub host: Option<String>,
    pub address: Option<String>,
    pub build_version: Option<String>,
}

/// Heartbeat payload: the version the client currently has applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatInput {
    pub version: Option<i64>,
}

/// Liveness classification computed at query time from heartbeat age.
/// Sessions are never evicted by the query path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionLiveness {
    Active,
    PossiblyDisconnected,
}

/// A session as reported to operators, with the liveness classification and
/// the latest published version for its scope (for drift spotting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSessionView {
    #[serde(flatten)]
    pub session: ClientSession,
    pub liveness: SessionLiveness,
    /// Latest snapshot version published for the session's app+environment,
    /// when known. `None` means nothing has been published yet.
    pub latest_version: Option<i64>,
}

/// Per-app connection counts for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConnections {
    pub app_id: Uuid,
    pub connection_count: usize,
    pub environment_count: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub unique_apps: usize,
    pub unique_clients: usize,
    pub by_app: Vec<AppConnections>,
}
