use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A configuration namespace.
///
/// Apps own configuration entries per environment and may inherit from one
/// parent app. The inheritance graph is a forest: at most one parent, no
/// cycles (rejected at write time). A disabled app is no longer served to
/// clients but keeps all of its data and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,
    pub name: String,
    /// Opaque token a pull client presents to fetch this app's configuration.
    /// Generated on creation when not supplied.
    pub secret: String,
    pub enabled: bool,
    /// When set, a successful edit or import immediately publishes the
    /// affected environment.
    pub auto_publish: bool,
    /// Parent app for inheritance resolution. Stored as an id, never a live
    /// reference.
    pub inherits_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a new app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppInput {
    pub name: String,
    /// Client auth token. A random one is generated when omitted.
    pub secret: Option<String>,
    #[serde(default)]
    pub auto_publish: bool,
    pub inherits_from: Option<Uuid>,
}

/// Input for updating an app. All fields are optional for partial updates.
///
/// `inherits_from` distinguishes three cases: field absent = leave the parent
/// alone, `null` = detach from the parent, a value = re-parent (cycle-checked).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAppInput {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub auto_publish: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<Option<Uuid>>,
}
