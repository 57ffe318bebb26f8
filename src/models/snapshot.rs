use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Environment;

/// An immutable record of one publish event.
///
/// Snapshot versions increase strictly per (app, environment) and are
/// independent from per-entry versions. A snapshot is never mutated after
/// creation; a rollback references it from the *new* snapshot's description
/// instead of touching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSnapshot {
    pub id: Uuid,
    pub app_id: Uuid,
    pub environment: Environment,
    pub version: i64,
    pub description: Option<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// One entry's change within a snapshot.
///
/// `old_value` is the last published value (`None` = the entry did not exist
/// before this snapshot); `new_value` is the value published here (`None` =
/// tombstone, the entry was archived). Together the diffs of a snapshot are
/// sufficient to restore the pre-snapshot state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDiff {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub entry_id: Uuid,
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// The entry's version at the time of this publish.
    pub entry_version: i64,
}

/// Request body for a publish.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishRequest {
    pub description: Option<String>,
}

/// A snapshot together with its diffs, for the compare endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCompare {
    pub snapshot: PublishSnapshot,
    pub diffs: Vec<EntryDiff>,
}

/// Result of a rollback: the new snapshot that records it plus a human
/// summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub message: String,
    pub snapshot: PublishSnapshot,
}
