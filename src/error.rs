//! Failure taxonomy for the configuration core.

use thiserror::Error;
use uuid::Uuid;

use crate::models::Environment;

/// Errors raised by the storage, resolver, publish and rollback paths.
///
/// Variants carry the identifiers their messages need so the API layer can
/// surface actionable responses (a version conflict reports the current
/// server version; a rollback failure names the snapshot and the entry).
#[derive(Debug, Error)]
pub enum CoreError {
    /// The referenced app, entry or snapshot does not exist.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Optimistic-concurrency check failed on an entry edit.
    ///
    /// `current` is the version the server holds now; the caller is expected
    /// to re-fetch and retry with it.
    #[error("version conflict on '{key}': expected {expected}, current version is {current}")]
    VersionMismatch {
        key: String,
        expected: i64,
        current: i64,
    },

    /// Another publish for the same app and environment is in flight.
    #[error("publish already in progress for app {app_id} in {environment}")]
    PublishBusy {
        app_id: Uuid,
        environment: Environment,
    },

    /// A create or revive collided with an existing live key in the same
    /// app+environment scope.
    #[error("key '{key}' already exists in this scope")]
    DuplicateKey { key: String },

    /// A rollback diff references an entry that no longer resolves.
    #[error("rollback of snapshot {snapshot_id} failed: entry {entry_id} no longer exists")]
    UnresolvableDiff { snapshot_id: Uuid, entry_id: Uuid },

    /// Malformed input: bad key pattern, missing fields, invalid references.
    #[error("{0}")]
    Validation(String),

    /// The inheritance chain exceeded the hard depth cap, indicating a cycle
    /// or a pathologically deep graph.
    #[error("inheritance chain for app {app_id} exceeds {depth} levels")]
    InheritanceTooDeep { app_id: Uuid, depth: usize },

    /// A publish was requested but nothing changed since the last one.
    #[error("nothing to publish for app {app_id} in {environment}")]
    NothingToPublish {
        app_id: Uuid,
        environment: Environment,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable tag for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::VersionMismatch { .. }
            | Self::DuplicateKey { .. }
            | Self::PublishBusy { .. }
            | Self::UnresolvableDiff { .. } => "conflict",
            Self::Validation(_) => "validation",
            Self::InheritanceTooDeep { .. } => "inheritance_too_deep",
            Self::NothingToPublish { .. } => "nothing_to_publish",
            Self::Storage(_) | Self::Encoding(_) => "internal",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_reports_current_version() {
        let err = CoreError::VersionMismatch {
            key: "db.pool_size".into(),
            expected: 3,
            current: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("current version is 4"));
    }

    #[test]
    fn unresolvable_diff_names_snapshot_and_entry() {
        let snapshot_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();
        let err = CoreError::UnresolvableDiff {
            snapshot_id,
            entry_id,
        };
        let msg = err.to_string();
        assert!(msg.contains(&snapshot_id.to_string()));
        assert!(msg.contains(&entry_id.to_string()));
    }
}
