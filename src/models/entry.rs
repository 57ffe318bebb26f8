use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One configuration value.
///
/// Entries are keyed by (app, environment, key); the key is unique among
/// non-archived entries of a scope. `version` increases by exactly 1 on every
/// committed mutation and backs the optimistic-concurrency check on edits.
///
/// # Lifecycle
/// Entries progress Init → Active → Archived. `Init` is the draft state: the
/// entry exists for editors but is invisible to resolving clients until a
/// publish promotes it to `Active`. `Archived` is the soft-deleted terminal
/// state; archived rows are kept so snapshot diffs always resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub id: Uuid,
    pub app_id: Uuid,
    pub environment: Environment,
    pub key: String,
    pub value: String,
    pub value_kind: ValueKind,
    /// Free-form grouping label for the admin UI. Never inherited.
    pub group_label: Option<String>,
    pub version: i64,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The deployment environment a value belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of an entry.
///
/// - `Init`: draft, edited but never published, hidden from clients
/// - `Active`: published at least once, part of the effective view
/// - `Archived`: soft-deleted, kept for history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Init,
    Active,
    Archived,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// How a value should be interpreted by consumers. Informational only; the
/// server never parses values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Json,
    Yaml,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Input for creating a new entry in an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntryInput {
    pub environment: Environment,
    pub key: String,
    pub value: String,
    /// Defaults to `Text` if not specified.
    pub value_kind: Option<ValueKind>,
    pub group_label: Option<String>,
}

/// Input for editing an entry.
///
/// `expected_version` is the version the caller last read; the edit fails
/// with a conflict if the entry has moved on since.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEntryInput {
    pub value: String,
    pub value_kind: Option<ValueKind>,
    pub group_label: Option<String>,
    pub expected_version: i64,
}

/// One item of a batch import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportItem {
    pub key: String,
    pub value: String,
    pub value_kind: Option<ValueKind>,
    pub group_label: Option<String>,
}

/// Input for a batch import into one app+environment scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImportInput {
    pub app_id: Uuid,
    pub environment: Environment,
    pub items: Vec<ImportItem>,
}

/// Input for bulk-archiving keys in one app+environment scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDeleteInput {
    pub app_id: Uuid,
    pub environment: Environment,
    pub keys: Vec<String>,
}

/// Aggregate result of a batch operation. Per-item failures never abort the
/// batch; callers always learn the full success/failure partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failed_keys: Vec<String>,
}
