mod publish;
mod resolve;
mod schema;

pub use resolve::MAX_INHERITANCE_DEPTH;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::*;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
    publish_locks: publish::ScopeLocks,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::wrap(conn))
    }

    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "beacon")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("beacon.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            publish_locks: publish::ScopeLocks::new(),
        }
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // App operations
    // ============================================================

    pub fn list_apps(&self) -> CoreResult<Vec<App>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {APP_COLUMNS} FROM apps ORDER BY name"
        ))?;

        let apps = stmt
            .query_map([], app_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(apps)
    }

    pub fn get_app(&self, id: Uuid) -> CoreResult<Option<App>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let app = conn
            .query_row(
                &format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?"),
                [id.to_string()],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    fn require_app(&self, id: Uuid) -> CoreResult<App> {
        self.get_app(id)?
            .ok_or_else(|| CoreError::not_found("app", id))
    }

    pub fn create_app(&self, input: CreateAppInput) -> CoreResult<App> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("app name must not be empty".into()));
        }
        if let Some(parent) = input.inherits_from {
            self.require_app(parent)?;
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM apps WHERE name = ?",
            [name],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(CoreError::Validation(format!(
                "app name '{name}' is already in use"
            )));
        }

        let id = Uuid::new_v4();
        let secret = input
            .secret
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = Utc::now();

        conn.execute(
            "INSERT INTO apps (id, name, secret, enabled, auto_publish, inherits_from, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?, ?, ?)",
            (
                id.to_string(),
                name,
                &secret,
                input.auto_publish as i32,
                input.inherits_from.map(|u| u.to_string()),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(App {
            id,
            name: name.to_string(),
            secret,
            enabled: true,
            auto_publish: input.auto_publish,
            inherits_from: input.inherits_from,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_app(&self, id: Uuid, input: UpdateAppInput) -> CoreResult<App> {
        let existing = self.require_app(id)?;

        let inherits_from = match input.inherits_from {
            None => existing.inherits_from,
            Some(None) => None,
            Some(Some(parent)) => {
                self.check_inheritance_target(id, parent)?;
                Some(parent)
            }
        };

        let name = match input.name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(CoreError::Validation("app name must not be empty".into()));
                }
                if name != existing.name {
                    let conn = self.conn.lock().expect("database lock poisoned");
                    let taken: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM apps WHERE name = ? AND id != ?",
                        (&name, id.to_string()),
                        |row| row.get(0),
                    )?;
                    if taken > 0 {
                        return Err(CoreError::Validation(format!(
                            "app name '{name}' is already in use"
                        )));
                    }
                }
                name
            }
            None => existing.name,
        };
        let enabled = input.enabled.unwrap_or(existing.enabled);
        let auto_publish = input.auto_publish.unwrap_or(existing.auto_publish);

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        conn.execute(
            "UPDATE apps SET name = ?, enabled = ?, auto_publish = ?, inherits_from = ?, updated_at = ?
             WHERE id = ?",
            (
                &name,
                enabled as i32,
                auto_publish as i32,
                inherits_from.map(|u| u.to_string()),
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;

        Ok(App {
            id,
            name,
            secret: existing.secret,
            enabled,
            auto_publish,
            inherits_from,
            created_at: existing.created_at,
            updated_at: now,
        })
    }

    /// Disable an app instead of deleting it. History and entries stay intact
    /// and the restrict-on-delete foreign keys are never exercised.
    pub fn disable_app(&self, id: Uuid) -> CoreResult<App> {
        self.update_app(
            id,
            UpdateAppInput {
                name: None,
                enabled: Some(false),
                auto_publish: None,
                inherits_from: None,
            },
        )
    }

    /// Reject re-parenting that would make the inheritance graph cyclic: walk
    /// up from the proposed parent and fail if the app itself appears.
    fn check_inheritance_target(&self, app_id: Uuid, parent: Uuid) -> CoreResult<()> {
        if parent == app_id {
            return Err(CoreError::Validation(
                "an app cannot inherit from itself".into(),
            ));
        }
        self.require_app(parent)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let chain = resolve::ancestor_chain(&conn, parent)?;
        if chain.iter().any(|link| link.id == app_id) {
            return Err(CoreError::Validation(format!(
                "inheriting from {parent} would create a cycle"
            )));
        }
        Ok(())
    }

    // ============================================================
    // Entry operations
    // ============================================================

    /// Draft view of a scope: init and active entries, editors' perspective.
    pub fn list_entries(&self, app_id: Uuid, env: Environment) -> CoreResult<Vec<ConfigEntry>> {
        self.require_app(app_id)?;
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM config_entries
             WHERE app_id = ? AND environment = ? AND status != 'archived'
             ORDER BY key"
        ))?;

        let entries = stmt
            .query_map((app_id.to_string(), env.as_str()), entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    pub fn get_entry(&self, id: Uuid) -> CoreResult<Option<ConfigEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM config_entries WHERE id = ?"),
                [id.to_string()],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Look up the live (non-archived) entry for a key, if any.
    pub fn get_entry_by_key(
        &self,
        app_id: Uuid,
        env: Environment,
        key: &str,
    ) -> CoreResult<Option<ConfigEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM config_entries
                     WHERE app_id = ? AND environment = ? AND key = ? AND status != 'archived'"
                ),
                (app_id.to_string(), env.as_str(), key),
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn create_entry(&self, app_id: Uuid, input: CreateEntryInput) -> CoreResult<ConfigEntry> {
        let app = self.require_app(app_id)?;
        validate_key(&input.key)?;
        if self
            .get_entry_by_key(app.id, input.environment, &input.key)?
            .is_some()
        {
            return Err(CoreError::DuplicateKey {
                key: input.key.clone(),
            });
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();
        let value_kind = input.value_kind.unwrap_or(ValueKind::Text);

        conn.execute(
            "INSERT INTO config_entries
             (id, app_id, environment, key, value, value_kind, group_label, version, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, 'init', ?, ?)",
            (
                id.to_string(),
                app_id.to_string(),
                input.environment.as_str(),
                &input.key,
                &input.value,
                value_kind.as_str(),
                &input.group_label,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(ConfigEntry {
            id,
            app_id,
            environment: input.environment,
            key: input.key,
            value: input.value,
            value_kind,
            group_label: input.group_label,
            version: 1,
            status: EntryStatus::Init,
            created_at: now,
            updated_at: now,
        })
    }

    /// Upsert by key. An existing entry requires the caller-held version and
    /// goes through the compare-and-swap path; an absent (or archived) key
    /// starts a fresh draft row.
    pub fn put_entry(
        &self,
        app_id: Uuid,
        env: Environment,
        key: &str,
        value: String,
        value_kind: Option<ValueKind>,
        group_label: Option<String>,
        expected_version: Option<i64>,
    ) -> CoreResult<ConfigEntry> {
        match self.get_entry_by_key(app_id, env, key)? {
            Some(existing) => {
                let expected = expected_version.ok_or_else(|| {
                    CoreError::Validation(format!(
                        "expected_version is required when updating existing key '{key}'"
                    ))
                })?;
                self.update_entry(
                    existing.id,
                    UpdateEntryInput {
                        value,
                        value_kind,
                        group_label,
                        expected_version: expected,
                    },
                )
            }
            None => self.create_entry(
                app_id,
                CreateEntryInput {
                    environment: env,
                    key: key.to_string(),
                    value,
                    value_kind,
                    group_label,
                },
            ),
        }
    }

    /// Optimistic-concurrency edit: a single compare-and-swap `UPDATE` keyed
    /// on (id, version), so two concurrent editors can never silently
    /// overwrite each other.
    pub fn update_entry(&self, id: Uuid, input: UpdateEntryInput) -> CoreResult<ConfigEntry> {
        let existing = self
            .get_entry(id)?
            .ok_or_else(|| CoreError::not_found("entry", id))?;
        if existing.status == EntryStatus::Archived {
            return Err(CoreError::Validation(format!(
                "entry '{}' is archived and cannot be edited",
                existing.key
            )));
        }

        let value_kind = input.value_kind.unwrap_or(existing.value_kind);
        let group_label = input.group_label.or(existing.group_label);

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE config_entries
             SET value = ?, value_kind = ?, group_label = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
            (
                &input.value,
                value_kind.as_str(),
                &group_label,
                now.to_rfc3339(),
                id.to_string(),
                input.expected_version,
            ),
        )?;

        if changed == 0 {
            let current: i64 = conn.query_row(
                "SELECT version FROM config_entries WHERE id = ?",
                [id.to_string()],
                |row| row.get(0),
            )?;
            return Err(CoreError::VersionMismatch {
                key: existing.key,
                expected: input.expected_version,
                current,
            });
        }

        Ok(ConfigEntry {
            id,
            app_id: existing.app_id,
            environment: existing.environment,
            key: existing.key,
            value: input.value,
            value_kind,
            group_label,
            version: input.expected_version + 1,
            status: existing.status,
            created_at: existing.created_at,
            updated_at: now,
        })
    }

    /// Soft delete: the row is kept (status `archived`) so snapshot diffs
    /// always resolve and the next publish can tombstone the key.
    pub fn archive_entry(&self, id: Uuid) -> CoreResult<ConfigEntry> {
        let existing = self
            .get_entry(id)?
            .ok_or_else(|| CoreError::not_found("entry", id))?;
        if existing.status == EntryStatus::Archived {
            return Ok(existing);
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        conn.execute(
            "UPDATE config_entries
             SET status = 'archived', version = version + 1, updated_at = ?
             WHERE id = ?",
            (now.to_rfc3339(), id.to_string()),
        )?;

        Ok(ConfigEntry {
            status: EntryStatus::Archived,
            version: existing.version + 1,
            updated_at: now,
            ..existing
        })
    }

    pub fn delete_entry_by_key(
        &self,
        app_id: Uuid,
        env: Environment,
        key: &str,
    ) -> CoreResult<ConfigEntry> {
        let existing = self
            .get_entry_by_key(app_id, env, key)?
            .ok_or_else(|| CoreError::not_found("entry", key))?;
        self.archive_entry(existing.id)
    }

    // ============================================================
    // Batch operations
    // ============================================================

    /// Create-only import. Each item is applied independently; a failed item
    /// (malformed or duplicate key) is reported in `failed_keys` and never
    /// aborts the rest of the batch.
    pub fn batch_import(&self, input: BatchImportInput) -> CoreResult<BatchOutcome> {
        self.require_app(input.app_id)?;

        let mut success_count = 0;
        let mut failed_keys = Vec::new();
        for item in input.items {
            let key = item.key.clone();
            let result = self.create_entry(
                input.app_id,
                CreateEntryInput {
                    environment: input.environment,
                    key: item.key,
                    value: item.value,
                    value_kind: item.value_kind,
                    group_label: item.group_label,
                },
            );
            match result {
                Ok(_) => success_count += 1,
                Err(err) => {
                    tracing::debug!("import of '{}' failed: {}", key, err);
                    failed_keys.push(key);
                }
            }
        }

        Ok(BatchOutcome {
            success_count,
            failed_keys,
        })
    }

    /// Bulk archive with the same aggregate semantics as [`batch_import`]:
    /// per-key outcomes, never all-or-nothing.
    ///
    /// [`batch_import`]: Database::batch_import
    pub fn batch_delete(&self, input: BatchDeleteInput) -> CoreResult<BatchOutcome> {
        self.require_app(input.app_id)?;

        let mut success_count = 0;
        let mut failed_keys = Vec::new();
        for key in input.keys {
            match self.delete_entry_by_key(input.app_id, input.environment, &key) {
                Ok(_) => success_count += 1,
                Err(err) => {
                    tracing::debug!("archive of '{}' failed: {}", key, err);
                    failed_keys.push(key);
                }
            }
        }

        Ok(BatchOutcome {
            success_count,
            failed_keys,
        })
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            publish_locks: self.publish_locks.clone(),
        }
    }
}

// ============================================================
// Row mapping and validation helpers
// ============================================================

const APP_COLUMNS: &str =
    "id, name, secret, enabled, auto_publish, inherits_from, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "id, app_id, environment, key, value, value_kind, group_label, version, status, created_at, updated_at";

fn app_from_row(row: &Row) -> rusqlite::Result<App> {
    Ok(App {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        secret: row.get(2)?,
        enabled: row.get::<_, i32>(3)? != 0,
        auto_publish: row.get::<_, i32>(4)? != 0,
        inherits_from: row.get::<_, Option<String>>(5)?.map(parse_uuid),
        created_at: parse_datetime(row.get::<_, String>(6)?),
        updated_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<ConfigEntry> {
    Ok(ConfigEntry {
        id: parse_uuid(row.get::<_, String>(0)?),
        app_id: parse_uuid(row.get::<_, String>(1)?),
        environment: Environment::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(Environment::Development),
        key: row.get(3)?,
        value: row.get(4)?,
        value_kind: ValueKind::from_str(&row.get::<_, String>(5)?).unwrap_or(ValueKind::Text),
        group_label: row.get(6)?,
        version: row.get(7)?,
        status: EntryStatus::from_str(&row.get::<_, String>(8)?).unwrap_or(EntryStatus::Init),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const MAX_KEY_LEN: usize = 256;

/// Keys are path-ish identifiers: letters, digits, `_`, `.`, `:` and `-`.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(CoreError::Validation(format!(
            "key must be 1..={MAX_KEY_LEN} characters"
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(CoreError::Validation(format!(
            "key '{key}' contains characters outside [A-Za-z0-9_.:-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys_pass() {
        for key in ["db.pool_size", "log:level", "feature-flag_2", "a"] {
            assert!(validate_key(key).is_ok(), "{key} should be valid");
        }
    }

    #[test]
    fn invalid_keys_fail() {
        for key in ["", "has space", "emoji🚀", "slash/y", &"x".repeat(257)] {
            assert!(validate_key(key).is_err(), "{key:?} should be invalid");
        }
    }
}
