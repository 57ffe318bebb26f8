//! Publish and rollback: freezing drafts into immutable snapshots.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, Row};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::*;

use super::{parse_datetime, parse_uuid, Database};

/// Keyed critical sections: at most one publish (or rollback) per
/// (app, environment) at a time, without serializing unrelated scopes.
#[derive(Clone)]
pub(super) struct ScopeLocks {
    inner: Arc<DashMap<(Uuid, Environment), Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Non-blocking acquire: a second publisher for the same scope gets a
    /// conflict instead of interleaving with the first.
    fn acquire(&self, app_id: Uuid, env: Environment) -> CoreResult<OwnedMutexGuard<()>> {
        let lock = self
            .inner
            .entry((app_id, env))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().map_err(|_| CoreError::PublishBusy {
            app_id,
            environment: env,
        })
    }
}

/// A change slated for the next snapshot of a scope.
struct PendingChange {
    entry_id: Uuid,
    key: String,
    entry_version: i64,
    old_value: Option<String>,
    new_value: Option<String>,
}

impl Database {
    // ============================================================
    // Publish
    // ============================================================

    /// Freeze every pending change of (app, environment) into one immutable
    /// snapshot.
    ///
    /// Change detection compares each entry's current value against the value
    /// recorded by its most recent diff; never-published entries always count
    /// as changed, and entries archived since the last publish produce
    /// tombstone diffs. The read-diff-allocate-write sequence runs in a
    /// single transaction under the scope lock, so a concurrent edit is
    /// either included whole or deferred whole to the next publish.
    pub fn publish(
        &self,
        app_id: Uuid,
        env: Environment,
        description: Option<String>,
        author: &str,
    ) -> CoreResult<PublishSnapshot> {
        self.require_app(app_id)?;
        let _guard = self.publish_locks.acquire(app_id, env)?;

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let snapshot = publish_in_tx(&tx, app_id, env, description, author, None)?;
        tx.commit()?;

        tracing::info!(
            "published snapshot v{} for app {} in {}",
            snapshot.version,
            app_id,
            env
        );
        Ok(snapshot)
    }

    // ============================================================
    // Rollback
    // ============================================================

    /// Restore a scope to the state captured by a past snapshot, recording
    /// the restore as a fresh publish so it is auditable and itself
    /// rollback-able.
    ///
    /// Every entry that had a published value as of the target snapshot is
    /// written back to that value (an administrative override that skips the
    /// optimistic-concurrency check but bumps the version); entries published
    /// *after* the target are archived. Unpublished drafts are left alone.
    /// Restore and the follow-up publish share one transaction: a rollback
    /// either fully happens and is recorded, or nothing changes.
    pub fn rollback(&self, snapshot_id: Uuid, author: &str) -> CoreResult<RollbackOutcome> {
        let target = self
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| CoreError::not_found("snapshot", snapshot_id))?;
        let _guard = self
            .publish_locks
            .acquire(target.app_id, target.environment)?;

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        // Archive-not-delete should guarantee every recorded diff still
        // resolves; defend against hard deletion anyway.
        for diff in diffs_in_tx(&tx, snapshot_id)? {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM config_entries WHERE id = ?",
                    [diff.entry_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(CoreError::UnresolvableDiff {
                    snapshot_id,
                    entry_id: diff.entry_id,
                });
            }
        }

        let published_ids = restore_state_in_tx(&tx, &target)?;
        let description = format!(
            "Rollback to version {} (snapshot {})",
            target.version, target.id
        );
        let snapshot = publish_in_tx(
            &tx,
            target.app_id,
            target.environment,
            Some(description),
            author,
            Some(&published_ids),
        )?;
        let restored = diffs_in_tx(&tx, snapshot.id)?.len();
        tx.commit()?;

        tracing::info!(
            "rolled back app {} in {} to v{}, recorded as v{}",
            target.app_id,
            target.environment,
            target.version,
            snapshot.version
        );
        Ok(RollbackOutcome {
            success: true,
            message: format!(
                "restored {} entries to the state of version {}",
                restored, target.version
            ),
            snapshot,
        })
    }

    // ============================================================
    // Snapshot queries
    // ============================================================

    pub fn list_snapshots(
        &self,
        app_id: Uuid,
        env: Environment,
    ) -> CoreResult<Vec<PublishSnapshot>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM publish_snapshots
             WHERE app_id = ? AND environment = ?
             ORDER BY version DESC"
        ))?;

        let snapshots = stmt
            .query_map((app_id.to_string(), env.as_str()), snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(snapshots)
    }

    pub fn get_snapshot(&self, id: Uuid) -> CoreResult<Option<PublishSnapshot>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let snapshot = conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM publish_snapshots WHERE id = ?"),
                [id.to_string()],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// A snapshot with its diffs, the old/new view the compare endpoint serves.
    pub fn compare_snapshot(&self, id: Uuid) -> CoreResult<SnapshotCompare> {
        let snapshot = self
            .get_snapshot(id)?
            .ok_or_else(|| CoreError::not_found("snapshot", id))?;
        let conn = self.conn.lock().expect("database lock poisoned");
        let diffs = diffs_in_tx(&conn, id)?;
        Ok(SnapshotCompare { snapshot, diffs })
    }

    /// Latest published version for a scope, `None` before the first publish.
    pub fn latest_snapshot_version(
        &self,
        app_id: Uuid,
        env: Environment,
    ) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let version = conn.query_row(
            "SELECT MAX(version) FROM publish_snapshots WHERE app_id = ? AND environment = ?",
            (app_id.to_string(), env.as_str()),
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(version)
    }
}

// ============================================================
// Transaction bodies
// ============================================================

fn publish_in_tx(
    conn: &Connection,
    app_id: Uuid,
    env: Environment,
    description: Option<String>,
    author: &str,
    only: Option<&HashSet<Uuid>>,
) -> CoreResult<PublishSnapshot> {
    let changes = pending_changes(conn, app_id, env, only)?;
    if changes.is_empty() {
        return Err(CoreError::NothingToPublish {
            app_id,
            environment: env,
        });
    }

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM publish_snapshots
         WHERE app_id = ? AND environment = ?",
        (app_id.to_string(), env.as_str()),
        |row| row.get(0),
    )?;

    let id = Uuid::new_v4();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO publish_snapshots (id, app_id, environment, version, description, author, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            id.to_string(),
            app_id.to_string(),
            env.as_str(),
            version,
            &description,
            author,
            now.to_rfc3339(),
        ),
    )?;

    for change in &changes {
        conn.execute(
            "INSERT INTO entry_diffs (id, snapshot_id, entry_id, key, old_value, new_value, entry_version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                id.to_string(),
                change.entry_id.to_string(),
                &change.key,
                &change.old_value,
                &change.new_value,
                change.entry_version,
            ),
        )?;

        // Drafts included in a snapshot go live.
        if change.new_value.is_some() {
            conn.execute(
                "UPDATE config_entries SET status = 'active', updated_at = ?
                 WHERE id = ? AND status = 'init'",
                (now.to_rfc3339(), change.entry_id.to_string()),
            )?;
        }
    }

    Ok(PublishSnapshot {
        id,
        app_id,
        environment: env,
        version,
        description,
        author: author.to_string(),
        created_at: now,
    })
}

/// Entries of a scope whose current state differs from their last published
/// state, optionally restricted to an id set. Archived entries that were
/// never published are skipped; archived entries already tombstoned are
/// skipped.
fn pending_changes(
    conn: &Connection,
    app_id: Uuid,
    env: Environment,
    only: Option<&HashSet<Uuid>>,
) -> CoreResult<Vec<PendingChange>> {
    let mut stmt = conn.prepare(
        "SELECT id, key, value, version, status FROM config_entries
         WHERE app_id = ? AND environment = ?
         ORDER BY key",
    )?;
    let rows = stmt
        .query_map((app_id.to_string(), env.as_str()), |row| {
            Ok((
                parse_uuid(row.get::<_, String>(0)?),
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut changes = Vec::new();
    for (entry_id, key, value, version, status) in rows {
        if only.is_some_and(|ids| !ids.contains(&entry_id)) {
            continue;
        }
        let archived = status == "archived";
        let last_published = last_published_value(conn, entry_id)?;
        let current = if archived { None } else { Some(value) };

        let changed = match &last_published {
            // Never published: live drafts are new, archived drafts vanish
            // without ever having been visible.
            None => !archived,
            Some(published) => *published != current,
        };
        if !changed {
            continue;
        }

        changes.push(PendingChange {
            entry_id,
            key,
            entry_version: version,
            old_value: last_published.flatten(),
            new_value: current,
        });
    }

    Ok(changes)
}

/// The `new_value` of the entry's most recent diff: `None` = never published,
/// `Some(None)` = last published as a tombstone.
fn last_published_value(conn: &Connection, entry_id: Uuid) -> CoreResult<Option<Option<String>>> {
    let value = conn
        .query_row(
            "SELECT d.new_value FROM entry_diffs d
             JOIN publish_snapshots s ON s.id = d.snapshot_id
             WHERE d.entry_id = ?
             ORDER BY s.version DESC
             LIMIT 1",
            [entry_id.to_string()],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value)
}

/// The entry's published value as of `snapshot_version`: the `new_value` of
/// its latest diff at or before that version.
fn value_as_of(
    conn: &Connection,
    entry_id: Uuid,
    snapshot_version: i64,
) -> CoreResult<Option<Option<String>>> {
    let value = conn
        .query_row(
            "SELECT d.new_value FROM entry_diffs d
             JOIN publish_snapshots s ON s.id = d.snapshot_id
             WHERE d.entry_id = ? AND s.version <= ?
             ORDER BY s.version DESC
             LIMIT 1",
            (entry_id.to_string(), snapshot_version),
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value)
}

/// Write the published state as of `target` back into the scope's entries.
///
/// Returns the ids of every ever-published entry in the scope; the caller
/// feeds this set to the follow-up publish so unpublished drafts do not ride
/// along in the rollback snapshot. Archives run before restores so a revived
/// row never races a doomed row for the live-key slot.
fn restore_state_in_tx(conn: &Connection, target: &PublishSnapshot) -> CoreResult<HashSet<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT id, key, value, status FROM config_entries
         WHERE app_id = ? AND environment = ?",
    )?;
    let rows = stmt
        .query_map(
            (target.app_id.to_string(), target.environment.as_str()),
            |row| {
                Ok((
                    parse_uuid(row.get::<_, String>(0)?),
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut published_ids = HashSet::new();
    let mut archives: Vec<Uuid> = Vec::new();
    let mut restores: Vec<(Uuid, String, String)> = Vec::new();

    for (entry_id, key, value, status) in rows {
        let as_of = value_as_of(conn, entry_id, target.version)?;
        match as_of {
            Some(Some(restored)) => {
                published_ids.insert(entry_id);
                if status != "active" || value != restored {
                    restores.push((entry_id, key, restored));
                }
            }
            // Tombstoned at the target, or published only later.
            Some(None) | None => {
                if last_published_value(conn, entry_id)?.is_some() {
                    published_ids.insert(entry_id);
                    if status != "archived" {
                        archives.push(entry_id);
                    }
                }
                // Never-published drafts are not part of published state
                // and stay untouched.
            }
        }
    }

    let now = Utc::now().to_rfc3339();
    for entry_id in archives {
        conn.execute(
            "UPDATE config_entries
             SET status = 'archived', version = version + 1, updated_at = ?
             WHERE id = ?",
            (&now, entry_id.to_string()),
        )?;
    }
    for (entry_id, key, restored) in restores {
        let result = conn.execute(
            "UPDATE config_entries
             SET value = ?, status = 'active', version = version + 1, updated_at = ?
             WHERE id = ?",
            (&restored, &now, entry_id.to_string()),
        );
        match result {
            Ok(_) => {}
            // Reviving an archived row can still collide with a live row
            // that took the key over after the target snapshot.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(CoreError::DuplicateKey { key });
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(published_ids)
}

fn diffs_in_tx(conn: &Connection, snapshot_id: Uuid) -> CoreResult<Vec<EntryDiff>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DIFF_COLUMNS} FROM entry_diffs WHERE snapshot_id = ? ORDER BY key"
    ))?;
    let diffs = stmt
        .query_map([snapshot_id.to_string()], diff_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(diffs)
}

const SNAPSHOT_COLUMNS: &str = "id, app_id, environment, version, description, author, created_at";

const DIFF_COLUMNS: &str = "id, snapshot_id, entry_id, key, old_value, new_value, entry_version";

fn snapshot_from_row(row: &Row) -> rusqlite::Result<PublishSnapshot> {
    Ok(PublishSnapshot {
        id: parse_uuid(row.get::<_, String>(0)?),
        app_id: parse_uuid(row.get::<_, String>(1)?),
        environment: Environment::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(Environment::Development),
        version: row.get(3)?,
        description: row.get(4)?,
        author: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

fn diff_from_row(row: &Row) -> rusqlite::Result<EntryDiff> {
    Ok(EntryDiff {
        id: parse_uuid(row.get::<_, String>(0)?),
        snapshot_id: parse_uuid(row.get::<_, String>(1)?),
        entry_id: parse_uuid(row.get::<_, String>(2)?),
        key: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        entry_version: row.get(6)?,
    })
}
