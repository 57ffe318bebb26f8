//! Effective-configuration resolution along the app inheritance chain.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::Environment;

use super::{parse_uuid, Database};

/// Hard cap on the ancestor chain. Cycles are rejected when `inherits_from`
/// is written, so hitting this cap means the graph is corrupted or
/// pathologically deep; either way resolution refuses rather than looping.
pub const MAX_INHERITANCE_DEPTH: usize = 32;

/// One link of an ancestor chain, target-first.
#[derive(Debug)]
pub(super) struct ChainLink {
    pub id: Uuid,
    pub enabled: bool,
}

impl Database {
    /// Merge the active entries of `app_id`'s ancestor chain into the
    /// effective key→value map for one environment.
    ///
    /// The chain is walked from the root down to the target app, so a more
    /// specific (closer to the target) level always overwrites an ancestor's
    /// value for the same key. Only `active` entries participate: drafts
    /// (`init`) are invisible to clients until published, and archived
    /// entries are gone from the live view. Disabled ancestors contribute
    /// nothing; a disabled target cannot be resolved at all.
    pub fn resolve_effective(
        &self,
        app_id: Uuid,
        env: Environment,
    ) -> CoreResult<BTreeMap<String, String>> {
        let target = self.require_app(app_id)?;
        if !target.enabled {
            return Err(CoreError::Validation(format!(
                "app '{}' is disabled",
                target.name
            )));
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let chain = ancestor_chain(&conn, app_id)?;

        let mut effective = BTreeMap::new();
        // Root first, target last: later inserts win.
        for link in chain.iter().rev() {
            if !link.enabled {
                continue;
            }
            let mut stmt = conn.prepare(
                "SELECT key, value FROM config_entries
                 WHERE app_id = ? AND environment = ? AND status = 'active'",
            )?;
            let rows = stmt.query_map((link.id.to_string(), env.as_str()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, value) = row?;
                effective.insert(key, value);
            }
        }

        Ok(effective)
    }
}

/// Walk `inherits_from` links upward from `start`, target-first, bounded by
/// [`MAX_INHERITANCE_DEPTH`]. Parent pointers are followed as stored ids; a
/// dangling pointer simply ends the chain.
pub(super) fn ancestor_chain(conn: &Connection, start: Uuid) -> CoreResult<Vec<ChainLink>> {
    let mut chain = Vec::new();
    let mut current = Some(start);

    while let Some(id) = current {
        if chain.len() >= MAX_INHERITANCE_DEPTH {
            return Err(CoreError::InheritanceTooDeep {
                app_id: start,
                depth: MAX_INHERITANCE_DEPTH,
            });
        }
        let row = conn
            .query_row(
                "SELECT enabled, inherits_from FROM apps WHERE id = ?",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)? != 0,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;

        let Some((enabled, parent)) = row else {
            break;
        };
        chain.push(ChainLink { id, enabled });
        current = parent.map(parse_uuid);
    }

    Ok(chain)
}
