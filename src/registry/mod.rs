//! In-memory registry of connected runtime clients.
//!
//! The registry is observability and notification-routing state, not
//! configuration state: nothing here is persisted, a process restart drops
//! every session, and clients are expected to reconnect and re-heartbeat.
//! All operations are plain concurrent-map operations and never fail.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::*;

/// Heartbeat age beyond which a session is reported as possibly
/// disconnected. Classification is computed lazily at query time; the query
/// path never evicts.
const STALE_AFTER_SECS: i64 = 60;

/// Tracks which client connections are subscribed to which app+environment,
/// and which snapshot version each one last applied.
///
/// Keyed by connection id in a [`DashMap`], so connect, heartbeat,
/// disconnect and query interleave freely across connections without a
/// global lock.
#[derive(Clone)]
pub struct ClientRegistry {
    sessions: Arc<DashMap<String, ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a session. Reconnecting with an existing connection id
    /// replaces the old session wholesale.
    pub fn connect(&self, input: ConnectInput) {
        let now = Utc::now();
        let session = ClientSession {
            connection_id: input.connection_id.clone(),
            client_id: input.client_id,
            app_id: input.app_id,
            environment: input.environment,
            version: None,
            host: input.host,
            address: input.address,
            build_version: input.build_version,
            connected_at: now,
            last_heartbeat: now,
        };
        tracing::debug!(
            "client {} connected to app {} ({})",
            session.client_id,
            session.app_id,
            session.environment
        );
        self.sessions.insert(input.connection_id, session);
    }

    /// Refresh a session's last-active time and applied version. Returns
    /// false for an unknown connection id (e.g. one evicted after a long
    /// silence); the client should reconnect.
    pub fn heartbeat(&self, connection_id: &str, version: Option<i64>) -> bool {
        match self.sessions.get_mut(connection_id) {
            Some(mut session) => {
                session.last_heartbeat = Utc::now();
                if version.is_some() {
                    session.version = version;
                }
                true
            }
            None => false,
        }
    }

    /// Remove a session. Returns false if the connection id was unknown.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        self.sessions.remove(connection_id).is_some()
    }

    /// Filterable listing with lazy liveness classification.
    pub fn query(
        &self,
        app_id: Option<Uuid>,
        env: Option<Environment>,
    ) -> Vec<(ClientSession, SessionLiveness)> {
        let stale_cutoff = Utc::now() - Duration::seconds(STALE_AFTER_SECS);
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| app_id.is_none_or(|id| entry.app_id == id))
            .filter(|entry| env.is_none_or(|e| entry.environment == e))
            .map(|entry| {
                let liveness = if entry.last_heartbeat < stale_cutoff {
                    SessionLiveness::PossiblyDisconnected
                } else {
                    SessionLiveness::Active
                };
                (entry.value().clone(), liveness)
            })
            .collect();
        sessions.sort_by(|a, b| a.0.connected_at.cmp(&b.0.connected_at));
        sessions
    }

    pub fn stats(&self) -> RegistryStats {
        let mut clients = std::collections::HashSet::new();
        let mut per_app: HashMap<Uuid, (usize, std::collections::HashSet<Environment>)> =
            HashMap::new();

        let mut total = 0;
        for entry in self.sessions.iter() {
            total += 1;
            clients.insert(entry.client_id.clone());
            let slot = per_app.entry(entry.app_id).or_default();
            slot.0 += 1;
            slot.1.insert(entry.environment);
        }

        let mut by_app: Vec<AppConnections> = per_app
            .into_iter()
            .map(|(app_id, (connection_count, envs))| AppConnections {
                app_id,
                connection_count,
                environment_count: envs.len(),
            })
            .collect();
        by_app.sort_by(|a, b| b.connection_count.cmp(&a.connection_count));

        RegistryStats {
            total_connections: total,
            unique_apps: by_app.len(),
            unique_clients: clients.len(),
            by_app,
        }
    }

    /// Drop sessions whose last heartbeat is older than `max_age`.
    ///
    /// Operational hardening only: staleness reporting works without this,
    /// so the sweep can run at a lazy cadence.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_heartbeat >= cutoff);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            tracing::info!("evicted {} silent client sessions", evicted);
        }
        evicted
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
