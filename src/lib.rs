//! Beacon: a configuration distribution server.
//!
//! Configuration values are stored per application and environment, versioned
//! on every committed change, and served to runtime clients as an *effective*
//! map merged along the application inheritance chain. Edits accumulate as
//! drafts until a publish freezes them into an immutable snapshot; any past
//! snapshot can be rolled back, and the rollback is itself recorded as a new
//! publish. Connected clients are tracked in memory so operators can see who
//! is on which version.
//!
//! The crate is a library plus one server binary. The library splits into:
//!
//! - [`models`]: plain-data entities and request/response shapes.
//! - [`db`]: SQLite-backed storage: entry CRUD with optimistic concurrency,
//!   inheritance resolution, publish and rollback.
//! - [`registry`]: the in-memory registry of connected client sessions.
//! - [`api`]: the axum HTTP surface.
//! - [`error`]: the typed failure taxonomy shared by all of the above.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod registry;
