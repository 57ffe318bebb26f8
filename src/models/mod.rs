//! Domain models for Beacon.
//!
//! # Core Concepts
//!
//! ## Durable Entities
//!
//! - [`App`]: a configuration namespace. Apps form a forest via
//!   `inherits_from`; an app's effective configuration is resolved along its
//!   ancestor chain with closest-descendant-wins precedence.
//! - [`ConfigEntry`]: one configuration value, keyed by (app, environment,
//!   key), versioned on every committed mutation. Entries are archived, never
//!   physically deleted, so publish history stays resolvable.
//! - [`PublishSnapshot`] + [`EntryDiff`]: the immutable record of one publish
//!   event. A snapshot's diffs are sufficient to restore the prior state.
//!
//! ## Ephemeral Entities
//!
//! - [`ClientSession`]: a connected runtime client. Lives only in process
//!   memory; a restart loses all sessions and clients simply reconnect.

mod app;
mod client;
mod entry;
mod snapshot;

pub use app::*;
pub use client::*;
pub use entry::*;
pub use snapshot::*;
