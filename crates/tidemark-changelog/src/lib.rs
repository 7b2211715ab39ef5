//! Per-naming-context change logs for a multi-master replica.
//!
//! Each naming context (suffix) a replica serves is a [`ReplicationDomain`]:
//! it stamps local updates with CSNs, applies updates received from other
//! replicas, tracks the resulting [`ServerState`](tidemark_types::ServerState)
//! and broadcasts every stored change to live readers. Changes and states are
//! persisted in a [`ChangelogStore`] (Fjall on disk, or in memory), which
//! also numbers every stored change in one replica-wide sequence.
//!
//! Domains are collected in an explicitly constructed [`DomainRegistry`].

mod domain;
mod error;
mod record;
mod registry;
mod store;

#[cfg(test)]
mod tests;

pub use domain::{DEFAULT_BROADCAST_CAPACITY, DomainOptions, ReplicationDomain};
pub use error::ChangelogError;
pub use record::{
    Change, ChangeNumberRecord, Modification, ModificationKind, Operation, UpdateRecord,
};
pub use registry::DomainRegistry;
pub use store::ChangelogStore;
