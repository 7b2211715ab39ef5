//! Registry of the replication domains hosted by one replica.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tidemark_types::{MultiDomainServerState, Suffix};
use tracing::info;

use crate::domain::ReplicationDomain;
use crate::error::ChangelogError;
use crate::record::ChangeNumberRecord;
use crate::store::ChangelogStore;

/// The set of naming contexts a replica serves, keyed by suffix.
///
/// Constructed explicitly and shared by `Arc`; change-log sessions consult it
/// when they open. Every registered domain writes to the same
/// [`ChangelogStore`], whose change-number index the registry exposes.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: RwLock<BTreeMap<Suffix, Arc<ReplicationDomain>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain. Fails if its suffix is already registered or if it
    /// writes to another store than the registered domains.
    pub fn register(&self, domain: Arc<ReplicationDomain>) -> Result<(), ChangelogError> {
        let mut domains = self.domains.write().expect("registry lock poisoned");
        let suffix = domain.suffix().clone();
        if domains.contains_key(&suffix) {
            return Err(ChangelogError::DomainExists(suffix));
        }
        if let Some(other) = domains.values().next() {
            if !Arc::ptr_eq(other.store(), domain.store()) {
                return Err(ChangelogError::StoreMismatch(suffix));
            }
        }

        info!(suffix = %suffix, "registered domain");
        domains.insert(suffix, domain);
        Ok(())
    }

    /// Remove and return the domain for `suffix`.
    pub fn unregister(&self, suffix: &Suffix) -> Option<Arc<ReplicationDomain>> {
        let removed = self
            .domains
            .write()
            .expect("registry lock poisoned")
            .remove(suffix);
        if removed.is_some() {
            info!(suffix = %suffix, "unregistered domain");
        }
        removed
    }

    pub fn get(&self, suffix: &Suffix) -> Option<Arc<ReplicationDomain>> {
        self.domains
            .read()
            .expect("registry lock poisoned")
            .get(suffix)
            .cloned()
    }

    /// Domain for `suffix`, or [`ChangelogError::UnknownDomain`].
    pub fn require(&self, suffix: &Suffix) -> Result<Arc<ReplicationDomain>, ChangelogError> {
        self.get(suffix)
            .ok_or_else(|| ChangelogError::UnknownDomain(suffix.clone()))
    }

    /// All domains, ordered by suffix.
    pub fn domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.domains
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn suffixes(&self) -> Vec<Suffix> {
        self.domains
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.domains.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The store shared by the registered domains.
    pub fn store(&self) -> Option<Arc<ChangelogStore>> {
        self.domains
            .read()
            .expect("registry lock poisoned")
            .values()
            .next()
            .map(|d| Arc::clone(d.store()))
    }

    /// Oldest change number still indexed, 0 when there is none.
    pub fn first_change_number(&self) -> Result<u64, ChangelogError> {
        match self.store() {
            Some(store) => store.first_change_number(),
            None => Ok(0),
        }
    }

    /// Newest change number given out, 0 when there is none.
    pub fn last_change_number(&self) -> Result<u64, ChangelogError> {
        match self.store() {
            Some(store) => store.last_change_number(),
            None => Ok(0),
        }
    }

    /// Up to `limit` index records from change number `first` on.
    pub fn change_numbers_from(
        &self,
        first: u64,
        limit: usize,
    ) -> Result<Vec<ChangeNumberRecord>, ChangelogError> {
        match self.store() {
            Some(store) => store.change_numbers_from(first, limit),
            None => Ok(Vec::new()),
        }
    }

    /// Cookie positioned after the newest change of every domain: resuming
    /// from it yields only changes applied later.
    pub fn newest_cookie(&self) -> MultiDomainServerState {
        let mut cookie = MultiDomainServerState::new();
        for domain in self.domains() {
            cookie.set(domain.suffix().clone(), domain.server_state());
        }
        cookie
    }
}
