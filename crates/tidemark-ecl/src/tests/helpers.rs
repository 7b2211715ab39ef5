//! Shared test utilities for tidemark-ecl tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use tidemark_changelog::{
    Change, ChangelogStore, DomainOptions, DomainRegistry, Operation, ReplicationDomain,
    UpdateRecord,
};
use tidemark_types::{Clock, Csn, ManualClock, ReplicaId, Suffix};

use crate::entry::{EclEntry, EclEvent};
use crate::session::EclSession;

pub fn suffix(dn: &str) -> Suffix {
    Suffix::new(dn).unwrap()
}

/// An `Add` of `uid=<uid>` under `parent`.
pub fn add_user(parent: &str, uid: &str) -> Change {
    let mut attributes = BTreeMap::new();
    attributes.insert("uid".to_string(), vec![uid.to_string()]);
    Change::new(format!("uid={uid},{parent}"), Operation::Add { attributes })
}

/// A delete originated by another replica.
pub fn remote_delete(dn: &str, csn: Csn) -> UpdateRecord {
    UpdateRecord {
        csn,
        target_dn: dn.to_string(),
        target_uuid: None,
        initiator: None,
        operation: Operation::Delete,
    }
}

/// One replica hosting a set of domains over an in-memory change log.
pub struct TestReplica {
    pub registry: DomainRegistry,
    pub clock: Arc<ManualClock>,
    store: Arc<ChangelogStore>,
    replica_id: ReplicaId,
}

impl TestReplica {
    /// A replica serving the public naming contexts `suffixes`.
    pub fn new(replica: u16, suffixes: &[&str]) -> Self {
        let replica = Self {
            registry: DomainRegistry::new(),
            clock: Arc::new(ManualClock::new(1_000)),
            store: Arc::new(ChangelogStore::in_memory()),
            replica_id: ReplicaId::new(replica),
        };
        for dn in suffixes {
            replica.add_domain(dn, DomainOptions::default());
        }
        replica
    }

    pub fn add_domain(&self, dn: &str, options: DomainOptions) -> Arc<ReplicationDomain> {
        let domain = Arc::new(
            ReplicationDomain::open(
                suffix(dn),
                self.replica_id,
                Arc::clone(&self.store),
                self.clock.clone() as Arc<dyn Clock>,
                options,
            )
            .unwrap(),
        );
        self.registry.register(Arc::clone(&domain)).unwrap();
        domain
    }

    pub fn domain(&self, dn: &str) -> Arc<ReplicationDomain> {
        self.registry.get(&suffix(dn)).unwrap()
    }

    /// Publish a user add under `dn`, one millisecond after the previous.
    pub fn publish(&self, dn: &str, uid: &str) -> UpdateRecord {
        self.clock.advance(1);
        self.domain(dn).publish(add_user(dn, uid)).unwrap()
    }
}

/// Drain a one-shot session until `Done`.
pub async fn collect(session: &mut EclSession) -> Vec<EclEntry> {
    let mut entries = Vec::new();
    loop {
        match session.next().await.unwrap() {
            EclEvent::Change(entry) => entries.push(entry),
            EclEvent::Done => return entries,
            EclEvent::Cancelled => panic!("session cancelled before completion"),
        }
    }
}

/// Next event, which must be a change.
pub async fn next_change(session: &mut EclSession) -> EclEntry {
    match session.next().await.unwrap() {
        EclEvent::Change(entry) => entry,
        other => panic!("expected a change, got {other:?}"),
    }
}
