//! Tests for the changelog crate.


use std::collections::BTreeMap;
use std::sync::Arc;

use tidemark_types::{Clock, Csn, ManualClock, ReplicaId, Suffix};

use crate::domain::{DomainOptions, ReplicationDomain};
use crate::record::{Change, Operation, UpdateRecord};
use crate::store::ChangelogStore;

fn suffix(dn: &str) -> Suffix {
    Suffix::new(dn).unwrap()
}

fn csn(timestamp: u64, seqnum: u16, replica: u16) -> Csn {
    Csn::new(timestamp, seqnum, ReplicaId::new(replica))
}

/// An `Add` of `uid=<uid>` under `parent`.
fn add_user(parent: &str, uid: &str) -> Change {
    let mut attributes = BTreeMap::new();
    attributes.insert("objectClass".to_string(), vec!["person".to_string()]);
    attributes.insert("uid".to_string(), vec![uid.to_string()]);
    Change::new(format!("uid={uid},{parent}"), Operation::Add { attributes })
}

/// A record as it would arrive from another server.
fn remote_record(dn: &str, csn: Csn) -> UpdateRecord {
    UpdateRecord {
        csn,
        target_dn: dn.to_string(),
        target_uuid: None,
        initiator: None,
        operation: Operation::Delete,
    }
}

/// Open a domain over `store` driven by a manual clock.
fn test_domain(
    dn: &str,
    replica: u16,
    store: &Arc<ChangelogStore>,
    clock: &Arc<ManualClock>,
) -> ReplicationDomain {
    ReplicationDomain::open(
        suffix(dn),
        ReplicaId::new(replica),
        Arc::clone(store),
        clock.clone() as Arc<dyn Clock>,
        DomainOptions::default(),
    )
    .unwrap()
}
