//! Change-log entries handed to consumers.

use std::fmt::Write as _;

use tidemark_changelog::{Modification, ModificationKind, Operation, UpdateRecord};
use tidemark_types::{MultiDomainServerState, ReplicaId, Suffix};

/// Attribute carrying the initiator of an add.
const CREATORS_NAME: &str = "creatorsname";
/// Attribute carrying the initiator of a modify.
const MODIFIERS_NAME: &str = "modifiersname";

/// What [`EclSession::next`](crate::EclSession::next) yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EclEvent {
    /// One update, in merge order.
    Change(EclEntry),
    /// A one-shot search has replayed everything.
    Done,
    /// The session was cancelled or closed.
    Cancelled,
}

/// One update as seen through the external change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EclEntry {
    /// Naming context the update belongs to.
    pub suffix: Suffix,
    /// The update itself.
    pub record: UpdateRecord,
    /// Session cookie after this update. Handing it back resumes right after
    /// this entry.
    pub cookie: MultiDomainServerState,
    /// Position in the replica's change-number index, for entries read by
    /// change number.
    pub change_number: Option<u64>,
}

impl EclEntry {
    /// Replica that originated the update.
    pub fn replica_id(&self) -> ReplicaId {
        self.record.replica_id()
    }

    /// The entry as a change-log directory entry: attribute name and value
    /// pairs, in a stable order. Optional attributes are left out when the
    /// update does not carry them.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let record = &self.record;
        let mut attrs = Vec::new();
        if let Some(number) = self.change_number {
            attrs.push(("changeNumber", number.to_string()));
        }
        attrs.extend([
            ("changeType", record.operation.change_type().to_string()),
            ("targetDN", record.target_dn.clone()),
            ("replicationCSN", record.csn.to_string()),
            ("replicaIdentifier", record.replica_id().to_string()),
            ("changeLogCookie", self.cookie.to_string()),
        ]);

        if let Some(uuid) = &record.target_uuid {
            attrs.push(("targetEntryUUID", uuid.clone()));
        }
        if let Some(initiator) = self.initiator() {
            attrs.push(("changeInitiatorsName", initiator));
        }

        match &record.operation {
            Operation::Add { attributes } => {
                let mut ldif = String::new();
                for (name, values) in attributes {
                    for value in values {
                        let _ = writeln!(ldif, "{name}: {value}");
                    }
                }
                attrs.push(("changes", ldif));
            }
            Operation::Delete => {}
            Operation::Modify { modifications } => {
                attrs.push(("changes", modifications_ldif(modifications)));
            }
            Operation::ModifyDn {
                new_rdn,
                new_superior,
                delete_old_rdn,
            } => {
                attrs.push(("newRDN", new_rdn.clone()));
                if let Some(superior) = new_superior {
                    attrs.push(("newSuperior", superior.clone()));
                }
                attrs.push(("deleteOldRDN", delete_old_rdn.to_string()));
            }
        }

        attrs
    }

    /// Value of attribute `name`, if present.
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Explicit initiator, else the creator of an added entry or the
    /// replaced modifier of a modified one.
    fn initiator(&self) -> Option<String> {
        if let Some(initiator) = &self.record.initiator {
            return Some(initiator.clone());
        }

        match &self.record.operation {
            Operation::Add { attributes } => attributes
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(CREATORS_NAME))
                .and_then(|(_, values)| values.first().cloned()),
            Operation::Modify { modifications } => modifications
                .iter()
                .find(|m| {
                    m.kind == ModificationKind::Replace
                        && m.attribute.eq_ignore_ascii_case(MODIFIERS_NAME)
                })
                .and_then(|m| m.values.first().cloned()),
            _ => None,
        }
    }
}

fn modifications_ldif(modifications: &[Modification]) -> String {
    let mut ldif = String::new();
    for m in modifications {
        let _ = writeln!(ldif, "{}: {}", m.kind, m.attribute);
        for value in &m.values {
            let _ = writeln!(ldif, "{}: {value}", m.attribute);
        }
        ldif.push_str("-\n");
    }
    ldif
}
