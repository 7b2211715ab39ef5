//! CSN-stamped update records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tidemark_types::{Csn, ReplicaId, Suffix};

/// One update applied to a naming context, stamped with the CSN of the
/// replica that originated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Position of this update in the naming context's total order.
    pub csn: Csn,
    /// DN of the entry the update targets.
    pub target_dn: String,
    /// Stable identifier of the target entry, if known.
    pub target_uuid: Option<String>,
    /// DN of the client that initiated the update, if known.
    pub initiator: Option<String>,
    /// What the update does.
    pub operation: Operation,
}

impl UpdateRecord {
    /// Replica that originated the update.
    pub fn replica_id(&self) -> ReplicaId {
        self.csn.replica_id()
    }
}

/// Entry of the replica-wide change-number index: the `change_number`-th
/// change stored on this replica, across every naming context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNumberRecord {
    pub change_number: u64,
    /// Naming context of the change.
    pub suffix: Suffix,
    /// CSN of the change within its naming context.
    pub csn: Csn,
}

/// The kind of update and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create an entry.
    Add {
        /// Attribute name → values of the new entry.
        attributes: BTreeMap<String, Vec<String>>,
    },
    /// Remove an entry.
    Delete,
    /// Change attributes of an entry.
    Modify {
        /// Modifications in application order.
        modifications: Vec<Modification>,
    },
    /// Rename or move an entry.
    ModifyDn {
        /// New relative DN.
        new_rdn: String,
        /// New parent DN, if the entry moves.
        new_superior: Option<String>,
        /// Whether the old RDN values are removed from the entry.
        delete_old_rdn: bool,
    },
}

impl Operation {
    /// Change type as exposed in change-log entries.
    pub fn change_type(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Delete => "delete",
            Operation::Modify { .. } => "modify",
            Operation::ModifyDn { .. } => "modrdn",
        }
    }
}

/// A single attribute change inside [`Operation::Modify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationKind,
    pub attribute: String,
    pub values: Vec<String>,
}

impl Modification {
    /// Build a modification of `kind` on `attribute`.
    pub fn new<I, S>(kind: ModificationKind, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationKind {
    Add,
    Delete,
    Replace,
    Increment,
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModificationKind::Add => "add",
            ModificationKind::Delete => "delete",
            ModificationKind::Replace => "replace",
            ModificationKind::Increment => "increment",
        })
    }
}

/// A locally originated update before it is stamped with a CSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub target_dn: String,
    pub target_uuid: Option<String>,
    pub initiator: Option<String>,
    pub operation: Operation,
}

impl Change {
    /// A change of `operation` on `target_dn`.
    pub fn new(target_dn: impl Into<String>, operation: Operation) -> Self {
        Self {
            target_dn: target_dn.into(),
            target_uuid: None,
            initiator: None,
            operation,
        }
    }

    /// Set the target entry UUID.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.target_uuid = Some(uuid.into());
        self
    }

    /// Set the initiator DN.
    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }

    /// Stamp the change with `csn`.
    pub(crate) fn into_record(self, csn: Csn) -> UpdateRecord {
        UpdateRecord {
            csn,
            target_dn: self.target_dn,
            target_uuid: self.target_uuid,
            initiator: self.initiator,
            operation: self.operation,
        }
    }
}
