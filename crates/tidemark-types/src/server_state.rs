//! Per-naming-context vector clock.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CSN_BYTES_LEN, Csn, DecodeError, ReplicaId};

/// Length of the entry count heading the byte layout.
const COUNT_LEN: usize = 4;

/// Highest CSN applied to one naming context, per replica.
///
/// Entries only ever move forward: [`ServerState::update`] is monotone and
/// idempotent, which makes it safe under at-least-once delivery.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ServerState {
    csns: BTreeMap<ReplicaId, Csn>,
}

impl ServerState {
    /// An empty state (nothing seen from any replica).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` if it is newer than what is stored for its replica.
    ///
    /// Returns `true` if the state changed. `None` is always a no-op.
    pub fn update(&mut self, csn: impl Into<Option<Csn>>) -> bool {
        let Some(csn) = csn.into() else {
            return false;
        };

        match self.csns.get(&csn.replica_id()) {
            Some(stored) if !stored.older(csn) => false,
            _ => {
                self.csns.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Join every coordinate of `other` into this state. Returns `true` if
    /// any coordinate advanced.
    pub fn merge(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.iter() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// Highest CSN seen from `replica`, or `None` if never seen.
    pub fn csn(&self, replica: ReplicaId) -> Option<Csn> {
        self.csns.get(&replica).copied()
    }

    /// Whether `csn` is already reflected in this state, i.e. the stored CSN
    /// for its replica is newer than or equal to it.
    pub fn covers(&self, csn: &Csn) -> bool {
        self.csn(csn.replica_id())
            .is_some_and(|stored| stored.newer_or_equal(*csn))
    }

    /// Whether every coordinate of `other` is covered by this state.
    pub fn covers_state(&self, other: &ServerState) -> bool {
        other.iter().all(|csn| self.covers(csn))
    }

    /// Replace the contents with a copy of `other`.
    pub fn reload(&mut self, other: &ServerState) {
        self.csns.clone_from(&other.csns);
    }

    /// Copy of the coordinates strictly older than `bound`.
    pub fn duplicate_only_older_than(&self, bound: &Csn) -> ServerState {
        Self {
            csns: self
                .csns
                .iter()
                .filter(|(_, csn)| csn.older(*bound))
                .map(|(replica, csn)| (*replica, *csn))
                .collect(),
        }
    }

    /// Newest CSN across all replicas.
    pub fn max_csn(&self) -> Option<Csn> {
        self.csns.values().max().copied()
    }

    /// Whether no replica has been seen.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Number of replicas seen.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// CSNs ordered by replica id.
    pub fn iter(&self) -> impl Iterator<Item = &Csn> {
        self.csns.values()
    }

    /// Replica ids in ascending order.
    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.csns.keys().copied()
    }

    // ----- Encodings -----

    /// Byte layout: big-endian `u32` count followed by one 12-byte CSN per
    /// replica, ordered by replica id. The count is wider than a replica id
    /// so a state holding every replica id still encodes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COUNT_LEN + self.csns.len() * CSN_BYTES_LEN);
        buf.put_u32(self.csns.len() as u32);
        for csn in self.csns.values() {
            buf.put_slice(&csn.to_bytes());
        }
        buf.freeze()
    }

    /// Parse the layout produced by [`ServerState::to_bytes`].
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.remaining() < COUNT_LEN {
            return Err(DecodeError::Truncated {
                expected: COUNT_LEN,
                actual: bytes.remaining(),
            });
        }

        let count = bytes.get_u32() as usize;
        let expected = count.saturating_mul(CSN_BYTES_LEN);
        if bytes.remaining() < expected {
            return Err(DecodeError::Truncated {
                expected: COUNT_LEN.saturating_add(expected),
                actual: COUNT_LEN + bytes.remaining(),
            });
        }

        let mut state = Self::new();
        for _ in 0..count {
            let csn = Csn::from_bytes(&bytes[..CSN_BYTES_LEN])?;
            bytes.advance(CSN_BYTES_LEN);
            state.insert_unique(csn)?;
        }

        if bytes.has_remaining() {
            return Err(DecodeError::TrailingBytes(bytes.remaining()));
        }
        Ok(state)
    }

    /// One `"<replicaId>=<csn>"` string per replica, ordered by replica id.
    pub fn to_string_set(&self) -> Vec<String> {
        self.csns
            .iter()
            .map(|(replica, csn)| format!("{replica}={csn}"))
            .collect()
    }

    /// Parse the view produced by [`ServerState::to_string_set`]. Entry
    /// order does not matter.
    pub fn from_string_set<I, S>(entries: I) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (replica, csn) = entry
                .split_once('=')
                .ok_or_else(|| DecodeError::InvalidStateEntry(entry.to_string()))?;
            let replica: ReplicaId = replica.parse()?;
            let csn = Csn::decode(csn.trim())?;
            if csn.replica_id() != replica {
                return Err(DecodeError::ReplicaMismatch {
                    entry: entry.to_string(),
                });
            }
            state.insert_unique(csn)?;
        }
        Ok(state)
    }

    fn insert_unique(&mut self, csn: Csn) -> Result<(), DecodeError> {
        if self.csns.insert(csn.replica_id(), csn).is_some() {
            return Err(DecodeError::DuplicateReplica(csn.replica_id()));
        }
        Ok(())
    }
}

/// CSNs separated by single spaces, ordered by replica id. This is the form
/// embedded in cookies.
impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, csn) in self.csns.values().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.csns.values()).finish()
    }
}

impl FromStr for ServerState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = Self::new();
        for token in s.split_whitespace() {
            state.insert_unique(Csn::decode(token)?)?;
        }
        Ok(state)
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<T: IntoIterator<Item = Csn>>(iter: T) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}
