//! Change sequence numbers.
//!
//! A [`Csn`] stamps every update with `(timestamp, seqnum, replica id)`.
//! CSNs are totally ordered lexicographically on those three fields, which
//! is the order in which a naming context applies its updates.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DecodeError, ReplicaId};

/// Length of the textual form: 16 + 4 + 4 hex digits.
pub const CSN_TEXT_LEN: usize = 24;

/// Length of the byte form: 8 + 2 + 2 bytes, big-endian.
pub const CSN_BYTES_LEN: usize = 12;

/// Returned by [`Csn::diff_seqnum`] when two seqnums cannot be compared on
/// their own and the caller must fall back to full CSN comparison.
pub const SEQNUM_OVERFLOW: i32 = i32::MAX;

/// A change sequence number.
///
/// The derived ordering compares `timestamp`, then `seqnum`, then
/// `replica_id`, so field order here is load-bearing. `Option<Csn>` orders
/// `None` before any CSN, which matches "absence is earliest".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn {
    timestamp: u64,
    seqnum: u16,
    replica_id: ReplicaId,
}

impl Csn {
    /// Build a CSN from its parts.
    pub const fn new(timestamp: u64, seqnum: u16, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            seqnum,
            replica_id,
        }
    }

    /// Smallest CSN carrying the given timestamp. Every CSN issued at or
    /// after `timestamp` is newer-or-equal to it.
    pub const fn lower_bound(timestamp: u64) -> Self {
        Self::new(timestamp, 0, ReplicaId::new(0))
    }

    /// Wall-clock milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sequence number within the millisecond.
    pub fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// Replica that generated this CSN.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Compare two optional CSNs. `None` sorts before any CSN.
    pub fn compare(a: Option<&Csn>, b: Option<&Csn>) -> Ordering {
        a.cmp(&b)
    }

    /// Whether `self` is strictly older than `other`. Always false against
    /// `None`, which is infinitely old.
    pub fn older(&self, other: impl Into<Option<Csn>>) -> bool {
        match other.into() {
            Some(other) => *self < other,
            None => false,
        }
    }

    /// Whether `self` is older than or equal to `other`.
    pub fn older_or_equal(&self, other: impl Into<Option<Csn>>) -> bool {
        match other.into() {
            Some(other) => *self <= other,
            None => false,
        }
    }

    /// Whether `self` is strictly newer than `other`. Always true against
    /// `None`.
    pub fn newer(&self, other: impl Into<Option<Csn>>) -> bool {
        match other.into() {
            Some(other) => *self > other,
            None => true,
        }
    }

    /// Whether `self` is newer than or equal to `other`.
    pub fn newer_or_equal(&self, other: impl Into<Option<Csn>>) -> bool {
        match other.into() {
            Some(other) => *self >= other,
            None => true,
        }
    }

    /// Seqnum distance from `b` to `a` within the 16-bit counter space.
    ///
    /// Returns `a.seqnum - b.seqnum` only when `a` is strictly ahead without
    /// wrapping. When `b` is sequenced after `a` (including the exact
    /// wraparound `a.seqnum == b.seqnum + 1 mod 2^16`) the result is
    /// [`SEQNUM_OVERFLOW`]. Against `None` the distance is `a.seqnum`.
    pub fn diff_seqnum(a: &Csn, b: Option<&Csn>) -> i32 {
        let Some(b) = b else {
            return i32::from(a.seqnum);
        };

        match a.seqnum.cmp(&b.seqnum) {
            Ordering::Equal => 0,
            Ordering::Greater => i32::from(a.seqnum - b.seqnum),
            Ordering::Less => SEQNUM_OVERFLOW,
        }
    }

    /// Fixed-width, order-preserving text form (24 lowercase hex digits).
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse the text form produced by [`Csn::encode`].
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        if text.len() != CSN_TEXT_LEN || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeError::InvalidCsnText(text.to_string()));
        }

        let invalid = |_| DecodeError::InvalidCsnText(text.to_string());
        let timestamp = u64::from_str_radix(&text[..16], 16).map_err(invalid)?;
        let seqnum = u16::from_str_radix(&text[16..20], 16).map_err(invalid)?;
        let replica_id = u16::from_str_radix(&text[20..], 16).map_err(invalid)?;

        Ok(Self::new(timestamp, seqnum, ReplicaId::new(replica_id)))
    }

    /// Big-endian byte form; byte-wise order equals CSN order.
    pub fn to_bytes(&self) -> [u8; CSN_BYTES_LEN] {
        let mut out = [0u8; CSN_BYTES_LEN];
        out[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..10].copy_from_slice(&self.seqnum.to_be_bytes());
        out[10..].copy_from_slice(&self.replica_id.get().to_be_bytes());
        out
    }

    /// Parse the byte form produced by [`Csn::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let bytes: &[u8; CSN_BYTES_LEN] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidCsnLength(bytes.len()))?;

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        let seqnum = u16::from_be_bytes([bytes[8], bytes[9]]);
        let replica_id = u16::from_be_bytes([bytes[10], bytes[11]]);

        Ok(Self::new(
            u64::from_be_bytes(timestamp),
            seqnum,
            ReplicaId::new(replica_id),
        ))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:04x}",
            self.timestamp,
            self.seqnum,
            self.replica_id.get()
        )
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Csn({}.{}@{})",
            self.timestamp, self.seqnum, self.replica_id
        )
    }
}

impl FromStr for Csn {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
