//! Shared types for tidemark.
//!
//! This crate defines the ordering primitives used across the tidemark
//! workspace:
//!
//! - identifiers ([`ReplicaId`], [`Suffix`]),
//! - the change sequence number ([`Csn`]) and its total order,
//! - the per-replica [`CsnGenerator`] and its [`Clock`] sources,
//! - the per-naming-context vector clock ([`ServerState`]),
//! - the multi-domain resumption cookie ([`MultiDomainServerState`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod cookie;
mod csn;
mod error;
mod generator;
mod server_state;

pub use cookie::MultiDomainServerState;
pub use csn::{CSN_BYTES_LEN, CSN_TEXT_LEN, Csn, SEQNUM_OVERFLOW};
pub use error::{CookieError, DecodeError};
pub use generator::{Clock, CsnGenerator, ManualClock, SystemClock};
pub use server_state::ServerState;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier of a replica (one server's copy of the replicated data).
///
/// Every CSN carries the id of the replica that generated it, which breaks
/// ties between replicas that issued the same `(timestamp, seqnum)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// Wrap a raw replica id.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Return the raw value.
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl From<u16> for ReplicaId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(Self)
            .map_err(|_| DecodeError::InvalidReplicaId(s.to_string()))
    }
}

/// A naming context (replicated suffix DN) such as `o=example`.
///
/// Suffixes are trimmed and lowercased on construction so that cookies and
/// registry lookups compare them by value. A suffix may not be empty and may
/// not contain `;`, which separates cookie segments.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Suffix(String);

impl Suffix {
    /// Normalize and validate a suffix DN.
    pub fn new(dn: impl AsRef<str>) -> Result<Self, DecodeError> {
        let normalized = dn.as_ref().trim().to_lowercase();
        if normalized.is_empty() || normalized.contains(';') {
            return Err(DecodeError::InvalidSuffix(dn.as_ref().to_string()));
        }
        Ok(Self(normalized))
    }

    /// The normalized DN.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `dn` names this suffix or an entry below it.
    pub fn contains_dn(&self, dn: &str) -> bool {
        let dn = dn.trim().to_lowercase();
        dn == self.0 || dn.ends_with(&format!(",{}", self.0))
    }
}

impl TryFrom<String> for Suffix {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Suffix> for String {
    fn from(suffix: Suffix) -> Self {
        suffix.0
    }
}

impl FromStr for Suffix {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Suffix {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Suffix({})", self.0)
    }
}
