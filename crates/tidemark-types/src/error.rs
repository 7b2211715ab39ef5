//! Error types for decoding CSNs, server states and cookies.

use crate::{ReplicaId, Suffix};

/// Errors produced when decoding a CSN, a [`ServerState`](crate::ServerState)
/// or one of the identifier types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// CSN text is not exactly 24 hexadecimal characters.
    #[error("invalid CSN {0:?}: expected 24 hexadecimal characters")]
    InvalidCsnText(String),

    /// CSN byte form has the wrong length.
    #[error("invalid CSN bytes: expected 12 bytes, got {0}")]
    InvalidCsnLength(usize),

    /// Byte input ended before the declared number of CSNs.
    #[error("truncated server state: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the header.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Bytes left over after the declared number of CSNs.
    #[error("{0} trailing bytes after server state")]
    TrailingBytes(usize),

    /// The same replica appears twice in one server state.
    #[error("duplicate replica {0} in server state")]
    DuplicateReplica(ReplicaId),

    /// Replica id is not a 16-bit unsigned integer.
    #[error("invalid replica id {0:?}")]
    InvalidReplicaId(String),

    /// String-set entry is not of the form `<replicaId>=<csn>`.
    #[error("invalid server state entry {0:?}")]
    InvalidStateEntry(String),

    /// String-set entry names a replica that differs from its CSN's replica.
    #[error("server state entry {entry:?} does not match its CSN replica")]
    ReplicaMismatch {
        /// The offending entry.
        entry: String,
    },

    /// Naming context is empty or contains `;`.
    #[error("invalid naming context {0:?}")]
    InvalidSuffix(String),
}

/// Errors produced when parsing a client-supplied resumption cookie.
///
/// A malformed cookie is rejected before any cursor is created; it never
/// silently resets a consumer to the start of the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieError {
    /// Segment has no `:` between naming context and state.
    #[error("cookie segment {segment:?} has no ':' separator")]
    MissingSeparator {
        /// The offending segment.
        segment: String,
    },

    /// Segment names an invalid naming context.
    #[error("cookie segment {segment:?}: {source}")]
    InvalidSuffix {
        /// The offending segment.
        segment: String,
        /// Why the suffix was rejected.
        #[source]
        source: DecodeError,
    },

    /// Segment carries a state that does not decode.
    #[error("cookie segment {segment:?}: {source}")]
    InvalidState {
        /// The offending segment.
        segment: String,
        /// Why the state was rejected.
        #[source]
        source: DecodeError,
    },

    /// The same naming context appears in two segments.
    #[error("duplicate naming context {0} in cookie")]
    DuplicateSuffix(Suffix),
}
