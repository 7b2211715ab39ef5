//! Error types for the changelog crate.

use tidemark_types::{DecodeError, Suffix};

/// Errors that can occur during changelog operations.
#[derive(Debug, thiserror::Error)]
pub enum ChangelogError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored key or server state did not decode.
    #[error("corrupt changelog data: {0}")]
    Decode(#[from] DecodeError),

    /// A domain for this naming context is already registered.
    #[error("domain {0} already registered")]
    DomainExists(Suffix),

    /// No domain is registered for this naming context.
    #[error("unknown domain {0}")]
    UnknownDomain(Suffix),

    /// Domains of one registry must share a change log, since change
    /// numbers are given out per store.
    #[error("domain {0} uses a different change log than the registered domains")]
    StoreMismatch(Suffix),

    /// A published change targets an entry outside the domain's suffix.
    #[error("{dn:?} is not within naming context {suffix}")]
    OutsideSuffix {
        /// The rejected target DN.
        dn: String,
        /// The domain's naming context.
        suffix: Suffix,
    },
}

impl From<postcard::Error> for ChangelogError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
