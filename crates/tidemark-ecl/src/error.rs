//! Error types for the external change log.

use std::time::Duration;

use tidemark_changelog::ChangelogError;
use tidemark_types::{CookieError, Suffix};

/// Errors that end or prevent a change-log session.
#[derive(Debug, thiserror::Error)]
pub enum EclError {
    /// The client-supplied cookie does not parse. No session is opened.
    #[error("malformed cookie: {0}")]
    MalformedCookie(#[from] CookieError),

    /// The cookie points before the oldest change still held for a naming
    /// context; the consumer must resynchronize from scratch.
    #[error("cookie too old for {suffix}: changes it has not seen were purged")]
    CookieTooOld {
        /// Naming context whose history was trimmed.
        suffix: Suffix,
    },

    /// Replaying stored history took longer than the session's budget.
    #[error("catch-up did not finish within {0:?}")]
    CatchUpTimeout(Duration),

    /// Reading the change log failed.
    #[error("changelog error: {0}")]
    Changelog(#[from] ChangelogError),
}
