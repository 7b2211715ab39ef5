//! Parameters of a change-log session.

use std::collections::BTreeSet;
use std::time::Duration;

use tidemark_types::{MultiDomainServerState, Suffix};

use crate::error::EclError;
use crate::filter::TargetFilter;

/// Default budget for replaying stored history.
pub const DEFAULT_CATCH_UP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of changes read from a domain's log per store access.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// How a session treats history and new changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Replay history from the cookie, then complete.
    #[default]
    OneShot,
    /// Replay history from the cookie, then follow new changes until
    /// cancelled.
    Persistent,
    /// Follow changes made after the session opens; no history.
    ChangesOnly,
}

impl SearchMode {
    /// Whether the session keeps following changes after catch-up.
    pub fn is_persistent(self) -> bool {
        !matches!(self, SearchMode::OneShot)
    }
}

/// Change numbers a change-number search reads, both ends inclusive.
///
/// A `first` below the oldest indexed change number starts at the oldest.
/// Without `last` the range is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNumberRange {
    pub first: u64,
    pub last: Option<u64>,
}

impl ChangeNumberRange {
    /// Whether `change_number` is past the end of the range.
    pub fn is_past_end(&self, change_number: u64) -> bool {
        self.last.is_some_and(|last| change_number > last)
    }
}

/// A change-log search.
///
/// By default the search is positioned by its cookie. Setting a change-number
/// range instead reads the replica's change-number index; the cookie is then
/// ignored and entries carry their change number.
#[derive(Debug, Clone)]
pub struct EclRequest {
    pub(crate) cookie: MultiDomainServerState,
    pub(crate) change_numbers: Option<ChangeNumberRange>,
    pub(crate) mode: SearchMode,
    pub(crate) filter: TargetFilter,
    pub(crate) privileged: bool,
    pub(crate) excluded: BTreeSet<Suffix>,
    pub(crate) catch_up_timeout: Duration,
    pub(crate) batch_size: usize,
}

impl Default for EclRequest {
    fn default() -> Self {
        Self {
            cookie: MultiDomainServerState::new(),
            change_numbers: None,
            mode: SearchMode::default(),
            filter: TargetFilter::default(),
            privileged: false,
            excluded: BTreeSet::new(),
            catch_up_timeout: DEFAULT_CATCH_UP_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl EclRequest {
    /// A one-shot search from the start of every log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a parsed cookie.
    pub fn with_cookie(mut self, cookie: MultiDomainServerState) -> Self {
        self.cookie = cookie;
        self
    }

    /// Resume from cookie text as handed out with a previous entry.
    pub fn with_cookie_str(self, cookie: &str) -> Result<Self, EclError> {
        let cookie = MultiDomainServerState::parse(cookie)?;
        Ok(self.with_cookie(cookie))
    }

    /// Read by change number, from `first` on.
    pub fn from_change_number(mut self, first: u64) -> Self {
        self.change_numbers = Some(ChangeNumberRange { first, last: None });
        self
    }

    /// Read by change number, from `first` through `last`. The search
    /// completes after `last`, even when persistent.
    pub fn with_change_number_range(mut self, first: u64, last: u64) -> Self {
        self.change_numbers = Some(ChangeNumberRange {
            first,
            last: Some(last),
        });
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: TargetFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Allow the session to read private naming contexts.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Leave `suffix` out of the session.
    pub fn exclude(mut self, suffix: Suffix) -> Self {
        self.excluded.insert(suffix);
        self
    }

    pub fn with_catch_up_timeout(mut self, timeout: Duration) -> Self {
        self.catch_up_timeout = timeout;
        self
    }

    /// Changes read per store access. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn cookie(&self) -> &MultiDomainServerState {
        &self.cookie
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// Change-number range of a change-number search.
    pub fn change_numbers(&self) -> Option<ChangeNumberRange> {
        self.change_numbers
    }

    /// Whether `suffix` may be read by this request: not excluded, and not
    /// private unless the request is privileged.
    pub(crate) fn admits(&self, suffix: &Suffix, private: bool) -> bool {
        !self.excluded.contains(suffix) && (self.privileged || !private)
    }
}
