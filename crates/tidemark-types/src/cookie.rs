//! Multi-domain resumption cookie.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;

use crate::{CookieError, Csn, ServerState, Suffix};

/// One [`ServerState`] per naming context.
///
/// The text form is the cookie handed to change-log consumers:
/// `"<suffix>:<csn> <csn> ...;"` repeated for every naming context, sorted
/// by suffix. Each segment carries a trailing `;`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MultiDomainServerState {
    domains: BTreeMap<Suffix, ServerState>,
}

impl MultiDomainServerState {
    /// An empty cookie: start of every naming context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse cookie text.
    ///
    /// Segments are split on `;` and each segment on its last `:`, so the
    /// suffix DN itself may contain colons. Empty segments are skipped and an
    /// empty state (`"o=a:;"`) denotes the start of that naming context. A
    /// naming context named twice is rejected.
    pub fn parse(text: &str) -> Result<Self, CookieError> {
        let mut domains = BTreeMap::new();

        for segment in text.split(';') {
            if segment.trim().is_empty() {
                continue;
            }

            let (suffix, state) =
                segment
                    .rsplit_once(':')
                    .ok_or_else(|| CookieError::MissingSeparator {
                        segment: segment.to_string(),
                    })?;

            let suffix = Suffix::new(suffix).map_err(|source| CookieError::InvalidSuffix {
                segment: segment.to_string(),
                source,
            })?;
            let state: ServerState =
                state
                    .parse()
                    .map_err(|source| CookieError::InvalidState {
                        segment: segment.to_string(),
                        source,
                    })?;

            match domains.entry(suffix) {
                Entry::Occupied(entry) => {
                    return Err(CookieError::DuplicateSuffix(entry.key().clone()));
                }
                Entry::Vacant(entry) => {
                    entry.insert(state);
                }
            }
        }

        Ok(Self { domains })
    }

    /// Whether both cookies hold the same naming contexts with equal states.
    pub fn equals_to(&self, other: &MultiDomainServerState) -> bool {
        self == other
    }

    /// Advance the state of `suffix` with `csn`. Returns `true` if the cookie
    /// changed.
    pub fn update(&mut self, suffix: &Suffix, csn: Csn) -> bool {
        match self.domains.get_mut(suffix) {
            Some(state) => state.update(csn),
            None => {
                self.domains
                    .insert(suffix.clone(), std::iter::once(csn).collect());
                true
            }
        }
    }

    /// Merge a whole server state into the entry for `suffix`.
    pub fn update_state(&mut self, suffix: &Suffix, state: &ServerState) -> bool {
        let entry = self.domains.entry(suffix.clone()).or_default();
        entry.merge(state)
    }

    /// Replace the entry for `suffix`.
    pub fn set(&mut self, suffix: Suffix, state: ServerState) {
        self.domains.insert(suffix, state);
    }

    /// State recorded for `suffix`.
    pub fn get(&self, suffix: &Suffix) -> Option<&ServerState> {
        self.domains.get(suffix)
    }

    /// Drop the entry for `suffix`.
    pub fn remove(&mut self, suffix: &Suffix) -> Option<ServerState> {
        self.domains.remove(suffix)
    }

    /// Naming contexts present, in ascending order.
    pub fn suffixes(&self) -> impl Iterator<Item = &Suffix> {
        self.domains.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Suffix, &ServerState)> {
        self.domains.iter()
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (suffix, state) in &self.domains {
            write!(f, "{suffix}:{state};")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.domains.iter()).finish()
    }
}

impl FromStr for MultiDomainServerState {
    type Err = CookieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
