//! Target-DN filtering of change-log entries.

use std::fmt;
use std::sync::Arc;

use tidemark_changelog::UpdateRecord;

/// Which updates a session emits.
///
/// Rejected updates are still consumed: they advance the session cookie so a
/// resumed session does not revisit them.
#[derive(Clone, Default)]
pub enum TargetFilter {
    /// Emit everything.
    #[default]
    Any,
    /// Emit updates whose target DN matches a substring pattern.
    Pattern(TargetPattern),
    /// Emit updates accepted by a predicate.
    Custom(Arc<dyn Fn(&UpdateRecord) -> bool + Send + Sync>),
}

impl TargetFilter {
    /// Filter on target DN with a `*`-wildcard pattern.
    pub fn pattern(pattern: &str) -> Self {
        Self::Pattern(TargetPattern::parse(pattern))
    }

    /// Filter with an arbitrary predicate.
    pub fn custom(f: impl Fn(&UpdateRecord) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn matches(&self, record: &UpdateRecord) -> bool {
        match self {
            TargetFilter::Any => true,
            TargetFilter::Pattern(p) => p.matches(&record.target_dn),
            TargetFilter::Custom(f) => f(record),
        }
    }
}

impl fmt::Debug for TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFilter::Any => f.write_str("Any"),
            TargetFilter::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            TargetFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Case-insensitive substring pattern with `*` wildcards, e.g.
/// `*ou=people*` or `uid=*,o=example`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPattern {
    /// Literal pieces between wildcards, lowercased.
    parts: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

impl TargetPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        Self {
            anchored_start: !pattern.starts_with('*'),
            anchored_end: !pattern.ends_with('*'),
            parts: pattern
                .split('*')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Whether `dn` matches, ignoring case.
    pub fn matches(&self, dn: &str) -> bool {
        let dn = dn.to_lowercase();
        let mut rest = dn.as_str();

        if self.parts.is_empty() {
            // "*" (or "**") matches everything; "" only the empty DN.
            return !(self.anchored_start && self.anchored_end) || rest.is_empty();
        }

        let last = self.parts.len() - 1;
        for (i, part) in self.parts.iter().enumerate() {
            if i == 0 && self.anchored_start {
                match rest.strip_prefix(part.as_str()) {
                    Some(r) => rest = r,
                    None => return false,
                }
                if i == last && self.anchored_end {
                    return rest.is_empty();
                }
                continue;
            }

            if i == last && self.anchored_end {
                return rest.ends_with(part.as_str());
            }

            match rest.find(part.as_str()) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
        true
    }
}
