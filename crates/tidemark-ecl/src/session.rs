//! Merged change-log cursor across naming contexts.
//!
//! An [`EclSession`] owns one sub-cursor per eligible replication domain.
//! Stored history is replayed with a k-way merge on CSN (oldest head
//! first); live changes arrive through each domain's broadcast channel,
//! merged with a [`StreamMap`]. The session cookie records, per naming
//! context, the newest change consumed from each replica, so a change is
//! never yielded twice even when it is seen both in the store and on the
//! broadcast.
//!
//! A change-number session reads the replica's change-number index instead
//! and uses the broadcasts only to learn that the index grew.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tidemark_changelog::{
    ChangeNumberRecord, ChangelogStore, DomainRegistry, ReplicationDomain, UpdateRecord,
};
use tidemark_types::{Csn, MultiDomainServerState, ServerState, Suffix};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::entry::{EclEntry, EclEvent};
use crate::error::EclError;
use crate::request::{ChangeNumberRange, EclRequest, SearchMode};

type Result<T> = std::result::Result<T, EclError>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Subscribing and computing start states.
    Initializing,
    /// Replaying stored history.
    CatchingUp,
    /// Following new changes.
    Live,
    /// A one-shot search finished.
    Done,
    /// Cancelled, closed or failed. All subscriptions are released.
    Closed,
}

/// Cancels a session from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Ask the session to stop. The pending or next call to
    /// [`EclSession::next`] returns [`EclEvent::Cancelled`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Stored history of one domain not yet consumed by the session.
struct DomainCursor {
    domain: Arc<ReplicationDomain>,
    buffer: VecDeque<UpdateRecord>,
    /// Last CSN read from the store; the next page starts after it.
    scan_from: Option<Csn>,
    exhausted: bool,
}

impl DomainCursor {
    fn new(domain: Arc<ReplicationDomain>, scan_from: Option<Csn>, exhausted: bool) -> Self {
        Self {
            domain,
            buffer: VecDeque::new(),
            scan_from,
            exhausted,
        }
    }

    /// Read pages until a change is buffered or the log is exhausted.
    fn fill(&mut self, batch_size: usize) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self.domain.changes_after(self.scan_from.as_ref(), batch_size)?;
            if page.len() < batch_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.scan_from = Some(last.csn);
            }
            self.buffer.extend(page);
        }
        Ok(())
    }

    /// Restart reading the store from what `covered` has not seen.
    fn rewind(&mut self, covered: &ServerState) {
        self.buffer.clear();
        self.scan_from = scan_start(covered, &self.domain.server_state());
        self.exhausted = false;
    }
}

/// Position of a change-number session in the change-number index.
struct NumberedCursor {
    store: Option<Arc<ChangelogStore>>,
    range: ChangeNumberRange,
    /// Next change number to read from the index.
    next: u64,
    buffer: VecDeque<ChangeNumberRecord>,
    /// A change number past the end of the range was reached.
    finished: bool,
}

impl NumberedCursor {
    fn fill(&mut self, batch_size: usize) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let Some(store) = &self.store else {
            return Ok(());
        };
        let page = store.change_numbers_from(self.next, batch_size)?;
        if let Some(last) = page.last() {
            self.next = last.change_number + 1;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

/// Domains of `registry` that `request` may read, ordered by suffix.
fn eligible_domains(registry: &DomainRegistry, request: &EclRequest) -> Vec<Arc<ReplicationDomain>> {
    registry
        .domains()
        .into_iter()
        .filter(|domain| {
            let admitted = request.admits(domain.suffix(), domain.is_private());
            if !admitted {
                debug!(suffix = %domain.suffix(), "domain hidden from session");
            }
            admitted
        })
        .collect()
}

/// Cookie positioned after every change applied so far to the naming
/// contexts `request` may read. A session opened with it only yields later
/// changes.
pub fn newest_cookie(registry: &DomainRegistry, request: &EclRequest) -> MultiDomainServerState {
    let mut cookie = MultiDomainServerState::new();
    for domain in eligible_domains(registry, request) {
        cookie.set(domain.suffix().clone(), domain.server_state());
    }
    cookie
}

/// Where to start reading a domain's log so that every change not covered by
/// `covered` is read. Changes at or below the returned CSN are all covered.
fn scan_start(covered: &ServerState, current: &ServerState) -> Option<Csn> {
    let mut lowest: Option<Csn> = None;
    for csn in current.iter() {
        let seen = covered.csn(csn.replica_id())?;
        lowest = Some(lowest.map_or(seen, |l| l.min(seen)));
    }
    lowest
}

/// A consumer's cursor over the external change log.
pub struct EclSession {
    request: EclRequest,
    phase: Phase,
    cookie: MultiDomainServerState,
    cursors: BTreeMap<Suffix, DomainCursor>,
    live: StreamMap<Suffix, BroadcastStream<UpdateRecord>>,
    numbered: Option<NumberedCursor>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    /// End of the catch-up budget. `None` when the budget does not fit in an
    /// `Instant`, which leaves catch-up unbounded.
    deadline: Option<Instant>,
}

impl EclSession {
    /// Open a session over the domains of `registry`.
    ///
    /// Every eligible domain is subscribed before its start state is read,
    /// so no change published while the session opens is missed. Eligible
    /// domains are registered, not excluded by the request, and not private
    /// unless the request is privileged.
    pub fn open(registry: &DomainRegistry, request: EclRequest) -> Result<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut session = Self {
            cookie: MultiDomainServerState::new(),
            phase: Phase::Initializing,
            cursors: BTreeMap::new(),
            live: StreamMap::new(),
            numbered: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            deadline: Instant::now().checked_add(request.catch_up_timeout),
            request,
        };

        for domain in eligible_domains(registry, &session.request) {
            let suffix = domain.suffix().clone();
            session
                .live
                .insert(suffix.clone(), BroadcastStream::new(domain.subscribe()));

            let (start, cursor) = session.start_position(&suffix, domain)?;
            session.cookie.set(suffix.clone(), start);
            session.cursors.insert(suffix, cursor);
        }

        if let Some(range) = session.request.change_numbers {
            if !session.request.cookie.is_empty() {
                debug!("cookie ignored by change-number search");
            }
            let first = match session.request.mode {
                SearchMode::ChangesOnly => registry.last_change_number()? + 1,
                SearchMode::OneShot | SearchMode::Persistent => range.first,
            };
            session.numbered = Some(NumberedCursor {
                store: registry.store(),
                range,
                next: first,
                buffer: VecDeque::new(),
                finished: false,
            });
            session.cover_change_numbers_below(first)?;
        } else {
            for suffix in session.request.cookie.suffixes() {
                if !session.cursors.contains_key(suffix) {
                    debug!(suffix = %suffix, "ignoring cookie entry for unavailable domain");
                }
            }
        }

        session.phase = match session.request.mode {
            SearchMode::ChangesOnly => Phase::Live,
            SearchMode::OneShot | SearchMode::Persistent => Phase::CatchingUp,
        };

        info!(
            domains = session.cursors.len(),
            mode = ?session.request.mode,
            change_numbers = ?session.request.change_numbers,
            cookie = %session.cookie,
            "change log session opened"
        );
        Ok(session)
    }

    /// Fold every indexed change numbered below `first` into the cookie, so
    /// the cookie of the first entry resumes right after it.
    fn cover_change_numbers_below(&mut self, first: u64) -> Result<()> {
        let Some(store) = self.numbered.as_ref().and_then(|n| n.store.clone()) else {
            return Ok(());
        };

        let mut from = 0;
        loop {
            let page = store.change_numbers_from(from, self.request.batch_size)?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            from = last.change_number + 1;

            for index in page {
                if index.change_number >= first {
                    return Ok(());
                }
                if self.cursors.contains_key(&index.suffix) {
                    self.cookie.update(&index.suffix, index.csn);
                }
            }
        }
    }

    /// Start state of `suffix` and its history cursor.
    fn start_position(
        &self,
        suffix: &Suffix,
        domain: Arc<ReplicationDomain>,
    ) -> Result<(ServerState, DomainCursor)> {
        if self.request.change_numbers.is_some() {
            // Positioned by the change-number index instead.
            return Ok((domain.start_state(), DomainCursor::new(domain, None, true)));
        }
        if self.request.mode == SearchMode::ChangesOnly {
            let current = domain.server_state();
            return Ok((current, DomainCursor::new(domain, None, true)));
        }

        let start = match self.request.cookie.get(suffix) {
            Some(state) => {
                if !state.covers_state(&domain.trimmed_state()) {
                    return Err(EclError::CookieTooOld {
                        suffix: suffix.clone(),
                    });
                }
                state.clone()
            }
            None => domain.start_state(),
        };

        let scan_from = scan_start(&start, &domain.server_state());
        Ok((start, DomainCursor::new(domain, scan_from, false)))
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Cookie after the last consumed change.
    pub fn cookie(&self) -> &MultiDomainServerState {
        &self.cookie
    }

    /// Handle that cancels this session from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Naming contexts this session reads.
    pub fn suffixes(&self) -> impl Iterator<Item = &Suffix> {
        self.cursors.keys()
    }

    /// Release every subscription. Further calls to [`EclSession::next`]
    /// return [`EclEvent::Cancelled`].
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.live.clear();
        self.cursors.clear();
        self.phase = Phase::Closed;
        info!(cookie = %self.cookie, "change log session closed");
    }

    /// Next event of the session.
    ///
    /// In [`SearchMode::OneShot`] this yields stored changes and then
    /// [`EclEvent::Done`]. In the persistent modes it waits for new changes
    /// and only returns [`EclEvent::Cancelled`] once cancelled or closed.
    pub async fn next(&mut self) -> Result<EclEvent> {
        loop {
            if *self.cancel_rx.borrow_and_update() {
                self.close();
                return Ok(EclEvent::Cancelled);
            }

            match self.phase {
                Phase::Initializing | Phase::CatchingUp => {
                    match self.next_available(true) {
                        Ok(Some(entry)) => return Ok(EclEvent::Change(entry)),
                        Ok(None) => {}
                        Err(e) => {
                            self.close();
                            return Err(e);
                        }
                    }

                    if self.request.mode.is_persistent() && !self.range_finished() {
                        debug!("catch-up complete, following live changes");
                        self.phase = Phase::Live;
                    } else {
                        return Ok(self.complete());
                    }
                }
                Phase::Live => {
                    // Re-read stores rewound after a lagged subscription, or
                    // the grown change-number index.
                    match self.next_available(false) {
                        Ok(Some(entry)) => return Ok(EclEvent::Change(entry)),
                        Ok(None) => {}
                        Err(e) => {
                            self.close();
                            return Err(e);
                        }
                    }
                    if self.range_finished() {
                        return Ok(self.complete());
                    }

                    if let Some(entry) = self.next_live().await {
                        return Ok(EclEvent::Change(entry));
                    }
                }
                Phase::Done => return Ok(EclEvent::Done),
                Phase::Closed => return Ok(EclEvent::Cancelled),
            }
        }
    }

    /// End a search that has delivered everything it will.
    fn complete(&mut self) -> EclEvent {
        self.live.clear();
        self.cursors.clear();
        self.phase = Phase::Done;
        info!(cookie = %self.cookie, "change log search complete");
        EclEvent::Done
    }

    /// Whether a change-number search has passed the end of its range.
    fn range_finished(&self) -> bool {
        self.numbered.as_ref().is_some_and(|n| n.finished)
    }

    fn next_available(&mut self, enforce_deadline: bool) -> Result<Option<EclEntry>> {
        if self.numbered.is_some() {
            self.next_numbered(enforce_deadline)
        } else {
            self.next_stored(enforce_deadline)
        }
    }

    fn check_catch_up_budget(&self, enforce_deadline: bool) -> Result<()> {
        if !enforce_deadline || self.deadline.is_none_or(|d| Instant::now() < d) {
            return Ok(());
        }
        warn!(
            timeout = ?self.request.catch_up_timeout,
            cookie = %self.cookie,
            "catch-up timed out"
        );
        Err(EclError::CatchUpTimeout(self.request.catch_up_timeout))
    }

    /// Next indexed change the session may read, in change-number order.
    /// Index records of hidden domains or of purged changes are skipped.
    fn next_numbered(&mut self, enforce_deadline: bool) -> Result<Option<EclEntry>> {
        loop {
            let batch_size = self.request.batch_size;
            let Some(numbered) = self.numbered.as_mut() else {
                return Ok(None);
            };
            if numbered.finished {
                return Ok(None);
            }
            numbered.fill(batch_size)?;

            let Some(head) = numbered.buffer.front() else {
                return Ok(None);
            };
            if numbered.range.is_past_end(head.change_number) {
                debug!(change_number = head.change_number, "end of change number range");
                numbered.finished = true;
                numbered.buffer.clear();
                return Ok(None);
            }
            let Some(store) = numbered.store.clone() else {
                return Ok(None);
            };

            self.check_catch_up_budget(enforce_deadline)?;

            let Some(index) = self.numbered.as_mut().and_then(|n| n.buffer.pop_front()) else {
                return Ok(None);
            };
            if !self.cursors.contains_key(&index.suffix) {
                continue;
            }
            let Some(record) = store.get_change(&index.suffix, &index.csn)? else {
                debug!(
                    change_number = index.change_number,
                    suffix = %index.suffix,
                    "indexed change was purged"
                );
                continue;
            };
            if let Some(entry) = self.consume(index.suffix, record, Some(index.change_number)) {
                return Ok(Some(entry));
            }
        }
    }

    /// Oldest unconsumed stored change across all domains, if any. Changes
    /// consumed but rejected by the filter are skipped.
    fn next_stored(&mut self, enforce_deadline: bool) -> Result<Option<EclEntry>> {
        loop {
            let mut oldest: Option<(&Suffix, Csn)> = None;
            for (suffix, cursor) in self.cursors.iter_mut() {
                cursor.fill(self.request.batch_size)?;
                if let Some(head) = cursor.buffer.front() {
                    if oldest.is_none_or(|(_, csn)| head.csn < csn) {
                        oldest = Some((suffix, head.csn));
                    }
                }
            }

            let Some((suffix, _)) = oldest else {
                return Ok(None);
            };
            let suffix = suffix.clone();

            self.check_catch_up_budget(enforce_deadline)?;

            let record = self
                .cursors
                .get_mut(&suffix)
                .and_then(|cursor| cursor.buffer.pop_front());
            if let Some(entry) = record.and_then(|r| self.consume(suffix, r, None)) {
                return Ok(Some(entry));
            }
        }
    }

    /// Wait for the next live change. Returns `None` when an event was
    /// handled without producing an entry; the caller loops. Change-number
    /// sessions take every broadcast as a cue to re-read the index.
    async fn next_live(&mut self) -> Option<EclEntry> {
        let mut cancel = self.cancel_rx.clone();
        let has_streams = !self.live.is_empty();
        let numbered = self.numbered.is_some();

        tokio::select! {
            biased;
            _ = cancel.changed() => None,
            item = self.live.next(), if has_streams => match item {
                Some(_) if numbered => None,
                Some((suffix, Ok(record))) => self.consume(suffix, record, None),
                Some((suffix, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(suffix = %suffix, skipped, "change log subscriber lagged, re-reading store");
                    let covered = self.cookie.get(&suffix).cloned().unwrap_or_default();
                    if let Some(cursor) = self.cursors.get_mut(&suffix) {
                        cursor.rewind(&covered);
                    }
                    None
                }
                None => {
                    debug!("every subscribed domain closed");
                    None
                }
            },
        }
    }

    /// Advance the cookie past `record` and return it as an entry if it is
    /// new and passes the filter.
    fn consume(
        &mut self,
        suffix: Suffix,
        record: UpdateRecord,
        change_number: Option<u64>,
    ) -> Option<EclEntry> {
        if self
            .cookie
            .get(&suffix)
            .is_some_and(|state| state.covers(&record.csn))
        {
            return None;
        }

        self.cookie.update(&suffix, record.csn);

        if !self.request.filter.matches(&record) {
            debug!(suffix = %suffix, csn = %record.csn, "change filtered out");
            return None;
        }

        debug!(suffix = %suffix, csn = %record.csn, ?change_number, "emitting change");
        Some(EclEntry {
            suffix,
            record,
            cookie: self.cookie.clone(),
            change_number,
        })
    }
}

impl Drop for EclSession {
    fn drop(&mut self) {
        if self.phase != Phase::Closed && self.phase != Phase::Done {
            self.close();
        }
    }
}

impl std::fmt::Debug for EclSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EclSession")
            .field("phase", &self.phase)
            .field("cookie", &self.cookie)
            .field("domains", &self.cursors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
