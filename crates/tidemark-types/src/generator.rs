//! Per-replica CSN generation.
//!
//! [`CsnGenerator`] is a Lamport-style clock seeded from wall-clock time:
//! it follows the local clock while the clock moves forward, counts seqnums
//! while it stands still or regresses, and is pulled forward by CSNs
//! observed from other replicas through [`CsnGenerator::adjust`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::{Csn, ReplicaId, ServerState};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. It may be set backward to simulate
/// clock regression.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    /// Set the current reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move the reading forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Last issued position of a generator.
#[derive(Debug)]
struct GeneratorState {
    last_timestamp: u64,
    last_seqnum: u16,
    /// No CSN has been issued or adopted at `(last_timestamp, last_seqnum)`
    /// yet, so that position itself is still available.
    fresh: bool,
}

impl GeneratorState {
    fn position(&self) -> (u64, u16) {
        (self.last_timestamp, self.last_seqnum)
    }

    fn advance(&mut self, now: u64) {
        if now > self.last_timestamp {
            self.last_timestamp = now;
            self.last_seqnum = 0;
        } else if self.fresh {
            // First CSN of the seeding millisecond keeps seqnum 0.
        } else if self.last_seqnum == u16::MAX {
            self.last_timestamp += 1;
            self.last_seqnum = 0;
        } else {
            self.last_seqnum += 1;
        }
        self.fresh = false;
    }
}

/// Generates strictly increasing CSNs for one replica.
///
/// Both operations take the same mutex, so concurrent writers never observe
/// or produce a partially applied update of the last issued position.
pub struct CsnGenerator {
    replica_id: ReplicaId,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    /// Create a generator for `replica_id`, seeded with the clock's current
    /// reading.
    pub fn new(replica_id: ReplicaId, clock: Arc<dyn Clock>) -> Self {
        let seed = clock.now_millis();
        Self {
            replica_id,
            clock,
            state: Mutex::new(GeneratorState {
                last_timestamp: seed,
                last_seqnum: 0,
                fresh: true,
            }),
        }
    }

    /// Create a generator driven by the system clock.
    pub fn with_system_clock(replica_id: ReplicaId) -> Self {
        Self::new(replica_id, Arc::new(SystemClock))
    }

    /// Replica this generator stamps CSNs for.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Issue the next CSN.
    ///
    /// Never fails. When the clock stands still or moves backward the seqnum
    /// is incremented instead; a seqnum overflow bumps the timestamp by one
    /// millisecond.
    pub fn new_csn(&self) -> Csn {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("generator lock poisoned");

        if now < state.last_timestamp {
            debug!(
                replica = %self.replica_id,
                now,
                last = state.last_timestamp,
                "clock behind last issued CSN"
            );
        }

        state.advance(now);
        Csn::new(state.last_timestamp, state.last_seqnum, self.replica_id)
    }

    /// Pull the generator forward so that the next [`new_csn`] is strictly
    /// newer than `external`. Older or equal CSNs leave it unchanged.
    ///
    /// [`new_csn`]: CsnGenerator::new_csn
    pub fn adjust(&self, external: &Csn) {
        let mut state = self.state.lock().expect("generator lock poisoned");
        let incoming = (external.timestamp(), external.seqnum());

        if incoming > state.position() || (state.fresh && incoming == state.position()) {
            state.last_timestamp = incoming.0;
            state.last_seqnum = incoming.1;
            state.fresh = false;
        }
    }

    /// Adjust to every CSN of `state`.
    pub fn adjust_to_state(&self, state: &ServerState) {
        for csn in state.iter() {
            self.adjust(csn);
        }
    }

    /// The last issued or adopted position, if any.
    pub fn last_issued(&self) -> Option<Csn> {
        let state = self.state.lock().expect("generator lock poisoned");
        (!state.fresh).then(|| Csn::new(state.last_timestamp, state.last_seqnum, self.replica_id))
    }
}

impl fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsnGenerator")
            .field("replica_id", &self.replica_id)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
