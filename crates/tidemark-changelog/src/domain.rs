//! One naming context replicated on one replica.

use std::fmt;
use std::sync::{Arc, RwLock};

use tidemark_types::{Clock, Csn, CsnGenerator, ReplicaId, ServerState, Suffix};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::ChangelogError;
use crate::record::{Change, UpdateRecord};
use crate::store::ChangelogStore;

type Result<T> = std::result::Result<T, ChangelogError>;

/// Default capacity of a domain's change broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Per-domain settings.
#[derive(Debug, Clone)]
pub struct DomainOptions {
    /// Private domains are only visible to privileged change-log readers.
    pub private: bool,
    /// Capacity of the live change broadcast. Slow subscribers that fall
    /// further behind than this observe a lag and re-read from the store.
    pub broadcast_capacity: usize,
}

impl Default for DomainOptions {
    fn default() -> Self {
        Self {
            private: false,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// The change log of one naming context on one replica.
///
/// Local updates are stamped by the domain's [`CsnGenerator`]; updates from
/// other replicas arrive through [`ReplicationDomain::receive`]. Every stored
/// update is given the store's next change number, advances the domain's
/// [`ServerState`] and is broadcast to live subscribers.
///
/// Writers are serialized on the server state lock, so subscribers observe
/// each replica's updates in CSN order.
pub struct ReplicationDomain {
    suffix: Suffix,
    options: DomainOptions,
    generator: CsnGenerator,
    store: Arc<ChangelogStore>,
    state: RwLock<ServerState>,
    trimmed: RwLock<ServerState>,
    changes: broadcast::Sender<UpdateRecord>,
}

impl ReplicationDomain {
    /// Open the domain for `suffix`, reloading its persisted server state and
    /// trimmed state. The generator is adjusted past every persisted CSN so a
    /// restarted replica never reissues one.
    pub fn open(
        suffix: Suffix,
        replica_id: ReplicaId,
        store: Arc<ChangelogStore>,
        clock: Arc<dyn Clock>,
        options: DomainOptions,
    ) -> Result<Self> {
        let state = store.server_state(&suffix)?.unwrap_or_default();
        let trimmed = store.trimmed_state(&suffix)?.unwrap_or_default();

        let generator = CsnGenerator::new(replica_id, clock);
        generator.adjust_to_state(&state);
        generator.adjust_to_state(&trimmed);

        store.put_server_state(&suffix, &state)?;

        let (changes, _) = broadcast::channel(options.broadcast_capacity.max(1));

        info!(
            suffix = %suffix,
            replica = %replica_id,
            replicas = state.len(),
            private = options.private,
            "replication domain opened"
        );

        Ok(Self {
            suffix,
            options,
            generator,
            store,
            state: RwLock::new(state),
            trimmed: RwLock::new(trimmed),
            changes,
        })
    }

    /// Naming context of this domain.
    pub fn suffix(&self) -> &Suffix {
        &self.suffix
    }

    /// Local replica id.
    pub fn replica_id(&self) -> ReplicaId {
        self.generator.replica_id()
    }

    /// Change log this domain writes to.
    pub fn store(&self) -> &Arc<ChangelogStore> {
        &self.store
    }

    /// Whether the domain is hidden from unprivileged change-log readers.
    pub fn is_private(&self) -> bool {
        self.options.private
    }

    /// Stamp a local change with a new CSN, store it and broadcast it.
    pub fn publish(&self, change: Change) -> Result<UpdateRecord> {
        if !self.suffix.contains_dn(&change.target_dn) {
            return Err(ChangelogError::OutsideSuffix {
                dn: change.target_dn,
                suffix: self.suffix.clone(),
            });
        }

        let mut state = self.state.write().expect("server state lock poisoned");
        let record = change.into_record(self.generator.new_csn());
        let change_number = self.apply(&mut state, &record)?;

        debug!(
            suffix = %self.suffix,
            csn = %record.csn,
            change_number,
            change_type = record.operation.change_type(),
            "published change"
        );
        Ok(record)
    }

    /// Apply an update originated by another replica.
    ///
    /// Returns `false` without touching anything if the update is already
    /// covered by the server state, so redelivery is harmless.
    pub fn receive(&self, record: &UpdateRecord) -> Result<bool> {
        let mut state = self.state.write().expect("server state lock poisoned");
        if state.covers(&record.csn) {
            debug!(suffix = %self.suffix, csn = %record.csn, "ignoring covered change");
            return Ok(false);
        }

        self.generator.adjust(&record.csn);
        let change_number = self.apply(&mut state, record)?;

        debug!(
            suffix = %self.suffix,
            csn = %record.csn,
            change_number,
            origin = %record.replica_id(),
            "received change"
        );
        Ok(true)
    }

    /// Store, index and broadcast `record`. Returns its change number.
    fn apply(&self, state: &mut ServerState, record: &UpdateRecord) -> Result<u64> {
        self.store.put_change(&self.suffix, record)?;
        let change_number = self.store.index_change(&self.suffix, &record.csn)?;
        state.update(record.csn);
        self.store.put_server_state(&self.suffix, state)?;

        // No subscribers is not an error.
        let _ = self.changes.send(record.clone());
        Ok(change_number)
    }

    /// Snapshot of the newest CSN applied per replica.
    pub fn server_state(&self) -> ServerState {
        self.state
            .read()
            .expect("server state lock poisoned")
            .clone()
    }

    /// State of the naming context before any change still held in the log:
    /// the lower bound a reader without a cookie starts from.
    pub fn start_state(&self) -> ServerState {
        self.trimmed_state()
    }

    /// Newest purged CSN per replica.
    pub fn trimmed_state(&self) -> ServerState {
        self.trimmed
            .read()
            .expect("trimmed state lock poisoned")
            .clone()
    }

    /// Receive every change stored from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateRecord> {
        self.changes.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Up to `limit` stored changes strictly newer than `after`, in CSN order.
    pub fn changes_after(&self, after: Option<&Csn>, limit: usize) -> Result<Vec<UpdateRecord>> {
        self.store.changes_after(&self.suffix, after, limit)
    }

    /// Number of changes held in the log.
    pub fn change_count(&self) -> Result<usize> {
        self.store.change_count(&self.suffix)
    }

    /// Purge changes strictly older than `bound`, folding their CSNs into
    /// the trimmed state. Returns the number of purged changes.
    pub fn trim_before(&self, bound: &Csn) -> Result<usize> {
        let mut trimmed = self.trimmed.write().expect("trimmed state lock poisoned");
        let removed = self.store.remove_changes_before(&self.suffix, bound)?;
        if removed.is_empty() {
            return Ok(0);
        }

        for csn in &removed {
            trimmed.update(*csn);
        }
        self.store.put_trimmed_state(&self.suffix, &trimmed)?;
        let unindexed = self.store.purge_change_numbers()?;

        info!(
            suffix = %self.suffix,
            bound = %bound,
            purged = removed.len(),
            unindexed,
            "trimmed change log"
        );
        Ok(removed.len())
    }
}

impl fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("suffix", &self.suffix)
            .field("replica_id", &self.replica_id())
            .field("private", &self.options.private)
            .finish_non_exhaustive()
    }
}
