//! Shared test harness for tidemark integration tests.
//!
//! Provides [`IntegrationCluster`]: N in-process replicas serving the same
//! naming contexts, each with its own change log store and manual clock.
//! Updates only travel between replicas when a test forwards them, either
//! in bulk ([`IntegrationCluster::replicate`]) or as they happen through a
//! [`Forwarder`]. Replicas marked down neither send nor receive.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use tidemark_changelog::{
    Change, ChangelogStore, DomainOptions, DomainRegistry, Operation, ReplicationDomain,
    UpdateRecord,
};
use tidemark_ecl::{EclEntry, EclEvent, EclRequest, EclSession};
use tidemark_types::{Csn, ManualClock, MultiDomainServerState, ReplicaId, Suffix};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

/// Millisecond at which every replica clock starts.
pub const CLOCK_START: u64 = 1_000;

/// Page size used when forwarding stored history.
const FORWARD_BATCH: usize = 128;

// =========================================================================
// Replica
// =========================================================================

/// One replica: a registry of domains over a private store.
pub struct TestReplica {
    pub replica_id: ReplicaId,
    pub registry: DomainRegistry,
    pub clock: Arc<ManualClock>,
    pub store: Arc<ChangelogStore>,
}

impl TestReplica {
    /// Open a replica serving `suffixes` on `store`.
    pub fn open(
        replica_id: ReplicaId,
        suffixes: &[Suffix],
        store: Arc<ChangelogStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let registry = DomainRegistry::new();
        for suffix in suffixes {
            let domain = ReplicationDomain::open(
                suffix.clone(),
                replica_id,
                Arc::clone(&store),
                clock.clone(),
                DomainOptions::default(),
            )
            .unwrap();
            registry.register(Arc::new(domain)).unwrap();
        }
        Self {
            replica_id,
            registry,
            clock,
            store,
        }
    }

    pub fn domain(&self, suffix: &str) -> Arc<ReplicationDomain> {
        self.registry.require(&suffix_of(suffix)).unwrap()
    }

    /// Apply a local change one millisecond after the previous one.
    pub fn publish(&self, suffix: &str, change: Change) -> UpdateRecord {
        self.clock.advance(1);
        self.domain(suffix).publish(change).unwrap()
    }

    /// Publish the creation of `uid=<uid>,<suffix>`.
    pub fn add_user(&self, suffix: &str, uid: &str) -> UpdateRecord {
        self.publish(suffix, add_user(suffix, uid))
    }

    /// Server states of every domain, shaped like a cookie.
    pub fn server_states(&self) -> MultiDomainServerState {
        let mut states = MultiDomainServerState::new();
        for domain in self.registry.domains() {
            states.set(domain.suffix().clone(), domain.server_state());
        }
        states
    }

    /// Run a one-shot change log search to completion. Returns the entries
    /// and the final session cookie.
    pub async fn read_all(&self, request: EclRequest) -> (Vec<EclEntry>, MultiDomainServerState) {
        let mut session = EclSession::open(&self.registry, request).unwrap();
        let mut entries = Vec::new();
        loop {
            match session.next().await.unwrap() {
                EclEvent::Change(entry) => entries.push(entry),
                EclEvent::Done => break,
                EclEvent::Cancelled => panic!("one-shot session was cancelled"),
            }
        }
        (entries, session.cookie().clone())
    }
}

// =========================================================================
// Cluster
// =========================================================================

/// A set of replicas serving the same naming contexts.
pub struct IntegrationCluster {
    replicas: Vec<Arc<TestReplica>>,
    suffixes: Vec<Suffix>,
    down: Arc<RwLock<HashSet<usize>>>,
}

impl IntegrationCluster {
    /// `n` in-memory replicas with ids `1..=n`.
    pub fn new(n: usize, suffixes: &[&str]) -> Self {
        let suffixes: Vec<Suffix> = suffixes.iter().map(|s| suffix_of(s)).collect();
        let replicas = (0..n)
            .map(|i| {
                Arc::new(TestReplica::open(
                    ReplicaId::new(i as u16 + 1),
                    &suffixes,
                    Arc::new(ChangelogStore::in_memory()),
                    Arc::new(ManualClock::new(CLOCK_START)),
                ))
            })
            .collect();
        Self {
            replicas,
            suffixes,
            down: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn replica(&self, i: usize) -> &Arc<TestReplica> {
        &self.replicas[i]
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Cut replica `i` off from all traffic.
    pub fn kill_replica(&self, i: usize) {
        self.down.write().unwrap().insert(i);
    }

    pub fn revive_replica(&self, i: usize) {
        self.down.write().unwrap().remove(&i);
    }

    pub fn is_down(&self, i: usize) -> bool {
        self.down.read().unwrap().contains(&i)
    }

    /// Forward every stored change of `from` that `to` has not applied.
    /// Returns the number of changes applied on `to`.
    pub fn replicate(&self, from: usize, to: usize) -> usize {
        if from == to || self.is_down(from) || self.is_down(to) {
            return 0;
        }
        self.suffixes
            .iter()
            .map(|suffix| forward_history(&self.replicas[from], &self.replicas[to], suffix))
            .sum()
    }

    /// Replicate between every pair of live replicas until nothing moves.
    pub fn sync_all(&self) -> usize {
        let mut total = 0;
        loop {
            let mut round = 0;
            for from in 0..self.len() {
                for to in 0..self.len() {
                    round += self.replicate(from, to);
                }
            }
            if round == 0 {
                return total;
            }
            total += round;
        }
    }

    /// Whether every replica holds the same server state for every domain.
    pub fn converged(&self) -> bool {
        let first = self.replicas[0].server_states();
        self.replicas
            .iter()
            .all(|r| r.server_states().equals_to(&first))
    }

    /// Forward changes from `from` to `to` as they are stored on `from`.
    pub fn spawn_forwarder(&self, from: usize, to: usize) -> Forwarder {
        let handles = self
            .suffixes
            .iter()
            .map(|suffix| {
                let source = Arc::clone(&self.replicas[from]);
                let target = Arc::clone(&self.replicas[to]);
                let down = Arc::clone(&self.down);
                let suffix = suffix.clone();
                let mut rx = source.registry.require(&suffix).unwrap().subscribe();

                tokio::spawn(async move {
                    let domain = target.registry.require(&suffix).unwrap();
                    loop {
                        match rx.recv().await {
                            Ok(record) => {
                                let blocked = {
                                    let down = down.read().unwrap();
                                    down.contains(&from) || down.contains(&to)
                                };
                                if blocked {
                                    debug!(csn = %record.csn, "dropping change for down replica");
                                    continue;
                                }
                                domain.receive(&record).unwrap();
                            }
                            Err(RecvError::Lagged(_)) => {
                                forward_history(&source, &target, &suffix);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                })
            })
            .collect();
        Forwarder { handles }
    }
}

/// Live forwarding tasks; aborted on drop.
pub struct Forwarder {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn forward_history(from: &TestReplica, to: &TestReplica, suffix: &Suffix) -> usize {
    let source = from.registry.require(suffix).unwrap();
    let target = to.registry.require(suffix).unwrap();

    let mut applied = 0;
    let mut after: Option<Csn> = None;
    loop {
        let page = source.changes_after(after.as_ref(), FORWARD_BATCH).unwrap();
        let Some(last) = page.last() else {
            return applied;
        };
        after = Some(last.csn);
        for record in &page {
            if target.receive(record).unwrap() {
                applied += 1;
            }
        }
    }
}

// =========================================================================
// Helpers
// =========================================================================

pub fn suffix_of(dn: &str) -> Suffix {
    Suffix::new(dn).unwrap()
}

/// An add of `uid=<uid>,<parent>` with a couple of attributes.
pub fn add_user(parent: &str, uid: &str) -> Change {
    let mut attributes = BTreeMap::new();
    attributes.insert("objectClass".to_string(), vec!["person".to_string()]);
    attributes.insert("uid".to_string(), vec![uid.to_string()]);
    Change::new(
        format!("uid={uid},{parent}"),
        Operation::Add { attributes },
    )
}

/// CSNs of `entries`, in order.
pub fn csns(entries: &[EclEntry]) -> Vec<Csn> {
    entries.iter().map(|e| e.record.csn).collect()
}
