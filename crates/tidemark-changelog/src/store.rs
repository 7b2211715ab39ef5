//! Storage backend for the change log (Fjall disk or pure in-memory).
//!
//! Changes of every naming context share one keyspace. Keys are the suffix
//! bytes, a `0x00` separator and the 12-byte big-endian CSN, so a range scan
//! over one suffix yields its changes in CSN order.
//!
//! A second keyspace numbers every indexed change across all naming contexts
//! (key: big-endian `u64` change number). Numbers start at 1, increase by one
//! per change and are never reused: purging keeps the newest index record.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tempfile::TempDir;
use tidemark_types::{CSN_BYTES_LEN, Csn, ServerState, Suffix};

use crate::error::ChangelogError;
use crate::record::{ChangeNumberRecord, UpdateRecord};

type Result<T> = std::result::Result<T, ChangelogError>;

const SEPARATOR: u8 = 0x00;

/// Index records examined per page while purging.
const PURGE_BATCH: usize = 256;

/// Inner backend: either Fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        /// Held for temporary stores so the directory outlives the database.
        #[allow(dead_code)]
        tmp: Option<TempDir>,
        changes: Keyspace,
        states: Keyspace,
        trimmed: Keyspace,
        change_numbers: Keyspace,
    },
    Memory(Box<MemoryBackend>),
}

/// Pure in-memory storage.
struct MemoryBackend {
    /// change key → serialized UpdateRecord.
    changes: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// suffix → encoded ServerState.
    states: RwLock<HashMap<Suffix, Vec<u8>>>,
    /// suffix → encoded trimmed ServerState.
    trimmed: RwLock<HashMap<Suffix, Vec<u8>>>,
    /// change number → serialized ChangeNumberRecord.
    change_numbers: RwLock<BTreeMap<u64, Vec<u8>>>,
}

/// Persistent change log shared by every replication domain of a replica.
pub struct ChangelogStore {
    backend: Backend,
    /// Number given to the next indexed change.
    next_change_number: Mutex<u64>,
}

fn storage_err(e: impl std::fmt::Display) -> ChangelogError {
    ChangelogError::Storage(e.to_string())
}

fn prefix(suffix: &Suffix) -> Vec<u8> {
    let mut key = Vec::with_capacity(suffix.as_str().len() + 1 + CSN_BYTES_LEN);
    key.extend_from_slice(suffix.as_str().as_bytes());
    key.push(SEPARATOR);
    key
}

/// First key past every change of `suffix`.
fn prefix_end(suffix: &Suffix) -> Vec<u8> {
    let mut key = suffix.as_str().as_bytes().to_vec();
    key.push(SEPARATOR + 1);
    key
}

fn change_key(suffix: &Suffix, csn: &Csn) -> Vec<u8> {
    let mut key = prefix(suffix);
    key.extend_from_slice(&csn.to_bytes());
    key
}

fn csn_from_key(key: &[u8]) -> Result<Csn> {
    if key.len() < CSN_BYTES_LEN {
        return Err(storage_err(format!("change key too short: {} bytes", key.len())));
    }
    Ok(Csn::from_bytes(&key[key.len() - CSN_BYTES_LEN..])?)
}

fn change_number_key(change_number: u64) -> Vec<u8> {
    change_number.to_be_bytes().to_vec()
}

fn decode_change_number(value: &[u8]) -> Result<ChangeNumberRecord> {
    Ok(postcard::from_bytes(value)?)
}

impl ChangelogStore {
    /// Open a persistent store at the given path (Fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        let backend = Self::init_fjall(db, None)?;
        Self::with_backend(backend)
    }

    /// Open a temporary store backed by Fjall (cleaned up on drop).
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(storage_err)?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        let backend = Self::init_fjall(db, Some(tmp))?;
        Self::with_backend(backend)
    }

    /// Create a pure in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Box::new(MemoryBackend {
                changes: RwLock::new(BTreeMap::new()),
                states: RwLock::new(HashMap::new()),
                trimmed: RwLock::new(HashMap::new()),
                change_numbers: RwLock::new(BTreeMap::new()),
            })),
            next_change_number: Mutex::new(1),
        }
    }

    fn with_backend(backend: Backend) -> Result<Self> {
        let store = Self {
            backend,
            next_change_number: Mutex::new(1),
        };
        let last = store.last_change_number()?;
        *store
            .next_change_number
            .lock()
            .expect("change number lock poisoned") = last + 1;
        Ok(store)
    }

    fn init_fjall(db: Database, tmp: Option<TempDir>) -> Result<Backend> {
        let changes = db
            .keyspace("cl_changes", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let states = db
            .keyspace("cl_states", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let trimmed = db
            .keyspace("cl_trimmed", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let change_numbers = db
            .keyspace("cl_change_numbers", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Backend::Fjall {
            db,
            tmp,
            changes,
            states,
            trimmed,
            change_numbers,
        })
    }

    // ----- Changes -----

    /// Store a change under `suffix`. Storing the same CSN twice overwrites.
    pub fn put_change(&self, suffix: &Suffix, record: &UpdateRecord) -> Result<()> {
        let key = change_key(suffix, &record.csn);
        let bytes = postcard::to_allocvec(record)?;

        match &self.backend {
            Backend::Fjall { changes, .. } => {
                changes.insert(key, bytes).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.changes.write().unwrap().insert(key, bytes);
            }
        }
        Ok(())
    }

    /// Retrieve a change by CSN.
    pub fn get_change(&self, suffix: &Suffix, csn: &Csn) -> Result<Option<UpdateRecord>> {
        let key = change_key(suffix, csn);
        let bytes = match &self.backend {
            Backend::Fjall { changes, .. } => {
                changes.get(&key).map_err(storage_err)?.map(|v| v.to_vec())
            }
            Backend::Memory(m) => m.changes.read().unwrap().get(&key).cloned(),
        };

        match bytes {
            Some(b) => Ok(Some(postcard::from_bytes(&b)?)),
            None => Ok(None),
        }
    }

    /// Check if a change exists.
    pub fn has_change(&self, suffix: &Suffix, csn: &Csn) -> Result<bool> {
        let key = change_key(suffix, csn);
        match &self.backend {
            Backend::Fjall { changes, .. } => Ok(changes.get(&key).map_err(storage_err)?.is_some()),
            Backend::Memory(m) => Ok(m.changes.read().unwrap().contains_key(&key)),
        }
    }

    /// Remove a change.
    pub fn remove_change(&self, suffix: &Suffix, csn: &Csn) -> Result<()> {
        let key = change_key(suffix, csn);
        match &self.backend {
            Backend::Fjall { changes, .. } => {
                changes.remove(key).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.changes.write().unwrap().remove(&key);
            }
        }
        Ok(())
    }

    /// Up to `limit` changes of `suffix` strictly newer than `after`, in CSN
    /// order. `None` starts at the oldest stored change.
    pub fn changes_after(
        &self,
        suffix: &Suffix,
        after: Option<&Csn>,
        limit: usize,
    ) -> Result<Vec<UpdateRecord>> {
        let start = match after {
            Some(csn) => change_key(suffix, csn),
            None => prefix(suffix),
        };
        let end = prefix_end(suffix);
        let mut records = Vec::new();

        match &self.backend {
            Backend::Fjall { changes, .. } => {
                for guard in changes.range(start.clone()..end) {
                    if records.len() >= limit {
                        break;
                    }
                    let (key, value) = guard.into_inner().map_err(storage_err)?;
                    if after.is_some() && &*key == start.as_slice() {
                        continue;
                    }
                    records.push(postcard::from_bytes(&value)?);
                }
            }
            Backend::Memory(m) => {
                let changes = m.changes.read().unwrap();
                for (key, value) in changes.range(start.clone()..end) {
                    if records.len() >= limit {
                        break;
                    }
                    if after.is_some() && *key == start {
                        continue;
                    }
                    records.push(postcard::from_bytes(value)?);
                }
            }
        }

        Ok(records)
    }

    /// Oldest stored change of `suffix`.
    pub fn oldest_change(&self, suffix: &Suffix) -> Result<Option<UpdateRecord>> {
        Ok(self.changes_after(suffix, None, 1)?.into_iter().next())
    }

    /// Newest stored change of `suffix`.
    pub fn newest_change(&self, suffix: &Suffix) -> Result<Option<UpdateRecord>> {
        let bytes = match &self.backend {
            Backend::Fjall { changes, .. } => match changes.prefix(prefix(suffix)).next_back() {
                Some(guard) => Some(guard.value().map_err(storage_err)?.to_vec()),
                None => None,
            },
            Backend::Memory(m) => m
                .changes
                .read()
                .unwrap()
                .range(prefix(suffix)..prefix_end(suffix))
                .next_back()
                .map(|(_, v)| v.clone()),
        };

        match bytes {
            Some(b) => Ok(Some(postcard::from_bytes(&b)?)),
            None => Ok(None),
        }
    }

    /// Number of stored changes of `suffix`.
    pub fn change_count(&self, suffix: &Suffix) -> Result<usize> {
        match &self.backend {
            Backend::Fjall { changes, .. } => {
                let mut count = 0;
                for guard in changes.prefix(prefix(suffix)) {
                    guard.key().map_err(storage_err)?;
                    count += 1;
                }
                Ok(count)
            }
            Backend::Memory(m) => Ok(m
                .changes
                .read()
                .unwrap()
                .range(prefix(suffix)..prefix_end(suffix))
                .count()),
        }
    }

    /// Delete every change of `suffix` strictly older than `bound` and
    /// return their CSNs in order.
    pub fn remove_changes_before(&self, suffix: &Suffix, bound: &Csn) -> Result<Vec<Csn>> {
        let start = prefix(suffix);
        let end = change_key(suffix, bound);

        match &self.backend {
            Backend::Fjall { changes, .. } => {
                let mut keys = Vec::new();
                for guard in changes.range(start..end) {
                    keys.push(guard.key().map_err(storage_err)?.to_vec());
                }

                let mut removed = Vec::with_capacity(keys.len());
                for key in keys {
                    removed.push(csn_from_key(&key)?);
                    changes.remove(key).map_err(storage_err)?;
                }
                Ok(removed)
            }
            Backend::Memory(m) => {
                let mut changes = m.changes.write().unwrap();
                let keys: Vec<Vec<u8>> = changes.range(start..end).map(|(k, _)| k.clone()).collect();

                let mut removed = Vec::with_capacity(keys.len());
                for key in keys {
                    removed.push(csn_from_key(&key)?);
                    changes.remove(&key);
                }
                Ok(removed)
            }
        }
    }

    // ----- Change numbers -----

    /// Give the change `csn` of `suffix` the next change number and record
    /// it in the index. Returns the number.
    pub fn index_change(&self, suffix: &Suffix, csn: &Csn) -> Result<u64> {
        let mut next = self
            .next_change_number
            .lock()
            .expect("change number lock poisoned");
        let record = ChangeNumberRecord {
            change_number: *next,
            suffix: suffix.clone(),
            csn: *csn,
        };
        let bytes = postcard::to_allocvec(&record)?;

        match &self.backend {
            Backend::Fjall { change_numbers, .. } => {
                change_numbers
                    .insert(change_number_key(record.change_number), bytes)
                    .map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.change_numbers
                    .write()
                    .unwrap()
                    .insert(record.change_number, bytes);
            }
        }

        *next += 1;
        Ok(record.change_number)
    }

    /// Up to `limit` index records with a change number of at least `first`,
    /// in change-number order.
    pub fn change_numbers_from(&self, first: u64, limit: usize) -> Result<Vec<ChangeNumberRecord>> {
        let mut records = Vec::new();

        match &self.backend {
            Backend::Fjall { change_numbers, .. } => {
                for guard in change_numbers.range(change_number_key(first)..) {
                    if records.len() >= limit {
                        break;
                    }
                    let (_, value) = guard.into_inner().map_err(storage_err)?;
                    records.push(decode_change_number(&value)?);
                }
            }
            Backend::Memory(m) => {
                let index = m.change_numbers.read().unwrap();
                for (_, value) in index.range(first..).take(limit) {
                    records.push(decode_change_number(value)?);
                }
            }
        }

        Ok(records)
    }

    /// Oldest change number still indexed, 0 when nothing was ever indexed.
    pub fn first_change_number(&self) -> Result<u64> {
        Ok(self.edge_change_number(false)?.map_or(0, |r| r.change_number))
    }

    /// Newest change number given out, 0 when nothing was ever indexed.
    pub fn last_change_number(&self) -> Result<u64> {
        Ok(self.edge_change_number(true)?.map_or(0, |r| r.change_number))
    }

    fn edge_change_number(&self, newest: bool) -> Result<Option<ChangeNumberRecord>> {
        let bytes = match &self.backend {
            Backend::Fjall { change_numbers, .. } => {
                let guard = if newest {
                    change_numbers.iter().next_back()
                } else {
                    change_numbers.first_key_value()
                };
                match guard {
                    Some(guard) => Some(guard.value().map_err(storage_err)?.to_vec()),
                    None => None,
                }
            }
            Backend::Memory(m) => {
                let index = m.change_numbers.read().unwrap();
                let entry = if newest {
                    index.last_key_value()
                } else {
                    index.first_key_value()
                };
                entry.map(|(_, v)| v.clone())
            }
        };

        bytes.map(|b| decode_change_number(&b)).transpose()
    }

    /// Drop leading index records whose change is no longer stored. Stops at
    /// the first record whose change is still held, and never drops the
    /// newest record so numbering resumes after it. Returns the number of
    /// dropped records.
    pub fn purge_change_numbers(&self) -> Result<usize> {
        // Hold the numbering lock so the newest record cannot change under us.
        let next = self
            .next_change_number
            .lock()
            .expect("change number lock poisoned");
        let newest = next.saturating_sub(1);

        let mut purged = 0;
        let mut from = 0;
        loop {
            let page = self.change_numbers_from(from, PURGE_BATCH)?;
            let Some(last) = page.last() else {
                return Ok(purged);
            };
            from = last.change_number + 1;

            for record in &page {
                if record.change_number >= newest
                    || self.has_change(&record.suffix, &record.csn)?
                {
                    return Ok(purged);
                }
                self.remove_change_number(record.change_number)?;
                purged += 1;
            }
        }
    }

    fn remove_change_number(&self, change_number: u64) -> Result<()> {
        match &self.backend {
            Backend::Fjall { change_numbers, .. } => {
                change_numbers
                    .remove(change_number_key(change_number))
                    .map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.change_numbers.write().unwrap().remove(&change_number);
            }
        }
        Ok(())
    }

    // ----- Server states -----

    /// Persist the server state of `suffix`.
    pub fn put_server_state(&self, suffix: &Suffix, state: &ServerState) -> Result<()> {
        self.put_state(suffix, state, StateKind::Current)
    }

    /// Load the persisted server state of `suffix`.
    pub fn server_state(&self, suffix: &Suffix) -> Result<Option<ServerState>> {
        self.get_state(suffix, StateKind::Current)
    }

    /// Persist the trimmed state of `suffix`: the newest CSN per replica
    /// that has been purged from the log.
    pub fn put_trimmed_state(&self, suffix: &Suffix, state: &ServerState) -> Result<()> {
        self.put_state(suffix, state, StateKind::Trimmed)
    }

    /// Load the trimmed state of `suffix`.
    pub fn trimmed_state(&self, suffix: &Suffix) -> Result<Option<ServerState>> {
        self.get_state(suffix, StateKind::Trimmed)
    }

    /// Naming contexts with a persisted server state, in ascending order.
    pub fn suffixes(&self) -> Result<Vec<Suffix>> {
        let mut suffixes = match &self.backend {
            Backend::Fjall { states, .. } => {
                let mut result = Vec::new();
                for guard in states.iter() {
                    let k = guard.key().map_err(storage_err)?;
                    let dn = std::str::from_utf8(&k).map_err(storage_err)?;
                    result.push(Suffix::new(dn)?);
                }
                result
            }
            Backend::Memory(m) => m.states.read().unwrap().keys().cloned().collect(),
        };
        suffixes.sort();
        Ok(suffixes)
    }

    fn put_state(&self, suffix: &Suffix, state: &ServerState, kind: StateKind) -> Result<()> {
        let bytes = state.to_bytes();

        match &self.backend {
            Backend::Fjall {
                states, trimmed, ..
            } => {
                let ks = match kind {
                    StateKind::Current => states,
                    StateKind::Trimmed => trimmed,
                };
                ks.insert(suffix.as_str().as_bytes(), &bytes[..])
                    .map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                let map = match kind {
                    StateKind::Current => &m.states,
                    StateKind::Trimmed => &m.trimmed,
                };
                map.write().unwrap().insert(suffix.clone(), bytes.to_vec());
            }
        }
        Ok(())
    }

    fn get_state(&self, suffix: &Suffix, kind: StateKind) -> Result<Option<ServerState>> {
        let bytes = match &self.backend {
            Backend::Fjall {
                states, trimmed, ..
            } => {
                let ks = match kind {
                    StateKind::Current => states,
                    StateKind::Trimmed => trimmed,
                };
                ks.get(suffix.as_str().as_bytes())
                    .map_err(storage_err)?
                    .map(|v| v.to_vec())
            }
            Backend::Memory(m) => {
                let map = match kind {
                    StateKind::Current => &m.states,
                    StateKind::Trimmed => &m.trimmed,
                };
                map.read().unwrap().get(suffix).cloned()
            }
        };

        match bytes {
            Some(b) => Ok(Some(ServerState::from_bytes(&b)?)),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Copy)]
enum StateKind {
    Current,
    Trimmed,
}
