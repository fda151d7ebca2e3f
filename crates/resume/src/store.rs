use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::ResumeError;
use crate::record::{FileIdentity, Lookup, ResumeKey, ResumeRecord};

/// Keyed persistence of resume records.
///
/// Implementations must serialize writes so that a reader never observes a
/// completed-parts set shrinking while a transfer is in progress.
pub trait ResumeStore: Send + Sync {
    /// Returns the record stored under `key`, if any.
    fn get(&self, key: &ResumeKey) -> Option<ResumeRecord>;

    /// Inserts or replaces the record stored under `key`.
    fn upsert(&self, key: &ResumeKey, record: &ResumeRecord) -> Result<(), ResumeError>;

    /// Removes the record stored under `key`. Missing keys are not an error.
    fn remove(&self, key: &ResumeKey) -> Result<(), ResumeError>;

    /// Returns every stored record.
    fn records(&self) -> Vec<(ResumeKey, ResumeRecord)>;

    /// Looks up the record for `identity`, discarding it if it is stale.
    fn lookup(&self, identity: &FileIdentity) -> Result<Lookup, ResumeError> {
        let key = identity.resume_key();
        let Some(record) = self.get(&key) else {
            return Ok(Lookup::Absent);
        };
        if record.is_valid_for(identity) {
            return Ok(Lookup::Found(record));
        }
        debug!(key = %key, "discarding stale resume record");
        self.remove(&key)?;
        Ok(Lookup::Stale(record))
    }

    /// Removes records for the same destination whose file identity differs
    /// from `identity` (the file changed since they were written).
    fn purge_superseded(&self, identity: &FileIdentity) -> Result<Vec<ResumeRecord>, ResumeError> {
        let current = identity.resume_key();
        let mut purged = Vec::new();
        for (key, record) in self.records() {
            if key != current && record.same_destination(identity) {
                self.remove(&key)?;
                purged.push(record);
            }
        }
        Ok(purged)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Resume store persisted as a single JSON object on disk.
///
/// Records are cached in memory; every mutation rewrites the file through a
/// temporary sibling and a rename, while holding the cache lock.
pub struct JsonResumeStore {
    path: PathBuf,
    records: Mutex<HashMap<ResumeKey, ResumeRecord>>,
}

impl JsonResumeStore {
    /// Opens the store at `path`, loading existing records.
    ///
    /// A missing file yields an empty store. A file that cannot be decoded is
    /// treated as empty, and individual entries that fail to decode are
    /// dropped.
    pub fn open(path: PathBuf) -> Result<Self, ResumeError> {
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &HashMap<ResumeKey, ResumeRecord>) -> Result<(), ResumeError> {
        let ordered: BTreeMap<&str, &ResumeRecord> =
            records.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let json = serde_json::to_vec_pretty(&ordered)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} resume record(s) to {:?}", records.len(), self.path);
        Ok(())
    }
}

impl ResumeStore for JsonResumeStore {
    fn get(&self, key: &ResumeKey) -> Option<ResumeRecord> {
        lock(&self.records).get(key).cloned()
    }

    fn upsert(&self, key: &ResumeKey, record: &ResumeRecord) -> Result<(), ResumeError> {
        let mut records = lock(&self.records);
        records.insert(key.clone(), record.clone());
        self.persist(&records)
    }

    fn remove(&self, key: &ResumeKey) -> Result<(), ResumeError> {
        let mut records = lock(&self.records);
        if records.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&records)
    }

    fn records(&self) -> Vec<(ResumeKey, ResumeRecord)> {
        lock(&self.records)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Loads records from a JSON file on disk.
fn load_records(path: &Path) -> Result<HashMap<ResumeKey, ResumeRecord>, ResumeError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let raw: HashMap<String, Box<RawValue>> = match serde_json::from_str(&data) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "resume store unreadable, starting empty");
            return Ok(HashMap::new());
        }
    };

    let mut records = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        match serde_json::from_str::<ResumeRecord>(value.get()) {
            Ok(record) => {
                records.insert(ResumeKey::from(key), record);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "dropping undecodable resume record");
            }
        }
    }
    debug!("loaded {} resume record(s) from {:?}", records.len(), path);
    Ok(records)
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Resume store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryResumeStore {
    records: Mutex<HashMap<ResumeKey, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn get(&self, key: &ResumeKey) -> Option<ResumeRecord> {
        lock(&self.records).get(key).cloned()
    }

    fn upsert(&self, key: &ResumeKey, record: &ResumeRecord) -> Result<(), ResumeError> {
        lock(&self.records).insert(key.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &ResumeKey) -> Result<(), ResumeError> {
        lock(&self.records).remove(key);
        Ok(())
    }

    fn records(&self) -> Vec<(ResumeKey, ResumeRecord)> {
        lock(&self.records)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
