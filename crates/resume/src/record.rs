use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one file going to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Source modification time, milliseconds since the Unix epoch.
    pub last_modified: u64,
}

impl FileIdentity {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, size: u64, last_modified: u64) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size,
            last_modified,
        }
    }

    /// Returns the resume key for this identity.
    pub fn resume_key(&self) -> ResumeKey {
        ResumeKey(format!(
            "{}|{}|{}|{}",
            self.bucket, self.key, self.size, self.last_modified
        ))
    }
}

/// Composite key of a resume record: `bucket|key|size|lastModified`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResumeKey(String);

impl ResumeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResumeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ResumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload-id scoped progress of one multipart transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartState {
    pub upload_id: String,
    pub part_size: u64,
    /// Part number (1-based) to committed ETag.
    pub parts: BTreeMap<u32, String>,
}

impl MultipartState {
    /// Creates a state with no committed parts.
    pub fn new(upload_id: impl Into<String>, part_size: u64) -> Self {
        Self {
            upload_id: upload_id.into(),
            part_size,
            parts: BTreeMap::new(),
        }
    }

    /// Returns `true` if the part already has a committed ETag.
    pub fn is_committed(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    /// Number of parts needed to cover `size` bytes.
    pub fn part_count(&self, size: u64) -> u32 {
        if self.part_size == 0 {
            return 0;
        }
        size.div_ceil(self.part_size).max(1) as u32
    }
}

/// Persisted form of [`MultipartState`] plus the file identity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub upload_id: String,
    pub part_size: u64,
    #[serde(default)]
    pub parts: BTreeMap<u32, String>,
    pub size: u64,
    pub last_modified: u64,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
}

impl ResumeRecord {
    /// Builds a record from the in-memory state.
    pub fn new(identity: &FileIdentity, name: &str, state: &MultipartState) -> Self {
        Self {
            upload_id: state.upload_id.clone(),
            part_size: state.part_size,
            parts: state.parts.clone(),
            size: identity.size,
            last_modified: identity.last_modified,
            bucket: identity.bucket.clone(),
            key: identity.key.clone(),
            name: name.to_string(),
        }
    }

    /// Returns the in-memory state carried by this record.
    pub fn state(&self) -> MultipartState {
        MultipartState {
            upload_id: self.upload_id.clone(),
            part_size: self.part_size,
            parts: self.parts.clone(),
        }
    }

    /// Returns `true` if the record targets the same destination.
    pub fn same_destination(&self, identity: &FileIdentity) -> bool {
        self.bucket == identity.bucket && self.key == identity.key
    }

    /// Returns `true` if the record can be reused for `identity`.
    ///
    /// The destination, size and modification time must all match, and the
    /// record itself must be well formed: non-zero part size, non-empty
    /// upload id and ETags, and part numbers inside `1..=part_count`.
    pub fn is_valid_for(&self, identity: &FileIdentity) -> bool {
        if !self.same_destination(identity)
            || self.size != identity.size
            || self.last_modified != identity.last_modified
        {
            return false;
        }
        if self.part_size == 0 || self.upload_id.is_empty() {
            return false;
        }
        let count = self.state().part_count(self.size);
        self.parts
            .iter()
            .all(|(&n, etag)| n >= 1 && n <= count && !etag.is_empty())
    }
}

/// Outcome of looking up a resume record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A reusable record.
    Found(ResumeRecord),
    /// A record existed but did not match the file; it has been discarded.
    Stale(ResumeRecord),
    /// No record.
    Absent,
}
