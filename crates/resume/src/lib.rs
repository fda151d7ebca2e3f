//! Resume records for multipart uploads.
//!
//! A record remembers the remote upload id, the chosen part size and the
//! ETag of every acknowledged part so an interrupted transfer can pick up
//! where it stopped. Records are keyed by a fingerprint of the destination
//! and the source file (`bucket|key|size|lastModified`), so a record is only
//! ever reused for a byte-identical file going to the same place.

mod record;
mod store;

pub use record::{FileIdentity, Lookup, MultipartState, ResumeKey, ResumeRecord};
pub use store::{JsonResumeStore, MemoryResumeStore, ResumeStore};

/// Errors produced by the resume store.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
