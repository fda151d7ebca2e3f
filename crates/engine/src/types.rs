//! Engine data types.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bucketlift_resume::{FileIdentity, MultipartState};
use bucketlift_transfer::FileSource;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Monotonic identifier of a queued upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Uploading,
    Paused,
    Done,
    Error,
    Canceled,
}

impl TaskStatus {
    /// `done` and `canceled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A file and the object it should become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub source: FileSource,
    pub bucket: String,
    pub key: String,
}

impl UploadRequest {
    pub fn new(source: FileSource, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Identity used to key resume records.
    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(
            self.bucket.clone(),
            self.key.clone(),
            self.source.size,
            self.source.last_modified,
        )
    }
}

/// Snapshot of one queued upload.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub request: UploadRequest,
    /// Bytes transferred so far.
    pub loaded: u64,
    /// Smoothed throughput in bytes per second.
    pub speed: f64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub multipart: Option<MultipartState>,
}

impl UploadTask {
    pub fn total(&self) -> u64 {
        self.request.source.size
    }
}

/// Cumulative byte progress of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub loaded: u64,
    pub total: u64,
}

/// Phases of one multipart transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartPhase {
    Uninitialized,
    Initializing,
    Transferring,
    Completing,
    Done,
    Paused,
    Aborted,
    Failed,
}

impl fmt::Display for MultipartPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MultipartPhase::Uninitialized => "uninitialized",
            MultipartPhase::Initializing => "initializing",
            MultipartPhase::Transferring => "transferring",
            MultipartPhase::Completing => "completing",
            MultipartPhase::Done => "done",
            MultipartPhase::Paused => "paused",
            MultipartPhase::Aborted => "aborted",
            MultipartPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receives transfer notifications synchronously, on the transferring task.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);

    /// Called whenever the committed-parts set changes.
    fn on_multipart(&self, _state: &MultipartState) {}

    fn on_phase(&self, _phase: MultipartPhase) {}
}

/// Observer that ignores everything.
impl TransferObserver for () {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Why a running transfer was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
}

const REASON_NONE: u8 = 0;
const REASON_PAUSE: u8 = 1;
const REASON_CANCEL: u8 = 2;

/// Stop signal shared by everything working on one task run.
///
/// Raising it cancels the token; the reason tells the coordinator whether to
/// keep (pause) or discard (cancel) the resume state. Cancel overrides pause.
#[derive(Debug, Clone, Default)]
pub struct TaskSignal {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl TaskSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        let _ = self.reason.compare_exchange(
            REASON_NONE,
            REASON_PAUSE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.token.cancel();
    }

    pub fn cancel(&self) {
        self.reason.store(REASON_CANCEL, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            REASON_PAUSE => Some(StopReason::Pause),
            REASON_CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert_eq!(TaskStatus::Uploading.to_string(), "uploading");
        assert_eq!(serde_json::to_value(TaskStatus::Canceled).unwrap(), "canceled");
    }

    #[test]
    fn signal_reasons() {
        let signal = TaskSignal::new();
        assert!(!signal.is_raised());
        assert_eq!(signal.reason(), None);

        signal.pause();
        assert!(signal.is_raised());
        assert_eq!(signal.reason(), Some(StopReason::Pause));

        // Cancel wins over an earlier pause.
        signal.cancel();
        assert_eq!(signal.reason(), Some(StopReason::Cancel));

        // A later pause does not downgrade it.
        signal.pause();
        assert_eq!(signal.reason(), Some(StopReason::Cancel));
    }

    #[test]
    fn signal_clones_share_state() {
        let signal = TaskSignal::new();
        let clone = signal.clone();
        clone.cancel();
        assert!(signal.token().is_cancelled());
        assert_eq!(signal.reason(), Some(StopReason::Cancel));
    }

    #[test]
    fn request_identity() {
        let source = FileSource {
            path: "/tmp/a.bin".into(),
            size: 10,
            last_modified: 99,
            name: "a.bin".into(),
            content_type: "application/octet-stream".into(),
        };
        let req = UploadRequest::new(source, "media", "x/a.bin");
        assert_eq!(req.identity().resume_key().as_str(), "media|x/a.bin|10|99");
    }
}
