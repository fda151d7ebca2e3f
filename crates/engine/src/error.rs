//! Engine error types.

use bucketlift_resume::ResumeError;
use bucketlift_signing::SigningError;
use bucketlift_transfer::TransferError;

use crate::types::{TaskId, TaskStatus};

/// Why a transfer did not finish.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("signing failed: {0}")]
    SigningFailed(#[from] SigningError),

    #[error("transfer failed: {0}")]
    TransferFailed(TransferError),

    #[error("object store returned no ETag")]
    MissingETag,

    /// Raised by pause or cancel; not a failure.
    #[error("upload canceled")]
    Canceled,

    #[error("file needs {parts} parts, more than the limit of {max}")]
    TooManyParts { parts: u64, max: u32 },

    #[error("resume store error: {0}")]
    Resume(#[from] ResumeError),
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Canceled => UploadError::Canceled,
            TransferError::MissingETag => UploadError::MissingETag,
            other => UploadError::TransferFailed(other),
        }
    }
}

impl UploadError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, UploadError::Canceled)
    }
}

/// Misuse of the queue API.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("cannot {action} task {id} while {status}")]
    InvalidTransition {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },
}
