//! Resumable upload engine.
//!
//! Gets local files into an S3-compatible bucket through pre-signed URLs.
//! Small files go up in one PUT; large files are split into parts that are
//! uploaded concurrently and recorded in a resume store after every part, so
//! a transfer survives restarts, pauses and network failures.
//!
//! # Pieces
//!
//! - [`UploadEngine`] transfers one file, choosing single or multipart.
//! - [`UploadQueue`] holds the user-visible tasks and runs them one at a
//!   time in FIFO order.

mod config;
mod engine;
mod error;
mod multipart;
mod queue;
mod types;

pub use config::{EngineConfig, RetryPolicy};
pub use engine::UploadEngine;
pub use error::{QueueError, UploadError};
pub use queue::{QueueEvent, UploadQueue};
pub use types::{
    MultipartPhase, ProgressEvent, StopReason, TaskId, TaskSignal, TaskStatus, TransferObserver,
    UploadRequest, UploadTask,
};
