//! Byte movement for uploads: strategy selection, ranged PUTs against
//! pre-signed URLs, and throughput metering.

mod progress;
mod source;
mod strategy;
mod uploader;

pub use progress::ThroughputMeter;
pub use source::{FileSource, detect_content_type};
pub use strategy::{
    ByteRange, MIB, StrategyConfig, TransferStrategy, part_count, part_range, select_strategy,
};
pub use uploader::{HttpPartUploader, PartUploader, PutFuture, PutRequest};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("object store returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("object store response carried no ETag")]
    MissingETag,

    #[error("transfer canceled")]
    Canceled,
}
