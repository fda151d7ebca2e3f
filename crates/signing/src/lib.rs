//! Signing service client.
//!
//! The signing service hands out short-lived pre-signed URLs and drives the
//! store-side multipart transaction (create, complete, abort). Every call is
//! bearer-authenticated; an expired access token is refreshed once and the
//! call retried transparently.

pub mod client;
pub mod credentials;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use client::SigningClient;
pub use credentials::{CredentialStore, Credentials};
pub use types::{
    CompleteMultipartRequest, CompletedPart, ObjectTarget, SignPartRequest, UploadRef,
};

/// Errors from the signing service.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("signing service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("signing service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid signing response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("signing service did not acknowledge {0}")]
    NotAcknowledged(&'static str),

    #[error("no refresh token available")]
    NoRefreshToken,
}

impl SigningError {
    /// Returns `true` if the service rejected the access credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SigningError::Rejected { status: 401, .. })
    }
}

/// Boxed future returned by [`SigningApi`] methods.
pub type SignFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SigningError>> + Send + 'a>>;

/// Operations the upload engine needs from the signing service.
///
/// [`SigningClient`] implements this over HTTP; tests substitute mocks.
pub trait SigningApi: Send + Sync {
    /// Returns a pre-signed URL for a single-shot PUT of the whole object.
    fn sign_single(&self, target: ObjectTarget) -> SignFuture<'_, String>;

    /// Starts a multipart upload and returns its upload id.
    fn create_multipart(&self, target: ObjectTarget) -> SignFuture<'_, String>;

    /// Returns a pre-signed URL for uploading one part.
    fn sign_part(&self, req: SignPartRequest) -> SignFuture<'_, String>;

    /// Finalizes a multipart upload from its parts.
    fn complete_multipart(&self, req: CompleteMultipartRequest) -> SignFuture<'_, ()>;

    /// Abandons a multipart upload and its stored parts.
    fn abort_multipart(&self, upload: UploadRef) -> SignFuture<'_, ()>;
}
