//! HTTP implementation of [`SigningApi`].
//!
//! Async client using `reqwest`. Every request carries the current access
//! token; a 401 triggers exactly one refresh-and-retry cycle.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::types::{
    AckResponse, CompleteMultipartRequest, CreateResponse, ObjectTarget, RefreshRequest,
    RefreshResponse, SignPartRequest, UploadRef, UrlResponse,
};
use crate::{SignFuture, SigningApi, SigningError};

const SIGN_SINGLE: &str = "/uploads/sign";
const MULTIPART_CREATE: &str = "/uploads/multipart/create";
const MULTIPART_SIGN_PART: &str = "/uploads/multipart/sign-part";
const MULTIPART_COMPLETE: &str = "/uploads/multipart/complete";
const MULTIPART_ABORT: &str = "/uploads/multipart/abort";
const AUTH_REFRESH: &str = "/auth/refresh";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Signing service client.
pub struct SigningClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    /// Serializes refreshes so concurrent 401s trigger a single refresh.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SigningClient {
    /// Creates a client for the service rooted at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, SigningError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the shared credential store.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Performs an authenticated POST, refreshing the token once on 401.
    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, SigningError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.credentials.access_token();
        let resp = self.send(endpoint, body, &token).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return decode(resp).await;
        }

        let original = rejection(resp).await;
        match self.refresh(&token).await {
            Ok(fresh) => {
                debug!(endpoint, "retrying after token refresh");
                let retry = self.send(endpoint, body, &fresh).await?;
                decode(retry).await
            }
            Err(e) => {
                warn!(endpoint, error = %e, "token refresh failed");
                Err(original)
            }
        }
    }

    async fn send<B>(
        &self,
        endpoint: &str,
        body: &B,
        token: &str,
    ) -> Result<reqwest::Response, SigningError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// `stale` is the access token that was rejected. If another caller has
    /// already replaced it, the current token is returned without a second
    /// refresh.
    async fn refresh(&self, stale: &str) -> Result<String, SigningError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.credentials.access_token();
        if current != stale {
            return Ok(current);
        }

        let refresh_token = self
            .credentials
            .refresh_token()
            .ok_or(SigningError::NoRefreshToken)?;

        let url = format!("{}{}", self.base_url, AUTH_REFRESH);
        let resp = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;
        let tokens: RefreshResponse = decode(resp).await?;

        self.credentials
            .replace(tokens.access_token.clone(), tokens.refresh_token);
        info!("access token refreshed");
        Ok(tokens.access_token)
    }

    async fn ack<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
        what: &'static str,
    ) -> Result<(), SigningError> {
        let ack: AckResponse = self.post(endpoint, body).await?;
        if ack.ok {
            Ok(())
        } else {
            Err(SigningError::NotAcknowledged(what))
        }
    }
}

impl SigningApi for SigningClient {
    fn sign_single(&self, target: ObjectTarget) -> SignFuture<'_, String> {
        Box::pin(async move {
            let resp: UrlResponse = self.post(SIGN_SINGLE, &target).await?;
            Ok(resp.url)
        })
    }

    fn create_multipart(&self, target: ObjectTarget) -> SignFuture<'_, String> {
        Box::pin(async move {
            let resp: CreateResponse = self.post(MULTIPART_CREATE, &target).await?;
            debug!(bucket = %target.bucket, key = %target.key, upload_id = %resp.upload_id, "multipart upload created");
            Ok(resp.upload_id)
        })
    }

    fn sign_part(&self, req: SignPartRequest) -> SignFuture<'_, String> {
        Box::pin(async move {
            let resp: UrlResponse = self.post(MULTIPART_SIGN_PART, &req).await?;
            Ok(resp.url)
        })
    }

    fn complete_multipart(&self, req: CompleteMultipartRequest) -> SignFuture<'_, ()> {
        Box::pin(async move { self.ack(MULTIPART_COMPLETE, &req, "complete").await })
    }

    fn abort_multipart(&self, upload: UploadRef) -> SignFuture<'_, ()> {
        Box::pin(async move { self.ack(MULTIPART_ABORT, &upload, "abort").await })
    }
}

/// Decodes a successful JSON response, or turns a non-2xx into `Rejected`.
///
/// An empty 2xx body decodes as `{}`.
async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, SigningError> {
    if !resp.status().is_success() {
        return Err(rejection(resp).await);
    }
    let body = resp.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_slice(b"{}")?);
    }
    Ok(serde_json::from_slice(&body)?)
}

async fn rejection(resp: reqwest::Response) -> SigningError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    SigningError::Rejected { status, body }
}
