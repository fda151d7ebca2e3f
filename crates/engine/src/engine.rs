//! Per-file transfer entry point.

use std::sync::Arc;

use bucketlift_resume::{MultipartState, ResumeStore};
use bucketlift_signing::{ObjectTarget, SigningApi, UploadRef};
use bucketlift_transfer::{PartUploader, PutRequest, TransferStrategy, select_strategy};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::multipart::MultipartCoordinator;
use crate::types::{ProgressEvent, TaskSignal, TransferObserver, UploadRequest};

/// Moves files to the object store with single PUTs or resumable
/// multipart uploads.
#[derive(Clone)]
pub struct UploadEngine {
    signing: Arc<dyn SigningApi>,
    uploader: Arc<dyn PartUploader>,
    store: Arc<dyn ResumeStore>,
    config: EngineConfig,
}

impl UploadEngine {
    pub fn new(
        signing: Arc<dyn SigningApi>,
        uploader: Arc<dyn PartUploader>,
        store: Arc<dyn ResumeStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            signing,
            uploader,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResumeStore> {
        &self.store
    }

    /// Transfers one file, reporting to `observer` and stopping when
    /// `signal` is raised.
    ///
    /// Pause and cancel both end in [`UploadError::Canceled`]; the signal's
    /// reason decides whether resume state is kept. `known` is multipart
    /// state from an earlier attempt, used when the store has no record.
    pub async fn transfer(
        &self,
        request: &UploadRequest,
        known: Option<&MultipartState>,
        observer: &dyn TransferObserver,
        signal: &TaskSignal,
    ) -> Result<(), UploadError> {
        let size = request.source.size;
        match select_strategy(size, &self.config.strategy) {
            TransferStrategy::Single => {
                debug!(bucket = %request.bucket, key = %request.key, size, "single PUT");
                self.transfer_single(request, observer, signal).await
            }
            TransferStrategy::Multipart { part_size } => {
                debug!(bucket = %request.bucket, key = %request.key, size, part_size, "multipart upload");
                MultipartCoordinator {
                    signing: self.signing.as_ref(),
                    uploader: self.uploader.as_ref(),
                    store: self.store.as_ref(),
                    config: &self.config,
                    observer,
                    signal,
                    request,
                    known,
                }
                .run(part_size)
                .await
            }
        }
    }

    async fn transfer_single(
        &self,
        request: &UploadRequest,
        observer: &dyn TransferObserver,
        signal: &TaskSignal,
    ) -> Result<(), UploadError> {
        let cancel = signal.token();
        let sign = self.signing.sign_single(ObjectTarget {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            content_type: request.source.content_type.clone(),
        });
        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Canceled),
            url = sign => url?,
        };

        let total = request.source.size;
        let on_progress = |loaded: u64| observer.on_progress(ProgressEvent { loaded, total });
        self.uploader
            .put_range(PutRequest {
                url: &url,
                source: &request.source,
                range: request.source.full_range(),
                content_type: &request.source.content_type,
                on_progress: &on_progress,
                cancel,
            })
            .await?;

        info!(bucket = %request.bucket, key = %request.key, size = total, "upload completed");
        Ok(())
    }

    /// Forgets the resume state of `request` and abandons its remote upload.
    ///
    /// `known` is the task's in-memory state, used when the store has no
    /// record (for example when persisting it failed).
    pub async fn discard(
        &self,
        request: &UploadRequest,
        known: Option<&MultipartState>,
    ) -> Result<(), UploadError> {
        let key = request.identity().resume_key();
        let record = self.store.get(&key);
        let removed = self.store.remove(&key);
        if let Err(e) = &removed {
            warn!(key = %key, error = %e, "failed to remove resume record");
        }

        let upload_id = record
            .map(|r| r.upload_id)
            .or_else(|| known.map(|s| s.upload_id.clone()));
        let Some(upload_id) = upload_id else {
            return removed.map_err(UploadError::from);
        };

        info!(key = %key, upload_id = %upload_id, "discarding multipart upload");
        let upload = UploadRef {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            upload_id,
        };
        if let Err(e) = self.signing.abort_multipart(upload).await {
            warn!(key = %key, error = %e, "abort failed");
        }
        removed.map_err(UploadError::from)
    }
}
