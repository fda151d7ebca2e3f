//! Multipart coordinator.
//!
//! Drives one file through create-or-resume, a bounded pool of concurrent
//! part uploads, and complete or abort. The resume record is written right
//! after the upload id is obtained and again after every acknowledged part,
//! so a restart picks up from the last committed part.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bucketlift_resume::{FileIdentity, Lookup, MultipartState, ResumeKey, ResumeRecord, ResumeStore};
use bucketlift_signing::{
    CompleteMultipartRequest, CompletedPart, ObjectTarget, SignPartRequest, SigningApi, UploadRef,
};
use bucketlift_transfer::{ByteRange, PartUploader, PutRequest, part_count, part_range};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::types::{MultipartPhase, ProgressEvent, StopReason, TaskSignal, TransferObserver, UploadRequest};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one multipart transfer needs, borrowed from the engine.
pub(crate) struct MultipartCoordinator<'a> {
    pub signing: &'a dyn SigningApi,
    pub uploader: &'a dyn PartUploader,
    pub store: &'a dyn ResumeStore,
    pub config: &'a EngineConfig,
    pub observer: &'a dyn TransferObserver,
    pub signal: &'a TaskSignal,
    pub request: &'a UploadRequest,
    /// In-memory state of an earlier attempt, if any.
    pub known: Option<&'a MultipartState>,
}

/// State shared by the workers of one run.
struct PartsRun {
    identity: FileIdentity,
    key: ResumeKey,
    upload_id: String,
    part_size: u64,
    state: Mutex<MultipartState>,
    progress: Mutex<Progress>,
    /// Part numbers still to upload, claimed in order through `next`.
    pending: Vec<u32>,
    next: AtomicUsize,
    /// Child of the task token; also raised by the first failing worker.
    cancel: CancellationToken,
}

struct Progress {
    /// Bytes of committed parts.
    completed: u64,
    /// Bytes sent so far of parts still uploading.
    in_flight: HashMap<u32, u64>,
}

impl PartsRun {
    fn range(&self, part: u32) -> ByteRange {
        part_range(part, self.part_size, self.identity.size)
    }

    fn report(&self, part: u32, sent: u64, observer: &dyn TransferObserver) {
        let mut progress = lock(&self.progress);
        progress.in_flight.insert(part, sent);
        self.emit(&progress, observer);
    }

    fn emit(&self, progress: &Progress, observer: &dyn TransferObserver) {
        let loaded = progress.completed + progress.in_flight.values().sum::<u64>();
        observer.on_progress(ProgressEvent {
            loaded: loaded.min(self.identity.size),
            total: self.identity.size,
        });
    }
}

impl MultipartCoordinator<'_> {
    /// Runs the transfer to completion, pause, cancel or failure.
    ///
    /// `part_size` applies to fresh uploads; a resumed upload keeps the part
    /// size it was started with.
    pub async fn run(&self, part_size: u64) -> Result<(), UploadError> {
        let identity = self.request.identity();
        let key = identity.resume_key();

        self.phase(MultipartPhase::Initializing);
        let state = match self.prepare(&identity, &key, part_size).await {
            Ok(state) => state,
            Err(e) => return Err(self.stopped(e, None, &key).await),
        };

        let upload = self.upload_ref(&state.upload_id);
        match self.transfer(identity, key.clone(), state).await {
            Ok(()) => {
                self.phase(MultipartPhase::Done);
                Ok(())
            }
            Err(e) => Err(self.stopped(e, Some(upload), &key).await),
        }
    }

    /// Resolves the upload to continue: an adopted resume record or a fresh
    /// remote upload, persisted before any part is sent.
    async fn prepare(
        &self,
        identity: &FileIdentity,
        key: &ResumeKey,
        part_size: u64,
    ) -> Result<MultipartState, UploadError> {
        self.purge_superseded(identity).await;

        let mut from_memory = false;
        let existing = match self.store.lookup(identity)? {
            Lookup::Found(record) => {
                info!(
                    key = %key,
                    upload_id = %record.upload_id,
                    committed = record.parts.len(),
                    "resuming multipart upload"
                );
                Some(record.state())
            }
            Lookup::Stale(record) => {
                info!(key = %key, upload_id = %record.upload_id, "discarded stale resume record");
                self.abort_quietly(UploadRef {
                    bucket: record.bucket,
                    key: record.key,
                    upload_id: record.upload_id,
                })
                .await;
                None
            }
            Lookup::Absent => match self.known {
                Some(state)
                    if ResumeRecord::new(identity, &self.request.source.name, state)
                        .is_valid_for(identity) =>
                {
                    info!(
                        key = %key,
                        upload_id = %state.upload_id,
                        committed = state.parts.len(),
                        "resuming multipart upload from memory"
                    );
                    from_memory = true;
                    Some(state.clone())
                }
                _ => None,
            },
        };

        let part_size = existing.as_ref().map_or(part_size, |s| s.part_size);
        let parts = part_count(identity.size, part_size);
        if parts > u64::from(self.config.max_parts) {
            return Err(UploadError::TooManyParts {
                parts,
                max: self.config.max_parts,
            });
        }

        if let Some(state) = existing {
            if from_memory {
                self.persist(identity, key, &state);
            }
            self.observer.on_multipart(&state);
            return Ok(state);
        }

        let create = self.signing.create_multipart(ObjectTarget {
            bucket: self.request.bucket.clone(),
            key: self.request.key.clone(),
            content_type: self.request.source.content_type.clone(),
        });
        let upload_id = tokio::select! {
            biased;
            _ = self.signal.token().cancelled() => return Err(UploadError::Canceled),
            id = create => id?,
        };
        info!(key = %key, upload_id = %upload_id, part_size, parts, "multipart upload created");

        let state = MultipartState::new(upload_id, part_size);
        self.persist(identity, key, &state);
        self.observer.on_multipart(&state);
        Ok(state)
    }

    async fn transfer(
        &self,
        identity: FileIdentity,
        key: ResumeKey,
        state: MultipartState,
    ) -> Result<(), UploadError> {
        self.phase(MultipartPhase::Transferring);

        let count = state.part_count(identity.size);
        let pending: Vec<u32> = (1..=count).filter(|&n| !state.is_committed(n)).collect();
        let completed = state
            .parts
            .keys()
            .map(|&n| part_range(n, state.part_size, identity.size).len())
            .sum();

        let run = PartsRun {
            upload_id: state.upload_id.clone(),
            part_size: state.part_size,
            identity,
            key,
            state: Mutex::new(state),
            progress: Mutex::new(Progress {
                completed,
                in_flight: HashMap::new(),
            }),
            pending,
            next: AtomicUsize::new(0),
            cancel: self.signal.token().child_token(),
        };

        if !run.pending.is_empty() {
            let workers = self.config.max_concurrency.max(1).min(run.pending.len());
            debug!(
                key = %run.key,
                pending = run.pending.len(),
                total = count,
                workers,
                "starting part workers"
            );

            let results = join_all((0..workers).map(|_| self.worker(&run))).await;
            let mut canceled = false;
            for result in results {
                match result {
                    Ok(()) => {}
                    Err(UploadError::Canceled) => canceled = true,
                    Err(e) => return Err(e),
                }
            }
            if canceled {
                return Err(UploadError::Canceled);
            }
        }

        if self.signal.is_raised() {
            return Err(UploadError::Canceled);
        }

        self.phase(MultipartPhase::Completing);
        let parts: Vec<CompletedPart> = lock(&run.state)
            .parts
            .iter()
            .map(|(&part_number, etag)| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect();

        self.signing
            .complete_multipart(CompleteMultipartRequest {
                bucket: self.request.bucket.clone(),
                key: self.request.key.clone(),
                upload_id: run.upload_id.clone(),
                parts,
            })
            .await?;

        if let Err(e) = self.store.remove(&run.key) {
            warn!(key = %run.key, error = %e, "failed to remove resume record");
        }
        info!(key = %run.key, upload_id = %run.upload_id, parts = count, "multipart upload completed");
        Ok(())
    }

    /// Claims and uploads parts until none are left or the run stops.
    async fn worker(&self, run: &PartsRun) -> Result<(), UploadError> {
        loop {
            if run.cancel.is_cancelled() {
                return Err(UploadError::Canceled);
            }
            let idx = run.next.fetch_add(1, Ordering::SeqCst);
            let Some(&part) = run.pending.get(idx) else {
                return Ok(());
            };

            match self.upload_with_retry(run, part).await {
                Ok(etag) => self.commit(run, part, etag),
                Err(e) => {
                    if !e.is_canceled() {
                        // Stop the siblings; the first real error wins.
                        run.cancel.cancel();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn upload_with_retry(&self, run: &PartsRun, part: u32) -> Result<String, UploadError> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            let err = match self.upload_part(run, part).await {
                Ok(etag) => return Ok(etag),
                Err(e) => e,
            };

            lock(&run.progress).in_flight.remove(&part);
            if err.is_canceled() || attempt >= policy.part_retries {
                return Err(err);
            }

            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            warn!(
                key = %run.key,
                part,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "part upload failed, retrying"
            );
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(UploadError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn upload_part(&self, run: &PartsRun, part: u32) -> Result<String, UploadError> {
        let sign = self.signing.sign_part(SignPartRequest {
            bucket: self.request.bucket.clone(),
            key: self.request.key.clone(),
            upload_id: run.upload_id.clone(),
            part_number: part,
        });
        let url = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(UploadError::Canceled),
            url = sign => url?,
        };

        let range = run.range(part);
        let on_progress = |sent: u64| run.report(part, sent, self.observer);
        let etag = self
            .uploader
            .put_range(PutRequest {
                url: &url,
                source: &self.request.source,
                range,
                content_type: &self.request.source.content_type,
                on_progress: &on_progress,
                cancel: &run.cancel,
            })
            .await?;
        debug!(key = %run.key, part, bytes = range.len(), "part uploaded");
        Ok(etag)
    }

    /// Records an acknowledged part. Runs without suspending, so a stop
    /// signal either sees the part fully committed or not at all.
    fn commit(&self, run: &PartsRun, part: u32, etag: String) {
        {
            let mut state = lock(&run.state);
            state.parts.insert(part, etag);
            self.persist(&run.identity, &run.key, &state);
            self.observer.on_multipart(&state);
        }

        let mut progress = lock(&run.progress);
        progress.in_flight.remove(&part);
        progress.completed += run.range(part).len();
        run.emit(&progress, self.observer);
    }

    fn persist(&self, identity: &FileIdentity, key: &ResumeKey, state: &MultipartState) {
        let record = ResumeRecord::new(identity, &self.request.source.name, state);
        if let Err(e) = self.store.upsert(key, &record) {
            warn!(key = %key, error = %e, "failed to persist resume record");
        }
    }

    /// Settles a run that did not complete and returns its error.
    async fn stopped(
        &self,
        err: UploadError,
        upload: Option<UploadRef>,
        key: &ResumeKey,
    ) -> UploadError {
        match self.signal.reason() {
            // A user cancel wins over whatever error the run ended with.
            Some(StopReason::Cancel) => {
                self.phase(MultipartPhase::Aborted);
                if let Some(upload) = upload {
                    self.abort_quietly(upload).await;
                }
                if let Err(e) = self.store.remove(key) {
                    warn!(key = %key, error = %e, "failed to remove resume record");
                }
                info!(key = %key, "multipart upload aborted");
                UploadError::Canceled
            }
            Some(StopReason::Pause) if err.is_canceled() => {
                self.phase(MultipartPhase::Paused);
                info!(key = %key, "multipart upload paused");
                err
            }
            _ => {
                self.phase(MultipartPhase::Failed);
                warn!(key = %key, error = %err, "multipart upload failed");
                err
            }
        }
    }

    /// Drops records for this destination left by an earlier version of the
    /// file and abandons their remote uploads.
    async fn purge_superseded(&self, identity: &FileIdentity) {
        let purged = match self.store.purge_superseded(identity) {
            Ok(purged) => purged,
            Err(e) => {
                warn!(bucket = %identity.bucket, key = %identity.key, error = %e, "failed to purge superseded resume records");
                return;
            }
        };
        for record in purged {
            info!(upload_id = %record.upload_id, "abandoning upload of a previous file version");
            self.abort_quietly(UploadRef {
                bucket: record.bucket,
                key: record.key,
                upload_id: record.upload_id,
            })
            .await;
        }
    }

    async fn abort_quietly(&self, upload: UploadRef) {
        let upload_id = upload.upload_id.clone();
        if let Err(e) = self.signing.abort_multipart(upload).await {
            warn!(upload_id = %upload_id, error = %e, "abort failed");
        }
    }

    fn upload_ref(&self, upload_id: &str) -> UploadRef {
        UploadRef {
            bucket: self.request.bucket.clone(),
            key: self.request.key.clone(),
            upload_id: upload_id.to_string(),
        }
    }

    fn phase(&self, phase: MultipartPhase) {
        debug!(bucket = %self.request.bucket, key = %self.request.key, %phase, "multipart phase");
        self.observer.on_phase(phase);
    }
}
