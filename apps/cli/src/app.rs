//! Upload session: wires the engine together, runs the queue and reports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bucketlift_engine::{QueueEvent, TaskStatus, UploadEngine, UploadQueue, UploadRequest};
use bucketlift_resume::{JsonResumeStore, ResumeStore};
use bucketlift_signing::{CredentialStore, Credentials, SigningClient};
use bucketlift_transfer::{FileSource, HttpPartUploader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Args;
use crate::config::Config;

/// Final tally of a session.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub done: usize,
    pub paused: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// Uploads every file named in `args`. Ctrl-C pauses the active upload so
/// the next invocation resumes it.
pub async fn run(args: Args, mut config: Config, config_path: PathBuf) -> anyhow::Result<Summary> {
    let credentials = Arc::new(CredentialStore::new(Credentials {
        access_token: config.signing.access_token.clone(),
        refresh_token: config.signing.refresh_token.clone(),
    }));
    let signing = Arc::new(SigningClient::new(
        config.signing.base_url.clone(),
        Arc::clone(&credentials),
    )?);
    let uploader = Arc::new(HttpPartUploader::new()?);
    let store = Arc::new(
        JsonResumeStore::open(config.resume_store.clone())
            .with_context(|| format!("opening resume store {}", config.resume_store.display()))?,
    );
    info!(
        path = %store.path().display(),
        pending = store.records().len(),
        "resume store opened"
    );

    let engine = UploadEngine::new(signing, uploader, store, config.engine.clone());
    let queue = UploadQueue::new(engine);

    let mut requests = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let source = FileSource::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let key = object_key(&args.prefix, &source.name);
        requests.push(UploadRequest::new(source, args.bucket.clone(), key));
    }

    let mut events = queue.subscribe();
    let ids = queue.enqueue(requests);

    let shutdown = CancellationToken::new();
    let driver = tokio::spawn({
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        async move { queue.run(shutdown).await }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut reported: HashMap<_, u64> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted, pausing the active upload");
                break;
            }
            event = events.recv() => match event {
                Ok(QueueEvent::Progress { id, loaded, total, speed }) => {
                    let percent = if total == 0 { 100 } else { loaded * 100 / total };
                    let last = reported.entry(id).or_insert(0);
                    if percent >= *last + 10 || (percent == 100 && *last != 100) {
                        *last = percent - percent % 10;
                        info!(task = %id, percent, loaded, total, bytes_per_sec = speed as u64, "progress");
                    }
                }
                Ok(QueueEvent::StatusChanged { id, status, error }) => {
                    match &error {
                        Some(e) => error!(task = %id, %status, error = %e, "upload status"),
                        None => info!(task = %id, %status, "upload status"),
                    }
                    if settled(queue.tasks().iter().map(|t| t.status)) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // The final status events may be among the dropped ones.
                    debug!(skipped, "event receiver lagged");
                    if settled(queue.tasks().iter().map(|t| t.status)) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    shutdown.cancel();
    driver.await.context("queue driver panicked")?;

    persist_rotated_tokens(&mut config, &config_path, &credentials);

    let mut summary = Summary::default();
    for id in ids {
        let Some(task) = queue.task(id) else { continue };
        match task.status {
            TaskStatus::Done => summary.done += 1,
            TaskStatus::Paused | TaskStatus::Queued | TaskStatus::Uploading => {
                summary.paused += 1;
            }
            TaskStatus::Error => summary.failed += 1,
            TaskStatus::Canceled => summary.canceled += 1,
        }
    }
    Ok(summary)
}

/// Returns `true` once no task is waiting or transferring.
fn settled(statuses: impl IntoIterator<Item = TaskStatus>) -> bool {
    statuses
        .into_iter()
        .all(|status| !matches!(status, TaskStatus::Queued | TaskStatus::Uploading))
}

/// Writes refreshed tokens back so the next run starts authenticated.
fn persist_rotated_tokens(config: &mut Config, path: &std::path::Path, credentials: &CredentialStore) {
    let current = credentials.snapshot();
    if current.access_token == config.signing.access_token
        && current.refresh_token == config.signing.refresh_token
    {
        return;
    }
    config.signing.access_token = current.access_token;
    config.signing.refresh_token = current.refresh_token;
    if let Err(e) = config.save(path) {
        warn!(error = %e, "failed to save refreshed credentials");
    }
}

/// Joins a key prefix and a file name with exactly one `/`.
pub fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
