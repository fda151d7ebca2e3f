//! FIFO upload queue.
//!
//! One task transfers at a time; parallelism lives inside a multipart
//! transfer. The driver ([`UploadQueue::run`]) picks the oldest `queued`
//! task unless the queue is globally paused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bucketlift_resume::MultipartState;
use bucketlift_transfer::ThroughputMeter;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::UploadEngine;
use crate::error::{QueueError, UploadError};
use crate::types::{
    MultipartPhase, ProgressEvent, StopReason, TaskId, TaskSignal, TaskStatus, TransferObserver,
    UploadRequest, UploadTask,
};

const EVENT_CAPACITY: usize = 1024;

/// Change notifications broadcast by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added(TaskId),
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
    Progress {
        id: TaskId,
        loaded: u64,
        total: u64,
        speed: f64,
    },
    Removed(TaskId),
}

/// Handle to the upload queue. Clones share the same queue.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    engine: UploadEngine,
    state: Mutex<QueueState>,
    wake: Notify,
    paused: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Default)]
struct QueueState {
    /// Tasks in enqueue order.
    tasks: Vec<UploadTask>,
    meters: HashMap<TaskId, ThroughputMeter>,
    next_id: u64,
    active: Option<(TaskId, TaskSignal)>,
    /// Set when the active task was resumed while its pause was unwinding.
    requeue_active: bool,
}

impl QueueState {
    fn get_mut(&mut self, id: TaskId) -> Result<&mut UploadTask, QueueError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(QueueError::UnknownTask(id))
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn status_changed(&self, task: &UploadTask) {
        self.emit(QueueEvent::StatusChanged {
            id: task.id,
            status: task.status,
            error: task.error.clone(),
        });
    }
}

impl UploadQueue {
    pub fn new(engine: UploadEngine) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                engine,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                paused: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Subscribes to queue events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Appends one task per request, in order.
    pub fn enqueue(&self, requests: Vec<UploadRequest>) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(requests.len());
        {
            let mut state = self.inner.lock();
            for request in requests {
                state.next_id += 1;
                let id = TaskId(state.next_id);
                debug!(task = %id, bucket = %request.bucket, key = %request.key, size = request.source.size, "task queued");
                state.tasks.push(UploadTask {
                    id,
                    request,
                    loaded: 0,
                    speed: 0.0,
                    status: TaskStatus::Queued,
                    error: None,
                    multipart: None,
                });
                state.meters.insert(id, ThroughputMeter::default());
                ids.push(id);
            }
        }
        for &id in &ids {
            self.inner.emit(QueueEvent::Added(id));
        }
        self.inner.wake.notify_one();
        ids
    }

    /// Pauses a task. A queued task is parked; the active one is signaled
    /// and becomes `paused` once its transfer unwinds.
    pub fn pause(&self, id: TaskId) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let active = state.active.clone();
        let task = state.get_mut(id)?;
        let status = task.status;
        match status {
            TaskStatus::Queued => {
                task.status = TaskStatus::Paused;
                self.inner.status_changed(task);
                Ok(())
            }
            TaskStatus::Uploading => {
                if let Some((active_id, signal)) = active {
                    if active_id == id {
                        info!(task = %id, "pausing active task");
                        signal.pause();
                        state.requeue_active = false;
                    }
                }
                Ok(())
            }
            TaskStatus::Paused => Ok(()),
            status => Err(QueueError::InvalidTransition {
                id,
                status,
                action: "pause",
            }),
        }
    }

    /// Re-queues a paused or failed task. Its byte count is left as is.
    pub fn resume(&self, id: TaskId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            let active = state.active.clone();
            let task = state.get_mut(id)?;
            let status = task.status;
            match status {
                TaskStatus::Paused | TaskStatus::Error => {
                    task.status = TaskStatus::Queued;
                    task.error = None;
                    self.inner.status_changed(task);
                }
                TaskStatus::Uploading => {
                    // A pause still unwinding: queue the task again once it
                    // settles instead of leaving it paused.
                    if let Some((active_id, signal)) = active {
                        if active_id == id && signal.reason() == Some(StopReason::Pause) {
                            info!(task = %id, "resume requested while pausing");
                            state.requeue_active = true;
                        }
                    }
                    return Ok(());
                }
                TaskStatus::Queued => return Ok(()),
                status => {
                    return Err(QueueError::InvalidTransition {
                        id,
                        status,
                        action: "resume",
                    });
                }
            }
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Cancels a task. The active task is signaled and aborts itself; any
    /// other task is marked canceled here and its resume state discarded.
    pub async fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
        let (request, multipart) = {
            let mut state = self.inner.lock();
            let active = state.active.clone();
            let task = state.get_mut(id)?;
            match task.status {
                TaskStatus::Uploading => {
                    if let Some((active_id, signal)) = active {
                        if active_id == id {
                            info!(task = %id, "canceling active task");
                            signal.cancel();
                        }
                    }
                    return Ok(());
                }
                TaskStatus::Queued | TaskStatus::Paused | TaskStatus::Error => {
                    task.status = TaskStatus::Canceled;
                    task.error = None;
                    task.speed = 0.0;
                    self.inner.status_changed(task);
                    (task.request.clone(), task.multipart.take())
                }
                TaskStatus::Canceled => return Ok(()),
                status => {
                    return Err(QueueError::InvalidTransition {
                        id,
                        status,
                        action: "cancel",
                    });
                }
            }
        };

        info!(task = %id, "task canceled");
        if let Err(e) = self.inner.engine.discard(&request, multipart.as_ref()).await {
            warn!(task = %id, error = %e, "failed to discard resume state");
        }
        Ok(())
    }

    /// Stops the driver from starting new tasks. The active task continues.
    pub fn pause_all(&self) {
        info!("queue paused");
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_all(&self) {
        info!("queue resumed");
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Drops `done` and `canceled` tasks.
    pub fn clear_completed(&self) -> Vec<TaskId> {
        let removed: Vec<TaskId> = {
            let mut state = self.inner.lock();
            let removed: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|t| t.status.is_terminal())
                .map(|t| t.id)
                .collect();
            state.tasks.retain(|t| !t.status.is_terminal());
            for id in &removed {
                state.meters.remove(id);
            }
            removed
        };
        for &id in &removed {
            self.inner.emit(QueueEvent::Removed(id));
        }
        removed
    }

    /// Snapshot of every task, in enqueue order.
    pub fn tasks(&self) -> Vec<UploadTask> {
        self.inner.lock().tasks.clone()
    }

    pub fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Drives the queue until `shutdown` fires. On shutdown the active task
    /// is paused, so its resume state survives for the next run.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let Some((id, signal, request)) = self.claim_next() else {
                tokio::select! {
                    _ = self.inner.wake.notified() => {}
                    _ = shutdown.cancelled() => {}
                }
                continue;
            };

            let work = self.process(id, &signal, request);
            tokio::pin!(work);
            tokio::select! {
                _ = &mut work => {}
                _ = shutdown.cancelled() => {
                    signal.pause();
                    work.await;
                    break;
                }
            }
        }
        debug!("queue driver stopped");
    }

    /// Processes queued tasks until none is runnable, then returns.
    pub async fn run_until_idle(&self) {
        while let Some((id, signal, request)) = self.claim_next() {
            self.process(id, &signal, request).await;
        }
    }

    /// Marks the oldest queued task as uploading and hands it out.
    fn claim_next(&self) -> Option<(TaskId, TaskSignal, UploadRequest)> {
        if self.inner.paused.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.inner.lock();
        let signal = TaskSignal::new();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Queued)?;
        task.status = TaskStatus::Uploading;
        task.error = None;
        let claimed = (task.id, signal.clone(), task.request.clone());
        self.inner.status_changed(task);
        if let Some(meter) = state.meters.get(&claimed.0) {
            meter.reset();
        }
        state.active = Some((claimed.0, signal));
        state.requeue_active = false;
        Some(claimed)
    }

    async fn process(&self, id: TaskId, signal: &TaskSignal, request: UploadRequest) {
        info!(task = %id, bucket = %request.bucket, key = %request.key, "upload started");
        // State from an earlier run this session; covers records the store
        // failed to write.
        let known = self.task(id).and_then(|t| t.multipart);
        let observer = TaskObserver {
            inner: &self.inner,
            id,
            signal,
        };
        let result = self
            .inner
            .engine
            .transfer(&request, known.as_ref(), &observer, signal)
            .await;
        self.finish(id, signal, result);
    }

    fn finish(&self, id: TaskId, signal: &TaskSignal, result: Result<(), UploadError>) {
        let requeued = {
            let mut state = self.inner.lock();
            state.active = None;
            let requeue = std::mem::take(&mut state.requeue_active);
            let Ok(task) = state.get_mut(id) else {
                return;
            };

            task.speed = 0.0;
            match (result, signal.reason()) {
                (Ok(()), _) => {
                    task.status = TaskStatus::Done;
                    task.loaded = task.total();
                    info!(task = %id, "upload done");
                }
                (Err(_), Some(StopReason::Cancel)) => {
                    task.status = TaskStatus::Canceled;
                    task.error = None;
                    task.multipart = None;
                    info!(task = %id, "upload canceled");
                }
                (Err(UploadError::Canceled), _) if requeue => {
                    task.status = TaskStatus::Queued;
                    info!(task = %id, loaded = task.loaded, "upload paused, queued again");
                }
                (Err(UploadError::Canceled), _) => {
                    task.status = TaskStatus::Paused;
                    info!(task = %id, loaded = task.loaded, "upload paused");
                }
                (Err(e), _) => {
                    warn!(task = %id, error = %e, "upload failed");
                    task.status = TaskStatus::Error;
                    task.error = Some(e.to_string());
                }
            }
            self.inner.status_changed(task);
            task.status == TaskStatus::Queued
        };
        if requeued {
            self.inner.wake.notify_one();
        }
    }
}

/// Routes transfer notifications of the active task into the queue.
struct TaskObserver<'a> {
    inner: &'a QueueInner,
    id: TaskId,
    signal: &'a TaskSignal,
}

impl TransferObserver for TaskObserver<'_> {
    fn on_progress(&self, event: ProgressEvent) {
        // Once stopped, late progress from unwinding parts is dropped so
        // `loaded` stays at its last reported value.
        if self.signal.is_raised() {
            return;
        }
        let mut state = self.inner.lock();
        let speed = match state.meters.get(&self.id) {
            Some(meter) => {
                meter.observe(event.loaded);
                meter.bytes_per_second()
            }
            None => 0.0,
        };
        let Ok(task) = state.get_mut(self.id) else {
            return;
        };
        task.loaded = event.loaded;
        task.speed = speed;
        self.inner.emit(QueueEvent::Progress {
            id: self.id,
            loaded: event.loaded,
            total: event.total,
            speed,
        });
    }

    fn on_multipart(&self, multipart: &MultipartState) {
        if let Ok(task) = self.inner.lock().get_mut(self.id) {
            task.multipart = Some(multipart.clone());
        }
    }

    fn on_phase(&self, phase: MultipartPhase) {
        debug!(task = %self.id, %phase, "task phase");
    }
}
