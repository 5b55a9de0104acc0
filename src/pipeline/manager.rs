//! Queue-driven background processing.
//!
//! Producers push alerts into a bounded queue; one worker task pulls them
//! off and runs the pipeline. The worker only checks for cancellation
//! between alerts, so `stop` never abandons a run halfway.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::metrics::MetricsSnapshot;
use super::orchestrator::AlertPipeline;
use super::types::Alert;
use crate::events::panic_message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("alert queue is full")]
    Full,
    #[error("alert queue is closed")]
    Closed,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PipelineManager {
    pipeline: Arc<AlertPipeline>,
    sender: mpsc::Sender<Alert>,
    receiver: Arc<Mutex<mpsc::Receiver<Alert>>>,
    poll_interval: Duration,
    worker: StdMutex<Option<Worker>>,
}

impl PipelineManager {
    pub fn new(pipeline: Arc<AlertPipeline>) -> Self {
        let capacity = pipeline.config().queue_capacity.max(1);
        let poll_interval = pipeline.config().poll_interval();
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            pipeline,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            poll_interval,
            worker: StdMutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<AlertPipeline> {
        &self.pipeline
    }

    /// Spawn the worker. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!("pipeline manager already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            self.pipeline.clone(),
            self.receiver.clone(),
            cancel.clone(),
            self.poll_interval,
        ));
        *worker = Some(Worker { cancel, handle });
        info!(capacity = self.sender.max_capacity(), "pipeline manager started");
        true
    }

    /// Cancel the worker and wait for it to exit. Returns false if it was
    /// not running.
    pub async fn stop(&self) -> bool {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return false;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!(error = %e, "pipeline worker ended abnormally");
        }
        info!(queued = self.queue_size(), "pipeline manager stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Queue an alert, waiting for space if the queue is full.
    pub async fn enqueue_alert(&self, alert: Alert) -> Result<(), EnqueueError> {
        let alert_id = alert.id.clone();
        self.sender.send(alert).await.map_err(|_| EnqueueError::Closed)?;
        debug!(alert_id = %alert_id, queued = self.queue_size(), "alert enqueued");
        Ok(())
    }

    /// Queue an alert without waiting.
    pub fn try_enqueue(&self, alert: Alert) -> Result<(), EnqueueError> {
        self.sender.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(alert) => {
                warn!(alert_id = %alert.id, "alert queue full");
                EnqueueError::Full
            }
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn queue_size(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics().snapshot()
    }
}

async fn run_worker(
    pipeline: Arc<AlertPipeline>,
    receiver: Arc<Mutex<mpsc::Receiver<Alert>>>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    // Held for the worker's lifetime; a restarted worker waits here for the
    // previous one to let go.
    let mut receiver = receiver.lock().await;
    debug!("pipeline worker running");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(poll_interval, receiver.recv()) => next,
        };

        let alert = match next {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                warn!("alert queue closed, worker exiting");
                break;
            }
            Err(_) => continue,
        };

        // Outside the select: a started run always finishes.
        if let Err(panic) = AssertUnwindSafe(pipeline.process_alert(&alert)).catch_unwind().await {
            error!(alert_id = %alert.id, panic = %panic_message(&panic), "alert processing panicked");
        }
    }

    debug!("pipeline worker exited");
}
