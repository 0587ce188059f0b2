use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use watchlist_core::{
    extract_signature, record_sighting, CancelToken, CosineMatcher, Extraction, GalleryError,
    GalleryStore, ModelRegistry, PipelineError, SightingOutcome, SourceImage, Stage, UploadedImage,
};
use watchlist_store::ErrorLog;

use crate::queue::{FailureHook, QueueClosed, TaskQueue};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("persistence: {0}")]
    Persistence(#[from] GalleryError),
    #[error("engine worker exited")]
    ChannelClosed,
}

impl From<QueueClosed> for EngineError {
    fn from(_: QueueClosed) -> Self {
        EngineError::ChannelClosed
    }
}

impl EngineError {
    /// Short message that is safe to show to a client.
    pub fn public_message(&self) -> &'static str {
        match self {
            EngineError::Pipeline(e) => e.public_message(),
            EngineError::Persistence(_) => "Failed to save the result.",
            EngineError::ChannelClosed => "The recognition engine is unavailable.",
        }
    }
}

type Reply = oneshot::Sender<Result<SightingOutcome, EngineError>>;

/// How a sighting request is executed.
enum ExecutionMode {
    /// A caller is waiting on the reply channel.
    Synchronous(Reply),
    /// Nobody waits; failures go to the error log.
    Queued,
}

/// One photo to run through the pipeline and record.
pub struct SightingRequest {
    pub image: UploadedImage,
    pub source: SourceImage,
}

/// State owned by the worker thread.
struct Worker {
    models: ModelRegistry,
    gallery: Arc<dyn GalleryStore>,
    threshold: f32,
}

impl Worker {
    /// Run one request. The task's deadline starts here, not when it was queued.
    fn process(
        &mut self,
        request: SightingRequest,
        mut cancel: CancelToken,
    ) -> Result<SightingOutcome, EngineError> {
        cancel.start();
        let started = Instant::now();
        let SightingRequest { image, source } = request;

        let Extraction { signature, face } =
            extract_signature(&mut self.models, image.bytes(), &cancel)?;
        drop(image);

        cancel.checkpoint(Stage::Persist).map_err(PipelineError::from)?;
        let outcome = record_sighting(
            self.gallery.as_ref(),
            &CosineMatcher,
            signature,
            source,
            self.threshold,
            Utc::now(),
        )?;

        tracing::info!(
            id = %outcome.record().id,
            new = outcome.is_new(),
            face_confidence = face.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sighting processed"
        );

        Ok(outcome)
    }
}

/// Cancels the token when dropped unless disarmed; ties a synchronous
/// task's lifetime to the caller's future.
struct CancelOnDrop(Option<CancelToken>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}

/// Clone-safe handle to the inference worker.
///
/// Every request, synchronous or queued, runs on the same single worker, so
/// the model handles are never driven concurrently and gallery
/// read-match-write sequences never interleave.
#[derive(Clone)]
pub struct EngineHandle {
    queue: TaskQueue<Worker>,
    timeout: Duration,
}

impl EngineHandle {
    /// Spawn the worker thread that owns `models`.
    ///
    /// `timeout` is each task's run-time budget, counted from when the
    /// worker picks the task up.
    pub fn start(
        models: ModelRegistry,
        gallery: Arc<dyn GalleryStore>,
        threshold: f32,
        timeout: Duration,
        error_log: Arc<ErrorLog>,
    ) -> std::io::Result<Self> {
        let worker = Worker {
            models,
            gallery,
            threshold,
        };
        let on_failure: FailureHook = Box::new(move |label: &str, err: &anyhow::Error| {
            error_log.record(label, err);
        });
        let queue = TaskQueue::spawn("watchlist-engine", worker, on_failure)?;
        tracing::info!(
            threshold,
            timeout_secs = timeout.as_secs(),
            "engine started"
        );
        Ok(Self { queue, timeout })
    }

    /// Run `request` and wait for the outcome.
    ///
    /// Dropping the returned future (a client going away) cancels the task
    /// at its next stage boundary.
    pub async fn identify(&self, request: SightingRequest) -> Result<SightingOutcome, EngineError> {
        let cancel = CancelToken::with_timeout(self.timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let mode = ExecutionMode::Synchronous(reply_tx);
        self.submit(request, mode, cancel.clone())?;

        let mut guard = CancelOnDrop(Some(cancel));
        let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        guard.disarm();
        result
    }

    /// Queue `request` and return at once. Failures are written to the error log.
    pub fn enqueue(&self, request: SightingRequest) -> Result<(), EngineError> {
        let cancel = CancelToken::with_timeout(self.timeout);
        self.submit(request, ExecutionMode::Queued, cancel)?;
        tracing::debug!(depth = self.queue.depth(), "sighting queued");
        Ok(())
    }

    /// Hand `request` to the worker. Both modes share this path.
    fn submit(
        &self,
        request: SightingRequest,
        mode: ExecutionMode,
        cancel: CancelToken,
    ) -> Result<(), EngineError> {
        let label = format!("upload {}", request.source.filename);
        self.queue.enqueue(label, move |worker: &mut Worker| {
            let result = worker.process(request, cancel);
            match mode {
                ExecutionMode::Synchronous(reply) => {
                    let _ = reply.send(result);
                    Ok(())
                }
                ExecutionMode::Queued => {
                    result?;
                    Ok(())
                }
            }
        })?;
        Ok(())
    }

    /// Tasks waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}
