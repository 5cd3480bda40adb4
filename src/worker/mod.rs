//! Per-stream worker loop.
//!
//! A worker moves through `Init -> Opening -> Running -> Stopping -> Stopped`, or
//! `Opening -> Failed` when its frame source cannot be opened. While running it reads
//! frames continuously and performs a tick (inference, count, artifact, history) at
//! most once per check interval. Tick failures are logged and the loop carries on.

use chrono::Local;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::artifact::{annotate, artifact_path, ArtifactSink};
use crate::detector::{ClassFilter, DetectorGate};
use crate::error::{OpenError, TickError};
use crate::ffmpeg::{FrameSourceFactory, ReadOutcome};
use crate::store::CountStore;
use crate::stream::StreamDefinition;

/// Tunables shared by every worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Minimum time between two ticks of the same stream
    pub check_interval: Duration,
    pub confidence_threshold: f32,
    /// Class label whose detections are counted
    pub target_class: String,
    /// Pause after a read that produced no frame
    pub read_backoff: Duration,
    /// Root directory for annotated artifacts
    pub output_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            confidence_threshold: 0.4,
            target_class: "head".to_string(),
            read_backoff: Duration::from_secs(1),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Collaborators every worker borrows from the manager
#[derive(Clone)]
pub struct Services {
    pub detector: DetectorGate,
    pub sources: Arc<dyn FrameSourceFactory>,
    pub store: Arc<dyn CountStore>,
    pub sink: Arc<dyn ArtifactSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Opening,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Init => "init",
            WorkerState::Opening => "opening",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        }
    }

    /// The loop has exited or will never run
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle through which the owner observes and stops a worker
#[derive(Clone)]
pub struct WorkerControl {
    running: Arc<AtomicBool>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerControl {
    /// Ask the loop to exit; observed once per iteration
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// `stop` has been called on this worker
    pub fn stop_requested(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }
}

/// One stream's worker. Built by the manager, consumed by [`Worker::run`].
pub struct Worker {
    stream: StreamDefinition,
    settings: WorkerSettings,
    services: Services,
    run_id: Uuid,
    running: Arc<AtomicBool>,
    state: watch::Sender<WorkerState>,
    last_check: Option<Instant>,
}

impl Worker {
    pub fn new(stream: StreamDefinition, settings: WorkerSettings, services: Services) -> Self {
        let (state, _) = watch::channel(WorkerState::Init);
        Self {
            stream,
            settings,
            services,
            run_id: Uuid::new_v4(),
            running: Arc::new(AtomicBool::new(true)),
            state,
            last_check: None,
        }
    }

    pub fn control(&self) -> WorkerControl {
        WorkerControl {
            running: self.running.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Unique id of this worker instance, distinct across restarts of one stream
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run the worker to completion on the current thread.
    ///
    /// `ready` receives the outcome of opening the frame source, before the read
    /// loop begins.
    pub fn run(mut self, ready: oneshot::Sender<Result<(), OpenError>>) {
        let span = info_span!(
            "worker",
            stream_id = self.stream.id,
            name = %self.stream.name,
            run = %self.run_id
        );
        let _enter = span.enter();

        let classes = self.services.detector.known_classes();
        let filter = ClassFilter::resolve(&self.settings.target_class, classes.clone());
        match &filter {
            ClassFilter::Index(index) => debug!(
                "Target class '{}' resolved to index {}",
                self.settings.target_class, index
            ),
            ClassFilter::Label { .. } => warn!(
                "Target class '{}' not among detector classes, matching by label",
                self.settings.target_class
            ),
        }

        self.set_state(WorkerState::Opening);
        info!("▶️ Starting worker for URL: {}", self.stream.url);
        let mut source = match self.services.sources.open(&self.stream.url) {
            Ok(source) => source,
            Err(e) => {
                error!("❌ Cannot open stream: {}", e);
                self.set_state(WorkerState::Failed);
                let _ = ready.send(Err(e));
                return;
            }
        };

        if !self.running.load(Ordering::Acquire) {
            // Stopped while opening: never report ready, the caller sees the exit
            info!("Stop requested while opening, releasing stream");
            drop(ready);
            self.set_state(WorkerState::Stopping);
            source.release();
            self.set_state(WorkerState::Stopped);
            return;
        }

        self.set_state(WorkerState::Running);
        let _ = ready.send(Ok(()));

        while self.running.load(Ordering::Acquire) {
            let frame = match source.read() {
                ReadOutcome::Frame(frame) => frame,
                ReadOutcome::Empty => {
                    debug!("No frame available, retrying in {:?}", self.settings.read_backoff);
                    std::thread::sleep(self.settings.read_backoff);
                    continue;
                }
                ReadOutcome::Closed => {
                    warn!("⚠️ Stream closed by source");
                    break;
                }
            };

            let now = Instant::now();
            if !self.is_due(now) {
                trace!("Skipping frame, next check not due");
                continue;
            }
            self.last_check = Some(now);

            match self.tick(&frame, &filter, &classes) {
                Ok(count) => debug!("Tick complete with count {}", count),
                Err(e) => error!("❌ Tick failed: {}", e),
            }
        }

        self.set_state(WorkerState::Stopping);
        source.release();
        self.set_state(WorkerState::Stopped);
        info!("⏹️ Worker stopped");
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_check {
            Some(last) => now.duration_since(last) >= self.settings.check_interval,
            None => true,
        }
    }

    /// One due cycle: infer under the gate, count, persist, annotate, record history
    fn tick(
        &self,
        frame: &RgbImage,
        filter: &ClassFilter,
        classes: &[String],
    ) -> Result<usize, TickError> {
        let detections = self
            .services
            .detector
            .infer(frame)
            .map_err(TickError::Inference)?;

        let kept = filter.apply(detections, self.settings.confidence_threshold);
        let count = kept.len();
        info!("Counted: {}", count);

        if let Err(e) = self
            .services
            .store
            .record_latest_count(self.stream.id, count)
        {
            error!("{}", TickError::Persist(e));
        }

        let path = artifact_path(&self.settings.output_dir, &self.stream.name, &Local::now());
        let annotated = annotate(frame, &kept, classes);
        self.services
            .sink
            .save(&path, &annotated)
            .map_err(TickError::Save)?;
        debug!("Saved annotated frame to {:?}", path);

        if let Err(e) =
            self.services
                .store
                .append_history(self.stream.id, &self.stream.name, count, Some(&path))
        {
            error!("{}", TickError::Persist(e));
        }

        Ok(count)
    }
}
