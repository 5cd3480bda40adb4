use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detector::DetectorGate;
use crate::error::{ManagerError, ManagerResult, OpenError};
use crate::stream::{StreamDefinition, StreamId};
use crate::worker::{Services, Worker, WorkerControl, WorkerSettings, WorkerState};

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry entry for one worker
struct WorkerEntry {
    stream: StreamDefinition,
    run_id: Uuid,
    control: WorkerControl,
    /// Taken by the first `stop` call
    task: Option<JoinHandle<()>>,
}

impl WorkerEntry {
    /// The loop exited on its own (source closed) and nobody is stopping it
    fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.is_finished())
    }
}

/// Snapshot of a registered worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub stream: StreamDefinition,
    pub state: WorkerState,
}

/// Outcome of a bulk load
#[derive(Debug, Default)]
pub struct LoadReport {
    pub started: Vec<StreamId>,
    pub failed: Vec<(StreamId, ManagerError)>,
}

/// Owns the worker registry and the shared detector.
///
/// The registry lock is only held for map reads and updates; waiting for a worker
/// to open or exit always happens with the lock released. Workers whose loop ended
/// on its own are dropped from the registry whenever it is next read.
pub struct Manager {
    services: Services,
    settings: WorkerSettings,
    stop_timeout: Duration,
    open_timeout: Duration,
    workers: Mutex<HashMap<StreamId, WorkerEntry>>,
}

impl Manager {
    pub fn new(services: Services, settings: WorkerSettings, stop_timeout: Duration) -> Self {
        Self {
            services,
            settings,
            stop_timeout,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Bound on how long `start` waits for a stream's first frame
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn detector(&self) -> &DetectorGate {
        &self.services.detector
    }

    /// Start a worker for `stream` and wait until its frame source is open
    pub async fn start(&self, stream: StreamDefinition) -> ManagerResult<()> {
        let id = stream.id;
        let worker = Worker::new(stream.clone(), self.settings.clone(), self.services.clone());
        let run_id = worker.run_id();
        let control = worker.control();
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut workers = self.registry();
            if workers.contains_key(&id) {
                return Err(ManagerError::AlreadyRunning(id));
            }

            let task = tokio::task::spawn_blocking(move || worker.run(ready_tx));
            workers.insert(
                id,
                WorkerEntry {
                    stream: stream.clone(),
                    run_id,
                    control: control.clone(),
                    task: Some(task),
                },
            );
        }

        match tokio::time::timeout(self.open_timeout, ready_rx).await {
            // A concurrent stop landed between readiness and this check
            Ok(Ok(Ok(()))) if control.stop_requested() => {
                debug!("Worker {} was stopped while starting", id);
                Err(ManagerError::ExitedBeforeReady(id))
            }
            Ok(Ok(Ok(()))) => {
                info!("✅ Started worker {} ({})", id, stream.name);
                Ok(())
            }
            Ok(Ok(Err(source))) => {
                self.remove_entry(id, run_id);
                Err(ManagerError::Open { id, source })
            }
            Ok(Err(_)) => {
                self.remove_entry(id, run_id);
                Err(ManagerError::ExitedBeforeReady(id))
            }
            Err(_) => {
                // The loop exits on its own once the blocked open returns
                warn!(
                    "⚠️ Stream {} did not open within {:?}, abandoning it",
                    id, self.open_timeout
                );
                control.stop();
                self.remove_entry(id, run_id);
                Err(ManagerError::Open {
                    id,
                    source: OpenError::new(
                        stream.url,
                        format!("no frame within {:?}", self.open_timeout),
                    ),
                })
            }
        }
    }

    /// Signal the worker to stop, wait up to the stop timeout, then unregister it
    pub async fn stop(&self, id: StreamId) -> ManagerResult<()> {
        let (task, run_id) = {
            let mut workers = self.registry();
            let entry = workers
                .get_mut(&id)
                .filter(|e| e.task.is_some())
                .ok_or(ManagerError::NotFound(id))?;
            entry.control.stop();
            (entry.task.take(), entry.run_id)
        };

        if let Some(task) = task {
            match tokio::time::timeout(self.stop_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Worker {} terminated abnormally: {}", id, e),
                Err(_) => warn!(
                    "⚠️ Worker {} did not stop within {:?}, detaching it",
                    id, self.stop_timeout
                ),
            }
        }

        self.remove_entry(id, run_id);
        info!("Stopped worker {}", id);
        Ok(())
    }

    /// Stop the stream if it is running, then start it with the new definition
    pub async fn restart(&self, stream: StreamDefinition) -> ManagerResult<()> {
        match self.stop(stream.id).await {
            Ok(()) | Err(ManagerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(stream).await
    }

    /// Stop every registered worker, returning the failures instead of aborting on them
    pub async fn stop_all(&self) -> Vec<ManagerError> {
        // Signal everyone first so the individual waits overlap
        let ids: Vec<StreamId> = {
            let workers = self.registry();
            for entry in workers.values() {
                entry.control.stop();
            }
            workers.keys().copied().collect()
        };

        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                error!("Error stopping worker {}: {}", id, e);
                failures.push(e);
            }
        }
        failures
    }

    /// Start a worker for each definition concurrently; a definition that fails or
    /// hangs while opening does not hold back the rest
    pub async fn load_all(
        &self,
        streams: impl IntoIterator<Item = StreamDefinition>,
    ) -> LoadReport {
        let starts = streams.into_iter().map(|stream| async move {
            let id = stream.id;
            (id, self.start(stream).await)
        });

        let mut report = LoadReport::default();
        for (id, result) in join_all(starts).await {
            match result {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    error!("Failed to start stream {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        info!(
            "Loaded streams: {} started, {} failed",
            report.started.len(),
            report.failed.len()
        );
        report
    }

    pub fn is_running(&self, id: StreamId) -> bool {
        self.state(id) == Some(WorkerState::Running)
    }

    pub fn state(&self, id: StreamId) -> Option<WorkerState> {
        self.registry().get(&id).map(|e| e.control.state())
    }

    /// Registered workers ordered by stream id
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .registry()
            .values()
            .map(|e| WorkerInfo {
                stream: e.stream.clone(),
                state: e.control.state(),
            })
            .collect();
        infos.sort_by_key(|i| i.stream.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the registry, dropping entries whose loop already exited on its own
    fn registry(&self) -> MutexGuard<'_, HashMap<StreamId, WorkerEntry>> {
        let mut workers = self.workers.lock();
        workers.retain(|id, entry| {
            let finished = entry.is_finished();
            if finished {
                debug!("Reaping exited worker for stream {}", id);
            }
            !finished
        });
        workers
    }

    /// Remove the entry for `id` unless it now belongs to a newer worker
    fn remove_entry(&self, id: StreamId, run_id: Uuid) {
        let mut workers = self.workers.lock();
        if workers.get(&id).is_some_and(|e| e.run_id == run_id) {
            workers.remove(&id);
        }
    }
}
