use thiserror::Error;

use crate::stream::StreamId;

/// Errors returned to callers of the manager's lifecycle operations
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("worker already running for stream {0}")]
    AlreadyRunning(StreamId),

    #[error("no worker registered for stream {0}")]
    NotFound(StreamId),

    #[error("worker for stream {id} failed to start: {source}")]
    Open {
        id: StreamId,
        #[source]
        source: OpenError,
    },

    #[error("worker for stream {0} exited before reporting readiness")]
    ExitedBeforeReady(StreamId),
}

/// The frame source behind a stream address could not be opened
#[derive(Error, Debug)]
#[error("cannot open stream {address}: {reason}")]
pub struct OpenError {
    pub address: String,
    pub reason: String,
}

impl OpenError {
    pub fn new(address: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure of one due tick; logged by the worker loop, never propagated
#[derive(Error, Debug)]
pub enum TickError {
    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),

    #[error("failed to persist count: {0}")]
    Persist(#[source] anyhow::Error),

    #[error("failed to save artifact: {0}")]
    Save(#[source] anyhow::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
