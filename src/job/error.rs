use displaydoc::Display;
use thiserror::Error;

use crate::{model::ComputationError, protocol::ProtocolError, storage::StorageError};

/// Errors delivered to the subscribers of a job.
///
/// Every error ends the job: once it is delivered, the job is disposed.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum JobError {
    /// the job has been disposed and cannot be started again
    RunningDisposedJob,
    /// the job is not accepted in a cycle: {0}
    CycleNotAccepted(String),
    /// the network constraints are not satisfied
    NetworkConstraintsFailure,
    /// the battery constraints are not satisfied
    BatteryConstraintsFailure,
    /// the coordinator answered with an error: {0}
    NetworkResponseFailure(String),
    /// failed to download the cycle materials: {0}
    DownloadFailure(String),
    /// the coordinator is unreachable: {0}
    ConnectivityFailure(String),
}

impl From<ProtocolError> for JobError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Connectivity(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::Closed
            | ProtocolError::Superseded => Self::ConnectivityFailure(error.to_string()),
            ProtocolError::Parse { .. } | ProtocolError::Server(_) => {
                Self::NetworkResponseFailure(error.to_string())
            }
        }
    }
}

impl From<StorageError> for JobError {
    fn from(error: StorageError) -> Self {
        Self::DownloadFailure(error.to_string())
    }
}

/// Error returned by [`Job::create_diff`](crate::Job::create_diff).
#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Computation(#[from] ComputationError),
    #[error("failed to stage the diff: {0}")]
    Storage(#[from] StorageError),
}
