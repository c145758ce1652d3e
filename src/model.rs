//! The artifacts of a training cycle, as seen by the host.
//!
//! The engine never interprets plans or model parameters: it hands the downloaded
//! files over to the host and reports the diff the host computes.

use std::path::PathBuf;

use derive_more::{AsRef, From};
use thiserror::Error;

/// Serialized model parameters.
#[derive(Debug, Clone, PartialEq, Eq, From, AsRef)]
pub struct ModelState(Vec<u8>);

impl ModelState {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// Serialized difference between the parameters received from the coordinator and the
/// parameters after local training.
#[derive(Debug, Clone, PartialEq, Eq, From, AsRef)]
pub struct Diff(Vec<u8>);

impl Diff {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::encode(&self.0)
    }
}

/// The model handed out for a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyftModel {
    pub name: String,
    pub version: Option<String>,
    pub model_id: String,
    /// Where the parameters were persisted
    pub path: PathBuf,
    pub state: ModelState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub id: String,
    /// Where the plan, compiled to torchscript, was persisted
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub name: String,
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
#[error("model computation failed: {0}")]
pub struct ComputationError(pub String);

/// Computes diffs between model states. Implemented by the host's tensor library.
#[cfg_attr(test, mockall::automock)]
pub trait ModelComputation: Send + Sync {
    fn create_diff(&self, original: &ModelState, trained: &ModelState) -> Result<Diff, ComputationError>;
}
