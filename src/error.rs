use thiserror::Error;

use crate::inference::InferenceError;
use crate::state_machine::{SearchState, StepEvent};

/// Failures that abort the search for a single work item.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("inference call failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("invalid transition: {event:?} while in {state}")]
    InvalidTransition { state: SearchState, event: StepEvent },
}

/// Failures reading or writing the durable progress and result files.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
