use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while loading or running a classification model.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model artifact not found at {path:?}")]
    ModelNotFound { path: PathBuf },
    #[error("failed to load model {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("unexpected input buffer size: got {got} bytes, expected {expected}")]
    InputSize { expected: usize, got: usize },
    #[error("model produced {got} outputs, expected {expected}")]
    OutputSize { expected: usize, got: usize },
    #[error("forward pass failed: {0}")]
    Forward(String),
}
