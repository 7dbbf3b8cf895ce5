use ml_core::{InferenceError, InputShape};
use thiserror::Error;

use crate::{
    gpu::{BackendError, TextureDesc},
    timer::OcrError,
};

/// Errors raised while building a pipeline or running one of its stages.
///
/// Construction failures are returned to the caller; per-cycle failures are
/// logged by the pipeline and never reach the driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
    #[error("staging surface mismatch: reader expects {expected}, texture is {got}")]
    StagingMismatch {
        expected: TextureDesc,
        got: TextureDesc,
    },
    #[error("classifier expects input {expected:?} but the model reports {got:?}")]
    ModelShape {
        expected: InputShape,
        got: InputShape,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
}
