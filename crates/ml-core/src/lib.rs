//! Model-side building blocks for the live analysis pipeline: the
//! double-buffered result store, the inference engine seam, and the
//! game-context classifier built on top of it.

pub mod classifier;
pub mod engine;
pub mod error;
pub mod output;

pub use classifier::{
    CLASSIFIER_INPUT_EDGE, CONTEXT_LABELS, ClassificationResult, ContextClassifier, Normalization,
    argmax,
};
pub use engine::{InferenceEngine, InputShape};
pub use error::InferenceError;
pub use output::{DoubleBuffered, ReadGuard};

#[cfg(feature = "with-tch")]
pub use engine::TorchScriptEngine;

#[cfg(feature = "with-tch")]
pub use tch;
