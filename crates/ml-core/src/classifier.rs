//! Game-context classifier: BGRX pixels in, arg-max label out.
//!
//! Preprocessing converts an interleaved BGRX frame into the planar RGB tensor
//! the network was trained on, applying the fixed per-channel normalisation.
//! Raw scores are published through a [`DoubleBuffered`] so the label can be
//! read from any thread without blocking the render path.

use std::sync::Arc;

use tracing::trace;

use crate::{DoubleBuffered, InferenceEngine, InferenceError, engine::InputShape};

/// Classifier input edge length in pixels.
pub const CLASSIFIER_INPUT_EDGE: usize = 224;

/// Labels in the order of the model's output channels.
pub const CONTEXT_LABELS: [&str; 9] = [
    "GoalDefense",
    "LanePhase",
    "LegendaryFightPhase",
    "OutOfGame",
    "PreparationPhase",
    "ResultScreen",
    "ScoringAttempt",
    "SecondaryObjectiveFight",
    "WaitForRespawn",
];

/// Per-channel `(value - mean) / std` constants in RGB order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// ImageNet statistics on the 0..=255 scale.
    pub const IMAGENET: Self = Self {
        mean: [123.675, 116.28, 103.53],
        std: [58.395, 57.12, 57.375],
    };
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Latest classification output.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub label: &'static str,
    pub scores: Vec<f32>,
}

/// Wraps an [`InferenceEngine`] with context-classifier pre/post-processing.
pub struct ContextClassifier<E> {
    engine: E,
    labels: &'static [&'static str],
    normalization: Normalization,
    shape: InputShape,
    input: Vec<f32>,
    logits: Vec<f32>,
    scores: Arc<DoubleBuffered<Vec<f32>>>,
}

impl<E: InferenceEngine> ContextClassifier<E> {
    /// Build a classifier with the default label set and ImageNet normalisation.
    pub fn new(engine: E) -> Self {
        Self::with_labels(engine, &CONTEXT_LABELS, Normalization::IMAGENET)
    }

    pub fn with_labels(
        engine: E,
        labels: &'static [&'static str],
        normalization: Normalization,
    ) -> Self {
        let shape = engine.input_shape();
        Self {
            engine,
            labels,
            normalization,
            shape,
            input: vec![0.0; shape.len()],
            logits: Vec::with_capacity(labels.len()),
            scores: Arc::new(DoubleBuffered::new(vec![0.0; labels.len()])),
        }
    }

    /// Expected BGRX byte length of a frame handed to [`process`](Self::process).
    pub fn expected_input_bytes(&self) -> usize {
        self.shape.pixel_count() * 4
    }

    /// Run one classification over a BGRX frame sized to the model input.
    ///
    /// On error nothing is published and the previous result stays visible.
    pub fn process(&mut self, bgrx: &[u8]) -> Result<(), InferenceError> {
        let expected = self.expected_input_bytes();
        if bgrx.len() != expected {
            return Err(InferenceError::InputSize {
                expected,
                got: bgrx.len(),
            });
        }

        preprocess_bgrx(bgrx, &self.normalization, self.shape, &mut self.input);
        self.engine.forward(&self.input, &mut self.logits)?;

        let labels = self.labels.len();
        if self.logits.len() < labels {
            return Err(InferenceError::OutputSize {
                expected: labels,
                got: self.logits.len(),
            });
        }

        let logits = &self.logits[..labels];
        self.scores.write(|slot| {
            slot.clear();
            slot.extend_from_slice(logits);
        });
        trace!(label = self.inferred_label(), "classifier output published");
        Ok(())
    }

    /// Arg-max label of the latest published scores.
    pub fn inferred_label(&self) -> &'static str {
        let scores = self.scores.read();
        self.labels[argmax(&scores).unwrap_or(0)]
    }

    /// Label and score vector of the latest published result.
    pub fn result(&self) -> ClassificationResult {
        let scores = self.scores.snapshot();
        let label = self.labels[argmax(&scores).unwrap_or(0)];
        ClassificationResult { label, scores }
    }

    /// True once at least one forward pass has been published.
    pub fn has_result(&self) -> bool {
        self.scores.generation() > 0
    }

    /// Shared handle to the published score buffer.
    pub fn scores(&self) -> Arc<DoubleBuffered<Vec<f32>>> {
        self.scores.clone()
    }

    pub fn labels(&self) -> &'static [&'static str] {
        self.labels
    }
}

/// Index of the largest value; ties resolve to the first occurrence.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ if value.is_nan() => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// Interleaved BGRX → planar normalised RGB.
pub fn preprocess_bgrx(bgrx: &[u8], norm: &Normalization, shape: InputShape, out: &mut [f32]) {
    let pixels = shape.pixel_count();
    let (red, rest) = out.split_at_mut(pixels);
    let (green, blue) = rest.split_at_mut(pixels);

    for (index, px) in bgrx.chunks_exact(4).take(pixels).enumerate() {
        red[index] = (f32::from(px[2]) - norm.mean[0]) / norm.std[0];
        green[index] = (f32::from(px[1]) - norm.mean[1]) / norm.std[1];
        blue[index] = (f32::from(px[0]) - norm.mean[2]) / norm.std[2];
    }
}
