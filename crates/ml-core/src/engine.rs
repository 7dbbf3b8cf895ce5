use crate::InferenceError;

/// Planar `[channels, height, width]` shape of a model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of scalar elements in a single input tensor.
    pub const fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn pixel_count(&self) -> usize {
        self.height * self.width
    }
}

/// A loaded classification model able to run forward passes.
///
/// `forward` receives a planar, already-normalised input of `input_shape().len()`
/// floats and overwrites `output` with the raw class scores.
pub trait InferenceEngine: Send {
    fn input_shape(&self) -> InputShape;

    fn forward(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<(), InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn input_shape(&self) -> InputShape {
        (**self).input_shape()
    }

    fn forward(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<(), InferenceError> {
        (**self).forward(input, output)
    }
}

#[cfg(feature = "with-tch")]
pub use torch::TorchScriptEngine;

#[cfg(feature = "with-tch")]
mod torch {
    use std::{convert::TryFrom, path::Path};

    use tch::{self, Device, Kind, Tensor};
    use tracing::debug;

    use super::{InferenceEngine, InputShape};
    use crate::InferenceError;

    /// TorchScript-backed classifier engine.
    pub struct TorchScriptEngine {
        module: tch::CModule,
        device: Device,
        shape: InputShape,
    }

    impl TorchScriptEngine {
        /// Load a TorchScript module (graph and weights in one artifact).
        pub fn load<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            shape: InputShape,
        ) -> Result<Self, InferenceError> {
            let path = model_path.as_ref();
            if !path.is_file() {
                return Err(InferenceError::ModelNotFound {
                    path: path.to_path_buf(),
                });
            }
            let mut module = tch::CModule::load_on_device(path, device).map_err(|err| {
                InferenceError::ModelLoad {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            })?;
            module.set_eval();
            debug!("loaded classifier {} on {:?}", path.display(), device);
            Ok(Self {
                module,
                device,
                shape,
            })
        }

        pub fn device(&self) -> Device {
            self.device
        }
    }

    impl InferenceEngine for TorchScriptEngine {
        fn input_shape(&self) -> InputShape {
            self.shape
        }

        fn forward(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<(), InferenceError> {
            if input.len() != self.shape.len() {
                return Err(InferenceError::InputSize {
                    expected: self.shape.len(),
                    got: input.len(),
                });
            }

            let tensor = Tensor::from_slice(input)
                .view([
                    1,
                    self.shape.channels as i64,
                    self.shape.height as i64,
                    self.shape.width as i64,
                ])
                .to_device(self.device);

            let logits = tch::no_grad(|| self.module.forward_ts(&[tensor]))
                .map_err(|err| InferenceError::Forward(err.to_string()))?;
            let flat = logits
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .flatten(0, -1);
            let values = Vec::<f32>::try_from(&flat)
                .map_err(|err| InferenceError::Forward(err.to_string()))?;

            output.clear();
            output.extend_from_slice(&values);
            Ok(())
        }
    }
}
