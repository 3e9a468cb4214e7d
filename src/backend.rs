use std::path::Path;

use ndarray::Array4;
use tract_onnx::prelude::*;

use crate::errors::{LoadError, PredictError};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// A loaded network able to run a forward pass. Implementations must be
/// reentrant for read-only use: `forward` is called concurrently.
pub trait InferenceBackend: Send + Sync {
    /// Runs one forward pass and returns the flattened scores of the first output.
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, PredictError>;

    /// Number of scores per forward pass, when the model declares it.
    fn output_width(&self) -> Option<usize> {
        None
    }
}

/// ONNX model executed by tract on the CPU.
pub struct TractBackend {
    plan: Plan,
    output_width: Option<usize>,
}

impl TractBackend {
    pub fn load(path: &Path, input_size: u32) -> Result<Self, LoadError> {
        if !path.is_file() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
                )
            })
            .and_then(|model| model.into_optimized())
            .map_err(|e| LoadError::Incompatible(format!("{e:#}")))?;

        let output_width = model
            .output_fact(0)
            .map_err(|e| LoadError::Incompatible(format!("{e:#}")))?
            .shape
            .as_concrete()
            .and_then(|dims| dims.last().copied());

        let plan = model
            .into_runnable()
            .map_err(|e| LoadError::Incompatible(format!("{e:#}")))?;

        Ok(Self { plan, output_width })
    }
}

impl InferenceBackend for TractBackend {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, PredictError> {
        let data = input
            .as_slice()
            .ok_or_else(|| PredictError::Inference("non-contiguous input".into()))?;
        let tensor = Tensor::from_shape(input.shape(), data)
            .map_err(|e| PredictError::Inference(format!("{e:#}")))?;

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| PredictError::Inference(format!("{e:#}")))?;

        let first = outputs
            .first()
            .ok_or_else(|| PredictError::Inference("no outputs".into()))?;
        let scores = first
            .to_array_view::<f32>()
            .map_err(|e| PredictError::Inference(format!("{e:#}")))?;

        Ok(scores.iter().copied().collect())
    }

    fn output_width(&self) -> Option<usize> {
        self.output_width
    }
}
