//! Convenience entry point for running a pipeline on loosely shaped inputs

use std::collections::HashMap;

use ndarray::ArrayD;

use crate::error::{Error, Result};
use crate::execution::PredictionPipeline;
use crate::tensor::{Tensor, TensorId};

/// Model inputs given by position, by id, or as raw arrays tagged with the
/// declared input axes
#[derive(Debug, Clone)]
pub enum Inputs {
    Positional(Vec<Tensor>),
    Named(HashMap<TensorId, Tensor>),
    Arrays(Vec<ArrayD<f32>>),
}

impl From<Tensor> for Inputs {
    fn from(tensor: Tensor) -> Self {
        Inputs::Positional(vec![tensor])
    }
}

impl From<Vec<Tensor>> for Inputs {
    fn from(tensors: Vec<Tensor>) -> Self {
        Inputs::Positional(tensors)
    }
}

impl From<HashMap<TensorId, Tensor>> for Inputs {
    fn from(tensors: HashMap<TensorId, Tensor>) -> Self {
        Inputs::Named(tensors)
    }
}

impl From<ArrayD<f32>> for Inputs {
    fn from(array: ArrayD<f32>) -> Self {
        Inputs::Arrays(vec![array])
    }
}

fn check_count(pipeline: &PredictionPipeline, actual: usize) -> Result<()> {
    let expected = pipeline.input_ids().len();
    if actual != expected {
        return Err(Error::ShapeMismatch(format!(
            "model '{}' takes {} inputs, got {}",
            pipeline.name(),
            expected,
            actual
        )));
    }
    Ok(())
}

/// Run `pipeline` on one set of inputs and return its outputs in declared order
pub fn predict(pipeline: &mut PredictionPipeline, inputs: impl Into<Inputs>) -> Result<Vec<Option<Tensor>>> {
    let ordered: Vec<Option<Tensor>> = match inputs.into() {
        Inputs::Positional(tensors) => {
            check_count(pipeline, tensors.len())?;
            tensors.into_iter().map(Some).collect()
        }
        Inputs::Named(mut tensors) => {
            let ordered = pipeline
                .input_ids()
                .iter()
                .map(|id| tensors.remove(id).ok_or_else(|| Error::MissingTensor(id.clone())).map(Some))
                .collect::<Result<Vec<_>>>()?;
            if let Some(unknown) = tensors.keys().next() {
                return Err(Error::InvalidDescription(format!(
                    "model '{}' has no input '{}'",
                    pipeline.name(),
                    unknown
                )));
            }
            ordered
        }
        Inputs::Arrays(arrays) => {
            check_count(pipeline, arrays.len())?;
            arrays
                .into_iter()
                .zip(pipeline.input_axes())
                .map(|(array, axes)| Tensor::new(array, axes.clone()).map(Some))
                .collect::<Result<Vec<_>>>()?
        }
    };
    pipeline.forward(&ordered)
}
