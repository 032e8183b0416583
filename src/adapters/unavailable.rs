//! Adapters for weights formats whose runtimes are not linked into this crate
//!
//! Construction checks the description like a real backend would and then
//! fails with `BackendUnavailable`, so callers can skip the format. The types
//! are uninhabited.

use std::convert::Infallible;

use crate::adapters::ModelAdapter;
use crate::description::{ModelDescr, WeightsFormat};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

fn unavailable(model: &ModelDescr, format: WeightsFormat, runtime: &str) -> Error {
    match model.weights_path(format) {
        Err(e) => e,
        Ok(path) => Error::BackendUnavailable(format!(
            "{} is required to run {} weights at {}",
            runtime,
            format,
            path.display()
        )),
    }
}

#[derive(Debug)]
pub struct TorchscriptModelAdapter {
    never: Infallible,
}

impl TorchscriptModelAdapter {
    pub fn new(model: &ModelDescr, _devices: Option<&[String]>) -> Result<Self> {
        Err(unavailable(model, WeightsFormat::Torchscript, "libtorch"))
    }
}

impl ModelAdapter for TorchscriptModelAdapter {
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        match self.never {}
    }

    fn unload(&mut self) {
        match self.never {}
    }
}

#[derive(Debug)]
pub struct PytorchStateDictModelAdapter {
    never: Infallible,
}

impl PytorchStateDictModelAdapter {
    pub fn new(model: &ModelDescr, _devices: Option<&[String]>) -> Result<Self> {
        Err(unavailable(model, WeightsFormat::PytorchStateDict, "a python torch runtime"))
    }
}

impl ModelAdapter for PytorchStateDictModelAdapter {
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        match self.never {}
    }

    fn unload(&mut self) {
        match self.never {}
    }
}

/// Saved model bundles and Keras HDF5 files
#[derive(Debug)]
pub struct TensorflowModelAdapter {
    never: Infallible,
}

impl TensorflowModelAdapter {
    pub fn new(model: &ModelDescr, format: WeightsFormat, _devices: Option<&[String]>) -> Result<Self> {
        match format {
            WeightsFormat::TensorflowSavedModelBundle | WeightsFormat::KerasHdf5 => {
                Err(unavailable(model, format, "libtensorflow"))
            }
            other => Err(Error::InvalidDescription(format!(
                "{} weights cannot be run by the tensorflow adapter",
                other
            ))),
        }
    }
}

impl ModelAdapter for TensorflowModelAdapter {
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        match self.never {}
    }

    fn unload(&mut self) {
        match self.never {}
    }
}
