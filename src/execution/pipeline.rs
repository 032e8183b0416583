//! Pre-processing, inference and post-processing of one model
//!
//! A pipeline goes through `Uninitialized -> Active -> Closed`. The adapter is
//! released exactly once: by `unload`, or on drop if `unload` was never called.

use std::fmt;

use crate::adapters::{create_model_adapter, ModelAdapter};
use crate::description::ModelDescr;
use crate::error::{Error, Result};
use crate::execution::options::PredictionPipelineOptions;
use crate::processing::ops::Processing;
use crate::processing::setup::{setup_pre_and_postprocessing, PreAndPostprocessing};
use crate::sample::Sample;
use crate::tensor::{AxisId, Tensor, TensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Active,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Active => "active",
            PipelineState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct PredictionPipeline {
    name: String,
    input_ids: Vec<TensorId>,
    input_axes: Vec<Vec<AxisId>>,
    output_ids: Vec<TensorId>,
    preprocessing: Vec<Processing>,
    postprocessing: Vec<Processing>,
    adapter: Box<dyn ModelAdapter>,
    state: PipelineState,
}

impl PredictionPipeline {
    pub fn new(
        name: impl Into<String>,
        input_ids: Vec<TensorId>,
        input_axes: Vec<Vec<AxisId>>,
        output_ids: Vec<TensorId>,
        processing: PreAndPostprocessing,
        adapter: Box<dyn ModelAdapter>,
    ) -> Self {
        Self {
            name: name.into(),
            input_ids,
            input_axes,
            output_ids,
            preprocessing: processing.pre,
            postprocessing: processing.post,
            adapter,
            state: PipelineState::Uninitialized,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn input_ids(&self) -> &[TensorId] {
        &self.input_ids
    }

    /// Declared axes of every input, in input order
    pub fn input_axes(&self) -> &[Vec<AxisId>] {
        &self.input_axes
    }

    pub fn output_ids(&self) -> &[TensorId] {
        &self.output_ids
    }

    pub fn preprocessing(&self) -> &[Processing] {
        &self.preprocessing
    }

    pub fn postprocessing(&self) -> &[Processing] {
        &self.postprocessing
    }

    /// Make the pipeline ready for inference
    pub fn load(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Uninitialized => {
                self.state = PipelineState::Active;
                log::debug!("loaded prediction pipeline '{}'", self.name);
                Ok(())
            }
            PipelineState::Active => Ok(()),
            PipelineState::Closed => Err(Error::InvalidState(format!(
                "prediction pipeline '{}' was unloaded and cannot be loaded again",
                self.name
            ))),
        }
    }

    /// Release the model adapter; later calls are no-ops
    pub fn unload(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        self.adapter.unload();
        self.state = PipelineState::Closed;
        log::debug!("unloaded prediction pipeline '{}'", self.name);
    }

    /// Load, run `f` and unload, also when `f` fails
    pub fn scoped<F, T>(mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.load()?;
        let result = f(&mut self);
        self.unload();
        result
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != PipelineState::Active {
            return Err(Error::InvalidState(format!(
                "prediction pipeline '{}' is {}, call load() first",
                self.name, self.state
            )));
        }
        Ok(())
    }

    /// Run the model on already processed positional inputs
    pub fn predict(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        self.ensure_active()?;
        self.adapter.forward(inputs)
    }

    pub fn apply_preprocessing(&mut self, sample: &mut Sample) -> Result<()> {
        for op in self.preprocessing.iter_mut() {
            log::trace!("applying {} to {:?}", op.name(), op.tensor_id());
            op.apply(sample)?;
        }
        Ok(())
    }

    pub fn apply_postprocessing(&mut self, sample: &mut Sample) -> Result<()> {
        for op in self.postprocessing.iter_mut() {
            log::trace!("applying {} to {:?}", op.name(), op.tensor_id());
            op.apply(sample)?;
        }
        Ok(())
    }

    /// Pre-process `sample`, run the model and post-process its outputs
    ///
    /// The returned sample holds the outputs and inherits the statistics
    /// scope of the input sample.
    pub fn forward_sample(&mut self, mut sample: Sample) -> Result<Sample> {
        self.ensure_active()?;
        self.apply_preprocessing(&mut sample)?;

        let inputs: Vec<Option<Tensor>> = self.input_ids.iter().map(|id| sample.get(id).cloned()).collect();
        let outputs = self.predict(&inputs)?;
        if outputs.len() != self.output_ids.len() {
            return Err(Error::OutputCountMismatch {
                expected: self.output_ids.len(),
                actual: outputs.len(),
            });
        }

        let mut output = Sample::from_members(
            self.output_ids
                .iter()
                .cloned()
                .zip(outputs)
                .filter_map(|(id, tensor)| tensor.map(|t| (id, t))),
        );
        output.stat = std::mem::take(&mut sample.stat);
        self.apply_postprocessing(&mut output)?;
        Ok(output)
    }

    /// Run the whole pipeline on one tensor (or `None`) per declared input
    pub fn forward(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        if inputs.len() > self.input_ids.len() {
            return Err(Error::ShapeMismatch(format!(
                "model '{}' takes {} inputs, got {}",
                self.name,
                self.input_ids.len(),
                inputs.len()
            )));
        }
        let sample = Sample::from_members(
            self.input_ids
                .iter()
                .cloned()
                .zip(inputs.iter().cloned())
                .filter_map(|(id, tensor)| tensor.map(|t| (id, t))),
        );
        let mut output = self.forward_sample(sample)?;
        Ok(self.output_ids.iter().map(|id| output.remove(id)).collect())
    }
}

impl Drop for PredictionPipeline {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Create a pipeline for `model` with the first adapter that can be built
pub fn create_prediction_pipeline(model: &ModelDescr, options: PredictionPipelineOptions) -> Result<PredictionPipeline> {
    let priority = options.weight_format_priority_order();
    let adapter = create_model_adapter(model, options.devices.as_deref(), priority.as_deref())?;
    create_prediction_pipeline_with_adapter(model, adapter, options)
}

/// Create a pipeline for `model` that runs inference through `adapter`
pub fn create_prediction_pipeline_with_adapter(
    model: &ModelDescr,
    mut adapter: Box<dyn ModelAdapter>,
    options: PredictionPipelineOptions,
) -> Result<PredictionPipeline> {
    let input_axes = match model.inputs() {
        Ok(specs) => specs.into_iter().map(|spec| spec.axes).collect(),
        Err(e) => {
            adapter.unload();
            return Err(e);
        }
    };
    let processing = match setup_pre_and_postprocessing(
        model,
        options.dataset_for_initial_statistics,
        options.keep_updating_initial_dataset_statistics,
        options.fixed_dataset_statistics.as_ref(),
    ) {
        Ok(processing) => processing,
        Err(e) => {
            adapter.unload();
            return Err(e);
        }
    };
    log::info!(
        "created prediction pipeline for '{}' with {} pre- and {} post-processing step(s)",
        model.name(),
        processing.pre.len(),
        processing.post.len()
    );
    Ok(PredictionPipeline::new(
        model.name(),
        model.input_ids(),
        input_axes,
        model.output_ids(),
        processing,
        adapter,
    ))
}
