//! Dynamic tests of a model description
//!
//! Runs the model on its test inputs and compares against the test outputs,
//! then checks output shapes for inputs with parametrized sizes. Failures are
//! reported in the returned [`ValidationSummary`], never as `Err`.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use ndarray::{ArrayD, IxDyn, Zip};

use crate::adapters::{create_model_adapter, ModelAdapter};
use crate::description::{FormatVersion, ModelDescr, SizeDescr, TensorSpec, WeightsFormat};
use crate::error::{Error, Result};
use crate::execution::{create_prediction_pipeline_with_adapter, PredictionPipeline, PredictionPipelineOptions};
use crate::io::load_tensor;
use crate::summary::{ErrorEntry, ValidationDetail, ValidationSummary};
use crate::tensor::{AxisId, Tensor, TensorId};

pub const EXPECTED_TYPE_DETAIL: &str = "Has expected resource type";
pub const REPRODUCE_DETAIL: &str = "Reproduce test outputs from test inputs";
pub const PARAMETRIZED_DETAIL: &str = "Run inference for inputs with parametrized sizes";

const ERROR_TYPE: &str = env!("CARGO_PKG_NAME");

/// Options for testing a model description
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Only test this weights format
    pub weight_format: Option<WeightsFormat>,
    pub devices: Option<Vec<String>>,
    /// Outputs agree if `|actual - expected| < 1.5 * 10^-decimal`
    pub decimal: u32,
    /// Resource type the description must declare
    pub expected_type: Option<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            weight_format: None,
            devices: None,
            decimal: 4,
            expected_type: None,
        }
    }
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_weight_format(mut self, weight_format: WeightsFormat) -> Self {
        self.weight_format = Some(weight_format);
        self
    }

    pub fn set_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn set_decimal(mut self, decimal: u32) -> Self {
        self.decimal = decimal;
        self
    }

    pub fn set_expected_type(mut self, expected_type: impl Into<String>) -> Self {
        self.expected_type = Some(expected_type.into());
        self
    }

    fn loc(&self) -> Vec<String> {
        let mut loc = vec!["weights".to_string()];
        if let Some(format) = self.weight_format {
            loc.push(format.to_string());
        }
        loc
    }

    fn pipeline_options(&self) -> PredictionPipelineOptions {
        let mut options = PredictionPipelineOptions::new();
        options.devices = self.devices.clone();
        options.weight_format = self.weight_format;
        options
    }
}

/// Test that the test outputs of `model` can be reproduced
pub fn test_model(model: &ModelDescr, options: &TestOptions) -> ValidationSummary {
    let devices = options.devices.clone();
    let priority = options.weight_format.map(|f| vec![f]);
    test_model_with_adapter(
        model,
        |m: &ModelDescr| create_model_adapter(m, devices.as_deref(), priority.as_deref()),
        options,
    )
}

/// Like [`test_model`], running inference through adapters made by `factory`
pub fn test_model_with_adapter<F>(model: &ModelDescr, factory: F, options: &TestOptions) -> ValidationSummary
where
    F: Fn(&ModelDescr) -> Result<Box<dyn ModelAdapter>>,
{
    let mut options = options.clone();
    if options.expected_type.is_none() {
        options.expected_type = Some("model".to_string());
    }
    run_tests(model, &factory, &options)
}

/// Test a description without assuming its resource type
pub fn test_description(model: &ModelDescr, options: &TestOptions) -> ValidationSummary {
    let devices = options.devices.clone();
    let priority = options.weight_format.map(|f| vec![f]);
    let factory = |m: &ModelDescr| create_model_adapter(m, devices.as_deref(), priority.as_deref());
    run_tests(model, &factory, options)
}

/// Load the description at `path` and test it
pub fn test_description_at(path: impl AsRef<Path>, options: &TestOptions) -> ValidationSummary {
    let path = path.as_ref();
    match ModelDescr::from_path(path) {
        Ok(model) => test_description(&model, options),
        Err(e) => {
            let mut summary = ValidationSummary::new(path.display().to_string());
            summary.add_detail(ValidationDetail::failed(
                "Load description",
                vec![error_entry(vec!["source".to_string()], &e)],
            ));
            summary
        }
    }
}

fn run_tests(
    model: &ModelDescr,
    factory: &dyn Fn(&ModelDescr) -> Result<Box<dyn ModelAdapter>>,
    options: &TestOptions,
) -> ValidationSummary {
    let mut summary = ValidationSummary::new(model.name());
    if let Some(expected) = &options.expected_type {
        summary.add_detail(expected_resource_type(model, expected));
    }
    if model.kind() != "model" {
        return summary;
    }

    summary.add_detail(to_detail(REPRODUCE_DETAIL, options, reproduce_test_outputs(model, factory, options)));
    if model.format_version() == FormatVersion::V0_5 {
        match model.inputs() {
            Ok(inputs) if !inputs.iter().any(TensorSpec::has_parameterized_axis) => {}
            Ok(_) => summary.add_detail(to_detail(
                PARAMETRIZED_DETAIL,
                options,
                parametrized_inference(model, factory, options),
            )),
            Err(e) => summary.add_detail(to_detail(PARAMETRIZED_DETAIL, options, Err(e))),
        }
    }
    log::info!("tested '{}': {}", model.name(), summary.status);
    summary
}

fn expected_resource_type(model: &ModelDescr, expected: &str) -> ValidationDetail {
    if model.kind() == expected {
        return ValidationDetail::passed(EXPECTED_TYPE_DETAIL);
    }
    ValidationDetail::failed(
        EXPECTED_TYPE_DETAIL,
        vec![ErrorEntry {
            loc: vec!["type".to_string()],
            msg: format!("expected type {}, found {}", expected, model.kind()),
            kind: "type".to_string(),
            traceback: Vec::new(),
        }],
    )
}

fn error_entry(loc: Vec<String>, error: &Error) -> ErrorEntry {
    ErrorEntry {
        loc,
        msg: error.to_string(),
        kind: ERROR_TYPE.to_string(),
        traceback: Backtrace::force_capture().to_string().lines().map(str::to_string).collect(),
    }
}

/// `Ok(None)` passed, `Ok(Some(msg))` failed check, `Err` failed to run
fn to_detail(name: &str, options: &TestOptions, outcome: Result<Option<String>>) -> ValidationDetail {
    match outcome {
        Ok(None) => ValidationDetail::passed(name),
        Ok(Some(msg)) => {
            log::warn!("{}: {}", name, msg);
            ValidationDetail::failed(
                name,
                vec![ErrorEntry {
                    loc: options.loc(),
                    msg,
                    kind: ERROR_TYPE.to_string(),
                    traceback: Vec::new(),
                }],
            )
        }
        Err(e) => {
            log::warn!("{}: {}", name, e);
            ValidationDetail::failed(name, vec![error_entry(options.loc(), &e)])
        }
    }
}

fn load_test_tensors(specs: &[TensorSpec]) -> Result<Vec<Tensor>> {
    specs
        .iter()
        .map(|spec| {
            let path = spec
                .test_tensor
                .as_ref()
                .ok_or_else(|| Error::InvalidDescription(format!("tensor '{}' has no test tensor", spec.id)))?;
            load_tensor(path, &spec.axes)
        })
        .collect()
}

fn create_pipeline(
    model: &ModelDescr,
    factory: &dyn Fn(&ModelDescr) -> Result<Box<dyn ModelAdapter>>,
    options: &TestOptions,
) -> Result<PredictionPipeline> {
    let adapter = factory(model)?;
    create_prediction_pipeline_with_adapter(model, adapter, options.pipeline_options())
}

fn reproduce_test_outputs(
    model: &ModelDescr,
    factory: &dyn Fn(&ModelDescr) -> Result<Box<dyn ModelAdapter>>,
    options: &TestOptions,
) -> Result<Option<String>> {
    let inputs: Vec<Option<Tensor>> = load_test_tensors(&model.inputs()?)?.into_iter().map(Some).collect();
    let output_specs = model.outputs()?;
    let expected = load_test_tensors(&output_specs)?;

    let pipeline = create_pipeline(model, factory, options)?;
    let results = match pipeline.scoped(|pp| pp.forward(&inputs)) {
        Ok(results) => results,
        Err(Error::OutputCountMismatch { expected, actual }) => {
            return Ok(Some(format!("Expected {} outputs, but got {}", expected, actual)))
        }
        Err(e) => return Err(e),
    };

    let mut error = String::new();
    for ((spec, result), expected) in output_specs.iter().zip(&results).zip(&expected) {
        match result {
            None => {
                let _ = writeln!(error, "Output '{}' is missing", spec.id);
            }
            Some(actual) => {
                if let Some(msg) = compare_almost_equal(actual.data(), expected.data(), options.decimal) {
                    let _ = writeln!(error, "Output '{}' and expected output disagree:\n{}", spec.id, msg);
                }
            }
        }
    }
    Ok(if error.is_empty() { None } else { Some(error) })
}

/// Elementwise `|actual - expected| < 1.5 * 10^-decimal`
///
/// NaNs agree with NaNs and infinities with infinities of the same sign.
fn compare_almost_equal(actual: &ArrayD<f32>, expected: &ArrayD<f32>, decimal: u32) -> Option<String> {
    if actual.shape() != expected.shape() {
        return Some(format!(
            " Arrays are not almost equal to {} decimals\n (shapes {:?}, {:?} mismatch)",
            decimal,
            actual.shape(),
            expected.shape()
        ));
    }
    let tolerance = 1.5 * 10f64.powi(-(decimal as i32));
    let mut mismatched = 0usize;
    let mut max_abs_diff = 0f64;
    Zip::from(actual).and(expected).for_each(|&a, &e| {
        let (a, e) = (a as f64, e as f64);
        if (a.is_nan() && e.is_nan()) || a == e {
            return;
        }
        let diff = (a - e).abs();
        if !(diff < tolerance) {
            mismatched += 1;
            if diff > max_abs_diff || diff.is_nan() {
                max_abs_diff = diff;
            }
        }
    });
    if mismatched == 0 {
        return None;
    }
    let total = actual.len();
    Some(format!(
        " Arrays are not almost equal to {} decimals\n Mismatched elements: {} / {} ({:.3}%)\n Max absolute difference: {}",
        decimal,
        mismatched,
        total,
        100.0 * mismatched as f64 / total as f64,
        max_abs_diff
    ))
}

type AxisSizes = HashMap<(TensorId, AxisId), usize>;

fn reference_size(sizes: &AxisSizes, tensor_id: &TensorId, axis_id: &AxisId, scale: f64, offset: i64) -> Option<i64> {
    sizes
        .get(&(tensor_id.clone(), axis_id.clone()))
        .map(|&size| (size as f64 * scale).floor() as i64 + offset)
}

/// Input shapes for step `n` of the parametrized sizes
fn parametrized_input_shapes(specs: &[TensorSpec], test_inputs: &[Tensor], n: usize) -> Result<(Vec<Vec<usize>>, AxisSizes)> {
    let mut sizes = AxisSizes::new();
    for (spec, test) in specs.iter().zip(test_inputs) {
        for ((axis, size), &test_size) in spec.axes.iter().zip(&spec.sizes).zip(test.shape()) {
            let size = match size {
                SizeDescr::Fixed(s) => *s,
                SizeDescr::Parameterized { min, step } => min + n * step,
                SizeDescr::Reference { .. } => continue,
                SizeDescr::Any => test_size,
            };
            sizes.insert((spec.id.clone(), axis.clone()), size);
        }
    }

    let mut shapes = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut shape = Vec::with_capacity(spec.axes.len());
        for (axis, size) in spec.axes.iter().zip(&spec.sizes) {
            let size = match size {
                SizeDescr::Reference {
                    tensor_id,
                    axis_id,
                    scale,
                    offset,
                } => {
                    let size = reference_size(&sizes, tensor_id, axis_id, *scale, *offset).ok_or_else(|| {
                        Error::InvalidDescription(format!(
                            "cannot resolve size of axis '{}' of input '{}'",
                            axis, spec.id
                        ))
                    })?;
                    usize::try_from(size).map_err(|_| {
                        Error::InvalidDescription(format!("axis '{}' of input '{}' has negative size", axis, spec.id))
                    })?
                }
                _ => sizes.get(&(spec.id.clone(), axis.clone())).copied().ok_or_else(|| {
                    Error::ShapeMismatch(format!("test tensor of input '{}' has no axis '{}'", spec.id, axis))
                })?,
            };
            shape.push(size);
        }
        for (axis, &size) in spec.axes.iter().zip(&shape) {
            sizes.insert((spec.id.clone(), axis.clone()), size);
        }
        shapes.push(shape);
    }
    Ok((shapes, sizes))
}

/// Declared output sizes, `None` where the size is not known up front
fn expected_output_shape(spec: &TensorSpec, input_sizes: &AxisSizes) -> Vec<Option<i64>> {
    spec.sizes
        .iter()
        .map(|size| match size {
            SizeDescr::Fixed(s) => Some(*s as i64),
            SizeDescr::Reference {
                tensor_id,
                axis_id,
                scale,
                offset,
            } => reference_size(input_sizes, tensor_id, axis_id, *scale, *offset),
            SizeDescr::Parameterized { .. } | SizeDescr::Any => None,
        })
        .collect()
}

/// Repeat `tensor` along every axis to fill `shape`
fn tile_to(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if tensor.is_empty() {
        return Err(Error::ShapeMismatch("cannot tile an empty test tensor".to_string()));
    }
    let source = tensor.data();
    let source_shape = tensor.shape().to_vec();
    let mut index = vec![0usize; source_shape.len()];
    let data = ArrayD::from_shape_fn(IxDyn(shape), |idx| {
        for (i, slot) in index.iter_mut().enumerate() {
            *slot = idx[i] % source_shape[i];
        }
        source[IxDyn(&index)]
    });
    Tensor::with_data_type(data, tensor.dims().to_vec(), tensor.data_type())
}

fn format_shape(shape: &[Option<i64>]) -> String {
    let parts: Vec<String> = shape
        .iter()
        .map(|s| s.map_or_else(|| "?".to_string(), |s| s.to_string()))
        .collect();
    format!("[{}]", parts.join(", "))
}

fn parametrized_inference(
    model: &ModelDescr,
    factory: &dyn Fn(&ModelDescr) -> Result<Box<dyn ModelAdapter>>,
    options: &TestOptions,
) -> Result<Option<String>> {
    let input_specs = model.inputs()?;
    let output_specs = model.outputs()?;
    let test_inputs = load_test_tensors(&input_specs)?;

    let pipeline = create_pipeline(model, factory, options)?;
    pipeline.scoped(|pp| {
        for n in 0..=3usize {
            let (shapes, sizes) = parametrized_input_shapes(&input_specs, &test_inputs, n)?;
            let inputs = test_inputs
                .iter()
                .zip(&shapes)
                .map(|(test, shape)| tile_to(test, shape).map(Some))
                .collect::<Result<Vec<_>>>()?;
            log::debug!("running '{}' with parametrized input shapes {:?} (n={})", model.name(), shapes, n);

            let results = match pp.forward(&inputs) {
                Ok(results) => results,
                Err(Error::OutputCountMismatch { expected, actual }) => {
                    return Ok(Some(format!("Expected {} outputs, but got {}", expected, actual)))
                }
                Err(e) => return Err(e),
            };

            let mut error = String::new();
            for (spec, result) in output_specs.iter().zip(&results) {
                let expected = expected_output_shape(spec, &sizes);
                let actual = match result {
                    Some(tensor) => tensor.shape(),
                    None => {
                        let _ = writeln!(error, "(n={}) Output '{}' is missing", n, spec.id);
                        continue;
                    }
                };
                let matches = actual.len() == expected.len()
                    && actual.iter().zip(&expected).all(|(&a, e)| e.map_or(true, |e| e == a as i64));
                if !matches {
                    let _ = writeln!(
                        error,
                        "(n={}) Expected output shape {} for '{}', but got {:?}",
                        n,
                        format_shape(&expected),
                        spec.id,
                        actual
                    );
                }
            }
            if !error.is_empty() {
                return Ok(Some(error));
            }
        }
        Ok(None)
    })
}
