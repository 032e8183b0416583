//! Assembly of pre- and postprocessing chains from a model description

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::description::{FormatVersion, ModelDescr, ProcessingStepDescr, TensorSpec};
use crate::error::{Error, Result};
use crate::processing::ops::{
    AddKnownDatasetStats, Binarize, Clip, EnsureDtype, FixedZeroMeanUnitVariance, Param, Processing, ScaleLinear,
    ScaleMeanVariance, ScaleRange, Sigmoid, UpdateStats, ZeroMeanUnitVariance,
};
use crate::sample::Sample;
use crate::stats::calculators::StatsCalculator;
use crate::stats::measures::{DatasetMeasure, Measure, MeasureValue, SampleMeasure};
use crate::tensor::{AxisId, DataType, TensorId};

const DEFAULT_EPS: f32 = 1e-6;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Values {
    Scalar(f32),
    List(Vec<f32>),
}

/// Reduction axes, as a letter string or as a list of axis ids
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Axes {
    Letters(String),
    Ids(Vec<AxisId>),
}

impl Axes {
    fn resolve(&self) -> Result<Vec<AxisId>> {
        match self {
            Axes::Letters(s) => AxisId::parse_letters(s),
            Axes::Ids(ids) => Ok(ids.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Mode {
    Fixed,
    PerSample,
    PerDataset,
}

fn default_eps() -> f32 {
    DEFAULT_EPS
}

fn default_gain() -> Values {
    Values::Scalar(1.0)
}

fn default_offset() -> Values {
    Values::Scalar(0.0)
}

fn default_max_percentile() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
struct BinarizeKwargs {
    threshold: Values,
    #[serde(default)]
    axis: Option<AxisId>,
}

#[derive(Debug, Deserialize)]
struct ClipKwargs {
    #[serde(default)]
    min: Option<f32>,
    #[serde(default)]
    max: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ScaleLinearKwargs {
    #[serde(default)]
    axes: Option<Axes>,
    #[serde(default)]
    axis: Option<AxisId>,
    #[serde(default = "default_gain")]
    gain: Values,
    #[serde(default = "default_offset")]
    offset: Values,
}

#[derive(Debug, Deserialize)]
struct ZeroMeanUnitVarianceKwargs {
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    axes: Option<Axes>,
    #[serde(default)]
    axis: Option<AxisId>,
    #[serde(default)]
    mean: Option<Values>,
    #[serde(default)]
    std: Option<Values>,
    #[serde(default = "default_eps")]
    eps: f32,
}

#[derive(Debug, Deserialize)]
struct ScaleRangeKwargs {
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    axes: Option<Axes>,
    #[serde(default)]
    min_percentile: f64,
    #[serde(default = "default_max_percentile")]
    max_percentile: f64,
    #[serde(default = "default_eps")]
    eps: f32,
    #[serde(default)]
    reference_tensor: Option<TensorId>,
}

#[derive(Debug, Deserialize)]
struct ScaleMeanVarianceKwargs {
    #[serde(default)]
    mode: Option<Mode>,
    reference_tensor: TensorId,
    #[serde(default)]
    axes: Option<Axes>,
    #[serde(default = "default_eps")]
    eps: f32,
}

#[derive(Debug, Deserialize)]
struct EnsureDtypeKwargs {
    dtype: DataType,
}

/// Resolve reduction axes, adding the batch axis for dataset statistics
fn reduction_axes(axes: &Option<Axes>, spec: &TensorSpec, per_dataset: bool) -> Result<Option<Vec<AxisId>>> {
    let mut axes = match axes {
        Some(axes) => axes.resolve()?,
        None => return Ok(None),
    };
    for axis in &axes {
        if !spec.axes.contains(axis) {
            return Err(Error::InvalidProcessing(format!(
                "tensor '{}' has no axis '{}' to reduce over",
                spec.id, axis
            )));
        }
    }
    if per_dataset && spec.axes.contains(&AxisId::Batch) && !axes.contains(&AxisId::Batch) {
        axes.insert(0, AxisId::Batch);
    }
    Ok(Some(axes))
}

/// Turn declared values into a parameter, finding the axis a value list runs along
fn param(values: Values, axis: Option<AxisId>, joint: Option<&[AxisId]>, spec: &TensorSpec) -> Result<Param> {
    let values = match values {
        Values::Scalar(v) => return Ok(Param::Scalar(v)),
        Values::List(values) if values.len() == 1 => return Ok(Param::Scalar(values[0])),
        Values::List(values) => values,
    };
    let axis = match axis {
        Some(axis) => axis,
        None => {
            let candidates: Vec<&AxisId> = spec
                .axes
                .iter()
                .filter(|a| **a != AxisId::Batch && !joint.map_or(false, |j| j.contains(*a)))
                .collect();
            match candidates[..] {
                [axis] => axis.clone(),
                _ => {
                    return Err(Error::InvalidProcessing(format!(
                        "cannot tell which axis of '{}' {} values apply to",
                        spec.id,
                        values.len()
                    )))
                }
            }
        }
    };
    if !spec.axes.contains(&axis) {
        return Err(Error::InvalidProcessing(format!("tensor '{}' has no axis '{}'", spec.id, axis)));
    }
    Ok(Param::PerAxis { axis, values })
}

/// Translate one declared step into an operator
pub fn processing_from_step(step: &ProcessingStepDescr, spec: &TensorSpec) -> Result<Processing> {
    let tensor_id = spec.id.clone();
    let op = match step.name.as_str() {
        "binarize" => {
            let kw: BinarizeKwargs = step.kwargs()?;
            Processing::Binarize(Binarize {
                threshold: param(kw.threshold, kw.axis, None, spec)?,
                tensor_id,
            })
        }
        "clip" => {
            let kw: ClipKwargs = step.kwargs()?;
            if let (Some(min), Some(max)) = (kw.min, kw.max) {
                if min > max {
                    return Err(Error::InvalidProcessing(format!("clip min {} exceeds max {}", min, max)));
                }
            }
            Processing::Clip(Clip { tensor_id, min: kw.min, max: kw.max })
        }
        "scale_linear" => {
            let kw: ScaleLinearKwargs = step.kwargs()?;
            let joint = kw.axes.as_ref().map(Axes::resolve).transpose()?;
            Processing::ScaleLinear(ScaleLinear {
                gain: param(kw.gain, kw.axis.clone(), joint.as_deref(), spec)?,
                offset: param(kw.offset, kw.axis, joint.as_deref(), spec)?,
                tensor_id,
            })
        }
        "sigmoid" => Processing::Sigmoid(Sigmoid { tensor_id }),
        "zero_mean_unit_variance" | "fixed_zero_mean_unit_variance" => {
            let kw: ZeroMeanUnitVarianceKwargs = step.kwargs()?;
            let mode = match (kw.mode, step.name.as_str()) {
                (_, "fixed_zero_mean_unit_variance") => Mode::Fixed,
                (Some(mode), _) => mode,
                (None, _) if kw.mean.is_some() => Mode::Fixed,
                (None, _) => Mode::PerSample,
            };
            match mode {
                Mode::Fixed => {
                    let (mean, std) = match (kw.mean, kw.std) {
                        (Some(mean), Some(std)) => (mean, std),
                        _ => {
                            return Err(Error::InvalidProcessing(format!(
                                "fixed zero_mean_unit_variance of '{}' needs mean and std",
                                spec.id
                            )))
                        }
                    };
                    let joint = kw.axes.as_ref().map(Axes::resolve).transpose()?;
                    Processing::FixedZeroMeanUnitVariance(FixedZeroMeanUnitVariance {
                        mean: param(mean, kw.axis.clone(), joint.as_deref(), spec)?,
                        std: param(std, kw.axis, joint.as_deref(), spec)?,
                        eps: kw.eps,
                        tensor_id,
                    })
                }
                mode => {
                    let per_dataset = mode == Mode::PerDataset;
                    let axes = reduction_axes(&kw.axes, spec, per_dataset)?;
                    Processing::ZeroMeanUnitVariance(ZeroMeanUnitVariance::new(tensor_id, axes, kw.eps, per_dataset))
                }
            }
        }
        "scale_range" => {
            let kw: ScaleRangeKwargs = step.kwargs()?;
            let per_dataset = kw.mode == Some(Mode::PerDataset);
            let axes = reduction_axes(&kw.axes, spec, per_dataset)?;
            Processing::ScaleRange(ScaleRange::new(
                tensor_id,
                axes,
                kw.min_percentile,
                kw.max_percentile,
                kw.eps,
                kw.reference_tensor,
                per_dataset,
            )?)
        }
        "scale_mean_variance" => {
            let kw: ScaleMeanVarianceKwargs = step.kwargs()?;
            let per_dataset = kw.mode == Some(Mode::PerDataset);
            let axes = reduction_axes(&kw.axes, spec, per_dataset)?;
            Processing::ScaleMeanVariance(ScaleMeanVariance::new(
                tensor_id,
                kw.reference_tensor,
                axes,
                kw.eps,
                per_dataset,
            ))
        }
        "ensure_dtype" => {
            let kw: EnsureDtypeKwargs = step.kwargs()?;
            Processing::EnsureDtype(EnsureDtype { tensor_id, dtype: kw.dtype })
        }
        other => {
            return Err(Error::InvalidProcessing(format!(
                "unknown processing step '{}' for tensor '{}'",
                other, spec.id
            )))
        }
    };
    Ok(op)
}

fn prepare_procs(specs: &[TensorSpec], version: FormatVersion) -> Result<(Vec<Processing>, Vec<Measure>)> {
    let mut procs = Vec::new();
    for spec in specs {
        let ensure_dtype = Processing::EnsureDtype(EnsureDtype {
            tensor_id: spec.id.clone(),
            dtype: spec.data_type,
        });
        if version == FormatVersion::V0_4 || spec.steps.is_empty() {
            procs.push(ensure_dtype);
        }
        for step in &spec.steps {
            procs.push(processing_from_step(step, spec)?);
        }
    }

    let mut measures = Vec::new();
    for m in procs.iter().flat_map(Processing::required_measures) {
        if !measures.contains(&m) {
            measures.push(m);
        }
    }
    Ok((procs, measures))
}

struct SetupProcessing {
    pre: Vec<Processing>,
    post: Vec<Processing>,
    pre_measures: Vec<Measure>,
    post_measures: Vec<Measure>,
    input_ids: Vec<TensorId>,
}

fn prepare_setup_pre_and_postprocessing(model: &ModelDescr) -> Result<SetupProcessing> {
    let version = model.format_version();
    let (pre, pre_measures) = prepare_procs(&model.inputs()?, version)?;
    let (post, post_measures) = prepare_procs(&model.outputs()?, version)?;
    Ok(SetupProcessing {
        pre,
        post,
        pre_measures,
        post_measures,
        input_ids: model.input_ids(),
    })
}

/// Ordered operator chains for the inputs and the outputs of a model
#[derive(Debug, Clone)]
pub struct PreAndPostprocessing {
    pub pre: Vec<Processing>,
    pub post: Vec<Processing>,
}

/// Build the operator chains of `model`
///
/// Dataset statistics not covered by `fixed_dataset_stats` are computed from
/// `dataset_for_initial_statistics` in one pass. If that dataset is empty the
/// statistics are accumulated from the samples seen during inference instead.
pub fn setup_pre_and_postprocessing<I>(
    model: &ModelDescr,
    dataset_for_initial_statistics: I,
    keep_updating_initial_dataset_stats: bool,
    fixed_dataset_stats: Option<&HashMap<DatasetMeasure, MeasureValue>>,
) -> Result<PreAndPostprocessing>
where
    I: IntoIterator<Item = Sample>,
{
    let SetupProcessing {
        mut pre,
        mut post,
        pre_measures,
        post_measures,
        input_ids,
    } = prepare_setup_pre_and_postprocessing(model)?;
    let fixed = fixed_dataset_stats.cloned().unwrap_or_default();

    let missing: Vec<Measure> = {
        let mut missing = Vec::new();
        for m in pre_measures.iter().chain(&post_measures) {
            let covered = m.as_dataset().map_or(false, |d| fixed.contains_key(d));
            if !covered && !missing.contains(m) {
                missing.push(m.clone());
            }
        }
        missing
    };

    let mut initial = StatsCalculator::new(missing.iter().filter(|m| m.is_dataset_measure()).cloned())?;
    for sample in dataset_for_initial_statistics {
        initial.update(&sample)?;
    }
    if initial.sample_count() > 0 && initial.has_dataset_measures() {
        initial.finalize()?;
        log::info!("computed initial dataset statistics from {} sample(s)", initial.sample_count());
    }

    // Measures of input tensors are computed before the model runs; the
    // output sample inherits them through the stats scope.
    let (pre_missing, post_missing): (Vec<Measure>, Vec<Measure>) =
        missing.into_iter().partition(|m| input_ids.contains(m.tensor_id()));

    pre.insert(
        0,
        Processing::UpdateStats(UpdateStats::new(initial.subset(pre_missing)?, keep_updating_initial_dataset_stats)),
    );
    if !post_missing.is_empty() {
        post.insert(
            0,
            Processing::UpdateStats(UpdateStats::new(initial.subset(post_missing)?, keep_updating_initial_dataset_stats)),
        );
    }

    if !fixed.is_empty() {
        let known = AddKnownDatasetStats { dataset_stats: fixed };
        pre.insert(0, Processing::AddKnownDatasetStats(known.clone()));
        post.insert(0, Processing::AddKnownDatasetStats(known));
    }

    Ok(PreAndPostprocessing { pre, post })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredMeasures {
    pub pre: HashSet<Measure>,
    pub post: HashSet<Measure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredDatasetMeasures {
    pub pre: HashSet<DatasetMeasure>,
    pub post: HashSet<DatasetMeasure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredSampleMeasures {
    pub pre: HashSet<SampleMeasure>,
    pub post: HashSet<SampleMeasure>,
}

pub fn get_required_measures(model: &ModelDescr) -> Result<RequiredMeasures> {
    let s = prepare_setup_pre_and_postprocessing(model)?;
    Ok(RequiredMeasures {
        pre: s.pre_measures.into_iter().collect(),
        post: s.post_measures.into_iter().collect(),
    })
}

pub fn get_required_dataset_measures(model: &ModelDescr) -> Result<RequiredDatasetMeasures> {
    let s = prepare_setup_pre_and_postprocessing(model)?;
    let dataset = |ms: Vec<Measure>| ms.iter().filter_map(Measure::as_dataset).cloned().collect();
    Ok(RequiredDatasetMeasures {
        pre: dataset(s.pre_measures),
        post: dataset(s.post_measures),
    })
}

pub fn get_required_sample_measures(model: &ModelDescr) -> Result<RequiredSampleMeasures> {
    let s = prepare_setup_pre_and_postprocessing(model)?;
    let sample = |ms: Vec<Measure>| ms.iter().filter_map(Measure::as_sample).cloned().collect();
    Ok(RequiredSampleMeasures {
        pre: sample(s.pre_measures),
        post: sample(s.post_measures),
    })
}
