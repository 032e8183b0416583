use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};
use strum_macros::IntoStaticStr;

use crate::error::{Error, Result};
use crate::sample::{Sample, Stat};
use crate::stats::calculators::StatsCalculator;
use crate::stats::measures::{DatasetMeasure, Measure, MeasureValue, SampleMeasure, Statistic};
use crate::tensor::{AxisId, DataType, Tensor, TensorId};

/// A constant operator parameter, either one value or one value per entry of an axis
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Scalar(f32),
    PerAxis { axis: AxisId, values: Vec<f32> },
}

impl Param {
    /// Parameter values shaped to broadcast against `target`
    fn aligned(&self, target: &Tensor) -> Result<ArrayD<f32>> {
        match self {
            Param::Scalar(v) => Ok(scalar_array(*v, target.ndim())),
            Param::PerAxis { axis, values } => {
                let param = Tensor::new(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.clone())?, vec![axis.clone()])?;
                param.align_to(target.dims())
            }
        }
    }
}

impl From<f32> for Param {
    fn from(v: f32) -> Self {
        Param::Scalar(v)
    }
}

fn scalar_array(v: f32, ndim: usize) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(&vec![1; ndim]), v)
}

fn aligned_measure(value: &MeasureValue, target: &Tensor) -> Result<ArrayD<f32>> {
    match value {
        MeasureValue::Scalar(v) => Ok(scalar_array(*v as f32, target.ndim())),
        MeasureValue::Tensor(t) => t.align_to(target.dims()),
    }
}

fn broadcast_to<'a>(param: &'a ArrayD<f32>, target: &Tensor) -> Result<ArrayViewD<'a, f32>> {
    param.broadcast(target.shape()).ok_or_else(|| {
        Error::ShapeMismatch(format!(
            "parameter of shape {:?} does not broadcast to tensor {:?}",
            param.shape(),
            target
        ))
    })
}

fn lookup_aligned(stat: &Stat, measure: &Measure, target: &Tensor) -> Result<ArrayD<f32>> {
    let value = stat.get(measure).ok_or_else(|| {
        Error::MissingStatistics(format!("{} is not available in the sample scope", measure))
    })?;
    aligned_measure(value, target)
}

/// Operators that replace one tensor of a sample by a function of itself
trait TensorOp {
    fn tensor_id(&self) -> &TensorId;

    fn transform(&self, tensor: &Tensor, stat: &Stat) -> Result<Tensor>;

    fn required_measures(&self) -> Vec<Measure> {
        Vec::new()
    }

    /// Skipped optional tensors are not in the sample and are left alone
    fn apply_to(&self, sample: &mut Sample) -> Result<()> {
        let output = match sample.get(self.tensor_id()) {
            Some(tensor) => self.transform(tensor, &sample.stat)?,
            None => {
                log::trace!("'{}' is not in the sample, skipping", self.tensor_id());
                return Ok(());
            }
        };
        sample.insert(self.tensor_id().clone(), output);
        Ok(())
    }
}

/// Cast a tensor to a declared data type
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureDtype {
    pub tensor_id: TensorId,
    pub dtype: DataType,
}

impl TensorOp for EnsureDtype {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        Ok(tensor.cast_to(self.dtype))
    }
}

/// `x > threshold` as float32 ones and zeros
#[derive(Debug, Clone, PartialEq)]
pub struct Binarize {
    pub tensor_id: TensorId,
    pub threshold: Param,
}

impl TensorOp for Binarize {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        let threshold = self.threshold.aligned(tensor)?;
        let threshold = broadcast_to(&threshold, tensor)?;
        let mut out = tensor.data().clone();
        Zip::from(&mut out).and(&threshold).for_each(|v, &t| *v = if *v > t { 1.0 } else { 0.0 });
        Tensor::new(out, tensor.dims().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub tensor_id: TensorId,
    pub min: Option<f32>,
    pub max: Option<f32>,
}

impl TensorOp for Clip {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        let (min, max) = (self.min.unwrap_or(f32::NEG_INFINITY), self.max.unwrap_or(f32::INFINITY));
        Ok(tensor.map(|v| v.max(min).min(max)))
    }
}

/// `x * gain + offset`
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLinear {
    pub tensor_id: TensorId,
    pub gain: Param,
    pub offset: Param,
}

impl TensorOp for ScaleLinear {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        let gain = self.gain.aligned(tensor)?;
        let offset = self.offset.aligned(tensor)?;
        let mut out = tensor.data().clone();
        Zip::from(&mut out)
            .and(&broadcast_to(&gain, tensor)?)
            .and(&broadcast_to(&offset, tensor)?)
            .for_each(|v, &g, &o| *v = *v * g + o);
        Tensor::new(out, tensor.dims().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sigmoid {
    pub tensor_id: TensorId,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl TensorOp for Sigmoid {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        Tensor::new(tensor.data().mapv(sigmoid), tensor.dims().to_vec())
    }
}

fn mean_and_std(
    tensor_id: &TensorId,
    axes: Option<Vec<AxisId>>,
    per_dataset: bool,
) -> (Measure, Measure) {
    if per_dataset {
        (
            DatasetMeasure::new(tensor_id.clone(), axes.clone(), Statistic::Mean).into(),
            DatasetMeasure::new(tensor_id.clone(), axes, Statistic::Std).into(),
        )
    } else {
        (
            SampleMeasure::new(tensor_id.clone(), axes.clone(), Statistic::Mean).into(),
            SampleMeasure::new(tensor_id.clone(), axes, Statistic::Std).into(),
        )
    }
}

/// `(x - mean) / (std + eps)` with statistics of the sample or the dataset
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroMeanUnitVariance {
    pub tensor_id: TensorId,
    pub mean: Measure,
    pub std: Measure,
    pub eps: f32,
}

impl ZeroMeanUnitVariance {
    pub fn new(tensor_id: TensorId, axes: Option<Vec<AxisId>>, eps: f32, per_dataset: bool) -> Self {
        let (mean, std) = mean_and_std(&tensor_id, axes, per_dataset);
        Self { tensor_id, mean, std, eps }
    }
}

impl TensorOp for ZeroMeanUnitVariance {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn required_measures(&self) -> Vec<Measure> {
        vec![self.mean.clone(), self.std.clone()]
    }

    fn transform(&self, tensor: &Tensor, stat: &Stat) -> Result<Tensor> {
        let mean = lookup_aligned(stat, &self.mean, tensor)?;
        let std = lookup_aligned(stat, &self.std, tensor)?;
        let eps = self.eps;
        let mut out = tensor.data().clone();
        Zip::from(&mut out)
            .and(&broadcast_to(&mean, tensor)?)
            .and(&broadcast_to(&std, tensor)?)
            .for_each(|v, &m, &s| *v = (*v - m) / (s + eps));
        Tensor::new(out, tensor.dims().to_vec())
    }
}

/// Normalization with mean and standard deviation given up front
#[derive(Debug, Clone, PartialEq)]
pub struct FixedZeroMeanUnitVariance {
    pub tensor_id: TensorId,
    pub mean: Param,
    pub std: Param,
    pub eps: f32,
}

impl TensorOp for FixedZeroMeanUnitVariance {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn transform(&self, tensor: &Tensor, _stat: &Stat) -> Result<Tensor> {
        let mean = self.mean.aligned(tensor)?;
        let std = self.std.aligned(tensor)?;
        let eps = self.eps;
        let mut out = tensor.data().clone();
        Zip::from(&mut out)
            .and(&broadcast_to(&mean, tensor)?)
            .and(&broadcast_to(&std, tensor)?)
            .for_each(|v, &m, &s| *v = (*v - m) / (s + eps));
        Tensor::new(out, tensor.dims().to_vec())
    }
}

/// Map the `[lower, upper]` percentile range of a reference tensor to `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleRange {
    pub tensor_id: TensorId,
    pub lower: Measure,
    pub upper: Measure,
    pub eps: f32,
}

impl ScaleRange {
    /// Percentiles are in `[0, 100]`; quantiles are taken of `reference` or of the tensor itself
    pub fn new(
        tensor_id: TensorId,
        axes: Option<Vec<AxisId>>,
        min_percentile: f64,
        max_percentile: f64,
        eps: f32,
        reference: Option<TensorId>,
        per_dataset: bool,
    ) -> Result<Self> {
        if !(0.0..100.0).contains(&min_percentile) || !(min_percentile < max_percentile && max_percentile <= 100.0) {
            return Err(Error::InvalidProcessing(format!(
                "scale_range requires 0 <= min_percentile < max_percentile <= 100, got {} and {}",
                min_percentile, max_percentile
            )));
        }
        let source = reference.unwrap_or_else(|| tensor_id.clone());
        let quantile = |p: f64| -> Measure {
            let statistic = Statistic::Quantile(p / 100.0);
            if per_dataset {
                DatasetMeasure::new(source.clone(), axes.clone(), statistic).into()
            } else {
                SampleMeasure::new(source.clone(), axes.clone(), statistic).into()
            }
        };
        Ok(Self {
            lower: quantile(min_percentile),
            upper: quantile(max_percentile),
            tensor_id,
            eps,
        })
    }
}

impl TensorOp for ScaleRange {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn required_measures(&self) -> Vec<Measure> {
        vec![self.lower.clone(), self.upper.clone()]
    }

    fn transform(&self, tensor: &Tensor, stat: &Stat) -> Result<Tensor> {
        let lower = lookup_aligned(stat, &self.lower, tensor)?;
        let upper = lookup_aligned(stat, &self.upper, tensor)?;
        let eps = self.eps;
        let mut out = tensor.data().clone();
        Zip::from(&mut out)
            .and(&broadcast_to(&lower, tensor)?)
            .and(&broadcast_to(&upper, tensor)?)
            .for_each(|v, &lo, &hi| *v = (*v - lo) / (hi - lo + eps));
        Tensor::new(out, tensor.dims().to_vec())
    }
}

/// Match mean and standard deviation of a tensor to those of a reference tensor
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleMeanVariance {
    pub tensor_id: TensorId,
    pub mean: Measure,
    pub std: Measure,
    pub ref_mean: Measure,
    pub ref_std: Measure,
    pub eps: f32,
}

impl ScaleMeanVariance {
    pub fn new(
        tensor_id: TensorId,
        reference: TensorId,
        axes: Option<Vec<AxisId>>,
        eps: f32,
        per_dataset: bool,
    ) -> Self {
        let (mean, std) = mean_and_std(&tensor_id, axes.clone(), per_dataset);
        let (ref_mean, ref_std) = mean_and_std(&reference, axes, per_dataset);
        Self { tensor_id, mean, std, ref_mean, ref_std, eps }
    }
}

impl TensorOp for ScaleMeanVariance {
    fn tensor_id(&self) -> &TensorId {
        &self.tensor_id
    }

    fn required_measures(&self) -> Vec<Measure> {
        vec![self.mean.clone(), self.std.clone(), self.ref_mean.clone(), self.ref_std.clone()]
    }

    fn transform(&self, tensor: &Tensor, stat: &Stat) -> Result<Tensor> {
        let mean = lookup_aligned(stat, &self.mean, tensor)?;
        let std = lookup_aligned(stat, &self.std, tensor)?;
        let ref_mean = lookup_aligned(stat, &self.ref_mean, tensor)?;
        let ref_std = lookup_aligned(stat, &self.ref_std, tensor)?;
        let eps = self.eps;
        let mut out = tensor.data().clone();
        Zip::from(&mut out)
            .and(&broadcast_to(&mean, tensor)?)
            .and(&broadcast_to(&std, tensor)?)
            .and(&broadcast_to(&ref_mean, tensor)?)
            .and(&broadcast_to(&ref_std, tensor)?)
            .for_each(|v, &m, &s, &rm, &rs| *v = (*v - m) / (s + eps) * (rs + eps) + rm);
        Tensor::new(out, tensor.dims().to_vec())
    }
}

/// Writes the current sample and dataset statistics into the sample scope
///
/// In online mode every sample is also folded into the dataset statistics.
/// Online mode is forced while no dataset sample has been seen yet, so the
/// first inference samples initialize the statistics.
#[derive(Debug, Clone)]
pub struct UpdateStats {
    pub calculator: StatsCalculator,
    keep_updating: bool,
}

impl UpdateStats {
    pub fn new(calculator: StatsCalculator, keep_updating_initial_dataset_stats: bool) -> Self {
        let lazy = calculator.sample_count() == 0;
        if lazy && !keep_updating_initial_dataset_stats {
            log::debug!("no initial dataset statistics; accumulating from inference samples");
        }
        Self {
            keep_updating: keep_updating_initial_dataset_stats || lazy,
            calculator,
        }
    }

    pub fn keeps_updating(&self) -> bool {
        self.keep_updating
    }

    fn apply(&mut self, sample: &mut Sample) -> Result<()> {
        let stat = if self.keep_updating {
            self.calculator.update_and_get_all(sample)?
        } else {
            self.calculator.skip_update_and_get_all(sample)?
        };
        sample.stat.extend(stat);
        Ok(())
    }
}

/// Injects caller-supplied dataset statistics into the sample scope
#[derive(Debug, Clone, PartialEq)]
pub struct AddKnownDatasetStats {
    pub dataset_stats: HashMap<DatasetMeasure, MeasureValue>,
}

impl AddKnownDatasetStats {
    fn apply(&self, sample: &mut Sample) {
        sample
            .stat
            .extend(self.dataset_stats.iter().map(|(m, v)| (Measure::Dataset(m.clone()), v.clone())));
    }
}

/// One step of a pre- or postprocessing chain
#[derive(Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Processing {
    AddKnownDatasetStats(AddKnownDatasetStats),
    UpdateStats(UpdateStats),
    EnsureDtype(EnsureDtype),
    Binarize(Binarize),
    Clip(Clip),
    ScaleLinear(ScaleLinear),
    Sigmoid(Sigmoid),
    ZeroMeanUnitVariance(ZeroMeanUnitVariance),
    FixedZeroMeanUnitVariance(FixedZeroMeanUnitVariance),
    ScaleRange(ScaleRange),
    ScaleMeanVariance(ScaleMeanVariance),
}

impl Processing {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    fn tensor_op(&self) -> Option<&dyn TensorOp> {
        match self {
            Processing::AddKnownDatasetStats(_) | Processing::UpdateStats(_) => None,
            Processing::EnsureDtype(op) => Some(op),
            Processing::Binarize(op) => Some(op),
            Processing::Clip(op) => Some(op),
            Processing::ScaleLinear(op) => Some(op),
            Processing::Sigmoid(op) => Some(op),
            Processing::ZeroMeanUnitVariance(op) => Some(op),
            Processing::FixedZeroMeanUnitVariance(op) => Some(op),
            Processing::ScaleRange(op) => Some(op),
            Processing::ScaleMeanVariance(op) => Some(op),
        }
    }

    /// Tensor read and replaced by this step, if any
    pub fn tensor_id(&self) -> Option<&TensorId> {
        self.tensor_op().map(|op| op.tensor_id())
    }

    /// Statistics that must be in the sample scope before `apply`
    pub fn required_measures(&self) -> Vec<Measure> {
        self.tensor_op().map(|op| op.required_measures()).unwrap_or_default()
    }

    pub fn apply(&mut self, sample: &mut Sample) -> Result<()> {
        match self {
            Processing::AddKnownDatasetStats(op) => {
                op.apply(sample);
                Ok(())
            }
            Processing::UpdateStats(op) => op.apply(sample),
            other => match other.tensor_op() {
                Some(op) => op.apply_to(sample),
                None => Ok(()),
            },
        }
    }
}
