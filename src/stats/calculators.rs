//! Streaming computation of sample and dataset statistics.
//!
//! Measures are grouped by the tensor and axes they reduce over. Each group
//! gets the cheapest accumulators that can answer all of its statistics: a
//! plain running mean when only means are needed, a merged mean/variance
//! accumulator as soon as a variance or standard deviation is requested, one
//! quantile accumulator for every requested level and a min/max accumulator.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::sample::{Sample, Stat};
use crate::stats::measures::{DatasetMeasure, Measure, MeasureKey, MeasureValue, SampleMeasure, Statistic};
use crate::tensor::{AxisId, Tensor, TensorId};

/// Tensor and axes a group of measures reduces over
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    tensor_id: TensorId,
    axes: Option<Vec<AxisId>>,
}

impl GroupKey {
    fn of(key: &MeasureKey) -> Self {
        Self {
            tensor_id: key.tensor_id.clone(),
            axes: key.axes.clone(),
        }
    }
}

/// Which dimensions of a tensor are reduced and how many elements feed each result
struct Reduction {
    indices: Vec<usize>,
    count: usize,
    dims: Vec<AxisId>,
}

impl Reduction {
    fn of(tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<Self> {
        let mut indices = tensor.axis_indices(axes)?;
        indices.sort_unstable();
        indices.dedup();
        let count = indices.iter().map(|&i| tensor.shape()[i]).product::<usize>();
        if count == 0 {
            return Err(Error::ShapeMismatch(format!(
                "cannot compute statistics over empty axes of tensor with shape {:?}",
                tensor.shape()
            )));
        }
        Ok(Self {
            dims: tensor.remaining_dims(&indices),
            indices,
            count,
        })
    }

    fn sum(&self, data: &ArrayD<f64>) -> ArrayD<f64> {
        let mut out = data.clone();
        for &i in self.indices.iter().rev() {
            out = out.sum_axis(Axis(i));
        }
        out
    }

    fn fold(&self, data: &ArrayD<f64>, init: f64, f: fn(f64, f64) -> f64) -> ArrayD<f64> {
        let mut out = data.clone();
        for &i in self.indices.iter().rev() {
            out = out.fold_axis(Axis(i), init, |&a, &b| f(a, b));
        }
        out
    }

    /// Re-insert the reduced dimensions as singletons so `reduced` broadcasts against the input
    fn keep_dims(&self, reduced: &ArrayD<f64>) -> ArrayD<f64> {
        let mut out = reduced.clone();
        for &i in &self.indices {
            out.insert_axis_inplace(Axis(i));
        }
        out
    }

    /// Mean and sum of squared deviations over the reduced dimensions
    fn moments(&self, data: &ArrayD<f64>) -> (ArrayD<f64>, ArrayD<f64>) {
        let n = self.count as f64;
        let mean = self.sum(data).mapv(|s| s / n);
        let mut squared = data.clone();
        squared.zip_mut_with(&self.keep_dims(&mean), |x, &m| *x = (*x - m) * (*x - m));
        (mean, self.sum(&squared))
    }

    /// Exact quantiles with linear interpolation between closest ranks
    fn quantiles(&self, data: &ArrayD<f64>, levels: &[f64]) -> Result<Vec<ArrayD<f64>>> {
        let kept: Vec<usize> = (0..data.ndim()).filter(|i| !self.indices.contains(i)).collect();
        let kept_shape: Vec<usize> = kept.iter().map(|&i| data.shape()[i]).collect();
        let perm: Vec<usize> = kept.iter().chain(self.indices.iter()).copied().collect();

        let values: Vec<f64> = data
            .view()
            .permuted_axes(perm)
            .as_standard_layout()
            .iter()
            .copied()
            .collect();

        let rows: Vec<Vec<f64>> = values
            .par_chunks(self.count)
            .map(|row| {
                let mut sorted = row.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                levels.iter().map(|&q| interpolate_quantile(&sorted, q)).collect()
            })
            .collect();

        levels
            .iter()
            .enumerate()
            .map(|(qi, _)| {
                let column: Vec<f64> = rows.iter().map(|r| r[qi]).collect();
                ArrayD::from_shape_vec(IxDyn(&kept_shape), column).map_err(Error::from)
            })
            .collect()
    }
}

fn interpolate_quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

fn to_f64(tensor: &Tensor) -> ArrayD<f64> {
    tensor.data().mapv(|v| v as f64)
}

fn check_same_shape(current: &ArrayD<f64>, incoming: &ArrayD<f64>) -> Result<()> {
    if current.shape() != incoming.shape() {
        return Err(Error::ShapeMismatch(format!(
            "statistics of shape {:?} cannot be merged into running statistics of shape {:?}",
            incoming.shape(),
            current.shape()
        )));
    }
    Ok(())
}

fn to_measure_value(values: &ArrayD<f64>, dims: &[AxisId]) -> Result<MeasureValue> {
    if dims.is_empty() {
        let v = values.iter().next().copied().ok_or_else(|| {
            Error::MissingStatistics("reduced statistic has no value".to_string())
        })?;
        Ok(MeasureValue::Scalar(v))
    } else {
        Ok(MeasureValue::Tensor(Tensor::new(values.mapv(|v| v as f32), dims.to_vec())?))
    }
}

/// Running mean, merged sample by sample
#[derive(Debug, Clone, Default)]
struct MeanAccumulator {
    n: f64,
    mean: Option<ArrayD<f64>>,
    dims: Vec<AxisId>,
}

impl MeanAccumulator {
    fn update(&mut self, tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<()> {
        let red = Reduction::of(tensor, axes)?;
        let n_b = red.count as f64;
        let mean_b = red.sum(&to_f64(tensor)).mapv(|s| s / n_b);
        match &mut self.mean {
            None => {
                self.mean = Some(mean_b);
                self.dims = red.dims;
            }
            Some(mean) => {
                check_same_shape(mean, &mean_b)?;
                let n = self.n + n_b;
                Zip::from(mean).and(&mean_b).for_each(|m, &mb| {
                    let delta = mb - *m;
                    *m += delta * n_b / n;
                });
            }
        }
        self.n += n_b;
        Ok(())
    }

    fn value(&self, stat: &Statistic) -> Option<Result<MeasureValue>> {
        match (stat, &self.mean) {
            (Statistic::Mean, Some(mean)) => Some(to_measure_value(mean, &self.dims)),
            _ => None,
        }
    }
}

/// Mean and variance merged with Chan's parallel update
#[derive(Debug, Clone, Default)]
struct MeanVarStdAccumulator {
    n: f64,
    mean: Option<ArrayD<f64>>,
    m2: Option<ArrayD<f64>>,
    dims: Vec<AxisId>,
}

impl MeanVarStdAccumulator {
    fn update(&mut self, tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<()> {
        let red = Reduction::of(tensor, axes)?;
        let n_b = red.count as f64;
        let (mean_b, m2_b) = red.moments(&to_f64(tensor));
        match (&mut self.mean, &mut self.m2) {
            (Some(mean), Some(m2)) => {
                check_same_shape(mean, &mean_b)?;
                let n_a = self.n;
                let n = n_a + n_b;
                Zip::from(mean)
                    .and(m2)
                    .and(&mean_b)
                    .and(&m2_b)
                    .for_each(|m, s, &mb, &sb| {
                        let delta = mb - *m;
                        *m += delta * n_b / n;
                        *s += sb + delta * delta * n_a * n_b / n;
                    });
            }
            _ => {
                self.mean = Some(mean_b);
                self.m2 = Some(m2_b);
                self.dims = red.dims;
            }
        }
        self.n += n_b;
        Ok(())
    }

    fn value(&self, stat: &Statistic) -> Option<Result<MeasureValue>> {
        let (mean, m2) = match (&self.mean, &self.m2) {
            (Some(mean), Some(m2)) => (mean, m2),
            _ => return None,
        };
        let n = self.n;
        match stat {
            Statistic::Mean => Some(to_measure_value(mean, &self.dims)),
            Statistic::Var => Some(to_measure_value(&m2.mapv(|s| s / n), &self.dims)),
            Statistic::Std => Some(to_measure_value(&m2.mapv(|s| (s / n).sqrt()), &self.dims)),
            _ => None,
        }
    }
}

/// Quantiles averaged over samples, weighted by element count
///
/// Exact for a single sample. Over a dataset this approximates the quantiles
/// of the pooled data with memory independent of the dataset size.
#[derive(Debug, Clone)]
struct MeanQuantilesAccumulator {
    levels: Vec<f64>,
    n: f64,
    values: Option<Vec<ArrayD<f64>>>,
    dims: Vec<AxisId>,
}

impl MeanQuantilesAccumulator {
    fn new(levels: Vec<f64>) -> Self {
        Self {
            levels,
            n: 0.0,
            values: None,
            dims: Vec::new(),
        }
    }

    fn update(&mut self, tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<()> {
        let red = Reduction::of(tensor, axes)?;
        let n_b = red.count as f64;
        let incoming = red.quantiles(&to_f64(tensor), &self.levels)?;
        match &mut self.values {
            None => {
                self.values = Some(incoming);
                self.dims = red.dims;
            }
            Some(values) => {
                let n = self.n + n_b;
                for (current, new) in values.iter_mut().zip(&incoming) {
                    check_same_shape(current, new)?;
                    Zip::from(current).and(new).for_each(|c, &v| {
                        let delta = v - *c;
                        *c += delta * n_b / n;
                    });
                }
            }
        }
        self.n += n_b;
        Ok(())
    }

    fn value(&self, stat: &Statistic) -> Option<Result<MeasureValue>> {
        let q = match stat {
            Statistic::Quantile(q) => *q,
            _ => return None,
        };
        let i = self.levels.iter().position(|l| l.to_bits() == q.to_bits())?;
        let values = self.values.as_ref()?;
        Some(to_measure_value(&values[i], &self.dims))
    }
}

#[derive(Debug, Clone, Default)]
struct MinMaxAccumulator {
    min: Option<ArrayD<f64>>,
    max: Option<ArrayD<f64>>,
    dims: Vec<AxisId>,
}

impl MinMaxAccumulator {
    fn update(&mut self, tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<()> {
        let red = Reduction::of(tensor, axes)?;
        let data = to_f64(tensor);
        let min_b = red.fold(&data, f64::INFINITY, f64::min);
        let max_b = red.fold(&data, f64::NEG_INFINITY, f64::max);
        match (&mut self.min, &mut self.max) {
            (Some(min), Some(max)) => {
                check_same_shape(min, &min_b)?;
                min.zip_mut_with(&min_b, |a, &b| *a = (*a).min(b));
                max.zip_mut_with(&max_b, |a, &b| *a = (*a).max(b));
            }
            _ => {
                self.min = Some(min_b);
                self.max = Some(max_b);
                self.dims = red.dims;
            }
        }
        Ok(())
    }

    fn value(&self, stat: &Statistic) -> Option<Result<MeasureValue>> {
        match (stat, &self.min, &self.max) {
            (Statistic::Min, Some(min), _) => Some(to_measure_value(min, &self.dims)),
            (Statistic::Max, _, Some(max)) => Some(to_measure_value(max, &self.dims)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Mean(MeanAccumulator),
    MeanVarStd(MeanVarStdAccumulator),
    Quantiles(MeanQuantilesAccumulator),
    MinMax(MinMaxAccumulator),
}

impl Accumulator {
    fn update(&mut self, tensor: &Tensor, axes: Option<&[AxisId]>) -> Result<()> {
        match self {
            Accumulator::Mean(acc) => acc.update(tensor, axes),
            Accumulator::MeanVarStd(acc) => acc.update(tensor, axes),
            Accumulator::Quantiles(acc) => acc.update(tensor, axes),
            Accumulator::MinMax(acc) => acc.update(tensor, axes),
        }
    }

    /// `None` if this accumulator does not compute `stat` or has seen no data
    fn value(&self, stat: &Statistic) -> Option<Result<MeasureValue>> {
        match self {
            Accumulator::Mean(acc) => acc.value(stat),
            Accumulator::MeanVarStd(acc) => acc.value(stat),
            Accumulator::Quantiles(acc) => acc.value(stat),
            Accumulator::MinMax(acc) => acc.value(stat),
        }
    }

    fn serves(&self, stat: &Statistic) -> bool {
        match (self, stat) {
            (Accumulator::Mean(_), Statistic::Mean) => true,
            (Accumulator::MeanVarStd(_), Statistic::Mean | Statistic::Var | Statistic::Std) => true,
            (Accumulator::Quantiles(acc), Statistic::Quantile(q)) => {
                acc.levels.iter().any(|l| l.to_bits() == q.to_bits())
            }
            (Accumulator::MinMax(_), Statistic::Min | Statistic::Max) => true,
            _ => false,
        }
    }
}

/// Pick the accumulators answering `keys`, one set per tensor/axes group
fn build_accumulators<'a, I>(keys: I) -> Vec<(GroupKey, Accumulator)>
where
    I: IntoIterator<Item = &'a MeasureKey>,
{
    let mut groups: Vec<(GroupKey, Vec<Statistic>)> = Vec::new();
    for key in keys {
        let group = GroupKey::of(key);
        match groups.iter_mut().find(|(g, _)| *g == group) {
            Some((_, stats)) => {
                if !stats.contains(&key.statistic) {
                    stats.push(key.statistic)
                }
            }
            None => groups.push((group, vec![key.statistic])),
        }
    }

    let mut accumulators = Vec::new();
    for (group, stats) in groups {
        let needs_var = stats.iter().any(|s| matches!(s, Statistic::Var | Statistic::Std));
        let needs_mean = stats.contains(&Statistic::Mean);
        let needs_min_max = stats.iter().any(|s| matches!(s, Statistic::Min | Statistic::Max));
        let levels: Vec<f64> = stats
            .iter()
            .filter_map(|s| match s {
                Statistic::Quantile(q) => Some(*q),
                _ => None,
            })
            .collect();

        if needs_var {
            accumulators.push((group.clone(), Accumulator::MeanVarStd(MeanVarStdAccumulator::default())));
        } else if needs_mean {
            accumulators.push((group.clone(), Accumulator::Mean(MeanAccumulator::default())));
        }
        if !levels.is_empty() {
            accumulators.push((group.clone(), Accumulator::Quantiles(MeanQuantilesAccumulator::new(levels))));
        }
        if needs_min_max {
            accumulators.push((group, Accumulator::MinMax(MinMaxAccumulator::default())));
        }
    }
    accumulators
}

fn lookup(accumulators: &[(GroupKey, Accumulator)], key: &MeasureKey) -> Option<Result<MeasureValue>> {
    let group = GroupKey::of(key);
    accumulators
        .iter()
        .filter(|(g, _)| *g == group)
        .find_map(|(_, acc)| acc.value(&key.statistic))
}

fn validate_level(key: &MeasureKey) -> Result<()> {
    if let Statistic::Quantile(q) = key.statistic {
        if !(0.0..=1.0).contains(&q) {
            return Err(Error::InvalidProcessing(format!(
                "quantile level {} of {} is outside [0, 1]",
                q, key
            )));
        }
    }
    Ok(())
}

/// Incremental aggregator of the statistics a processing chain requires
///
/// Dataset measures are folded in sample by sample and finalized on demand;
/// sample measures are evaluated for each sample on its own. Dataset measures
/// seeded at construction are never aggregated and are reported verbatim.
#[derive(Debug, Clone)]
pub struct StatsCalculator {
    sample_measures: Vec<SampleMeasure>,
    dataset_measures: Vec<DatasetMeasure>,
    seeded: HashMap<DatasetMeasure, MeasureValue>,
    accumulators: Vec<(GroupKey, Accumulator)>,
    sample_count: usize,
    current: Option<HashMap<DatasetMeasure, MeasureValue>>,
}

impl StatsCalculator {
    pub fn new<I>(measures: I) -> Result<Self>
    where
        I: IntoIterator<Item = Measure>,
    {
        Self::with_seeded(measures, HashMap::new())
    }

    /// Create a calculator whose `seeded` dataset measures are known up front
    pub fn with_seeded<I>(measures: I, seeded: HashMap<DatasetMeasure, MeasureValue>) -> Result<Self>
    where
        I: IntoIterator<Item = Measure>,
    {
        let mut seen = HashSet::new();
        let mut sample_measures = Vec::new();
        let mut dataset_measures = Vec::new();
        for measure in measures {
            validate_level(measure.key())?;
            if !seen.insert(measure.clone()) {
                continue;
            }
            match measure {
                Measure::Sample(m) => sample_measures.push(m),
                Measure::Dataset(m) if seeded.contains_key(&m) => {}
                Measure::Dataset(m) => dataset_measures.push(m),
            }
        }
        let accumulators = build_accumulators(dataset_measures.iter().map(|m| &m.0));

        Ok(Self {
            sample_measures,
            dataset_measures,
            seeded,
            accumulators,
            sample_count: 0,
            current: None,
        })
    }

    /// Calculator for a subset of measures that continues from this one's running state
    pub fn subset<I>(&self, measures: I) -> Result<Self>
    where
        I: IntoIterator<Item = Measure>,
    {
        let measures: Vec<Measure> = measures.into_iter().collect();
        let seeded: HashMap<DatasetMeasure, MeasureValue> = self
            .seeded
            .iter()
            .filter(|(m, _)| measures.contains(&Measure::Dataset((*m).clone())))
            .map(|(m, v)| (m.clone(), v.clone()))
            .collect();
        let mut calc = Self::with_seeded(measures, seeded)?;

        let groups: HashSet<GroupKey> = calc.dataset_measures.iter().map(|m| GroupKey::of(&m.0)).collect();
        let mut accumulators: Vec<(GroupKey, Accumulator)> = self
            .accumulators
            .iter()
            .filter(|(g, _)| groups.contains(g))
            .cloned()
            .collect();
        let unserved: Vec<&MeasureKey> = calc
            .dataset_measures
            .iter()
            .map(|m| &m.0)
            .filter(|key| {
                let group = GroupKey::of(key);
                !accumulators.iter().any(|(g, acc)| *g == group && acc.serves(&key.statistic))
            })
            .collect();
        accumulators.extend(build_accumulators(unserved));

        calc.accumulators = accumulators;
        calc.sample_count = self.sample_count;
        Ok(calc)
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn has_dataset_measures(&self) -> bool {
        !self.dataset_measures.is_empty() || !self.seeded.is_empty()
    }

    /// Every measure this calculator answers for
    pub fn required_measures(&self) -> Vec<Measure> {
        self.sample_measures
            .iter()
            .cloned()
            .map(Measure::Sample)
            .chain(self.dataset_measures.iter().cloned().map(Measure::Dataset))
            .chain(self.seeded.keys().cloned().map(Measure::Dataset))
            .collect()
    }

    /// Fold one sample into the running dataset statistics
    ///
    /// Measures of tensors absent from `sample` are left untouched.
    pub fn update(&mut self, sample: &Sample) -> Result<()> {
        for (group, acc) in self.accumulators.iter_mut() {
            if let Some(tensor) = sample.get(&group.tensor_id) {
                acc.update(tensor, group.axes.as_deref())?;
            }
        }
        self.sample_count += 1;
        self.current = None;
        Ok(())
    }

    /// Current values of all dataset measures
    ///
    /// Fails if a measure's tensor was never observed and no value was seeded.
    pub fn finalize(&mut self) -> Result<HashMap<DatasetMeasure, MeasureValue>> {
        if let Some(current) = &self.current {
            return Ok(current.clone());
        }

        let mut values = self.seeded.clone();
        let mut missing = Vec::new();
        for measure in &self.dataset_measures {
            match lookup(&self.accumulators, &measure.0) {
                Some(value) => {
                    values.insert(measure.clone(), value?);
                }
                None => missing.push(measure.0.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingStatistics(format!(
                "no data observed for dataset measure(s) {} after {} sample(s)",
                missing.join(", "),
                self.sample_count
            )));
        }

        log::debug!("finalized {} dataset measure(s) from {} sample(s)", values.len(), self.sample_count);
        self.current = Some(values.clone());
        Ok(values)
    }

    /// Evaluate the sample measures on `sample` alone
    pub fn compute_sample_measures(&self, sample: &Sample) -> Result<Stat> {
        let mut accumulators = build_accumulators(self.sample_measures.iter().map(|m| &m.0));
        for (group, acc) in accumulators.iter_mut() {
            if let Some(tensor) = sample.get(&group.tensor_id) {
                acc.update(tensor, group.axes.as_deref())?;
            }
        }

        let mut stat = Stat::new();
        for measure in &self.sample_measures {
            if let Some(value) = lookup(&accumulators, &measure.0) {
                stat.insert(Measure::Sample(measure.clone()), value?);
            }
        }
        Ok(stat)
    }

    /// Fold `sample` in, then report sample and dataset measures
    pub fn update_and_get_all(&mut self, sample: &Sample) -> Result<Stat> {
        self.update(sample)?;
        self.skip_update_and_get_all(sample)
    }

    /// Report sample measures of `sample` and the current dataset measures
    pub fn skip_update_and_get_all(&mut self, sample: &Sample) -> Result<Stat> {
        let mut stat = self.compute_sample_measures(sample)?;
        if self.has_dataset_measures() {
            let values = match self.finalize() {
                Ok(values) => values,
                Err(Error::MissingStatistics(msg)) => {
                    log::debug!("reporting the observed dataset measures only: {}", msg);
                    self.observed_dataset_measures()?
                }
                Err(e) => return Err(e),
            };
            for (measure, value) in values {
                stat.insert(Measure::Dataset(measure), value);
            }
        }
        Ok(stat)
    }

    /// Seeded values and the dataset measures whose tensor has been observed
    fn observed_dataset_measures(&self) -> Result<HashMap<DatasetMeasure, MeasureValue>> {
        let mut values = self.seeded.clone();
        for measure in &self.dataset_measures {
            if let Some(value) = lookup(&self.accumulators, &measure.0) {
                values.insert(measure.clone(), value?);
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn raw_sample(values: Vec<f32>, shape: &[usize], dims: Vec<AxisId>) -> Sample {
        let data = Array::from_shape_vec(IxDyn(shape), values).unwrap();
        Sample::from_members([("raw".into(), Tensor::new(data, dims).unwrap())])
    }

    fn constant_sample(value: f32) -> Sample {
        raw_sample(vec![value; 16], &[1, 1, 4, 4], vec![AxisId::Batch, AxisId::Channel, AxisId::Y, AxisId::X])
    }

    fn random_samples(seed: u64, count: usize) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let values = (0..24).map(|_| rng.gen_range(-5.0f32..5.0)).collect();
                raw_sample(values, &[2, 3, 4], vec![AxisId::Channel, AxisId::Y, AxisId::X])
            })
            .collect()
    }

    #[test]
    fn test_streaming_dataset_mean_is_exact() {
        let mean = DatasetMeasure::new("raw", None, Statistic::Mean);
        let mut calc = StatsCalculator::new([Measure::Dataset(mean.clone())]).unwrap();
        for v in [1.0, 2.0, 3.0] {
            calc.update(&constant_sample(v)).unwrap();
        }
        let values = calc.finalize().unwrap();
        assert_eq!(values[&mean], MeasureValue::Scalar(2.0));
    }

    #[test]
    fn test_dataset_std_matches_pooled_data() {
        let std = DatasetMeasure::new("raw", None, Statistic::Std);
        let var = DatasetMeasure::new("raw", None, Statistic::Var);
        let mut calc = StatsCalculator::new([Measure::Dataset(std.clone()), Measure::Dataset(var.clone())]).unwrap();
        let samples = random_samples(7, 5);
        for s in &samples {
            calc.update(s).unwrap();
        }
        let values = calc.finalize().unwrap();

        let pooled: Vec<f64> = samples
            .iter()
            .flat_map(|s| s.get(&"raw".into()).unwrap().data().iter().map(|&v| v as f64).collect::<Vec<_>>())
            .collect();
        let n = pooled.len() as f64;
        let mean = pooled.iter().sum::<f64>() / n;
        let expected_var = pooled.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;

        let got_var = values[&var].as_scalar().unwrap();
        let got_std = values[&std].as_scalar().unwrap();
        assert!((got_var - expected_var).abs() < 1e-9);
        assert!((got_std - expected_var.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_per_channel_mean_keeps_channel_axis() {
        let mean = SampleMeasure::new("raw", Some(vec![AxisId::Y, AxisId::X]), Statistic::Mean);
        let calc = StatsCalculator::new([Measure::Sample(mean.clone())]).unwrap();
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let sample = raw_sample(values, &[2, 2, 2], vec![AxisId::Channel, AxisId::Y, AxisId::X]);

        let stat = calc.compute_sample_measures(&sample).unwrap();
        match &stat[&Measure::Sample(mean)] {
            MeasureValue::Tensor(t) => {
                assert_eq!(t.dims(), &[AxisId::Channel]);
                assert_eq!(t.data().as_slice().unwrap(), &[1.5, 5.5]);
            }
            other => panic!("expected per-channel tensor, got {:?}", other),
        }
    }

    #[test]
    fn test_sample_quantiles_interpolate_linearly() {
        let lo = SampleMeasure::new("raw", None, Statistic::Quantile(0.25));
        let hi = SampleMeasure::new("raw", None, Statistic::Quantile(1.0));
        let calc = StatsCalculator::new([Measure::Sample(lo.clone()), Measure::Sample(hi.clone())]).unwrap();
        let sample = raw_sample(vec![4.0, 1.0, 3.0, 2.0, 5.0], &[5], vec![AxisId::X]);

        let stat = calc.compute_sample_measures(&sample).unwrap();
        assert_eq!(stat[&Measure::Sample(lo)], MeasureValue::Scalar(2.0));
        assert_eq!(stat[&Measure::Sample(hi)], MeasureValue::Scalar(5.0));
    }

    #[test]
    fn test_min_max() {
        let min = DatasetMeasure::new("raw", None, Statistic::Min);
        let max = DatasetMeasure::new("raw", None, Statistic::Max);
        let mut calc = StatsCalculator::new([Measure::Dataset(min.clone()), Measure::Dataset(max.clone())]).unwrap();
        calc.update(&raw_sample(vec![1.0, -2.0], &[2], vec![AxisId::X])).unwrap();
        calc.update(&raw_sample(vec![7.0, 0.0], &[2], vec![AxisId::X])).unwrap();
        let values = calc.finalize().unwrap();
        assert_eq!(values[&min], MeasureValue::Scalar(-2.0));
        assert_eq!(values[&max], MeasureValue::Scalar(7.0));
    }

    #[test]
    fn test_same_input_sequence_gives_same_values() {
        let measures = vec![
            Measure::Dataset(DatasetMeasure::new("raw", Some(vec![AxisId::Y, AxisId::X]), Statistic::Std)),
            Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Quantile(0.99))),
        ];
        let run = || {
            let mut calc = StatsCalculator::new(measures.clone()).unwrap();
            for s in random_samples(42, 10) {
                calc.update(&s).unwrap();
            }
            calc.finalize().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_finalize_fails_without_observations() {
        let mean = DatasetMeasure::new("other", None, Statistic::Mean);
        let mut calc = StatsCalculator::new([Measure::Dataset(mean)]).unwrap();
        calc.update(&constant_sample(1.0)).unwrap();
        assert!(matches!(calc.finalize(), Err(Error::MissingStatistics(_))));
    }

    #[test]
    fn test_get_all_reports_observed_measures_only() {
        let raw_mean = DatasetMeasure::new("raw", None, Statistic::Mean);
        let other_mean = DatasetMeasure::new("other", None, Statistic::Mean);
        let mut calc =
            StatsCalculator::new([Measure::Dataset(raw_mean.clone()), Measure::Dataset(other_mean.clone())]).unwrap();
        let stat = calc.update_and_get_all(&constant_sample(2.0)).unwrap();
        assert_eq!(stat.get(&Measure::Dataset(raw_mean)), Some(&MeasureValue::Scalar(2.0)));
        assert!(stat.get(&Measure::Dataset(other_mean)).is_none());
    }

    #[test]
    fn test_seeded_values_are_never_aggregated() {
        let mean = DatasetMeasure::new("raw", None, Statistic::Mean);
        let seeded = HashMap::from([(mean.clone(), MeasureValue::Scalar(10.0))]);
        let mut calc = StatsCalculator::with_seeded([Measure::Dataset(mean.clone())], seeded).unwrap();
        assert!(calc.accumulators.is_empty());

        calc.update(&constant_sample(1.0)).unwrap();
        assert_eq!(calc.finalize().unwrap()[&mean], MeasureValue::Scalar(10.0));
    }

    #[test]
    fn test_cheapest_accumulators_are_chosen() {
        let mean_only = StatsCalculator::new([Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Mean))]).unwrap();
        assert!(matches!(mean_only.accumulators[..], [(_, Accumulator::Mean(_))]));

        let with_std = StatsCalculator::new([
            Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Mean)),
            Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Std)),
        ])
        .unwrap();
        assert!(matches!(with_std.accumulators[..], [(_, Accumulator::MeanVarStd(_))]));
    }

    #[test]
    fn test_subset_continues_running_state() {
        let mean = DatasetMeasure::new("raw", None, Statistic::Mean);
        let std = DatasetMeasure::new("raw", None, Statistic::Std);
        let mut shared = StatsCalculator::new([Measure::Dataset(mean.clone()), Measure::Dataset(std)]).unwrap();
        shared.update(&constant_sample(1.0)).unwrap();
        shared.update(&constant_sample(3.0)).unwrap();

        let mut pre = shared.subset([Measure::Dataset(mean.clone())]).unwrap();
        assert_eq!(pre.finalize().unwrap()[&mean], MeasureValue::Scalar(2.0));
        pre.update(&constant_sample(5.0)).unwrap();
        assert_eq!(pre.finalize().unwrap()[&mean], MeasureValue::Scalar(3.0));
    }

    #[test]
    fn test_rejects_quantile_outside_unit_interval() {
        let q = Measure::Sample(SampleMeasure::new("raw", None, Statistic::Quantile(1.5)));
        assert!(StatsCalculator::new([q]).is_err());
    }
}
