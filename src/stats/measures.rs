use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::tensor::{AxisId, Tensor, TensorId};

/// Kind of statistic a measure computes
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Std,
    Var,
    Min,
    Max,
    /// Quantile at level `q` in `[0, 1]`
    Quantile(f64),
}

impl PartialEq for Statistic {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Statistic::Quantile(a), Statistic::Quantile(b)) => a.to_bits() == b.to_bits(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Eq for Statistic {}

impl Hash for Statistic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        if let Statistic::Quantile(q) = self {
            q.to_bits().hash(state);
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Mean => f.write_str("mean"),
            Statistic::Std => f.write_str("std"),
            Statistic::Var => f.write_str("var"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Quantile(q) => write!(f, "quantile({})", q),
        }
    }
}

/// A statistic of one tensor, reduced over `axes` (all axes if `None`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MeasureKey {
    pub tensor_id: TensorId,
    pub axes: Option<Vec<AxisId>>,
    pub statistic: Statistic,
}

impl MeasureKey {
    pub fn new(tensor_id: TensorId, axes: Option<Vec<AxisId>>, statistic: Statistic) -> Self {
        Self { tensor_id, axes, statistic }
    }
}

impl fmt::Display for MeasureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.statistic, self.tensor_id)?;
        if let Some(axes) = &self.axes {
            let names: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
            write!(f, ", axes=[{}]", names.join(","))?;
        }
        f.write_str(")")
    }
}

/// Measure evaluated freshly for every sample
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SampleMeasure(pub MeasureKey);

/// Measure aggregated over a dataset and then held fixed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DatasetMeasure(pub MeasureKey);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", content = "measure", rename_all = "snake_case")]
pub enum Measure {
    Sample(SampleMeasure),
    Dataset(DatasetMeasure),
}

impl SampleMeasure {
    pub fn new(tensor_id: impl Into<TensorId>, axes: Option<Vec<AxisId>>, statistic: Statistic) -> Self {
        Self(MeasureKey::new(tensor_id.into(), axes, statistic))
    }
}

impl DatasetMeasure {
    pub fn new(tensor_id: impl Into<TensorId>, axes: Option<Vec<AxisId>>, statistic: Statistic) -> Self {
        Self(MeasureKey::new(tensor_id.into(), axes, statistic))
    }
}

impl From<SampleMeasure> for Measure {
    fn from(m: SampleMeasure) -> Self {
        Measure::Sample(m)
    }
}

impl From<DatasetMeasure> for Measure {
    fn from(m: DatasetMeasure) -> Self {
        Measure::Dataset(m)
    }
}

impl Measure {
    pub fn key(&self) -> &MeasureKey {
        match self {
            Measure::Sample(SampleMeasure(k)) | Measure::Dataset(DatasetMeasure(k)) => k,
        }
    }

    pub fn tensor_id(&self) -> &TensorId {
        &self.key().tensor_id
    }

    pub fn is_dataset_measure(&self) -> bool {
        matches!(self, Measure::Dataset(_))
    }

    pub fn as_dataset(&self) -> Option<&DatasetMeasure> {
        match self {
            Measure::Dataset(m) => Some(m),
            Measure::Sample(_) => None,
        }
    }

    pub fn as_sample(&self) -> Option<&SampleMeasure> {
        match self {
            Measure::Sample(m) => Some(m),
            Measure::Dataset(_) => None,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Sample(m) => write!(f, "sample {}", m.0),
            Measure::Dataset(m) => write!(f, "dataset {}", m.0),
        }
    }
}

/// Result of evaluating a measure
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureValue {
    Scalar(f64),
    /// Values over the axes that were not reduced
    Tensor(Tensor),
}

impl MeasureValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MeasureValue::Scalar(v) => Some(*v),
            MeasureValue::Tensor(_) => None,
        }
    }
}

impl From<f64> for MeasureValue {
    fn from(v: f64) -> Self {
        MeasureValue::Scalar(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_identity() {
        let a = DatasetMeasure::new("raw", Some(vec![AxisId::X, AxisId::Y]), Statistic::Mean);
        let b = DatasetMeasure::new("raw", Some(vec![AxisId::X, AxisId::Y]), Statistic::Mean);
        let c = SampleMeasure::new("raw", Some(vec![AxisId::X, AxisId::Y]), Statistic::Mean);

        let mut set: HashSet<Measure> = HashSet::new();
        set.insert(a.into());
        set.insert(b.into());
        set.insert(c.into());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_quantile_levels_are_distinct_keys() {
        let lo = SampleMeasure::new("raw", None, Statistic::Quantile(0.01));
        let hi = SampleMeasure::new("raw", None, Statistic::Quantile(0.99));
        assert_ne!(lo, hi);
        assert_eq!(lo, SampleMeasure::new("raw", None, Statistic::Quantile(0.01)));
        assert_eq!(lo.0.to_string(), "quantile(0.01)(raw)");
    }
}
