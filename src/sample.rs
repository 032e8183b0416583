use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::stats::measures::{Measure, MeasureValue};
use crate::tensor::{Tensor, TensorId};

/// Computed statistics available to processing operators
pub type Stat = HashMap<Measure, MeasureValue>;

/// Named tensors flowing through the pipeline at one point in time
///
/// Members keep insertion order so iteration is deterministic.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    members: Vec<(TensorId, Tensor)>,
    /// Statistics scope shared by the operators applied to this sample
    pub stat: Stat,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members<I>(members: I) -> Self
    where
        I: IntoIterator<Item = (TensorId, Tensor)>,
    {
        let mut sample = Self::new();
        for (id, tensor) in members {
            sample.insert(id, tensor);
        }
        sample
    }

    /// Set `id` to `tensor`, replacing an existing member in place
    pub fn insert(&mut self, id: TensorId, tensor: Tensor) {
        match self.members.iter_mut().find(|(k, _)| *k == id) {
            Some((_, slot)) => *slot = tensor,
            None => self.members.push((id, tensor)),
        }
    }

    pub fn get(&self, id: &TensorId) -> Option<&Tensor> {
        self.members.iter().find(|(k, _)| k == id).map(|(_, t)| t)
    }

    /// Like `get`, failing with `MissingTensor`
    pub fn require(&self, id: &TensorId) -> Result<&Tensor> {
        self.get(id).ok_or_else(|| Error::MissingTensor(id.clone()))
    }

    pub fn remove(&mut self, id: &TensorId) -> Option<Tensor> {
        let pos = self.members.iter().position(|(k, _)| k == id)?;
        Some(self.members.remove(pos).1)
    }

    pub fn contains(&self, id: &TensorId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TensorId> {
        self.members.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Tensor)> {
        self.members.iter().map(|(k, t)| (k, t))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up a statistic in the scope
    pub fn measure(&self, measure: &Measure) -> Result<&MeasureValue> {
        self.stat.get(measure).ok_or_else(|| {
            Error::MissingStatistics(format!("{} is not available in the sample scope", measure))
        })
    }
}
