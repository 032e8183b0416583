use std::collections::HashMap;

use crate::description::WeightsFormat;
use crate::sample::Sample;
use crate::stats::measures::{DatasetMeasure, MeasureValue};

/// Options for creating a prediction pipeline
#[derive(Debug, Clone, Default)]
pub struct PredictionPipelineOptions {
    /// Devices to run the model on, backend default if `None`
    pub devices: Option<Vec<String>>,
    /// Only try this weights format instead of the default priority order
    pub weight_format: Option<WeightsFormat>,
    /// Samples the initial dataset statistics are computed from
    pub dataset_for_initial_statistics: Vec<Sample>,
    /// Keep folding inference samples into the dataset statistics
    pub keep_updating_initial_dataset_statistics: bool,
    /// Known dataset statistics, never recomputed
    pub fixed_dataset_statistics: Option<HashMap<DatasetMeasure, MeasureValue>>,
}

impl PredictionPipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn set_weight_format(mut self, weight_format: WeightsFormat) -> Self {
        self.weight_format = Some(weight_format);
        self
    }

    pub fn set_dataset_for_initial_statistics(mut self, dataset: Vec<Sample>) -> Self {
        self.dataset_for_initial_statistics = dataset;
        self
    }

    pub fn keep_updating_initial_dataset_statistics(mut self, enable: bool) -> Self {
        self.keep_updating_initial_dataset_statistics = enable;
        self
    }

    pub fn set_fixed_dataset_statistics(mut self, stats: HashMap<DatasetMeasure, MeasureValue>) -> Self {
        self.fixed_dataset_statistics = Some(stats);
        self
    }

    pub(crate) fn weight_format_priority_order(&self) -> Option<Vec<WeightsFormat>> {
        self.weight_format.map(|f| vec![f])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = PredictionPipelineOptions::new()
            .set_devices(["cpu"])
            .set_weight_format(WeightsFormat::Onnx)
            .keep_updating_initial_dataset_statistics(true);

        assert_eq!(options.devices, Some(vec!["cpu".to_string()]));
        assert_eq!(options.weight_format_priority_order(), Some(vec![WeightsFormat::Onnx]));
        assert!(options.keep_updating_initial_dataset_statistics);
        assert!(options.dataset_for_initial_statistics.is_empty());
        assert!(options.fixed_dataset_statistics.is_none());
    }
}
