pub mod calculators;
pub mod measures;

pub use calculators::StatsCalculator;
pub use measures::{DatasetMeasure, Measure, MeasureKey, MeasureValue, SampleMeasure, Statistic};
