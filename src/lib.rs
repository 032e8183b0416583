pub mod adapters;
pub mod description;
pub mod error;
pub mod execution;
pub mod io;
pub mod prediction;
pub mod processing;
pub mod sample;
pub mod stats;
pub mod summary;
pub mod tensor;
pub mod testing;

// Re-export commonly used types
pub use adapters::{create_model_adapter, ModelAdapter};
pub use description::{FormatVersion, ModelDescr, TensorSpec, WeightsFormat};
pub use error::{Error, Result};
pub use execution::{
    create_prediction_pipeline, create_prediction_pipeline_with_adapter, PipelineState, PredictionPipeline,
    PredictionPipelineOptions,
};
pub use prediction::{predict, Inputs};
pub use processing::{setup_pre_and_postprocessing, PreAndPostprocessing, Processing};
pub use sample::{Sample, Stat};
pub use stats::{DatasetMeasure, Measure, MeasureValue, SampleMeasure, Statistic, StatsCalculator};
pub use summary::{Status, ValidationDetail, ValidationSummary};
pub use tensor::{AxisId, DataType, Tensor, TensorId};
pub use testing::{test_description, test_model, test_model_with_adapter, TestOptions};
