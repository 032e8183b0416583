pub mod options;
pub mod pipeline;

pub use options::PredictionPipelineOptions;
pub use pipeline::{
    create_prediction_pipeline, create_prediction_pipeline_with_adapter, PipelineState, PredictionPipeline,
};
