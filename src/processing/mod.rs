pub mod ops;
pub mod setup;

pub use ops::{Param, Processing};
pub use setup::{
    get_required_dataset_measures, get_required_measures, get_required_sample_measures,
    setup_pre_and_postprocessing, PreAndPostprocessing,
};
