use thiserror::Error;
use std::path::PathBuf;

use crate::tensor::TensorId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to read tensor from {0}: {1}")]
    NpyReadError(PathBuf, String),

    #[error("Failed to write tensor to {0}: {1}")]
    NpyWriteError(PathBuf, String),

    #[error("Failed to parse description: {0}")]
    ParseError(String),

    #[error("Conversion error: {0}")]
    ConversionError(String),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Invalid model description: {0}")]
    InvalidDescription(String),

    #[error("Invalid processing step: {0}")]
    InvalidProcessing(String),

    #[error("Invalid axis: {0}")]
    InvalidAxis(String),

    #[error("Model description has no '{0}' weights")]
    MissingWeights(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Missing statistics: {0}")]
    MissingStatistics(String),

    #[error("Tensor '{0}' is missing from sample")]
    MissingTensor(TensorId),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Expected {expected} outputs, but got {actual}")]
    OutputCountMismatch { expected: usize, actual: usize },

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("No model adapter could be created: {}", .0.join("; "))]
    NoAdapter(Vec<String>),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}
