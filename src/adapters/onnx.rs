//! ONNX Runtime backend
//!
//! Only available with the `onnxruntime` cargo feature.

use std::fmt;

use crate::adapters::ModelAdapter;
#[cfg(feature = "onnxruntime")]
use crate::adapters::{output_axes, warn_ignored_devices};
use crate::description::{ModelDescr, WeightsFormat};
use crate::error::{Error, Result};
#[cfg(feature = "onnxruntime")]
use crate::tensor::DataType;
use crate::tensor::{AxisId, Tensor};

#[cfg(feature = "onnxruntime")]
use half::f16;
#[cfg(feature = "onnxruntime")]
use ndarray::{ArrayD, IxDyn};
#[cfg(feature = "onnxruntime")]
use ort::session::{builder::GraphOptimizationLevel, Session};
#[cfg(feature = "onnxruntime")]
use ort::tensor::TensorElementType;
#[cfg(feature = "onnxruntime")]
use ort::value::{DynValue, Value};

pub struct OnnxModelAdapter {
    #[cfg(feature = "onnxruntime")]
    session: Option<Session>,
    #[cfg(not(feature = "onnxruntime"))]
    never: std::convert::Infallible,
    input_names: Vec<String>,
    output_names: Vec<String>,
    output_axes: Vec<Vec<AxisId>>,
}

impl fmt::Debug for OnnxModelAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxModelAdapter")
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .field("output_axes", &self.output_axes)
            .finish()
    }
}

#[cfg(feature = "onnxruntime")]
impl OnnxModelAdapter {
    pub fn new(model: &ModelDescr, devices: Option<&[String]>) -> Result<Self> {
        let path = model.weights_path(WeightsFormat::Onnx)?;
        let output_axes = output_axes(model)?;

        let _ = ort::init().commit();
        let session = Session::builder()
            .map_err(|e| Error::BackendError(format!("failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::BackendError(format!("failed to set optimization level: {}", e)))?
            .commit_from_file(&path)
            .map_err(|e| Error::BackendError(format!("failed to load {}: {}", path.display(), e)))?;

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        warn_ignored_devices("onnx", devices);
        log::info!(
            "created onnx session for {} with inputs {:?} and outputs {:?}",
            path.display(),
            input_names,
            output_names
        );

        Ok(Self {
            session: Some(session),
            input_names,
            output_names,
            output_axes,
        })
    }
}

/// Input value in the element type the tensor was cast to
///
/// Shape plus row-major values, so ort's own ndarray version is never crossed.
#[cfg(feature = "onnxruntime")]
fn input_value(name: &str, tensor: &Tensor) -> Result<DynValue> {
    let shape = tensor.shape().to_vec();
    macro_rules! value_of {
        ($convert:expr) => {
            Value::from_array((shape, tensor.data().iter().map(|&v| $convert(v)).collect::<Vec<_>>()))
                .map(|value| value.into_dyn())
        };
    }
    let value = match tensor.data_type() {
        DataType::Float16 => value_of!(f16::from_f32),
        DataType::Float32 => value_of!(|v: f32| v),
        DataType::Float64 => value_of!(f64::from),
        DataType::Int8 => value_of!(|v: f32| v as i8),
        DataType::Int16 => value_of!(|v: f32| v as i16),
        DataType::Int32 => value_of!(|v: f32| v as i32),
        DataType::Int64 => value_of!(|v: f32| v as i64),
        DataType::Uint8 => value_of!(|v: f32| v as u8),
        DataType::Uint16 => value_of!(|v: f32| v as u16),
        DataType::Uint32 => value_of!(|v: f32| v as u32),
        DataType::Uint64 => value_of!(|v: f32| v as u64),
        DataType::Bool => value_of!(|v: f32| v != 0.0),
    };
    value.map_err(|e| Error::BackendError(format!("cannot convert input '{}': {}", name, e)))
}

/// Read an output of any numeric element type as a tensor tagged with `axes`
#[cfg(feature = "onnxruntime")]
fn output_tensor(name: &str, value: &DynValue, axes: &[AxisId]) -> Result<Tensor> {
    macro_rules! extract {
        ($ty:ty) => {{
            let (shape, data) = value
                .try_extract_tensor::<$ty>()
                .map_err(|e| Error::BackendError(format!("cannot read output '{}': {}", name, e)))?;
            let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            (shape, data)
        }};
    }
    macro_rules! numeric {
        ($ty:ty, $dtype:expr) => {{
            let (shape, data) = extract!($ty);
            Tensor::from_ndarray(ArrayD::from_shape_vec(IxDyn(&shape), data.to_vec())?, axes.to_vec(), $dtype)
        }};
    }
    match value.dtype().tensor_type() {
        Some(TensorElementType::Float32) => numeric!(f32, DataType::Float32),
        Some(TensorElementType::Float64) => numeric!(f64, DataType::Float64),
        Some(TensorElementType::Int8) => numeric!(i8, DataType::Int8),
        Some(TensorElementType::Int16) => numeric!(i16, DataType::Int16),
        Some(TensorElementType::Int32) => numeric!(i32, DataType::Int32),
        Some(TensorElementType::Int64) => numeric!(i64, DataType::Int64),
        Some(TensorElementType::Uint8) => numeric!(u8, DataType::Uint8),
        Some(TensorElementType::Uint16) => numeric!(u16, DataType::Uint16),
        Some(TensorElementType::Uint32) => numeric!(u32, DataType::Uint32),
        Some(TensorElementType::Uint64) => numeric!(u64, DataType::Uint64),
        Some(TensorElementType::Float16) => {
            let (shape, data) = extract!(f16);
            let values: Vec<f32> = data.iter().map(|v| v.to_f32()).collect();
            Tensor::with_data_type(ArrayD::from_shape_vec(IxDyn(&shape), values)?, axes.to_vec(), DataType::Float16)
        }
        Some(TensorElementType::Bool) => {
            let (shape, data) = extract!(bool);
            let values: Vec<f32> = data.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
            Tensor::with_data_type(ArrayD::from_shape_vec(IxDyn(&shape), values)?, axes.to_vec(), DataType::Bool)
        }
        other => Err(Error::BackendError(format!(
            "output '{}' has unsupported element type {:?}",
            name, other
        ))),
    }
}

#[cfg(not(feature = "onnxruntime"))]
impl OnnxModelAdapter {
    pub fn new(model: &ModelDescr, _devices: Option<&[String]>) -> Result<Self> {
        let path = model.weights_path(WeightsFormat::Onnx)?;
        Err(Error::BackendUnavailable(format!(
            "onnx weights at {} need the `onnxruntime` feature",
            path.display()
        )))
    }
}

impl ModelAdapter for OnnxModelAdapter {
    #[cfg(feature = "onnxruntime")]
    fn forward(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        use std::borrow::Cow;
        use ort::session::{SessionInputValue, SessionInputs};

        if inputs.len() != self.input_names.len() {
            return Err(Error::BackendError(format!(
                "onnx model takes {} inputs, got {}",
                self.input_names.len(),
                inputs.len()
            )));
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::InvalidState("onnx session was unloaded".to_string()))?;

        let mut feeds: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (name, input) in self.input_names.iter().zip(inputs) {
            if let Some(tensor) = input {
                feeds.push((Cow::Owned(name.clone()), input_value(name, tensor)?.into()));
            }
        }

        let outputs = session
            .run(SessionInputs::from(feeds))
            .map_err(|e| Error::BackendError(format!("onnx inference failed: {}", e)))?;

        if self.output_names.len() != self.output_axes.len() {
            return Err(Error::OutputCountMismatch {
                expected: self.output_axes.len(),
                actual: self.output_names.len(),
            });
        }
        self.output_names
            .iter()
            .zip(&self.output_axes)
            .map(|(name, axes)| output_tensor(name, &outputs[name.as_str()], axes).map(Some))
            .collect()
    }

    #[cfg(not(feature = "onnxruntime"))]
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        match self.never {}
    }

    #[cfg(feature = "onnxruntime")]
    fn unload(&mut self) {
        if self.session.take().is_some() {
            log::debug!("released onnx session");
        }
    }

    #[cfg(not(feature = "onnxruntime"))]
    fn unload(&mut self) {
        match self.never {}
    }
}

#[cfg(all(test, not(feature = "onnxruntime")))]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime_feature() {
        let content = r#"
format_version: 0.4.10
name: test
inputs: []
outputs: []
weights:
  onnx: {source: weights.onnx}
"#;
        let model = ModelDescr::from_yaml_str(content, ".").unwrap();
        assert!(matches!(OnnxModelAdapter::new(&model, None), Err(Error::BackendUnavailable(_))));
    }
}
