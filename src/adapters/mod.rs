//! Backend-specific model executors behind one forward/unload contract

use std::fmt::Debug;

use crate::description::{ModelDescr, WeightsFormat};
use crate::error::{Error, Result};
use crate::tensor::{AxisId, Tensor};

pub mod onnx;
pub mod unavailable;

pub use onnx::OnnxModelAdapter;
pub use unavailable::{PytorchStateDictModelAdapter, TensorflowModelAdapter, TorchscriptModelAdapter};

/// Executes a model on positional inputs
pub trait ModelAdapter: Debug {
    /// Run the model on one tensor (or `None` for a skipped optional input) per
    /// declared input, returning one entry per declared output
    fn forward(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>>;

    /// Release backend resources
    fn unload(&mut self);
}

/// Declared axes of every model output
#[cfg_attr(not(feature = "onnxruntime"), allow(dead_code))]
pub(crate) fn output_axes(model: &ModelDescr) -> Result<Vec<Vec<AxisId>>> {
    Ok(model.outputs()?.into_iter().map(|spec| spec.axes).collect())
}

#[cfg_attr(not(feature = "onnxruntime"), allow(dead_code))]
pub(crate) fn warn_ignored_devices(backend: &str, devices: Option<&[String]>) {
    if let Some(devices) = devices {
        log::warn!(
            "device management is not implemented for {}, ignoring devices {:?}",
            backend,
            devices
        );
    }
}

/// Create the adapter for one weights format
pub fn create_adapter_for_format(
    model: &ModelDescr,
    format: WeightsFormat,
    devices: Option<&[String]>,
) -> Result<Box<dyn ModelAdapter>> {
    match format {
        WeightsFormat::Onnx => Ok(Box::new(OnnxModelAdapter::new(model, devices)?)),
        WeightsFormat::Torchscript => Ok(Box::new(TorchscriptModelAdapter::new(model, devices)?)),
        WeightsFormat::PytorchStateDict => Ok(Box::new(PytorchStateDictModelAdapter::new(model, devices)?)),
        WeightsFormat::TensorflowSavedModelBundle | WeightsFormat::KerasHdf5 => {
            Ok(Box::new(TensorflowModelAdapter::new(model, format, devices)?))
        }
        WeightsFormat::TensorflowJs => Err(Error::BackendUnavailable(
            "tensorflow_js weights cannot be executed outside a browser runtime".to_string(),
        )),
    }
}

/// Create an adapter for the first weights format that works
///
/// Formats are tried in `weight_format_priority_order` (or the default
/// priority); formats without weights in the description are skipped.
pub fn create_model_adapter(
    model: &ModelDescr,
    devices: Option<&[String]>,
    weight_format_priority_order: Option<&[WeightsFormat]>,
) -> Result<Box<dyn ModelAdapter>> {
    let order = weight_format_priority_order.unwrap_or(&WeightsFormat::DEFAULT_PRIORITY);
    let mut errors = Vec::new();
    for &format in order {
        if model.weights().get(format).is_none() {
            continue;
        }
        match create_adapter_for_format(model, format, devices) {
            Ok(adapter) => {
                log::info!("using {} weights for model '{}'", format, model.name());
                return Ok(adapter);
            }
            Err(e) => {
                log::debug!("cannot use {} weights: {}", format, e);
                errors.push(format!("{}: {}", format, e));
            }
        }
    }

    if errors.is_empty() {
        let names: Vec<String> = order.iter().map(|f| f.to_string()).collect();
        errors.push(format!("model '{}' has no weights in any of [{}]", model.name(), names.join(", ")));
    }
    Err(Error::NoAdapter(errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(weights: &str) -> ModelDescr {
        let content = format!(
            r#"
format_version: 0.4.10
name: test
inputs:
  - {{name: raw, axes: bcyx, shape: [1, 1, 4, 4]}}
outputs:
  - {{name: out, axes: bcyx, shape: [1, 1, 4, 4]}}
weights: {}
"#,
            weights
        );
        ModelDescr::from_yaml_str(&content, ".").unwrap()
    }

    #[test]
    fn test_collects_errors_of_every_tried_format() {
        let model = model("{torchscript: {source: w.pt}, pytorch_state_dict: {source: w.pth}}");
        match create_model_adapter(&model, None, None) {
            Err(Error::NoAdapter(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("torchscript"));
                assert!(errors[1].starts_with("pytorch_state_dict"));
            }
            other => panic!("expected NoAdapter, got {:?}", other),
        }
    }

    #[test]
    fn test_without_weights() {
        let model = model("{}");
        assert!(matches!(create_model_adapter(&model, None, None), Err(Error::NoAdapter(_))));
        assert!(matches!(
            create_adapter_for_format(&model, WeightsFormat::Torchscript, None),
            Err(Error::MissingWeights(_))
        ));
    }
}
