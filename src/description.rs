//! In-memory model descriptions
//!
//! Two on-disk format generations are understood. Both are reduced to a common
//! per-tensor view ([`TensorSpec`]) so the rest of the crate never has to look
//! at version-specific fields.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};
use crate::tensor::{AxisId, DataType, TensorId};

/// Serialized weights formats a model may ship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WeightsFormat {
    Onnx,
    Torchscript,
    PytorchStateDict,
    TensorflowSavedModelBundle,
    KerasHdf5,
    TensorflowJs,
}

impl WeightsFormat {
    /// Order in which adapters are tried when no format is requested
    pub const DEFAULT_PRIORITY: [WeightsFormat; 4] = [
        WeightsFormat::Onnx,
        WeightsFormat::Torchscript,
        WeightsFormat::PytorchStateDict,
        WeightsFormat::TensorflowSavedModelBundle,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsEntryDescr {
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opset_version: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightsDescr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onnx: Option<WeightsEntryDescr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torchscript: Option<WeightsEntryDescr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pytorch_state_dict: Option<WeightsEntryDescr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorflow_saved_model_bundle: Option<WeightsEntryDescr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keras_hdf5: Option<WeightsEntryDescr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorflow_js: Option<WeightsEntryDescr>,
}

impl WeightsDescr {
    pub fn get(&self, format: WeightsFormat) -> Option<&WeightsEntryDescr> {
        match format {
            WeightsFormat::Onnx => self.onnx.as_ref(),
            WeightsFormat::Torchscript => self.torchscript.as_ref(),
            WeightsFormat::PytorchStateDict => self.pytorch_state_dict.as_ref(),
            WeightsFormat::TensorflowSavedModelBundle => self.tensorflow_saved_model_bundle.as_ref(),
            WeightsFormat::KerasHdf5 => self.keras_hdf5.as_ref(),
            WeightsFormat::TensorflowJs => self.tensorflow_js.as_ref(),
        }
    }

    pub fn available_formats(&self) -> Vec<WeightsFormat> {
        use strum::IntoEnumIterator;
        WeightsFormat::iter().filter(|f| self.get(*f).is_some()).collect()
    }
}

/// A declared processing step in either format generation
///
/// The older format names the step with `name`, the newer one with `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStepDescr {
    #[serde(alias = "id")]
    pub name: String,
    #[serde(default)]
    pub kwargs: serde_yaml::Mapping,
}

impl ProcessingStepDescr {
    /// Deserialize the step arguments into `T`
    pub fn kwargs<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(serde_yaml::Value::Mapping(self.kwargs.clone())).map_err(|e| {
            Error::InvalidProcessing(format!("invalid kwargs for '{}': {}", self.name, e))
        })
    }
}

/// Declared size of one tensor axis
#[derive(Debug, Clone, PartialEq)]
pub enum SizeDescr {
    Fixed(usize),
    /// `min + n * step` for a non-negative integer `n`
    Parameterized { min: usize, step: usize },
    /// `floor(ref_size * scale) + offset`, the size of another tensor's axis mapped through a linear rule
    Reference { tensor_id: TensorId, axis_id: AxisId, scale: f64, offset: i64 },
    /// Not constrained by the description
    Any,
}

/// Version-independent view of one input or output tensor
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub id: TensorId,
    pub axes: Vec<AxisId>,
    pub sizes: Vec<SizeDescr>,
    pub data_type: DataType,
    pub steps: Vec<ProcessingStepDescr>,
    pub test_tensor: Option<PathBuf>,
}

impl TensorSpec {
    pub fn has_parameterized_axis(&self) -> bool {
        self.sizes.iter().any(|s| matches!(s, SizeDescr::Parameterized { .. }))
    }
}

pub mod v0_4 {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum InputShape {
        Fixed(Vec<usize>),
        Parameterized { min: Vec<usize>, step: Vec<usize> },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum OutputShape {
        Fixed(Vec<usize>),
        /// `reference * scale + 2 * offset` per axis
        Implicit {
            reference_tensor: TensorId,
            scale: Vec<Option<f64>>,
            offset: Vec<f64>,
        },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct InputTensorDescr {
        pub name: TensorId,
        /// One letter per axis, e.g. `bcyx`
        pub axes: String,
        #[serde(default)]
        pub data_type: DataType,
        pub shape: InputShape,
        #[serde(default)]
        pub preprocessing: Vec<ProcessingStepDescr>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OutputTensorDescr {
        pub name: TensorId,
        pub axes: String,
        #[serde(default)]
        pub data_type: DataType,
        pub shape: OutputShape,
        #[serde(default)]
        pub halo: Option<Vec<usize>>,
        #[serde(default)]
        pub postprocessing: Vec<ProcessingStepDescr>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ModelDescr {
        pub format_version: String,
        pub name: String,
        #[serde(rename = "type", default = "model_type")]
        pub kind: String,
        pub inputs: Vec<InputTensorDescr>,
        pub outputs: Vec<OutputTensorDescr>,
        #[serde(default)]
        pub test_inputs: Vec<PathBuf>,
        #[serde(default)]
        pub test_outputs: Vec<PathBuf>,
        #[serde(default)]
        pub weights: WeightsDescr,
    }

    pub(super) fn input_spec(descr: &InputTensorDescr, test_tensor: Option<PathBuf>) -> Result<TensorSpec> {
        let axes = AxisId::parse_letters(&descr.axes)?;
        let sizes: Vec<SizeDescr> = match &descr.shape {
            InputShape::Fixed(shape) => shape.iter().map(|&s| SizeDescr::Fixed(s)).collect(),
            InputShape::Parameterized { min, step } => {
                if min.len() != step.len() {
                    return Err(Error::InvalidDescription(format!(
                        "input '{}' has {} minimum sizes but {} steps",
                        descr.name,
                        min.len(),
                        step.len()
                    )));
                }
                min.iter()
                    .zip(step)
                    .map(|(&min, &step)| match step {
                        0 => SizeDescr::Fixed(min),
                        step => SizeDescr::Parameterized { min, step },
                    })
                    .collect()
            }
        };
        check_rank(&descr.name, &axes, &sizes)?;
        Ok(TensorSpec {
            id: descr.name.clone(),
            axes,
            sizes,
            data_type: descr.data_type,
            steps: descr.preprocessing.clone(),
            test_tensor,
        })
    }

    pub(super) fn output_spec(
        descr: &OutputTensorDescr,
        inputs: &[InputTensorDescr],
        test_tensor: Option<PathBuf>,
    ) -> Result<TensorSpec> {
        let axes = AxisId::parse_letters(&descr.axes)?;
        let sizes: Vec<SizeDescr> = match &descr.shape {
            OutputShape::Fixed(shape) => shape.iter().map(|&s| SizeDescr::Fixed(s)).collect(),
            OutputShape::Implicit { reference_tensor, scale, offset } => {
                let reference = inputs.iter().find(|i| i.name == *reference_tensor).ok_or_else(|| {
                    Error::InvalidDescription(format!(
                        "output '{}' references unknown tensor '{}'",
                        descr.name, reference_tensor
                    ))
                })?;
                let ref_axes = AxisId::parse_letters(&reference.axes)?;
                axes.iter()
                    .zip(scale.iter().zip(offset))
                    .map(|(axis, (scale, offset))| match (scale, ref_axes.contains(axis)) {
                        (Some(scale), true) => SizeDescr::Reference {
                            tensor_id: reference_tensor.clone(),
                            axis_id: axis.clone(),
                            scale: *scale,
                            offset: (2.0 * offset).round() as i64,
                        },
                        _ => SizeDescr::Any,
                    })
                    .collect()
            }
        };
        check_rank(&descr.name, &axes, &sizes)?;
        Ok(TensorSpec {
            id: descr.name.clone(),
            axes,
            sizes,
            data_type: descr.data_type,
            steps: descr.postprocessing.clone(),
            test_tensor,
        })
    }
}

pub mod v0_5 {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum AxisType {
        Batch,
        Channel,
        Index,
        Space,
        Time,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ParameterizedSize {
        pub min: usize,
        pub step: usize,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SizeReference {
        pub tensor_id: TensorId,
        pub axis_id: AxisId,
        #[serde(default)]
        pub offset: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum AxisSize {
        Fixed(usize),
        Parameterized(ParameterizedSize),
        Reference(SizeReference),
    }

    fn unit_scale() -> f64 {
        1.0
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AxisDescr {
        #[serde(rename = "type")]
        pub kind: AxisType,
        #[serde(default)]
        pub id: Option<AxisId>,
        #[serde(default)]
        pub size: Option<AxisSize>,
        #[serde(default)]
        pub channel_names: Option<Vec<String>>,
        #[serde(default = "unit_scale")]
        pub scale: f64,
    }

    impl AxisDescr {
        pub fn axis_id(&self) -> Result<AxisId> {
            match (&self.id, self.kind) {
                (Some(id), _) => Ok(id.clone()),
                (None, AxisType::Batch) => Ok(AxisId::Batch),
                (None, AxisType::Channel) => Ok(AxisId::Channel),
                (None, AxisType::Index) => Ok(AxisId::Index),
                (None, AxisType::Time) => Ok(AxisId::Custom("time".to_string())),
                (None, AxisType::Space) => Err(Error::InvalidDescription("space axis without id".to_string())),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct FileDescr {
        pub source: PathBuf,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct DataDescr {
        #[serde(rename = "type", default)]
        pub data_type: DataType,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TensorDescr {
        pub id: TensorId,
        pub axes: Vec<AxisDescr>,
        #[serde(default)]
        pub test_tensor: Option<FileDescr>,
        #[serde(default)]
        pub data: DataDescr,
        #[serde(default)]
        pub preprocessing: Vec<ProcessingStepDescr>,
        #[serde(default)]
        pub postprocessing: Vec<ProcessingStepDescr>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ModelDescr {
        pub format_version: String,
        pub name: String,
        #[serde(rename = "type", default = "model_type")]
        pub kind: String,
        pub inputs: Vec<TensorDescr>,
        pub outputs: Vec<TensorDescr>,
        #[serde(default)]
        pub weights: WeightsDescr,
    }

    fn find_axis<'a>(tensors: &'a [&'a TensorDescr], reference: &SizeReference) -> Result<&'a AxisDescr> {
        let tensor = tensors.iter().find(|t| t.id == reference.tensor_id).ok_or_else(|| {
            Error::InvalidDescription(format!("size reference to unknown tensor '{}'", reference.tensor_id))
        })?;
        for axis in &tensor.axes {
            if axis.axis_id()? == reference.axis_id {
                return Ok(axis);
            }
        }
        Err(Error::InvalidDescription(format!(
            "tensor '{}' has no axis '{}'",
            reference.tensor_id, reference.axis_id
        )))
    }

    pub(super) fn tensor_spec(
        descr: &TensorDescr,
        all: &[&TensorDescr],
        root: &Path,
        is_input: bool,
    ) -> Result<TensorSpec> {
        let mut axes = Vec::with_capacity(descr.axes.len());
        let mut sizes = Vec::with_capacity(descr.axes.len());
        for axis in &descr.axes {
            axes.push(axis.axis_id()?);
            let size = match (&axis.size, &axis.channel_names) {
                (Some(AxisSize::Fixed(n)), _) => SizeDescr::Fixed(*n),
                (Some(AxisSize::Parameterized(p)), _) => SizeDescr::Parameterized { min: p.min, step: p.step },
                (Some(AxisSize::Reference(r)), _) => {
                    let ref_axis = find_axis(all, r)?;
                    SizeDescr::Reference {
                        tensor_id: r.tensor_id.clone(),
                        axis_id: r.axis_id.clone(),
                        scale: ref_axis.scale / axis.scale,
                        offset: r.offset,
                    }
                }
                (None, Some(names)) => SizeDescr::Fixed(names.len()),
                (None, None) => SizeDescr::Any,
            };
            sizes.push(size);
        }
        Ok(TensorSpec {
            id: descr.id.clone(),
            axes,
            sizes,
            data_type: descr.data.data_type,
            steps: if is_input { descr.preprocessing.clone() } else { descr.postprocessing.clone() },
            test_tensor: descr.test_tensor.as_ref().map(|f| resolve(root, &f.source)),
        })
    }
}

fn model_type() -> String {
    "model".to_string()
}

fn check_rank(id: &TensorId, axes: &[AxisId], sizes: &[SizeDescr]) -> Result<()> {
    if axes.len() != sizes.len() {
        return Err(Error::InvalidDescription(format!(
            "tensor '{}' declares {} axes but a shape of rank {}",
            id,
            axes.len(),
            sizes.len()
        )));
    }
    Ok(())
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Description format generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V0_4,
    V0_5,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descr {
    V0_4(v0_4::ModelDescr),
    V0_5(v0_5::ModelDescr),
}

/// A model description together with the directory its relative paths resolve against
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescr {
    pub descr: Descr,
    pub root: PathBuf,
}

impl ModelDescr {
    /// Parse YAML (or JSON, which is a YAML subset) description content
    pub fn from_yaml_str(content: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        Self::from_value(value, root.into())
    }

    pub fn from_json_str(content: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let value: serde_yaml::Value = serde_json::from_str(content)?;
        Self::from_value(value, root.into())
    }

    /// Load a description file; relative paths inside it resolve against its directory
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        log::debug!("loading model description from {}", path.display());
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content, root),
            _ => Self::from_yaml_str(&content, root),
        }
    }

    fn from_value(value: serde_yaml::Value, root: PathBuf) -> Result<Self> {
        let version = match value.get("format_version") {
            Some(serde_yaml::Value::String(v)) => v.clone(),
            Some(other) => {
                return Err(Error::InvalidDescription(format!("format_version must be a string, got {:?}", other)))
            }
            None => return Err(Error::InvalidDescription("missing format_version".to_string())),
        };
        let descr = if version.starts_with("0.4.") {
            Descr::V0_4(serde_yaml::from_value(value)?)
        } else if version.starts_with("0.5.") {
            Descr::V0_5(serde_yaml::from_value(value)?)
        } else {
            return Err(Error::InvalidDescription(format!("unsupported format_version '{}'", version)));
        };
        Ok(Self { descr, root })
    }

    pub fn format_version(&self) -> FormatVersion {
        match self.descr {
            Descr::V0_4(_) => FormatVersion::V0_4,
            Descr::V0_5(_) => FormatVersion::V0_5,
        }
    }

    pub fn name(&self) -> &str {
        match &self.descr {
            Descr::V0_4(d) => &d.name,
            Descr::V0_5(d) => &d.name,
        }
    }

    /// Resource type, `"model"` for every model description
    pub fn kind(&self) -> &str {
        match &self.descr {
            Descr::V0_4(d) => &d.kind,
            Descr::V0_5(d) => &d.kind,
        }
    }

    pub fn weights(&self) -> &WeightsDescr {
        match &self.descr {
            Descr::V0_4(d) => &d.weights,
            Descr::V0_5(d) => &d.weights,
        }
    }

    /// Absolute path of the weights file in `format`
    pub fn weights_path(&self, format: WeightsFormat) -> Result<PathBuf> {
        self.weights()
            .get(format)
            .map(|w| resolve(&self.root, &w.source))
            .ok_or_else(|| Error::MissingWeights(format.to_string()))
    }

    pub fn inputs(&self) -> Result<Vec<TensorSpec>> {
        match &self.descr {
            Descr::V0_4(d) => d
                .inputs
                .iter()
                .enumerate()
                .map(|(i, t)| v0_4::input_spec(t, d.test_inputs.get(i).map(|p| resolve(&self.root, p))))
                .collect(),
            Descr::V0_5(d) => {
                let all = all_tensors(d);
                d.inputs.iter().map(|t| v0_5::tensor_spec(t, &all, &self.root, true)).collect()
            }
        }
    }

    pub fn outputs(&self) -> Result<Vec<TensorSpec>> {
        match &self.descr {
            Descr::V0_4(d) => d
                .outputs
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    v0_4::output_spec(t, &d.inputs, d.test_outputs.get(i).map(|p| resolve(&self.root, p)))
                })
                .collect(),
            Descr::V0_5(d) => {
                let all = all_tensors(d);
                d.outputs.iter().map(|t| v0_5::tensor_spec(t, &all, &self.root, false)).collect()
            }
        }
    }

    pub fn input_ids(&self) -> Vec<TensorId> {
        match &self.descr {
            Descr::V0_4(d) => d.inputs.iter().map(|t| t.name.clone()).collect(),
            Descr::V0_5(d) => d.inputs.iter().map(|t| t.id.clone()).collect(),
        }
    }

    pub fn output_ids(&self) -> Vec<TensorId> {
        match &self.descr {
            Descr::V0_4(d) => d.outputs.iter().map(|t| t.name.clone()).collect(),
            Descr::V0_5(d) => d.outputs.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

fn all_tensors(d: &v0_5::ModelDescr) -> Vec<&v0_5::TensorDescr> {
    d.inputs.iter().chain(d.outputs.iter()).collect()
}
