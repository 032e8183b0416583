use std::fmt;
use std::str::FromStr;

use half::f16;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use num_traits::NumCast;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Identifier of a logical model input or output slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(String);

impl TensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TensorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TensorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Axis tag of a tensor dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AxisId {
    Batch,
    Channel,
    Index,
    X,
    Y,
    Z,
    Custom(String),
}

impl AxisId {
    /// Parse a legacy axes string such as `"bcyx"` into one axis per letter
    pub fn parse_letters(axes: &str) -> Result<Vec<AxisId>> {
        axes.chars().map(|c| c.to_string().parse()).collect()
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, AxisId::X | AxisId::Y | AxisId::Z)
    }
}

impl FromStr for AxisId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(Error::InvalidAxis("empty axis id".to_string())),
            "b" | "batch" => Ok(AxisId::Batch),
            "c" | "channel" => Ok(AxisId::Channel),
            "i" | "index" => Ok(AxisId::Index),
            "x" => Ok(AxisId::X),
            "y" => Ok(AxisId::Y),
            "z" => Ok(AxisId::Z),
            other => Ok(AxisId::Custom(other.to_string())),
        }
    }
}

impl TryFrom<String> for AxisId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AxisId> for String {
    fn from(axis: AxisId) -> Self {
        axis.to_string()
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisId::Batch => f.write_str("batch"),
            AxisId::Channel => f.write_str("channel"),
            AxisId::Index => f.write_str("index"),
            AxisId::X => f.write_str("x"),
            AxisId::Y => f.write_str("y"),
            AxisId::Z => f.write_str("z"),
            AxisId::Custom(name) => f.write_str(name),
        }
    }
}

/// Element types a tensor may be declared with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float16,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Float32
    }
}

impl DataType {
    pub fn is_floating_point(&self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32 | DataType::Float64)
    }

    /// Get minimum and maximum value for the data type (as f64)
    pub fn get_value_range(&self) -> (f64, f64) {
        match self {
            DataType::Float16 => (-65504.0, 65504.0),
            DataType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            DataType::Float64 => (f64::MIN, f64::MAX),
            DataType::Int8 => (i8::MIN as f64, i8::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::Int64 => (i64::MIN as f64, i64::MAX as f64),
            DataType::Uint8 => (0.0, u8::MAX as f64),
            DataType::Uint16 => (0.0, u16::MAX as f64),
            DataType::Uint32 => (0.0, u32::MAX as f64),
            DataType::Uint64 => (0.0, u64::MAX as f64),
            DataType::Bool => (0.0, 1.0),
        }
    }
}

/// Nearest value of `target_type` to `value`
///
/// Integers round half away from zero and saturate at the type bounds; NaN
/// becomes zero for every non-float type.
fn convert_value(value: f64, target_type: DataType) -> f32 {
    if target_type.is_floating_point() {
        return match target_type {
            DataType::Float16 => f16::from_f64(value).to_f32(),
            _ => value as f32,
        };
    }
    if value.is_nan() {
        return 0.0;
    }
    if target_type == DataType::Bool {
        return if value != 0.0 { 1.0 } else { 0.0 };
    }
    let (min, max) = target_type.get_value_range();
    value.round().clamp(min, max) as f32
}

/// An axis-tagged N-dimensional array
///
/// Values are held as `f32`; `data_type` records the element type the values
/// conform to.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
    dims: Vec<AxisId>,
    data_type: DataType,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor {{ dims: {:?}, data_type: {}, shape: {:?} }}",
               self.dims, self.data_type, self.data.shape())
    }
}

impl Tensor {
    /// Create a float32 tensor, checking one unique axis tag per dimension
    pub fn new(data: ArrayD<f32>, dims: Vec<AxisId>) -> Result<Self> {
        Self::with_data_type(data, dims, DataType::Float32)
    }

    pub fn with_data_type(data: ArrayD<f32>, dims: Vec<AxisId>, data_type: DataType) -> Result<Self> {
        if dims.len() != data.ndim() {
            return Err(Error::ShapeMismatch(format!(
                "{} axis tags given for an array with {} dimensions",
                dims.len(),
                data.ndim()
            )));
        }
        for (i, axis) in dims.iter().enumerate() {
            if dims[..i].contains(axis) {
                return Err(Error::InvalidAxis(format!("duplicate axis '{}'", axis)));
            }
        }
        Ok(Self { data, dims, data_type })
    }

    /// Create a tensor from an array of any numeric element type
    ///
    /// Values are stored as `f32`; values that do not survive the round trip
    /// (large 64-bit integers, most `f64`) are reported with a warning.
    pub fn from_ndarray<T>(arr: ArrayD<T>, dims: Vec<AxisId>, data_type: DataType) -> Result<Self>
    where
        T: NumCast + Copy + PartialEq + fmt::Debug,
    {
        let mut lossy = 0usize;
        let mut values = Vec::with_capacity(arr.len());
        for &v in arr.iter() {
            let value = <f32 as NumCast>::from(v).ok_or_else(|| {
                Error::ConversionError(format!("{:?} cannot be represented as float32", v))
            })?;
            // NaN never compares equal and is carried over exactly
            let exact = value.is_nan() || <T as NumCast>::from(value) == Some(v);
            if !exact {
                lossy += 1;
            }
            values.push(value);
        }
        if lossy > 0 {
            log::warn!(
                "{} of {} {} value(s) lost precision when stored as float32",
                lossy,
                arr.len(),
                data_type
            );
        }
        let data = ArrayD::from_shape_vec(arr.raw_dim(), values)?;
        Self::with_data_type(data, dims, data_type)
    }

    pub fn zeros(shape: &[usize], dims: Vec<AxisId>) -> Result<Self> {
        Self::new(ArrayD::zeros(IxDyn(shape)), dims)
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    pub fn dims(&self) -> &[AxisId] {
        &self.dims
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn axis_index(&self, axis: &AxisId) -> Option<usize> {
        self.dims.iter().position(|a| a == axis)
    }

    /// Size of the dimension tagged `axis`
    pub fn size_of(&self, axis: &AxisId) -> Option<usize> {
        self.axis_index(axis).map(|i| self.data.shape()[i])
    }

    /// Resolve axis tags to dimension indices; `None` selects every dimension
    pub fn axis_indices(&self, axes: Option<&[AxisId]>) -> Result<Vec<usize>> {
        match axes {
            None => Ok((0..self.ndim()).collect()),
            Some(axes) => axes
                .iter()
                .map(|a| {
                    self.axis_index(a).ok_or_else(|| {
                        Error::InvalidAxis(format!("axis '{}' not in tensor axes {:?}", a, self.dims))
                    })
                })
                .collect(),
        }
    }

    /// Apply `op` to every element, keeping axes and data type
    pub fn map<F>(&self, op: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            data: self.data.mapv(op),
            dims: self.dims.clone(),
            data_type: self.data_type,
        }
    }

    /// Same values under a different data type tag, without conversion
    pub fn retagged(self, data_type: DataType) -> Tensor {
        Tensor { data_type, ..self }
    }

    /// Convert to `target_type`, applying its rounding and range rules
    pub fn cast_to(&self, target_type: DataType) -> Tensor {
        if target_type == self.data_type {
            return self.clone();
        }
        Tensor {
            data: self.data.mapv(|v| convert_value(v as f64, target_type)),
            dims: self.dims.clone(),
            data_type: target_type,
        }
    }

    /// Lay this tensor out along `target_dims`
    ///
    /// Every axis of `self` must appear in `target_dims`; axes missing from
    /// `self` become singleton dimensions so the result broadcasts against a
    /// tensor with `target_dims`.
    pub fn align_to(&self, target_dims: &[AxisId]) -> Result<ArrayD<f32>> {
        let mut perm = Vec::with_capacity(self.ndim());
        for axis in target_dims {
            if let Some(i) = self.axis_index(axis) {
                perm.push(i);
            }
        }
        if perm.len() != self.ndim() {
            return Err(Error::InvalidAxis(format!(
                "cannot align axes {:?} to {:?}",
                self.dims, target_dims
            )));
        }

        let mut view: ArrayViewD<f32> = self.data.view().permuted_axes(IxDyn(&perm));
        for (i, axis) in target_dims.iter().enumerate() {
            if self.axis_index(axis).is_none() {
                view.insert_axis_inplace(Axis(i));
            }
        }
        Ok(view.to_owned())
    }

    /// Drop the axes at `indices` from the axis tags (for reduced results)
    pub(crate) fn remaining_dims(&self, indices: &[usize]) -> Vec<AxisId> {
        self.dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !indices.contains(i))
            .map(|(_, a)| a.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array};

    #[test]
    fn test_axis_id_parsing() {
        assert_eq!(AxisId::parse_letters("bcyx").unwrap(),
                   vec![AxisId::Batch, AxisId::Channel, AxisId::Y, AxisId::X]);
        assert_eq!("channel".parse::<AxisId>().unwrap(), AxisId::Channel);
        assert_eq!("time".parse::<AxisId>().unwrap(), AxisId::Custom("time".to_string()));
        assert!("".parse::<AxisId>().is_err());
    }

    #[test]
    fn test_tensor_requires_one_tag_per_dimension() {
        let data = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        assert!(Tensor::new(data.clone(), vec![AxisId::Y]).is_err());
        assert!(Tensor::new(data.clone(), vec![AxisId::Y, AxisId::Y]).is_err());
        assert!(Tensor::new(data, vec![AxisId::Y, AxisId::X]).is_ok());
    }

    #[test]
    fn test_numeric_type_conversions() {
        assert_eq!(convert_value(3.7, DataType::Int32), 4.0);
        assert_eq!(convert_value(-2.5, DataType::Int32), -3.0);
        assert_eq!(convert_value(300.0, DataType::Int8), 127.0);
        assert_eq!(convert_value(-5.0, DataType::Uint8), 0.0);
        assert_eq!(convert_value(0.3, DataType::Bool), 1.0);
        assert_eq!(convert_value(f64::NAN, DataType::Uint16), 0.0);
        assert_eq!(convert_value(f64::INFINITY, DataType::Int16), i16::MAX as f32);
        assert!(convert_value(f64::NAN, DataType::Float32).is_nan());
        assert_eq!(convert_value(1.0 / 3.0, DataType::Float16), f16::from_f64(1.0 / 3.0).to_f32());
    }

    #[test]
    fn test_from_ndarray_keeps_values() {
        let ints = arr1(&[1i64, -7, 1 << 40]).into_dyn();
        let t = Tensor::from_ndarray(ints, vec![AxisId::X], DataType::Int64).unwrap();
        assert_eq!(t.data_type(), DataType::Int64);
        assert_eq!(t.data().as_slice().unwrap(), &[1.0, -7.0, (1u64 << 40) as f32]);

        // rounded to the nearest float32, not to zero
        let big = arr1(&[(1i64 << 53) + 1]).into_dyn();
        let t = Tensor::from_ndarray(big, vec![AxisId::X], DataType::Int64).unwrap();
        assert_eq!(t.data()[IxDyn(&[0])], (1i64 << 53) as f32);

        let floats = arr1(&[f64::NAN, 0.1]).into_dyn();
        let t = Tensor::from_ndarray(floats, vec![AxisId::X], DataType::Float64).unwrap();
        assert!(t.data()[IxDyn(&[0])].is_nan());
        assert_eq!(t.data()[IxDyn(&[1])], 0.1f32);
    }

    #[test]
    fn test_cast_to_uint8() {
        let t = Tensor::new(arr1(&[-1.0f32, 0.4, 1.6, 300.0]).into_dyn(), vec![AxisId::X]).unwrap();
        let cast = t.cast_to(DataType::Uint8);
        assert_eq!(cast.data_type(), DataType::Uint8);
        assert_eq!(cast.data().as_slice().unwrap(), &[0.0, 0.0, 2.0, 255.0]);
    }

    #[test]
    fn test_align_to_inserts_and_permutes_axes() {
        let param = Tensor::new(
            Array::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|v| v as f32).collect()).unwrap(),
            vec![AxisId::X, AxisId::Channel],
        )
        .unwrap();
        let aligned = param
            .align_to(&[AxisId::Batch, AxisId::Channel, AxisId::Y, AxisId::X])
            .unwrap();
        assert_eq!(aligned.shape(), &[1, 3, 1, 2]);
        assert_eq!(aligned[IxDyn(&[0, 2, 0, 1])], 5.0);
        assert!(param.align_to(&[AxisId::Y]).is_err());
    }
}
