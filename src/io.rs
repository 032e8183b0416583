//! Reading and writing tensors as `.npy` files
//!
//! Axis tags are not stored in the file and come from the caller.

use std::path::Path;

use ndarray::ArrayD;
use ndarray_npy::{read_npy, write_npy, ReadNpyError};

use crate::error::{Error, Result};
use crate::tensor::{AxisId, DataType, Tensor};

fn try_read<T>(path: &Path, dims: &[AxisId], data_type: DataType) -> Result<Option<Tensor>>
where
    T: ndarray_npy::ReadableElement + num_traits::NumCast + Copy + PartialEq + std::fmt::Debug,
{
    match read_npy::<_, ArrayD<T>>(path) {
        Ok(array) => Tensor::from_ndarray(array, dims.to_vec(), data_type).map(Some),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(Error::NpyReadError(path.to_path_buf(), e.to_string())),
    }
}

/// Load an `.npy` array of any supported element type as a tensor tagged with `dims`
pub fn load_tensor(path: impl AsRef<Path>, dims: &[AxisId]) -> Result<Tensor> {
    let path = path.as_ref();
    macro_rules! try_types {
        ($(($ty:ty, $dtype:expr)),* $(,)?) => {
            $(
                if let Some(tensor) = try_read::<$ty>(path, dims, $dtype)? {
                    log::debug!("loaded {} tensor {:?} from {}", $dtype, tensor.shape(), path.display());
                    return Ok(tensor);
                }
            )*
        };
    }
    try_types!(
        (f32, DataType::Float32),
        (f64, DataType::Float64),
        (i8, DataType::Int8),
        (i16, DataType::Int16),
        (i32, DataType::Int32),
        (i64, DataType::Int64),
        (u8, DataType::Uint8),
        (u16, DataType::Uint16),
        (u32, DataType::Uint32),
        (u64, DataType::Uint64),
    );

    match read_npy::<_, ArrayD<bool>>(path) {
        Ok(array) => Tensor::with_data_type(array.mapv(|b| if b { 1.0 } else { 0.0 }), dims.to_vec(), DataType::Bool),
        Err(e) => Err(Error::NpyReadError(
            path.to_path_buf(),
            format!("unsupported element type: {}", e),
        )),
    }
}

/// Save the tensor values as a float32 `.npy` file
pub fn save_tensor(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let path = path.as_ref();
    write_npy(path, tensor.data()).map_err(|e| Error::NpyWriteError(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.npy");
        let data = Array::from_shape_vec(IxDyn(&[1, 2, 3]), (0..6).map(|v| v as f32).collect()).unwrap();
        let tensor = Tensor::new(data, vec![AxisId::Channel, AxisId::Y, AxisId::X]).unwrap();

        save_tensor(&path, &tensor).unwrap();
        let loaded = load_tensor(&path, tensor.dims()).unwrap();
        assert_eq!(loaded, tensor);
    }

    #[test]
    fn test_load_integer_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.npy");
        write_npy(&path, &Array::from_shape_vec(IxDyn(&[3]), vec![1u8, 2, 3]).unwrap()).unwrap();

        let loaded = load_tensor(&path, &[AxisId::X]).unwrap();
        assert_eq!(loaded.data_type(), DataType::Uint8);
        assert_eq!(loaded.data().as_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_axis_count_must_match_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.npy");
        write_npy(&path, &Array::from_shape_vec(IxDyn(&[2, 2]), vec![0.0f32; 4]).unwrap()).unwrap();
        assert!(load_tensor(&path, &[AxisId::X]).is_err());
        assert!(matches!(load_tensor(dir.path().join("missing.npy"), &[AxisId::X]), Err(Error::NpyReadError(..))));
    }
}
