//! Reading and writing the SafeTensors format.
//!
//! Parameters are stored as `F32` tensors. Integer index arrays (such as
//! sparse adjacency coordinates) are stored as `I64`. `F64` tensors are
//! read and narrowed to `f32`.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use safetensors::serialize_to_file;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    #[error("unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("tensor '{name}' has {len} elements, which does not fit shape {shape:?}")]
    ShapeMismatch { name: String, shape: Vec<usize>, len: usize },

    #[error("tensor '{0}' not found")]
    TensorNotFound(String),

    #[error("invalid metadata: {0}")]
    Metadata(String),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// A tensor as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredTensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl StoredTensor {
    fn dtype(&self) -> Dtype {
        match self {
            StoredTensor::F32(_) => Dtype::F32,
            StoredTensor::I64(_) => Dtype::I64,
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            StoredTensor::F32(a) => a.shape().to_vec(),
            StoredTensor::I64(a) => a.shape().to_vec(),
        }
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            StoredTensor::F32(a) => a.iter().flat_map(|x| x.to_le_bytes()).collect(),
            StoredTensor::I64(a) => a.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

fn from_bytes<T, const W: usize>(name: &str, shape: &[usize], data: &[u8], decode: fn([u8; W]) -> T) -> Result<ArrayD<T>> {
    let values: Vec<T> = data
        .chunks_exact(W)
        .map(|chunk| {
            let mut bytes = [0u8; W];
            bytes.copy_from_slice(chunk);
            decode(bytes)
        })
        .collect();
    let len = values.len();
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| SafeTensorsError::ShapeMismatch {
        name: name.to_string(),
        shape: shape.to_vec(),
        len,
    })
}

/// Writes named tensors with optional string metadata.
pub fn write_tensors<P: AsRef<Path>>(
    path: P,
    tensors: &[(String, StoredTensor)],
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let bytes: Vec<Vec<u8>> = tensors.iter().map(|(_, t)| t.to_le_bytes()).collect();
    let views = tensors
        .iter()
        .zip(&bytes)
        .map(|((name, tensor), data)| Ok((name.as_str(), TensorView::new(tensor.dtype(), tensor.shape(), data)?)))
        .collect::<Result<Vec<_>>>()?;
    serialize_to_file(views, &metadata, path.as_ref())?;
    Ok(())
}

/// Reads every tensor of a file together with its metadata.
pub fn read_tensors<P: AsRef<Path>>(path: P) -> Result<(HashMap<String, StoredTensor>, HashMap<String, String>)> {
    let buffer = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let file = SafeTensors::deserialize(&buffer)?;

    let mut tensors = HashMap::new();
    for (name, view) in file.tensors() {
        let shape = view.shape().to_vec();
        let stored = match view.dtype() {
            Dtype::F32 => StoredTensor::F32(from_bytes(&name, &shape, view.data(), f32::from_le_bytes)?),
            Dtype::F64 => {
                let wide = from_bytes(&name, &shape, view.data(), f64::from_le_bytes)?;
                StoredTensor::F32(wide.mapv(|v| v as f32))
            }
            Dtype::I64 => StoredTensor::I64(from_bytes(&name, &shape, view.data(), i64::from_le_bytes)?),
            other => {
                return Err(SafeTensorsError::UnsupportedDtype { name, dtype: format!("{other:?}") });
            }
        };
        tensors.insert(name, stored);
    }
    Ok((tensors, metadata))
}

/// Saves parameter values as `F32` tensors; scalars get an empty shape.
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Value>) -> Result<()> {
    let mut entries: Vec<(String, StoredTensor)> = tensors
        .iter()
        .map(|(name, value)| {
            let array = match value {
                Value::Tensor(a) => a.clone(),
                Value::ScalarF32(v) => ArrayD::from_elem(IxDyn(&[]), *v),
            };
            (name.clone(), StoredTensor::F32(array))
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    write_tensors(path, &entries, None)
}

/// Loads a file written by [`save_safetensors`].
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let (tensors, _) = read_tensors(path)?;
    tensors
        .into_iter()
        .map(|(name, tensor)| match tensor {
            StoredTensor::F32(a) => Ok((name, Value::Tensor(a))),
            StoredTensor::I64(_) => Err(SafeTensorsError::UnsupportedDtype { name, dtype: "I64".to_string() }),
        })
        .collect()
}

/// Loads one tensor by name.
pub fn load_tensor<P: AsRef<Path>>(path: P, name: &str) -> Result<Value> {
    load_safetensors(path)?
        .remove(name)
        .ok_or_else(|| SafeTensorsError::TensorNotFound(name.to_string()))
}

/// Sorted tensor names of a file.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = std::fs::read(path)?;
    let file = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = file.names().into_iter().cloned().collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_save_load_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut weights = HashMap::new();
        weights.insert("conv.kernel".to_string(), Value::Tensor(arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn()));
        weights.insert("scale".to_string(), Value::ScalarF32(0.5));
        save_safetensors(&path, &weights).unwrap();

        let loaded = load_safetensors(&path).unwrap();
        assert_eq!(loaded["conv.kernel"], weights["conv.kernel"]);
        assert_eq!(loaded["scale"].shape(), Vec::<usize>::new());
        assert_eq!(list_tensors(&path).unwrap(), vec!["conv.kernel".to_string(), "scale".to_string()]);
        assert!(matches!(load_tensor(&path, "missing"), Err(SafeTensorsError::TensorNotFound(_))));
    }

    #[test]
    fn test_integer_tensors_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.safetensors");
        let index = StoredTensor::I64(ndarray::arr1(&[0i64, 4, 2]).into_dyn());
        let metadata = HashMap::from([("kind".to_string(), "test".to_string())]);
        write_tensors(&path, &[("index".to_string(), index.clone())], Some(metadata)).unwrap();

        let (tensors, meta) = read_tensors(&path).unwrap();
        assert_eq!(tensors["index"], index);
        assert_eq!(meta["kind"], "test");
        assert!(matches!(load_safetensors(&path), Err(SafeTensorsError::UnsupportedDtype { .. })));
    }
}
