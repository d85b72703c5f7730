// --- File: src/serialization/safetensors_io.rs ---

//! Reading and writing a [`ParamStore`] in the SafeTensors format.
//!
//! Tensors are written as little-endian `f32`. `f64` files are accepted on
//! load and narrowed to `f32`, so weights exported by other tools can be used
//! as frozen features or backbone initialisations.

use crate::nn::ParamStore;
use ndarray::{ArrayD, IxDyn};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading or writing SafeTensors files.
#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor '{name}' has {actual} elements, shape {shape:?} needs {expected}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Writes every tensor of `tensors` to `path`.
///
/// Names are sorted first so the same store always produces the same file.
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &ParamStore) -> Result<()> {
    // Bytes must outlive the views that borrow them.
    let data_storage: BTreeMap<&str, (Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, arr)| {
            let bytes: Vec<u8> = arr.iter().flat_map(|&x| x.to_le_bytes()).collect();
            (name.as_str(), (arr.shape().to_vec(), bytes))
        })
        .collect();

    let mut tensor_views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(data_storage.len());
    for (name, (shape, bytes)) in &data_storage {
        tensor_views.push((
            *name,
            TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?,
        ));
    }

    serialize_to_file(tensor_views, &None, path.as_ref())?;
    Ok(())
}

/// Loads every tensor of the file at `path`.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<ParamStore> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = ParamStore::new();
    for (name, tensor) in tensors.tensors() {
        let shape = tensor.shape().to_vec();
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };
        let actual = floats.len();
        let arr = ArrayD::from_shape_vec(IxDyn(&shape), floats).map_err(|_| {
            SafeTensorsError::ShapeMismatch {
                name: name.clone(),
                expected: shape.iter().product(),
                shape: shape.clone(),
                actual,
            }
        })?;
        result.insert(name, arr);
    }
    Ok(result)
}

/// Removes and returns the tensor `name`, failing when it is absent.
pub fn take_tensor(store: &mut ParamStore, name: &str) -> Result<ArrayD<f32>> {
    store
        .remove(name)
        .ok_or_else(|| SafeTensorsError::TensorNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_save_load_preserves_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut store = ParamStore::new();
        store.insert("classifier.weights".into(), arr2(&[[1.0, -2.0], [3.5, 4.0]]).into_dyn());
        store.insert("classifier.alpha".into(), arr1(&[1.0]).into_dyn());
        save_safetensors(&path, &store).unwrap();

        let mut loaded = load_safetensors(&path).unwrap();
        assert_eq!(loaded, store);
        assert!(take_tensor(&mut loaded, "classifier.alpha").is_ok());
        assert!(matches!(
            take_tensor(&mut loaded, "classifier.alpha"),
            Err(SafeTensorsError::TensorNotFound(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_safetensors("/nonexistent/weights.safetensors"),
            Err(SafeTensorsError::Io(_))
        ));
    }
}
