// --- File: src/nn/params.rs ---

//! Named parameter storage shared by layers, models and optimizers.
//!
//! Layers do not own their tensors. They hold parameter *names*
//! (`"classifier.fc1.weights"`) and read the values from a `ParamStore`
//! handed to `forward`. Gradients use the very same type, so an optimizer
//! step is a zip over two maps.

use crate::error::{FewShotError, Result};
use ndarray::{ArrayD, ArrayView1, ArrayView2, Ix1, Ix2};
use std::collections::HashMap;

/// Map from dotted parameter name to its value (or gradient).
pub type ParamStore = HashMap<String, ArrayD<f32>>;

/// Returns a 2-D view of the parameter `name`.
pub fn view2<'a>(store: &'a ParamStore, name: &str) -> Result<ArrayView2<'a, f32>> {
    let value = store
        .get(name)
        .ok_or_else(|| FewShotError::MissingParameter(name.to_string()))?;
    value
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| FewShotError::shape(name, &[0, 0], value.shape()))
}

/// Returns a 1-D view of the parameter `name`.
pub fn view1<'a>(store: &'a ParamStore, name: &str) -> Result<ArrayView1<'a, f32>> {
    let value = store
        .get(name)
        .ok_or_else(|| FewShotError::MissingParameter(name.to_string()))?;
    value
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| FewShotError::shape(name, &[0], value.shape()))
}

/// Reads a single-element parameter (R2D2 scalars).
pub fn scalar(store: &ParamStore, name: &str) -> Result<f32> {
    let value = store
        .get(name)
        .ok_or_else(|| FewShotError::MissingParameter(name.to_string()))?;
    value
        .iter()
        .next()
        .copied()
        .ok_or_else(|| FewShotError::shape(name, &[1], value.shape()))
}

/// Adds `value` to the gradient slot `name`, creating it on first use.
pub fn accumulate(grads: &mut ParamStore, name: &str, value: ArrayD<f32>) {
    match grads.get_mut(name) {
        Some(existing) if existing.shape() == value.shape() => *existing += &value,
        _ => {
            grads.insert(name.to_string(), value);
        }
    }
}

/// Adds every entry of `other` into `grads`.
pub fn accumulate_all(grads: &mut ParamStore, other: ParamStore) {
    for (name, value) in other {
        accumulate(grads, &name, value);
    }
}

/// Multiplies every gradient by `factor` in place.
pub fn scale(grads: &mut ParamStore, factor: f32) {
    for value in grads.values_mut() {
        value.mapv_inplace(|g| g * factor);
    }
}

/// Copies the entries whose name starts with `prefix`.
pub fn subset(store: &ParamStore, prefix: &str) -> ParamStore {
    store
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Copies the entries under `from`, renamed to live under `to`.
///
/// `rename_prefix(store, "classifier.", "head.")` maps `classifier.weights`
/// to `head.weights`.
pub fn rename_prefix(store: &ParamStore, from: &str, to: &str) -> ParamStore {
    store
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(from)
                .map(|rest| (format!("{}{}", to, rest), value.clone()))
        })
        .collect()
}

/// Drops every entry whose name starts with `prefix`.
pub fn remove_prefixed(store: &mut ParamStore, prefix: &str) {
    store.retain(|name, _| !name.starts_with(prefix));
}

/// True when every element of every tensor is finite.
pub fn all_finite(store: &ParamStore) -> bool {
    store.values().all(|v| v.iter().all(|x| x.is_finite()))
}

/// Total number of scalar parameters.
pub fn numel(store: &ParamStore) -> usize {
    store.values().map(|v| v.len()).sum()
}
