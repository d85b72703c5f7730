//! Module defining the core `Module` trait for all layers.

use crate::error::Result;
use crate::nn::params::ParamStore;
use ndarray::Array2;

/// Common interface of every layer.
///
/// A `Module` owns only the *names* of its parameters. Values are read from
/// the `ParamStore` passed in, which lets the same layer run against the
/// model's meta-parameters or against an adapted copy living in the inner
/// loop.
pub trait Module {
    /// Forward pass over a batch of row vectors.
    fn forward(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>>;

    /// Backward pass.
    ///
    /// Accumulates `dL/dθ` for every parameter of the layer into `grads`
    /// and returns `dL/d(inputs)`. The forward pass is recomputed from
    /// `inputs` where intermediate values are needed.
    fn backward(
        &self,
        store: &ParamStore,
        inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<Array2<f32>>;

    /// Names of all trainable parameters of this module.
    fn parameter_names(&self) -> Vec<String>;
}
