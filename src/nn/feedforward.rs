//! Two-layer perceptron head, `ReLU(xW₁ + b₁)W₂ + b₂`.

use crate::error::Result;
use crate::nn::{Linear, Module, ParamStore, ReLU};
use ndarray::Array2;
use rand::Rng;

/// `Linear -> ReLU -> Linear`, the classifier head adapted by ANIL.
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear1: Linear,
    relu: ReLU,
    linear2: Linear,
}

impl FeedForward {
    /// Registers both layers under `{name}.layers.0` and `{name}.layers.2`.
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            linear1: Linear::new(store, &format!("{}.layers.0", name), in_dim, hidden_dim, rng),
            relu: ReLU::new(),
            linear2: Linear::new(store, &format!("{}.layers.2", name), hidden_dim, out_dim, rng),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.linear1.out_features
    }

    pub fn out_dim(&self) -> usize {
        self.linear2.out_features
    }
}

impl Module for FeedForward {
    fn forward(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        let pre = self.linear1.forward(store, inputs)?;
        let hidden = self.relu.forward(&pre);
        self.linear2.forward(store, &hidden)
    }

    fn backward(
        &self,
        store: &ParamStore,
        inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<Array2<f32>> {
        let pre = self.linear1.forward(store, inputs)?;
        let hidden = self.relu.forward(&pre);
        let grad_hidden = self.linear2.backward(store, &hidden, grad_output, grads)?;
        let grad_pre = self.relu.backward(&pre, &grad_hidden);
        self.linear1.backward(store, inputs, &grad_pre, grads)
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names = self.linear1.parameter_names();
        names.extend(self.linear2.parameter_names());
        names
    }
}
