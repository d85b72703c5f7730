//! Fully connected layer over a `ParamStore`.

use crate::error::{FewShotError, Result};
use crate::nn::module::Module;
use crate::nn::params::{accumulate, view1, view2, ParamStore};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

/// Fully connected layer, `y = xW + b`.
///
/// `weights` has shape `[in_features, out_features]`, `bias` has shape
/// `[out_features]`. Both live in the store under `{name}.weights` and
/// `{name}.bias`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weights: String,
    pub bias: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    /// Creates the layer and registers freshly initialised parameters.
    ///
    /// Both tensors are drawn from `U(-1/sqrt(in), 1/sqrt(in))`, the default
    /// initialisation of a dense layer in most frameworks.
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        let layer = Self::named(name, in_features, out_features);
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        store.insert(
            layer.weights.clone(),
            Array2::random_using((in_features, out_features), dist, rng).into_dyn(),
        );
        store.insert(
            layer.bias.clone(),
            Array1::random_using(out_features, dist, rng).into_dyn(),
        );
        layer
    }

    /// Describes the layer without touching any store.
    pub fn named(name: &str, in_features: usize, out_features: usize) -> Self {
        Self {
            weights: format!("{}.weights", name),
            bias: format!("{}.bias", name),
            in_features,
            out_features,
        }
    }

    fn check_input(&self, inputs: &Array2<f32>) -> Result<()> {
        if inputs.ncols() != self.in_features {
            return Err(FewShotError::shape(
                &self.weights,
                &[inputs.nrows(), self.in_features],
                inputs.shape(),
            ));
        }
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(inputs)?;
        let w = view2(store, &self.weights)?;
        let b = view1(store, &self.bias)?;
        Ok(inputs.dot(&w) + &b)
    }

    fn backward(
        &self,
        store: &ParamStore,
        inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<Array2<f32>> {
        self.check_input(inputs)?;
        let w = view2(store, &self.weights)?;
        if grad_output.dim() != (inputs.nrows(), self.out_features) {
            return Err(FewShotError::shape(
                &self.bias,
                &[inputs.nrows(), self.out_features],
                grad_output.shape(),
            ));
        }

        accumulate(grads, &self.weights, inputs.t().dot(grad_output).into_dyn());
        accumulate(grads, &self.bias, grad_output.sum_axis(Axis(0)).into_dyn());
        Ok(grad_output.dot(&w.t()))
    }

    fn parameter_names(&self) -> Vec<String> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_registers_parameters() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let fc = Linear::new(&mut store, "fc", 4, 3, &mut rng);
        assert_eq!(store[&fc.weights].shape(), &[4, 3]);
        assert_eq!(store[&fc.bias].shape(), &[3]);
        assert!(store[&fc.weights].iter().all(|w| w.abs() <= 0.5));
    }

    #[test]
    fn test_linear_forward_backward() {
        let mut store = ParamStore::new();
        let fc = Linear::named("fc", 2, 2);
        store.insert(fc.weights.clone(), arr2(&[[1.0, 0.0], [0.0, 2.0]]).into_dyn());
        store.insert(fc.bias.clone(), ndarray::arr1(&[0.5, -0.5]).into_dyn());

        let x = arr2(&[[1.0, 1.0], [2.0, 0.0]]);
        let y = fc.forward(&store, &x).unwrap();
        assert_eq!(y, arr2(&[[1.5, 1.5], [2.5, -0.5]]));

        let mut grads = ParamStore::new();
        let dx = fc
            .backward(&store, &x, &arr2(&[[1.0, 0.0], [0.0, 1.0]]), &mut grads)
            .unwrap();
        assert_eq!(dx, arr2(&[[1.0, 0.0], [0.0, 2.0]]));
        assert_eq!(view2(&grads, "fc.weights").unwrap(), arr2(&[[1.0, 2.0], [1.0, 0.0]]));
        assert_eq!(view1(&grads, "fc.bias").unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let fc = Linear::new(&mut store, "fc", 3, 2, &mut rng);
        let x = Array2::zeros((2, 4));
        assert!(fc.forward(&store, &x).is_err());
    }
}
