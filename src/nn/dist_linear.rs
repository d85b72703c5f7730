//! Cosine-similarity classifier with class-wise weight normalisation.
//!
//! From "A Closer Look at Few-shot Classification" (ICLR 2019). The head
//! scores `scale · cos(x, W_o)` where each class row is reparametrised as
//! `W_o = g_o · v_o / ‖v_o‖`, so the norm `g_o` is learned separately from
//! the direction.

use crate::error::{FewShotError, Result};
use crate::nn::module::Module;
use crate::nn::params::{accumulate, view1, view2, ParamStore};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

const INPUT_NORM_EPS: f32 = 1e-5;
const WEIGHT_NORM_EPS: f32 = 1e-12;

/// Cosine classifier, the Baseline++ head.
#[derive(Debug, Clone)]
pub struct DistLinear {
    pub weight_v: String,
    pub weight_g: String,
    pub in_features: usize,
    pub out_features: usize,
    scale_factor: f32,
}

impl DistLinear {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        let layer = Self::named(name, in_features, out_features);
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let v = Array2::random_using((out_features, in_features), Uniform::new(-bound, bound), rng);
        // g starts at ‖v‖ so the effective weight equals v.
        let g: Array1<f32> = v.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        store.insert(layer.weight_v.clone(), v.into_dyn());
        store.insert(layer.weight_g.clone(), g.into_dyn());
        layer
    }

    pub fn named(name: &str, in_features: usize, out_features: usize) -> Self {
        // Omniglot-sized label spaces need a larger temperature.
        let scale_factor = if out_features <= 200 { 2.0 } else { 10.0 };
        Self {
            weight_v: format!("{}.weight_v", name),
            weight_g: format!("{}.weight_g", name),
            in_features,
            out_features,
            scale_factor,
        }
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    /// Effective weight `W = g · v/‖v‖` together with the unit directions.
    fn effective_weight(&self, store: &ParamStore) -> Result<(Array2<f32>, Array2<f32>, Array1<f32>)> {
        let v = view2(store, &self.weight_v)?;
        let g = view1(store, &self.weight_g)?;
        if v.dim() != (self.out_features, self.in_features) || g.len() != self.out_features {
            return Err(FewShotError::shape(
                &self.weight_v,
                &[self.out_features, self.in_features],
                v.shape(),
            ));
        }
        let v_norm = v.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(WEIGHT_NORM_EPS));
        let unit = &v / &v_norm.view().insert_axis(Axis(1));
        let weight = &unit * &g.insert_axis(Axis(1));
        Ok((weight, unit, v_norm))
    }

    fn normalize_input(&self, inputs: &Array2<f32>) -> Result<(Array2<f32>, Array1<f32>)> {
        if inputs.ncols() != self.in_features {
            return Err(FewShotError::shape(
                &self.weight_v,
                &[inputs.nrows(), self.in_features],
                inputs.shape(),
            ));
        }
        let norms = inputs.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        let denom = norms.mapv(|r| r + INPUT_NORM_EPS);
        let normalized = inputs / &denom.view().insert_axis(Axis(1));
        Ok((normalized, norms))
    }
}

impl Module for DistLinear {
    fn forward(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        let (x_norm, _) = self.normalize_input(inputs)?;
        let (weight, _, _) = self.effective_weight(store)?;
        Ok(x_norm.dot(&weight.t()) * self.scale_factor)
    }

    fn backward(
        &self,
        store: &ParamStore,
        inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<Array2<f32>> {
        let (x_norm, norms) = self.normalize_input(inputs)?;
        let (weight, unit, v_norm) = self.effective_weight(store)?;
        let g = view1(store, &self.weight_g)?;

        let grad_cos = grad_output * self.scale_factor;
        let grad_weight = grad_cos.t().dot(&x_norm);
        let grad_x_norm = grad_cos.dot(&weight);

        // Weight-norm chain rule, row by row.
        let mut grad_g = Array1::<f32>::zeros(self.out_features);
        let mut grad_v = Array2::<f32>::zeros((self.out_features, self.in_features));
        for o in 0..self.out_features {
            let dw = grad_weight.row(o);
            let u = unit.row(o);
            let dg = dw.dot(&u);
            grad_g[o] = dg;
            let coeff = g[o] / v_norm[o];
            grad_v
                .row_mut(o)
                .assign(&((&dw - &(&u * dg)) * coeff));
        }
        accumulate(grads, &self.weight_g, grad_g.into_dyn());
        accumulate(grads, &self.weight_v, grad_v.into_dyn());

        // Input normalisation x / (‖x‖ + eps).
        let mut grad_input = Array2::<f32>::zeros(inputs.raw_dim());
        for i in 0..inputs.nrows() {
            let r = norms[i];
            let s = r + INPUT_NORM_EPS;
            let dxn = grad_x_norm.row(i);
            let mut row = &dxn / s;
            if r > 0.0 {
                let x = inputs.row(i);
                let proj = x.dot(&dxn) / (s * s * r);
                row = row - &(&x * proj);
            }
            grad_input.row_mut(i).assign(&row);
        }
        Ok(grad_input)
    }

    fn parameter_names(&self) -> Vec<String> {
        vec![self.weight_v.clone(), self.weight_g.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_scale_factor_depends_on_classes() {
        assert_eq!(DistLinear::named("a", 4, 5).scale_factor(), 2.0);
        assert_eq!(DistLinear::named("b", 4, 201).scale_factor(), 10.0);
    }

    #[test]
    fn test_scores_are_bounded_cosines() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(7);
        let head = DistLinear::new(&mut store, "classifier", 3, 4, &mut rng);
        let x = arr2(&[[1.0, 2.0, 3.0], [-4.0, 0.5, 0.0]]);
        let scores = head.forward(&store, &x).unwrap();
        assert_eq!(scores.dim(), (2, 4));

        // With g = ‖v‖ the effective row norm equals ‖v‖, so divide it out.
        let v = view2(&store, "classifier.weight_v").unwrap().to_owned();
        for o in 0..4 {
            let n = v.row(o).dot(&v.row(o)).sqrt();
            for i in 0..2 {
                assert!((scores[[i, o]] / (2.0 * n)).abs() <= 1.0 + 1e-4);
            }
        }
    }

    #[test]
    fn test_zero_input_gets_finite_gradient() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(8);
        let head = DistLinear::new(&mut store, "classifier", 2, 2, &mut rng);
        let x = Array2::zeros((1, 2));
        let mut grads = ParamStore::new();
        let dx = head.backward(&store, &x, &Array2::ones((1, 2)), &mut grads).unwrap();
        assert!(dx.iter().all(|v| v.is_finite()));
    }
}
