//! Element-wise activations used between layers.

use ndarray::Array2;

/// Rectified linear unit, `max(0, x)`. Has no parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| v.max(0.0))
    }

    /// Passes the gradient only where the pre-activation was positive.
    pub fn backward(&self, pre_activation: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
        let mut grad = grad_output.clone();
        ndarray::azip!((g in &mut grad, &x in pre_activation) if x <= 0.0 { *g = 0.0 });
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_relu_masks_gradient() {
        let relu = ReLU::new();
        let x = arr2(&[[-1.0, 2.0], [0.0, 3.0]]);
        assert_eq!(relu.forward(&x), arr2(&[[0.0, 2.0], [0.0, 3.0]]));
        let g = relu.backward(&x, &arr2(&[[5.0, 5.0], [5.0, 5.0]]));
        assert_eq!(g, arr2(&[[0.0, 5.0], [0.0, 5.0]]));
    }
}
