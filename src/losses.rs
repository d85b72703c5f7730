// --- File: src/losses.rs ---

//! Loss functions with their gradients.
//!
//! Every loss returns the scalar value together with `dL/d(logits)`, which is
//! what the inner loops and the outer training step feed into
//! [`Module::backward`](crate::nn::Module::backward).

use crate::error::{FewShotError, Result};
use ndarray::{Array2, Axis};

/// Row-wise log-softmax, shifted by the row maximum for stability.
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Row-wise softmax.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    log_softmax(logits).mapv(f32::exp)
}

/// Cross-entropy between logits and integer targets, averaged over rows.
///
/// Formula: `CE = -mean_i log softmax(z_i)[t_i]`.
///
/// # Returns
///
/// `(loss, grad)` where `grad = (softmax(z) - onehot(t)) / n`.
///
/// # Errors
///
/// Fails on an empty batch, on a target/row count mismatch and on a target
/// outside `0..classes`.
pub fn cross_entropy(logits: &Array2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)> {
    let (n, classes) = logits.dim();
    if n == 0 {
        return Err(FewShotError::shape("cross_entropy", &[1, classes], &[0, classes]));
    }
    if targets.len() != n {
        return Err(FewShotError::shape("cross_entropy targets", &[n], &[targets.len()]));
    }
    if let Some(&label) = targets.iter().find(|&&t| t >= classes) {
        return Err(FewShotError::LabelOutOfRange { label, classes });
    }

    let log_probs = log_softmax(logits);
    let mut grad = log_probs.mapv(f32::exp);
    let mut loss = 0.0f32;
    for (i, &t) in targets.iter().enumerate() {
        loss -= log_probs[[i, t]];
        grad[[i, t]] -= 1.0;
    }
    let inv_n = 1.0 / n as f32;
    grad.mapv_inplace(|g| g * inv_n);
    Ok((loss * inv_n, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax(&arr2(&[[1.0, 2.0, 3.0], [1000.0, 1000.0, -1000.0]]));
        for row in p.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert_abs_diff_eq!(p[[1, 0]], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_uniform_logits_give_log_classes() {
        let (loss, grad) = cross_entropy(&Array2::zeros((4, 5)), &[0, 1, 2, 3]).unwrap();
        assert_abs_diff_eq!(loss, (5.0f32).ln(), epsilon = 1e-5);
        // Each row of the gradient sums to zero.
        for row in grad.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(grad[[0, 0]], (0.2 - 1.0) / 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cross_entropy_validates_targets() {
        let logits = Array2::zeros((2, 3));
        assert!(matches!(
            cross_entropy(&logits, &[0, 3]),
            Err(FewShotError::LabelOutOfRange { label: 3, classes: 3 })
        ));
        assert!(cross_entropy(&logits, &[0]).is_err());
        assert!(cross_entropy(&Array2::zeros((0, 3)), &[]).is_err());
    }
}
