// --- File: src/metrics/classification.rs ---

//! Top-k accuracy over logits.

use crate::error::{FewShotError, Result};
use ndarray::Array2;

/// Top-k accuracy in percent for every `k` in `topk`.
///
/// A row counts as correct for `k` when its target is among the `k`
/// highest scores, equal scores ordered by class index. `k` is clamped to the number of classes, so asking for
/// top-3 on a 2-way episode reports 100.
pub fn accuracy(output: &Array2<f32>, targets: &[usize], topk: &[usize]) -> Result<Vec<f64>> {
    let (n, classes) = output.dim();
    if targets.len() != n {
        return Err(FewShotError::shape("accuracy targets", &[n], &[targets.len()]));
    }
    if n == 0 {
        return Ok(vec![0.0; topk.len()]);
    }

    // Rank of the target inside each row. Ties go to the lower class index,
    // so a row of equal scores predicts class 0.
    let mut ranks = Vec::with_capacity(n);
    for (row, &t) in output.rows().into_iter().zip(targets) {
        if t >= classes {
            return Err(FewShotError::LabelOutOfRange { label: t, classes });
        }
        let target_score = row[t];
        let rank = row
            .iter()
            .enumerate()
            .filter(|&(j, &s)| s > target_score || (s == target_score && j < t))
            .count();
        ranks.push(rank);
    }

    Ok(topk
        .iter()
        .map(|&k| {
            let k = k.min(classes);
            let correct = ranks.iter().filter(|&&r| r < k).count();
            100.0 * correct as f64 / n as f64
        })
        .collect())
}

/// Top-1 accuracy in percent.
pub fn top1(output: &Array2<f32>, targets: &[usize]) -> Result<f64> {
    Ok(accuracy(output, targets, &[1])?[0])
}

/// Arg-max class per row.
pub fn predictions(output: &Array2<f32>) -> Vec<usize> {
    output
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_top1_and_top2() {
        let output = arr2(&[
            [0.7, 0.2, 0.1], // pred 0
            [0.1, 0.8, 0.1], // pred 1
            [0.5, 0.3, 0.2], // pred 0, target second best
            [0.1, 0.2, 0.7], // pred 2
        ]);
        let targets = [0, 1, 1, 0];
        let acc = accuracy(&output, &targets, &[1, 2, 3]).unwrap();
        assert_abs_diff_eq!(acc[0], 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc[1], 75.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc[2], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tied_scores_are_not_all_correct() {
        // A constant predictor picks class 0 for every row.
        let output = Array2::<f32>::zeros((5, 5));
        let targets = [0, 1, 2, 3, 4];
        assert_abs_diff_eq!(top1(&output, &targets).unwrap(), 20.0, epsilon = 1e-9);
        let acc = accuracy(&output, &targets, &[2, 5]).unwrap();
        assert_abs_diff_eq!(acc[0], 40.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc[1], 100.0, epsilon = 1e-9);
        assert_eq!(predictions(&output), vec![0; 5]);

        // Partial tie: target 2 ties with class 1 and ranks behind it.
        let output = arr2(&[[0.1, 0.5, 0.5]]);
        assert_eq!(accuracy(&output, &[2], &[1, 2]).unwrap(), vec![0.0, 100.0]);
        assert_eq!(accuracy(&output, &[1], &[1]).unwrap(), vec![100.0]);
    }

    #[test]
    fn test_topk_clamped_to_classes() {
        let output = arr2(&[[0.1, 0.9], [0.8, 0.2]]);
        let acc = accuracy(&output, &[0, 1], &[1, 3]).unwrap();
        assert_eq!(acc, vec![0.0, 100.0]);
    }

    #[test]
    fn test_invalid_targets() {
        let output = arr2(&[[0.1, 0.9]]);
        assert!(accuracy(&output, &[2], &[1]).is_err());
        assert!(accuracy(&output, &[0, 1], &[1]).is_err());
        assert_eq!(predictions(&output), vec![1]);
    }
}
