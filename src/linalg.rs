// --- File: src/linalg.rs ---

//! Small dense linear-algebra helpers on top of `ndarray`.
//!
//! The ridge-regression head only ever solves `(SSᵀ + γI) X = B` with
//! `n_support` rows (tens, not thousands), so a pivoted Gaussian
//! elimination is all that is needed.

use crate::error::{FewShotError, Result};
use ndarray::{s, Array2};

/// Pivots smaller than this are treated as zero.
const PIVOT_EPS: f32 = 1e-10;

/// Linear kernel between the rows of `a` (`[n, d]`) and `b` (`[m, d]`).
///
/// Returns `a bᵀ` with shape `[n, m]`.
pub fn gram_matrix(a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
    if a.ncols() != b.ncols() {
        return Err(FewShotError::shape("gram_matrix", &[b.nrows(), a.ncols()], b.shape()));
    }
    Ok(a.dot(&b.t()))
}

/// Solves `a x = b` for a square `a` and any number of right-hand sides.
///
/// Gaussian elimination with partial pivoting, accumulated in `f64`.
///
/// # Errors
///
/// [`FewShotError::SingularMatrix`] when a pivot vanishes.
pub fn solve(a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(FewShotError::shape("solve", &[n, n], a.shape()));
    }
    if b.nrows() != n {
        return Err(FewShotError::shape("solve rhs", &[n, b.ncols()], b.shape()));
    }
    let m = b.ncols();

    // Augmented matrix [A | B].
    let mut aug = Array2::<f64>::zeros((n, n + m));
    aug.slice_mut(s![.., ..n]).assign(&a.mapv(f64::from));
    aug.slice_mut(s![.., n..]).assign(&b.mapv(f64::from));

    for col in 0..n {
        let mut pivot_row = col;
        for row in (col + 1)..n {
            if aug[[row, col]].abs() > aug[[pivot_row, col]].abs() {
                pivot_row = row;
            }
        }
        let pivot = aug[[pivot_row, col]];
        if pivot.abs() < PIVOT_EPS as f64 {
            return Err(FewShotError::SingularMatrix {
                row: col,
                pivot: pivot as f32,
            });
        }
        if pivot_row != col {
            for j in 0..(n + m) {
                aug.swap([col, j], [pivot_row, j]);
            }
        }
        for row in (col + 1)..n {
            let factor = aug[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..(n + m) {
                aug[[row, j]] -= factor * aug[[col, j]];
            }
        }
    }

    // Back substitution.
    let mut x = Array2::<f64>::zeros((n, m));
    for row in (0..n).rev() {
        for k in 0..m {
            let mut acc = aug[[row, n + k]];
            for j in (row + 1)..n {
                acc -= aug[[row, j]] * x[[j, k]];
            }
            x[[row, k]] = acc / aug[[row, row]];
        }
    }
    Ok(x.mapv(|v| v as f32))
}

/// Inverse of a square matrix, `solve(a, I)`.
pub fn inverse(a: &Array2<f32>) -> Result<Array2<f32>> {
    solve(a, &Array2::eye(a.nrows()))
}

/// One-hot encoding, `[len, depth]`.
pub fn one_hot(indices: &[usize], depth: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((indices.len(), depth));
    for (i, &idx) in indices.iter().enumerate() {
        if idx >= depth {
            return Err(FewShotError::LabelOutOfRange {
                label: idx,
                classes: depth,
            });
        }
        encoded[[i, idx]] = 1.0;
    }
    Ok(encoded)
}
