//! Small dense linear-algebra helpers for the bandit posteriors.
//!
//! The matrices involved are at most ~20×20, so a straightforward Cholesky
//! factorization is enough and keeps the crate free of a LAPACK dependency.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;

/// Lower-triangular `L` with `matrix = L·Lᵀ`, or `None` when the matrix is not
/// symmetric positive definite (or contains non-finite entries).
pub fn cholesky(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return None;
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = matrix[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag.is_finite() && diag > 0.0) {
            return None;
        }
        let pivot = diag.sqrt();
        l[[j, j]] = pivot;

        for i in (j + 1)..n {
            let mut value = matrix[[i, j]];
            for k in 0..j {
                value -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = value / pivot;
        }
    }
    Some(l)
}

/// Inverse of a symmetric positive-definite matrix via its Cholesky factor.
pub fn invert_spd(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let l = cholesky(matrix)?;
    let n = l.nrows();

    // Forward substitution, one unit vector at a time: L · X = I.
    let mut l_inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        for i in col..n {
            let mut sum = if i == col { 1.0 } else { 0.0 };
            for k in col..i {
                sum -= l[[i, k]] * l_inv[[k, col]];
            }
            l_inv[[i, col]] = sum / l[[i, i]];
        }
    }

    let inverse = l_inv.t().dot(&l_inv);
    if inverse.iter().all(|v| v.is_finite()) {
        Some(inverse)
    } else {
        None
    }
}

/// Draw from `N(mean, covariance)`. `None` when the covariance cannot be factored.
pub fn sample_mvn<R: Rng + ?Sized>(
    mean: &Array1<f64>,
    covariance: &Array2<f64>,
    rng: &mut R,
) -> Option<Array1<f64>> {
    if mean.len() != covariance.nrows() {
        return None;
    }
    let l = cholesky(covariance)?;
    let z: Array1<f64> = (0..mean.len())
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    Some(mean + &l.dot(&z))
}

/// `xᵀ · M · x`
pub fn quadratic_form(x: &Array1<f64>, matrix: &Array2<f64>) -> f64 {
    x.dot(&matrix.dot(x))
}

/// Scaled identity matrix.
pub fn scaled_identity(n: usize, scale: f64) -> Array2<f64> {
    Array2::eye(n) * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let m = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let l = cholesky(&m).unwrap();
        assert_close(&l.dot(&l.t()), &m, 1e-12);
        assert_eq!(l[[0, 1]], 0.0);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let m = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&m).is_none());

        let nan = array![[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(cholesky(&nan).is_none());
    }

    #[test]
    fn test_invert_spd() {
        let m = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let inv = invert_spd(&m).unwrap();
        assert_close(&m.dot(&inv), &Array2::eye(3), 1e-10);
    }

    #[test]
    fn test_sample_mvn_is_seeded_and_centered() {
        let mean = array![1.0, -2.0];
        let cov = scaled_identity(2, 0.01);

        let mut a = StdRng::seed_from_u64(3);
        let mut b = StdRng::seed_from_u64(3);
        assert_eq!(
            sample_mvn(&mean, &cov, &mut a).unwrap(),
            sample_mvn(&mean, &cov, &mut b).unwrap()
        );

        let mut rng = StdRng::seed_from_u64(11);
        let n = 2000;
        let mut acc = Array1::<f64>::zeros(2);
        for _ in 0..n {
            acc += &sample_mvn(&mean, &cov, &mut rng).unwrap();
        }
        acc /= n as f64;
        assert!((acc[0] - 1.0).abs() < 0.02);
        assert!((acc[1] + 2.0).abs() < 0.02);
    }

    #[test]
    fn test_quadratic_form() {
        let x = array![1.0, 2.0];
        let m = array![[2.0, 0.0], [0.0, 3.0]];
        assert!((quadratic_form(&x, &m) - 14.0).abs() < 1e-12);
    }
}
