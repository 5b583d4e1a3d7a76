//! Matrix algebra primitives of the Kalman recursion.
//!
//! [`FilterMatrixOps`] owns every scratch buffer it needs, so one instance per
//! estimator keeps concurrently running filters independent without locks.
//! Buffers are sized lazily on first use and reshaped in place afterwards, so
//! a tick with unchanged dimensions does not allocate.

use crate::types::{empty_mat, empty_vector, reshape, reshape_vector, set_identity, set_zero, Mat, Vector};

#[derive(Debug, Clone)]
pub struct FilterMatrixOps {
    /// `A * Pposterior`.
    covariance_product: Mat,
    /// `A'`.
    a_transposed: Mat,
    /// `H * P`.
    observation_product: Mat,
    /// `H'`.
    h_transposed: Mat,
    /// `P * H'`.
    gain_product: Mat,
    /// Innovation covariance `S = H * P * H' + R`.
    innovation_cov: Mat,
    /// `inverse(S)`.
    innovation_inv: Mat,
    /// `I - K * H`.
    update_factor: Mat,
    /// `z - H * x` when recombining a raw measurement.
    residual: Vector,
    /// Elimination workspace of the inversion.
    inversion_work: Mat,
}

impl Default for FilterMatrixOps {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterMatrixOps {
    pub fn new() -> Self {
        Self {
            covariance_product: empty_mat(),
            a_transposed: empty_mat(),
            observation_product: empty_mat(),
            h_transposed: empty_mat(),
            gain_product: empty_mat(),
            innovation_cov: empty_mat(),
            innovation_inv: empty_mat(),
            update_factor: empty_mat(),
            residual: empty_vector(),
            inversion_work: empty_mat(),
        }
    }

    /// Sets the provided matrix to
    /// `result = A * Pposterior * A' + Q`
    ///
    /// ## Arguments
    /// * `a` - The linearized state evolution: `x(k+1) = A * x(k)`.
    /// * `p_posterior` - The previous error covariance.
    /// * `q` - The covariance matrix of the state evolution.
    pub fn predict_error_covariance(&mut self, result: &mut Mat, a: &Mat, p_posterior: &Mat, q: &Mat) {
        compute_abat(result, a, p_posterior, &mut self.covariance_product, &mut self.a_transposed);
        *result += q;
    }

    /// Sets the provided matrix to
    /// `result = P * H' * inverse(H * P * H' + R)`
    ///
    /// Returns whether the inversion succeeded. On a singular innovation
    /// covariance `result` is zero-filled and `false` is returned.
    ///
    /// ## Arguments
    /// * `p` - The error covariance.
    /// * `h` - The measurement Jacobian.
    /// * `r` - The measurement covariance.
    pub fn compute_kalman_gain(&mut self, result: &mut Mat, p: &Mat, h: &Mat, r: &Mat) -> bool {
        compute_abat(
            &mut self.innovation_cov,
            h,
            p,
            &mut self.observation_product,
            &mut self.h_transposed,
        );
        self.innovation_cov += r;

        if !solve_inverse(&mut self.innovation_inv, &self.innovation_cov, &mut self.inversion_work) {
            set_zero(result, p.nrows(), h.nrows());
            return false;
        }

        reshape(&mut self.gain_product, p.nrows(), h.nrows());
        p.mul_to(&self.h_transposed, &mut self.gain_product);

        reshape(result, p.nrows(), h.nrows());
        self.gain_product.mul_to(&self.innovation_inv, result);
        true
    }

    /// Sets the provided vector to
    /// `result = xPrior + K * residual`
    ///
    /// This is the form the estimator uses: sensors already report the
    /// residual between their raw reading and the predicted measurement.
    pub fn update_state(&mut self, result: &mut Vector, k: &Mat, residual: &Vector, x_prior: &Vector) {
        reshape_vector(result, x_prior.nrows());
        result.copy_from(x_prior);
        result.gemv(1.0, k, residual, 1.0);
    }

    /// Sets the provided vector to
    /// `result = xPrior + K * (z - H * xPrior)`
    ///
    /// ## Arguments
    /// * `k` - The Kalman gain.
    /// * `z` - The raw measurement.
    /// * `h` - The measurement Jacobian.
    /// * `x_prior` - The state before the measurement update.
    pub fn update_state_with_measurement(
        &mut self,
        result: &mut Vector,
        k: &Mat,
        z: &Vector,
        h: &Mat,
        x_prior: &Vector,
    ) {
        reshape_vector(&mut self.residual, z.nrows());
        self.residual.copy_from(z);
        self.residual.gemv(-1.0, h, x_prior, 1.0);

        reshape_vector(result, x_prior.nrows());
        result.copy_from(x_prior);
        result.gemv(1.0, k, &self.residual, 1.0);
    }

    /// Sets the provided matrix to
    /// `result = (I - K * H) * pPrior`
    pub fn update_error_covariance(&mut self, result: &mut Mat, k: &Mat, h: &Mat, p_prior: &Mat) {
        let n = p_prior.nrows();
        reshape(&mut self.update_factor, n, n);
        k.mul_to(h, &mut self.update_factor);
        self.update_factor.neg_mut();
        for i in 0..n {
            self.update_factor[(i, i)] += 1.0;
        }

        reshape(result, n, n);
        self.update_factor.mul_to(p_prior, result);
    }

    /// Sets the provided matrix to `result = inverse(A)`.
    ///
    /// Returns `false` and zero-fills `result` if `A` is singular, leaving the
    /// fallback policy to the caller.
    pub fn invert_matrix(&mut self, result: &mut Mat, a: &Mat) -> bool {
        solve_inverse(result, a, &mut self.inversion_work)
    }
}

/// Sets the provided matrix to `result = A * B * A'`. `B` must be square.
fn compute_abat(result: &mut Mat, a: &Mat, b: &Mat, temp: &mut Mat, a_t: &mut Mat) {
    reshape(temp, a.nrows(), b.ncols());
    a.mul_to(b, temp);

    reshape(a_t, a.ncols(), a.nrows());
    a.transpose_to(a_t);

    reshape(result, a.nrows(), a.nrows());
    temp.mul_to(a_t, result);
}

/// Solves `A * result = I` by Gauss-Jordan elimination with partial pivoting.
/// `work` receives a copy of `A` and is reduced to the identity.
fn solve_inverse(result: &mut Mat, a: &Mat, work: &mut Mat) -> bool {
    let n = a.nrows();
    if a.ncols() != n {
        set_zero(result, n, a.ncols());
        return false;
    }

    reshape(work, n, n);
    work.copy_from(a);
    set_identity(result, n);

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| work[(i, col)].abs().total_cmp(&work[(j, col)].abs()))
            .unwrap_or(col);
        let pivot = work[(pivot_row, col)];
        if pivot == 0.0 || !pivot.is_finite() {
            result.fill(0.0);
            return false;
        }
        if pivot_row != col {
            work.swap_rows(col, pivot_row);
            result.swap_rows(col, pivot_row);
        }

        let inv_pivot = 1.0 / pivot;
        for c in 0..n {
            work[(col, c)] *= inv_pivot;
            result[(col, c)] *= inv_pivot;
        }

        for row in 0..n {
            let factor = work[(row, col)];
            if row == col || factor == 0.0 {
                continue;
            }
            for c in 0..n {
                let pivot_value = work[(col, c)];
                let pivot_inverse = result[(col, c)];
                work[(row, c)] -= factor * pivot_value;
                result[(row, c)] -= factor * pivot_inverse;
            }
        }
    }

    if result.iter().any(|v| !v.is_finite()) {
        result.fill(0.0);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Xorshift64;
    use approx::assert_relative_eq;

    fn random_matrix(rng: &mut Xorshift64, rows: usize, cols: usize) -> Mat {
        Mat::from_fn(rows, cols, |_, _| rng.uniform(-1.0, 1.0))
    }

    /// `M * M' + diag`, symmetric positive definite.
    fn random_spd(rng: &mut Xorshift64, size: usize) -> Mat {
        let m = random_matrix(rng, size, size);
        &m * m.transpose() + Mat::identity(size, size) * 0.5
    }

    #[test]
    fn test_predict_error_covariance() {
        let mut rng = Xorshift64::new(21);
        let mut ops = FilterMatrixOps::new();
        let a = random_matrix(&mut rng, 6, 6);
        let p = random_spd(&mut rng, 6);
        let q = random_spd(&mut rng, 6);

        let mut result = empty_mat();
        ops.predict_error_covariance(&mut result, &a, &p, &q);

        let expected = &a * &p * a.transpose() + &q;
        assert_relative_eq!(result, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_kalman_gain_well_conditioned() {
        let mut rng = Xorshift64::new(4711);
        let mut ops = FilterMatrixOps::new();
        let p = random_spd(&mut rng, 7);
        let h = random_matrix(&mut rng, 3, 7);
        let r = random_spd(&mut rng, 3);

        let mut k = empty_mat();
        assert!(ops.compute_kalman_gain(&mut k, &p, &h, &r));
        assert_eq!(k.shape(), (7, 3));

        let s = &h * &p * h.transpose() + &r;
        assert_relative_eq!(&k * s, &p * h.transpose(), epsilon = 1e-9);
    }

    #[test]
    fn test_kalman_gain_singular_innovation() {
        let mut ops = FilterMatrixOps::new();
        let p = Mat::identity(4, 4);
        let h = Mat::zeros(2, 4);
        let r = Mat::zeros(2, 2);

        let mut k = Mat::from_element(1, 1, 5.0);
        assert!(!ops.compute_kalman_gain(&mut k, &p, &h, &r));
        assert_eq!(k.shape(), (4, 2));
        assert!(k.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_kalman_gain_recovers_after_failure() {
        let mut ops = FilterMatrixOps::new();
        let p = Mat::identity(2, 2);
        let h = Mat::identity(2, 2);
        let mut k = empty_mat();

        assert!(!ops.compute_kalman_gain(&mut k, &p, &Mat::zeros(2, 2), &Mat::zeros(2, 2)));
        assert!(ops.compute_kalman_gain(&mut k, &p, &h, &Mat::identity(2, 2)));
        assert_relative_eq!(k, Mat::identity(2, 2) * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_observation() {
        let mut ops = FilterMatrixOps::new();
        let p = Mat::identity(3, 3);
        let h = Mat::zeros(0, 3);
        let r = Mat::zeros(0, 0);
        let mut k = empty_mat();

        assert!(ops.compute_kalman_gain(&mut k, &p, &h, &r));
        assert_eq!(k.shape(), (3, 0));

        let mut p_post = empty_mat();
        ops.update_error_covariance(&mut p_post, &k, &h, &p);
        assert_eq!(p_post, p);
    }

    #[test]
    fn test_update_state() {
        let mut ops = FilterMatrixOps::new();
        let k = Mat::from_row_slice(2, 1, &[0.5, 0.25]);
        let residual = Vector::from_vec(vec![2.0]);
        let x_prior = Vector::from_vec(vec![1.0, -1.0]);

        let mut x = empty_vector();
        ops.update_state(&mut x, &k, &residual, &x_prior);
        assert_relative_eq!(x, Vector::from_vec(vec![2.0, -0.5]), epsilon = 1e-12);
    }

    #[test]
    fn test_update_state_with_measurement_matches_residual_form() {
        let mut rng = Xorshift64::new(99);
        let mut ops = FilterMatrixOps::new();
        let k = random_matrix(&mut rng, 5, 2);
        let h = random_matrix(&mut rng, 2, 5);
        let x_prior = Vector::from_fn(5, |_, _| rng.uniform(-2.0, 2.0));
        let z = Vector::from_fn(2, |_, _| rng.uniform(-2.0, 2.0));

        let mut from_measurement = empty_vector();
        ops.update_state_with_measurement(&mut from_measurement, &k, &z, &h, &x_prior);

        let residual = &z - &h * &x_prior;
        let mut from_residual = empty_vector();
        ops.update_state(&mut from_residual, &k, &residual, &x_prior);

        assert_relative_eq!(from_measurement, from_residual, epsilon = 1e-12);
    }

    #[test]
    fn test_update_error_covariance() {
        let mut rng = Xorshift64::new(7);
        let mut ops = FilterMatrixOps::new();
        let k = random_matrix(&mut rng, 4, 2);
        let h = random_matrix(&mut rng, 2, 4);
        let p = random_spd(&mut rng, 4);

        let mut result = empty_mat();
        ops.update_error_covariance(&mut result, &k, &h, &p);

        let expected = (Mat::identity(4, 4) - &k * &h) * &p;
        assert_relative_eq!(result, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_invert_matrix() {
        let mut rng = Xorshift64::new(3);
        let mut ops = FilterMatrixOps::new();
        let a = random_spd(&mut rng, 9);

        let mut inv = empty_mat();
        assert!(ops.invert_matrix(&mut inv, &a));
        assert_relative_eq!(&a * &inv, Mat::identity(9, 9), epsilon = 1e-9);

        let singular = Mat::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(!ops.invert_matrix(&mut inv, &singular));
        assert_eq!(inv.shape(), (2, 2));
        assert!(inv.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_buffers_follow_changing_sizes() {
        let mut rng = Xorshift64::new(12);
        let mut ops = FilterMatrixOps::new();
        let mut k = empty_mat();

        for (n, m) in [(6, 4), (2, 1), (9, 3)] {
            let p = random_spd(&mut rng, n);
            let h = random_matrix(&mut rng, m, n);
            let r = random_spd(&mut rng, m);
            assert!(ops.compute_kalman_gain(&mut k, &p, &h, &r));
            assert_eq!(k.shape(), (n, m));
        }
    }

    #[test]
    fn test_gain_matches_closed_form() {
        let mut rng = Xorshift64::new(58);
        let mut ops = FilterMatrixOps::new();
        let a = random_matrix(&mut rng, 5, 5);
        let p = random_spd(&mut rng, 5);
        let q = random_spd(&mut rng, 5);
        let h = random_matrix(&mut rng, 2, 5);
        let r = random_spd(&mut rng, 2);

        let mut p_prior = empty_mat();
        let mut k = empty_mat();
        ops.predict_error_covariance(&mut p_prior, &a, &p, &q);
        assert!(ops.compute_kalman_gain(&mut k, &p_prior, &h, &r));

        let expected_prior = &a * &p * a.transpose() + &q;
        let s = &h * &expected_prior * h.transpose() + &r;
        let expected_k = &expected_prior * h.transpose() * s.try_inverse().unwrap();
        assert_relative_eq!(p_prior, expected_prior, epsilon = 1e-10);
        assert_relative_eq!(k, expected_k, epsilon = 1e-9);
    }

    #[test]
    fn test_scratch_buffers_reused() {
        let mut rng = Xorshift64::new(5);
        let mut ops = FilterMatrixOps::new();
        let a = random_matrix(&mut rng, 6, 6);
        let q = random_spd(&mut rng, 6);
        let h = random_matrix(&mut rng, 3, 6);
        let r = random_spd(&mut rng, 3);
        let mut p = random_spd(&mut rng, 6);
        let mut p_prior = empty_mat();
        let mut k = empty_mat();

        let mut tick = |ops: &mut FilterMatrixOps, p: &mut Mat| {
            ops.predict_error_covariance(&mut p_prior, &a, p, &q);
            assert!(ops.compute_kalman_gain(&mut k, &p_prior, &h, &r));
            ops.update_error_covariance(p, &k, &h, &p_prior);
        };
        let buffers = |ops: &FilterMatrixOps| {
            [
                ops.covariance_product.as_ptr(),
                ops.a_transposed.as_ptr(),
                ops.observation_product.as_ptr(),
                ops.h_transposed.as_ptr(),
                ops.gain_product.as_ptr(),
                ops.innovation_cov.as_ptr(),
                ops.innovation_inv.as_ptr(),
                ops.update_factor.as_ptr(),
                ops.inversion_work.as_ptr(),
            ]
        };

        tick(&mut ops, &mut p);
        let first = buffers(&ops);
        for _ in 0..3 {
            tick(&mut ops, &mut p);
            assert_eq!(buffers(&ops), first);
        }
    }
}
