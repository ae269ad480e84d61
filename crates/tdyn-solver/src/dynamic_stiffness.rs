//! Effective dynamic stiffness `D = M + (dt/2)·C + (dt/2)²·K` and its
//! sparse Cholesky factor.
//!
//! `D` is symmetric positive definite whenever `M` is, `C` and `K` are
//! positive semi-definite and `dt > 0`. It is factored once per step size and
//! the factor is reused for every right-hand side of the time loop.

use crate::error::{Result, SolverError};
use crate::sparse::linear_combination_csc;
use crate::system::SystemMatrices;
use nalgebra::{DMatrixViewMut, DVector};
use nalgebra_sparse::factorization::CscCholesky;
use std::fmt;
use tracing::debug;

/// Cholesky-factored dynamic stiffness operator for one step size.
///
/// The factor is never modified after construction, so repeated solves with
/// the same right-hand side return identical results.
pub struct DynamicStiffness {
    factor: CscCholesky<f64>,
    dt: f64,
    dimension: usize,
    nnz: usize,
}

impl fmt::Debug for DynamicStiffness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicStiffness")
            .field("dt", &self.dt)
            .field("dimension", &self.dimension)
            .field("nnz", &self.nnz)
            .finish()
    }
}

impl DynamicStiffness {
    /// Assemble and factor `D` for step `dt`.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if `dt` is not positive and finite
    /// - `SingularSystem` if `D` has non-finite entries or is not positive definite
    pub fn factor(system: &SystemMatrices, dt: f64) -> Result<Self> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(SolverError::invalid(format!(
                "time step must be positive and finite, got {dt}"
            )));
        }

        let n = system.dimension();
        let half = 0.5 * dt;
        let d = linear_combination_csc(
            n,
            &[
                (1.0, &system.mass),
                (half, &system.damping),
                (half * half, &system.stiffness),
            ],
        )?;

        if d.values().iter().any(|v| !v.is_finite()) {
            return Err(SolverError::SingularSystem(
                "dynamic stiffness has non-finite entries".to_string(),
            ));
        }

        let nnz = d.nnz();
        let factor = CscCholesky::factor(&d).map_err(|e| {
            SolverError::SingularSystem(format!(
                "dynamic stiffness is not positive definite for dt = {dt:.6e} ({e:?})"
            ))
        })?;
        debug!(dt, dimension = n, nnz, "factored dynamic stiffness");

        Ok(Self {
            factor,
            dt,
            dimension: n,
            nnz,
        })
    }

    /// Step size this factor was built for.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stored entries of `D` before factorization.
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Solve `D·x = b`.
    pub fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let mut x = DVector::zeros(self.dimension);
        self.solve_into(rhs, &mut x)?;
        Ok(x)
    }

    /// Solve `D·x = b` into a caller-owned buffer.
    pub fn solve_into(&self, rhs: &DVector<f64>, x: &mut DVector<f64>) -> Result<()> {
        if rhs.len() != self.dimension || x.len() != self.dimension {
            return Err(SolverError::invalid(format!(
                "right-hand side has {} entries, operator has {}",
                rhs.len(),
                self.dimension
            )));
        }

        x.copy_from(rhs);
        let view = DMatrixViewMut::from_slice(x.as_mut_slice(), self.dimension, 1);
        self.factor.solve_mut(view);

        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::SingularSystem(
                "solve produced non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{csr_from_triplets, diagonal_csr};
    use nalgebra::DMatrix;

    fn chain_system(n: usize, alpha: f64) -> SystemMatrices {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for i in 0..n {
            rows.push(i);
            cols.push(i);
            vals.push(2.0);
            if i + 1 < n {
                rows.extend([i, i + 1]);
                cols.extend([i + 1, i]);
                vals.extend([-1.0, -1.0]);
            }
        }
        let k = csr_from_triplets(n, n, rows, cols, vals).unwrap();
        let m = DVector::from_fn(n, |i, _| 1.0 + i as f64);
        SystemMatrices::new(diagonal_csr(&m), diagonal_csr(&(&m * alpha)), k).unwrap()
    }

    #[test]
    fn solves_against_dense_operator() {
        let system = chain_system(5, 0.3);
        let dt = 0.2;
        let op = DynamicStiffness::factor(&system, dt).unwrap();

        let dense = DMatrix::from(&system.mass)
            + DMatrix::from(&system.damping) * (dt / 2.0)
            + DMatrix::from(&system.stiffness) * (dt * dt / 4.0);
        let b = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, 0.0]);
        let x = op.solve(&b).unwrap();
        let residual = (&dense * &x - &b).norm();
        assert!(residual < 1e-12, "residual {residual}");
        assert_eq!(op.dimension(), 5);
        assert_eq!(op.dt(), dt);
    }

    #[test]
    fn repeated_solves_are_identical() {
        let system = chain_system(8, 0.0);
        let op = DynamicStiffness::factor(&system, 0.05).unwrap();
        let b = DVector::from_fn(8, |i, _| (i as f64).sin());
        let first = op.solve(&b).unwrap();
        let second = op.solve(&b).unwrap();
        assert_eq!(first, second);

        let mut buffer = DVector::from_element(8, 99.0);
        op.solve_into(&b, &mut buffer).unwrap();
        assert_eq!(buffer, first);
    }

    #[test]
    fn rejects_non_positive_step() {
        let system = chain_system(3, 0.0);
        for dt in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            let err = DynamicStiffness::factor(&system, dt);
            assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))), "dt = {dt}");
        }
    }

    #[test]
    fn indefinite_operator_is_singular() {
        let m = diagonal_csr(&DVector::from_vec(vec![1.0, 1.0]));
        let k = diagonal_csr(&DVector::from_vec(vec![1.0, -1000.0]));
        let c = diagonal_csr(&DVector::zeros(2));
        let system = SystemMatrices::new(m, c, k).unwrap();
        let err = DynamicStiffness::factor(&system, 1.0);
        assert!(matches!(err, Err(SolverError::SingularSystem(_))));
    }

    #[test]
    fn rejects_wrong_rhs_length() {
        let system = chain_system(3, 0.0);
        let op = DynamicStiffness::factor(&system, 0.1).unwrap();
        let err = op.solve(&DVector::zeros(4));
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }
}
