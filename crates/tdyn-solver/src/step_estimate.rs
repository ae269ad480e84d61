//! Time-step estimate from the dominant eigenvalue of `(K, M)`.
//!
//! The trapezoidal rule is unconditionally stable, so the estimate controls
//! accuracy only: `2/√λ_max` is the period scale of the highest mode, and the
//! safety multiplier picks how many of those periods one step may span.
//!
//! `λ_max` comes from a Lanczos iteration on the symmetric operator
//! `A = M^{-1/2}·K·M^{-1/2}`, which has the same spectrum as `K·φ = λ·M·φ`
//! when `M` is diagonal. Only sparse matrix-vector products with `K` are
//! needed. The Lanczos basis is fully re-orthogonalized, which keeps the
//! tridiagonal projection free of spurious copies for the small iteration
//! counts used here.

use crate::error::{Result, SolverError};
use crate::lumping::LumpedMass;
use crate::sparse::{ensure_square, spmv};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default step multiplier on `2/√λ_max`.
pub const DEFAULT_SAFETY_MULTIPLIER: f64 = 10.0;

/// Default Lanczos iteration budget.
pub const DEFAULT_MAX_ITERATIONS: usize = 300;

/// Default bound on the Ritz residual relative to `λ_max`.
///
/// The estimate only sizes an unconditionally stable step, so three digits
/// of `λ_max` are plenty.
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

/// Result of a step-size estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepEstimate {
    /// Largest generalized eigenvalue λ_max = ω_max²
    pub lambda_max: f64,
    /// Suggested step `s·2/√λ_max`
    pub time_step: f64,
    /// Lanczos iterations used
    pub iterations: usize,
}

impl StepEstimate {
    /// Highest angular frequency ω_max (rad/s).
    pub fn omega_max(&self) -> f64 {
        self.lambda_max.sqrt()
    }
}

/// Estimates an accurate integration step from `(K, M)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StableStepEstimator {
    /// Multiplier `s` on `2/√λ_max`
    pub safety_multiplier: f64,
    /// Lanczos iteration budget
    pub max_iterations: usize,
    /// Bound on `β·|s_last|` relative to the Ritz value
    pub tolerance: f64,
}

impl Default for StableStepEstimator {
    fn default() -> Self {
        Self {
            safety_multiplier: DEFAULT_SAFETY_MULTIPLIER,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl StableStepEstimator {
    pub fn new(safety_multiplier: f64) -> Self {
        Self {
            safety_multiplier,
            ..Default::default()
        }
    }

    /// Set the iteration budget and tolerance.
    pub fn with_budget(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.max_iterations = max_iterations;
        self.tolerance = tolerance;
        self
    }

    /// Estimate `dt = s·2/√λ_max`.
    ///
    /// # Errors
    /// - `EigenNotConverged` if Lanczos exhausts its budget
    /// - `InvalidConfiguration` for a non-positive multiplier, mismatched
    ///   dimensions or a stiffness without positive eigenvalues
    /// - `SingularMass` if the lumped mass has non-positive entries
    pub fn estimate(&self, stiffness: &CsrMatrix<f64>, mass: &LumpedMass) -> Result<StepEstimate> {
        if !(self.safety_multiplier > 0.0 && self.safety_multiplier.is_finite()) {
            return Err(SolverError::invalid(format!(
                "safety multiplier must be positive, got {}",
                self.safety_multiplier
            )));
        }

        let (lambda_max, iterations) = self.largest_eigenvalue(stiffness, mass)?;
        if lambda_max <= 0.0 {
            return Err(SolverError::invalid(format!(
                "stiffness has no positive eigenvalue (λ_max = {lambda_max:.3e})"
            )));
        }

        let time_step = self.safety_multiplier * 2.0 / lambda_max.sqrt();
        info!(lambda_max, iterations, time_step, "estimated time step");

        Ok(StepEstimate {
            lambda_max,
            time_step,
            iterations,
        })
    }

    /// Largest eigenvalue of `K·φ = λ·M·φ` and the iterations it took.
    ///
    /// Stops once the residual bound `β_j·|s_j|` of the largest Ritz pair
    /// falls below `tolerance·θ`, or when the Krylov space becomes invariant.
    /// Agreement between successive Ritz values is not a stopping test: on
    /// long chains the top value creeps upward for many iterations.
    pub fn largest_eigenvalue(
        &self,
        stiffness: &CsrMatrix<f64>,
        mass: &LumpedMass,
    ) -> Result<(f64, usize)> {
        let n = mass.dimension();
        if n == 0 {
            return Err(SolverError::invalid("cannot estimate eigenvalues of an empty system"));
        }
        ensure_square("stiffness", stiffness, n)?;
        if self.max_iterations == 0 {
            return Err(SolverError::invalid("eigenvalue iteration budget must be positive"));
        }
        if let Some((dof, &m)) = mass.diagonal.iter().enumerate().find(|(_, m)| **m <= 0.0) {
            return Err(SolverError::SingularMass(format!(
                "DOF {dof} has mass {m:.3e}, cannot scale stiffness"
            )));
        }

        let inv_sqrt_mass = mass.diagonal.map(|m| 1.0 / m.sqrt());

        let mut basis: Vec<DVector<f64>> = Vec::new();
        let mut alphas: Vec<f64> = Vec::new();
        let mut betas: Vec<f64> = Vec::new();

        let mut q = start_vector(n);
        let mut w = DVector::zeros(n);
        let mut scaled = DVector::zeros(n);
        let mut estimate = 0.0;

        for iteration in 1..=self.max_iterations {
            // w = M^{-1/2} K M^{-1/2} q
            scaled.copy_from(&q);
            scaled.component_mul_assign(&inv_sqrt_mass);
            spmv(stiffness, &scaled, &mut w);
            w.component_mul_assign(&inv_sqrt_mass);

            let alpha = q.dot(&w);
            w.axpy(-alpha, &q, 1.0);
            if let (Some(prev_q), Some(&beta_prev)) = (basis.last(), betas.last()) {
                w.axpy(-beta_prev, prev_q, 1.0);
            }
            basis.push(q.clone());
            for b in &basis {
                let overlap = b.dot(&w);
                w.axpy(-overlap, b, 1.0);
            }

            alphas.push(alpha);
            let beta = w.norm();

            let (theta, last_component) = largest_ritz_pair(&alphas, &betas);
            estimate = theta;
            let residual = beta * last_component.abs();
            let scale = theta.abs().max(f64::MIN_POSITIVE);
            debug!(iteration, theta, residual, "lanczos iteration");

            let invariant = beta <= f64::EPSILON * scale || basis.len() == n;
            if residual <= self.tolerance * scale || invariant {
                return Ok((theta, iteration));
            }

            betas.push(beta);
            q.copy_from(&w);
            q /= beta;
        }

        Err(SolverError::EigenNotConverged {
            iterations: self.max_iterations,
            last_estimate: estimate,
        })
    }
}

/// Deterministic unit start vector with entries spread over `[-1, 1)`.
///
/// A smooth start barely excites the oscillatory top modes of a chain, so
/// each entry is hashed from its index (splitmix64 finalizer).
fn start_vector(n: usize) -> DVector<f64> {
    let v = DVector::from_fn(n, |i, _| {
        let mut z = (i as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        // top 53 bits as a fraction in [0, 1)
        2.0 * ((z >> 11) as f64 / (1u64 << 53) as f64) - 1.0
    });
    let norm = v.norm();
    v / norm
}

/// Largest eigenvalue of the Lanczos tridiagonal and the last component of
/// its eigenvector.
fn largest_ritz_pair(alphas: &[f64], betas: &[f64]) -> (f64, f64) {
    let j = alphas.len();
    let mut t = DMatrix::zeros(j, j);
    for (i, &a) in alphas.iter().enumerate() {
        t[(i, i)] = a;
    }
    for (i, &b) in betas.iter().enumerate().take(j.saturating_sub(1)) {
        t[(i, i + 1)] = b;
        t[(i + 1, i)] = b;
    }

    let eigen = SymmetricEigen::new(t);
    let (index, &theta) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, &f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
    (theta, eigen.eigenvectors[(j - 1, index)])
}
