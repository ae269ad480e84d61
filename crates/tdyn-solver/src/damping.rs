//! Mass-proportional (Rayleigh) damping, `C = α·M`.

use crate::lumping::LumpedMass;
use crate::sparse::diagonal_csr;
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};

/// Mass-proportional damping model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DampingModel {
    /// Mass-proportional coefficient α (1/s)
    pub alpha: f64,
}

impl DampingModel {
    /// Undamped model (α = 0).
    pub fn none() -> Self {
        Self { alpha: 0.0 }
    }

    /// Damping with a directly supplied coefficient.
    pub fn mass_proportional(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Coefficient matching a target loss tangent at one frequency.
    ///
    /// Mass-proportional damping gives a modal damping ratio `ζ = α/(2ω)`,
    /// and the loss tangent is `η = 2ζ`, so `α = η·ω` with `ω = 2πf`.
    pub fn from_loss_tangent(loss_tangent: f64, frequency_hz: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * frequency_hz;
        Self {
            alpha: loss_tangent * omega,
        }
    }

    /// Modal damping ratio this model produces at angular frequency `omega`.
    pub fn damping_ratio(&self, omega: f64) -> f64 {
        self.alpha / (2.0 * omega)
    }

    /// `C = α·M_d`, diagonal like the lumped mass.
    pub fn damping_matrix(&self, mass: &LumpedMass) -> CsrMatrix<f64> {
        diagonal_csr(&(&mass.diagonal * self.alpha))
    }
}
