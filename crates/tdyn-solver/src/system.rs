//! The discrete system `M·ü + C·u̇ + K·u = F(t)` over the free DOFs.

use crate::error::{Result, SolverError};
use crate::sparse::{self, ensure_square};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

/// Mass, damping and stiffness matrices of one simulation.
///
/// All three are square over the same set of free degrees of freedom and are
/// read-only once the run starts.
#[derive(Debug, Clone)]
pub struct SystemMatrices {
    /// Mass matrix (lumped diagonal in the standard pipeline)
    pub mass: CsrMatrix<f64>,
    /// Damping matrix
    pub damping: CsrMatrix<f64>,
    /// Stiffness matrix
    pub stiffness: CsrMatrix<f64>,
}

impl SystemMatrices {
    /// Bundle M, C and K after checking their dimensions agree.
    pub fn new(
        mass: CsrMatrix<f64>,
        damping: CsrMatrix<f64>,
        stiffness: CsrMatrix<f64>,
    ) -> Result<Self> {
        let n = mass.nrows();
        if n == 0 {
            return Err(SolverError::invalid("system has no free degrees of freedom"));
        }
        ensure_square("mass", &mass, n)?;
        ensure_square("damping", &damping, n)?;
        ensure_square("stiffness", &stiffness, n)?;
        Ok(Self {
            mass,
            damping,
            stiffness,
        })
    }

    /// Number of free degrees of freedom.
    pub fn dimension(&self) -> usize {
        self.mass.nrows()
    }

    /// Kinetic energy `½·VᵀMV`.
    pub fn kinetic_energy(&self, velocity: &DVector<f64>) -> f64 {
        0.5 * sparse::quadratic_form(&self.mass, velocity)
    }

    /// Strain energy `½·UᵀKU`.
    pub fn strain_energy(&self, displacement: &DVector<f64>) -> f64 {
        0.5 * sparse::quadratic_form(&self.stiffness, displacement)
    }

    /// Total discrete energy `½·VᵀMV + ½·UᵀKU`.
    pub fn energy(&self, displacement: &DVector<f64>, velocity: &DVector<f64>) -> f64 {
        self.kinetic_energy(velocity) + self.strain_energy(displacement)
    }

    /// Fail unless `v` has one entry per free DOF.
    pub fn ensure_vector(&self, name: &str, v: &DVector<f64>) -> Result<()> {
        if v.len() != self.dimension() {
            return Err(SolverError::invalid(format!(
                "{name} has {} entries, system has {} DOFs",
                v.len(),
                self.dimension()
            )));
        }
        Ok(())
    }
}

/// Prescribed displacement and velocity at `t = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialConditions {
    pub displacement: DVector<f64>,
    pub velocity: DVector<f64>,
}

impl InitialConditions {
    pub fn new(displacement: DVector<f64>, velocity: DVector<f64>) -> Self {
        Self {
            displacement,
            velocity,
        }
    }

    /// Zero displacement and velocity.
    pub fn at_rest(n: usize) -> Self {
        Self::new(DVector::zeros(n), DVector::zeros(n))
    }

    /// Uniform zero displacement with a prescribed velocity field.
    pub fn with_velocity(velocity: DVector<f64>) -> Self {
        Self::new(DVector::zeros(velocity.len()), velocity)
    }

    /// Prescribed displacement field released from rest.
    pub fn with_displacement(displacement: DVector<f64>) -> Self {
        let n = displacement.len();
        Self::new(displacement, DVector::zeros(n))
    }

    pub(crate) fn validate(&self, system: &SystemMatrices) -> Result<()> {
        system.ensure_vector("initial displacement", &self.displacement)?;
        system.ensure_vector("initial velocity", &self.velocity)
    }
}
