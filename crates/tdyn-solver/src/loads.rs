//! Time-dependent external load schedules `F(t)`.

use crate::error::{Result, SolverError};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Supplies the external force vector at a given time.
///
/// `out` is zeroed by the caller before each call, so a schedule only needs
/// to write the DOFs it loads.
pub trait ForceSchedule {
    /// Write `F(t)` into `out`.
    fn force_at(&self, t: f64, out: &mut DVector<f64>);

    /// Check the schedule against the number of free DOFs.
    fn validate(&self, _num_dofs: usize) -> Result<()> {
        Ok(())
    }
}

impl<F> ForceSchedule for F
where
    F: Fn(f64, &mut DVector<f64>),
{
    fn force_at(&self, t: f64, out: &mut DVector<f64>) {
        self(t, out)
    }
}

/// Free vibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Unforced;

impl ForceSchedule for Unforced {
    fn force_at(&self, _t: f64, _out: &mut DVector<f64>) {}
}

/// Time-invariant load vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantLoad {
    pub force: DVector<f64>,
}

impl ConstantLoad {
    pub fn new(force: DVector<f64>) -> Self {
        Self { force }
    }
}

impl ForceSchedule for ConstantLoad {
    fn force_at(&self, _t: f64, out: &mut DVector<f64>) {
        out.copy_from(&self.force);
    }

    fn validate(&self, num_dofs: usize) -> Result<()> {
        if self.force.len() != num_dofs {
            return Err(SolverError::invalid(format!(
                "load vector has {} entries, system has {num_dofs} DOFs",
                self.force.len()
            )));
        }
        Ok(())
    }
}

/// `F_dof(t) = amplitude · sin(ω·t + phase)` on a single DOF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonicLoad {
    pub dof: usize,
    pub amplitude: f64,
    /// Angular frequency (rad/s)
    pub omega: f64,
    #[serde(default)]
    pub phase: f64,
}

impl HarmonicLoad {
    pub fn new(dof: usize, amplitude: f64, omega: f64) -> Self {
        Self {
            dof,
            amplitude,
            omega,
            phase: 0.0,
        }
    }

    /// Harmonic load specified by frequency in Hz.
    pub fn from_frequency_hz(dof: usize, amplitude: f64, frequency_hz: f64) -> Self {
        Self::new(dof, amplitude, 2.0 * std::f64::consts::PI * frequency_hz)
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }
}

impl ForceSchedule for HarmonicLoad {
    fn force_at(&self, t: f64, out: &mut DVector<f64>) {
        out[self.dof] = self.amplitude * (self.omega * t + self.phase).sin();
    }

    fn validate(&self, num_dofs: usize) -> Result<()> {
        if self.dof >= num_dofs {
            return Err(SolverError::invalid(format!(
                "load DOF {} out of range (system has {num_dofs} DOFs)",
                self.dof
            )));
        }
        Ok(())
    }
}
