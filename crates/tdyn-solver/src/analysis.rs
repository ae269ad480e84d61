//! Transient analysis pipeline and its configuration.
//!
//! Runs the stages strictly in order:
//!
//! ```text
//! consistent M ──► HRZ lumping ──► damping C = α·M_d
//!                                    │
//! K ──────────────────────────► step estimate (or fixed dt)
//!                                    │
//!                        factor D = M + dt/2·C + (dt/2)²·K
//!                                    │
//!                        trapezoidal loop ──► response series
//! ```
//!
//! Any failure aborts the run; no partial series is returned.
//!
//! # Example
//! ```no_run
//! use tdyn_solver::{
//!     ConsistentMass, DofResponse, InitialConditions, TransientAnalysis, TransientConfig, Unforced,
//! };
//! # fn example(mass: ConsistentMass, stiffness: nalgebra_sparse::CsrMatrix<f64>) {
//! let config = TransientConfig::new(1.0).with_loss_tangent(0.02, 50.0);
//! let n = mass.num_dofs();
//! let results = TransientAnalysis::new(config)
//!     .run(&mass, &stiffness, &InitialConditions::at_rest(n), Unforced, DofResponse::displacement(n - 1))
//!     .expect("transient analysis failed");
//! println!("{} samples, dt = {:.3e}", results.response.len(), results.time_step);
//! # }
//! ```

use crate::collector::{EnergyResponse, ResponseExtractor, ResponseSeries, ResultCollector};
use crate::damping::DampingModel;
use crate::dynamic_stiffness::DynamicStiffness;
use crate::error::{Result, SolverError};
use crate::integrator::{TerminalStepPolicy, TrapezoidalIntegrator};
use crate::loads::ForceSchedule;
use crate::lumping::{ConsistentMass, LumpedMass, MassLumper};
use crate::sparse::{diagonal_of, is_symmetric};
use crate::step_estimate::{self, StableStepEstimator, StepEstimate};
use crate::system::{InitialConditions, SystemMatrices};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::info;

/// Relative tolerance for the stiffness and damping symmetry checks.
const SYMMETRY_TOLERANCE: f64 = 1e-10;

/// Upper bound on the samples reserved up front per series; longer runs
/// grow the series as they go.
const MAX_RESERVED_SAMPLES: usize = 1 << 16;

/// How the damping coefficient is specified.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DampingSpec {
    #[default]
    None,
    /// Mass-proportional coefficient α (1/s)
    Coefficient { alpha: f64 },
    /// Loss tangent η at a reference frequency
    LossTangent { loss_tangent: f64, frequency_hz: f64 },
}

impl DampingSpec {
    pub fn model(&self) -> DampingModel {
        match *self {
            DampingSpec::None => DampingModel::none(),
            DampingSpec::Coefficient { alpha } => DampingModel::mass_proportional(alpha),
            DampingSpec::LossTangent {
                loss_tangent,
                frequency_hz,
            } => DampingModel::from_loss_tangent(loss_tangent, frequency_hz),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            DampingSpec::None => Ok(()),
            DampingSpec::Coefficient { alpha } if alpha >= 0.0 && alpha.is_finite() => Ok(()),
            DampingSpec::Coefficient { alpha } => Err(SolverError::invalid(format!(
                "damping coefficient must be non-negative, got {alpha}"
            ))),
            DampingSpec::LossTangent {
                loss_tangent,
                frequency_hz,
            } => {
                if !(loss_tangent >= 0.0 && loss_tangent.is_finite()) {
                    return Err(SolverError::invalid(format!(
                        "loss tangent must be non-negative, got {loss_tangent}"
                    )));
                }
                if !(frequency_hz > 0.0 && frequency_hz.is_finite()) {
                    return Err(SolverError::invalid(format!(
                        "reference frequency must be positive, got {frequency_hz}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// How the nominal step size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeStepSpec {
    /// Caller-supplied step
    Fixed { dt: f64 },
    /// `s·2/√λ_max` from the step estimator
    Estimated { safety_multiplier: f64 },
}

impl Default for TimeStepSpec {
    fn default() -> Self {
        TimeStepSpec::Estimated {
            safety_multiplier: step_estimate::DEFAULT_SAFETY_MULTIPLIER,
        }
    }
}

/// Iteration budget for the largest-eigenvalue estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EigenConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for EigenConfig {
    fn default() -> Self {
        Self {
            max_iterations: step_estimate::DEFAULT_MAX_ITERATIONS,
            tolerance: step_estimate::DEFAULT_TOLERANCE,
        }
    }
}

/// Transient analysis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientConfig {
    /// End time of the simulation (s)
    pub t_end: f64,
    #[serde(default)]
    pub damping: DampingSpec,
    #[serde(default)]
    pub time_step: TimeStepSpec,
    #[serde(default)]
    pub eigen: EigenConfig,
    #[serde(default)]
    pub terminal_step: TerminalStepPolicy,
    /// Record `½·VᵀMV + ½·UᵀKU` alongside the response
    #[serde(default)]
    pub record_energy: bool,
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            t_end: 1.0,
            damping: DampingSpec::default(),
            time_step: TimeStepSpec::default(),
            eigen: EigenConfig::default(),
            terminal_step: TerminalStepPolicy::default(),
            record_energy: false,
        }
    }
}

impl TransientConfig {
    pub fn new(t_end: f64) -> Self {
        Self {
            t_end,
            ..Default::default()
        }
    }

    pub fn with_damping_coefficient(mut self, alpha: f64) -> Self {
        self.damping = DampingSpec::Coefficient { alpha };
        self
    }

    pub fn with_loss_tangent(mut self, loss_tangent: f64, frequency_hz: f64) -> Self {
        self.damping = DampingSpec::LossTangent {
            loss_tangent,
            frequency_hz,
        };
        self
    }

    pub fn with_fixed_step(mut self, dt: f64) -> Self {
        self.time_step = TimeStepSpec::Fixed { dt };
        self
    }

    pub fn with_estimated_step(mut self, safety_multiplier: f64) -> Self {
        self.time_step = TimeStepSpec::Estimated { safety_multiplier };
        self
    }

    pub fn with_eigen_budget(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.eigen = EigenConfig {
            max_iterations,
            tolerance,
        };
        self
    }

    pub fn with_terminal_policy(mut self, policy: TerminalStepPolicy) -> Self {
        self.terminal_step = policy;
        self
    }

    pub fn with_energy_recording(mut self, record: bool) -> Self {
        self.record_energy = record;
        self
    }

    /// Parse a configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from JSON and validate it.
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a run.
    pub fn validate(&self) -> Result<()> {
        if !(self.t_end > 0.0 && self.t_end.is_finite()) {
            return Err(SolverError::invalid(format!(
                "end time must be positive and finite, got {}",
                self.t_end
            )));
        }
        self.damping.validate()?;
        match self.time_step {
            TimeStepSpec::Fixed { dt } if !(dt > 0.0 && dt.is_finite()) => {
                return Err(SolverError::invalid(format!(
                    "time step must be positive and finite, got {dt}"
                )));
            }
            TimeStepSpec::Estimated { safety_multiplier }
                if !(safety_multiplier > 0.0 && safety_multiplier.is_finite()) =>
            {
                return Err(SolverError::invalid(format!(
                    "safety multiplier must be positive, got {safety_multiplier}"
                )));
            }
            _ => {}
        }
        if self.eigen.max_iterations == 0 {
            return Err(SolverError::invalid("eigenvalue iteration budget must be positive"));
        }
        if !(self.eigen.tolerance > 0.0) {
            return Err(SolverError::invalid(format!(
                "eigenvalue tolerance must be positive, got {}",
                self.eigen.tolerance
            )));
        }
        Ok(())
    }
}

/// Everything a transient run produces.
#[derive(Debug, Clone, Serialize)]
pub struct TransientResults<T> {
    /// HRZ-lumped diagonal mass
    pub lumped_mass: LumpedMass,
    /// Damping model that built `C`; `None` when `C` was supplied as an
    /// assembled matrix through [`TransientAnalysis::run_with_system`]
    pub damping: Option<DampingModel>,
    /// Eigenvalue estimate, when the step was estimated
    pub step_estimate: Option<StepEstimate>,
    /// Nominal step size
    pub time_step: f64,
    /// Accepted steps
    pub steps: usize,
    /// Factorizations of the dynamic stiffness
    pub factorizations: usize,
    /// Recorded response series
    pub response: ResponseSeries<T>,
    /// Discrete energy series, when requested
    pub energy: Option<ResponseSeries<f64>>,
}

/// Transient analysis orchestrator.
#[derive(Debug, Clone)]
pub struct TransientAnalysis {
    config: TransientConfig,
}

impl TransientAnalysis {
    pub fn new(config: TransientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransientConfig {
        &self.config
    }

    /// Run the full pipeline from a consistent mass and a stiffness matrix.
    ///
    /// # Errors
    /// Any [`SolverError`] from the stages; the run aborts on the first one.
    pub fn run<S, E>(
        &self,
        consistent_mass: &ConsistentMass,
        stiffness: &CsrMatrix<f64>,
        initial: &InitialConditions,
        schedule: S,
        extractor: E,
    ) -> Result<TransientResults<E::Output>>
    where
        S: ForceSchedule,
        E: ResponseExtractor,
    {
        self.config.validate()?;

        let lumped = MassLumper.lump(consistent_mass)?;
        let damping = self.config.damping.model();
        let system = SystemMatrices::new(
            lumped.to_csr(),
            damping.damping_matrix(&lumped),
            stiffness.clone(),
        )?;

        self.integrate(&system, lumped, Some(damping), initial, schedule, extractor)
    }

    /// Run from an already lumped (diagonal) mass; damping comes from the
    /// configuration.
    pub fn run_lumped<S, E>(
        &self,
        lumped: &LumpedMass,
        stiffness: &CsrMatrix<f64>,
        initial: &InitialConditions,
        schedule: S,
        extractor: E,
    ) -> Result<TransientResults<E::Output>>
    where
        S: ForceSchedule,
        E: ResponseExtractor,
    {
        self.config.validate()?;

        let damping = self.config.damping.model();
        let system = SystemMatrices::new(
            lumped.to_csr(),
            damping.damping_matrix(lumped),
            stiffness.clone(),
        )?;

        self.integrate(&system, lumped.clone(), Some(damping), initial, schedule, extractor)
    }

    /// Run on fully assembled system matrices. The mass must be diagonal and
    /// the damping in `system` is used as given: the configured damping is
    /// ignored and the results report no damping model.
    pub fn run_with_system<S, E>(
        &self,
        system: &SystemMatrices,
        initial: &InitialConditions,
        schedule: S,
        extractor: E,
    ) -> Result<TransientResults<E::Output>>
    where
        S: ForceSchedule,
        E: ResponseExtractor,
    {
        self.config.validate()?;

        if system.mass.triplet_iter().any(|(i, j, &v)| i != j && v != 0.0) {
            return Err(SolverError::invalid("mass matrix must be diagonal (lumped)"));
        }
        let lumped = LumpedMass {
            diagonal: diagonal_of(&system.mass),
            constrained: 0.0,
        };
        self.integrate(system, lumped, None, initial, schedule, extractor)
    }

    fn integrate<S, E>(
        &self,
        system: &SystemMatrices,
        lumped: LumpedMass,
        damping: Option<DampingModel>,
        initial: &InitialConditions,
        schedule: S,
        extractor: E,
    ) -> Result<TransientResults<E::Output>>
    where
        S: ForceSchedule,
        E: ResponseExtractor,
    {
        if !is_symmetric(&system.stiffness, SYMMETRY_TOLERANCE) {
            return Err(SolverError::invalid("stiffness matrix is not symmetric"));
        }
        if !is_symmetric(&system.damping, SYMMETRY_TOLERANCE) {
            return Err(SolverError::invalid("damping matrix is not symmetric"));
        }

        let (time_step, step_estimate) = self.resolve_time_step(system, &lumped)?;

        let operator = DynamicStiffness::factor(system, time_step)?;
        let mut integrator =
            TrapezoidalIntegrator::new(system, operator, self.config.t_end, initial, schedule)?
                .with_terminal_policy(self.config.terminal_step);

        let capacity = integrator.expected_samples().min(MAX_RESERVED_SAMPLES);
        let mut response = ResultCollector::with_capacity(extractor, capacity);
        response.validate(system.dimension())?;
        let mut energy = self
            .config
            .record_energy
            .then(|| ResultCollector::with_capacity(EnergyResponse::new(system), capacity));

        integrator.run_with(|state| {
            response.record(state)?;
            if let Some(energy) = energy.as_mut() {
                energy.record(state)?;
            }
            Ok(())
        })?;

        info!(
            dofs = system.dimension(),
            time_step,
            steps = integrator.steps_taken(),
            factorizations = integrator.factorizations(),
            samples = response.series().len(),
            "transient analysis complete"
        );

        Ok(TransientResults {
            lumped_mass: lumped,
            damping,
            step_estimate,
            time_step,
            steps: integrator.steps_taken(),
            factorizations: integrator.factorizations(),
            response: response.into_series(),
            energy: energy.map(ResultCollector::into_series),
        })
    }

    /// Nominal step, capped at `t_end`.
    fn resolve_time_step(
        &self,
        system: &SystemMatrices,
        lumped: &LumpedMass,
    ) -> Result<(f64, Option<StepEstimate>)> {
        let (dt, estimate) = match self.config.time_step {
            TimeStepSpec::Fixed { dt } => (dt, None),
            TimeStepSpec::Estimated { safety_multiplier } => {
                let estimate = StableStepEstimator::new(safety_multiplier)
                    .with_budget(self.config.eigen.max_iterations, self.config.eigen.tolerance)
                    .estimate(&system.stiffness, lumped)?;
                (estimate.time_step, Some(estimate))
            }
        };

        if dt > self.config.t_end {
            info!(dt, t_end = self.config.t_end, "time step capped at end time");
            return Ok((self.config.t_end, estimate));
        }
        Ok((dt, estimate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DofResponse;
    use crate::loads::Unforced;
    use crate::lumping::ElementMass;
    use crate::sparse::csr_from_triplets;
    use nalgebra::{DMatrix, DVector};

    fn single_dof(m: f64, k: f64) -> (ConsistentMass, CsrMatrix<f64>) {
        let mut mass = ConsistentMass::new(1);
        mass.add_element(ElementMass::unconstrained(DMatrix::from_element(1, 1, m), vec![0]))
            .unwrap();
        let stiffness = csr_from_triplets(1, 1, vec![0], vec![0], vec![k]).unwrap();
        (mass, stiffness)
    }

    #[test]
    fn config_defaults_estimate_the_step() {
        let config = TransientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.time_step,
            TimeStepSpec::Estimated {
                safety_multiplier: step_estimate::DEFAULT_SAFETY_MULTIPLIER
            }
        );
        assert_eq!(config.terminal_step, TerminalStepPolicy::Refactor);
    }

    #[test]
    fn config_parses_from_json() {
        let json = r#"{
            "t_end": 2.5,
            "damping": { "kind": "loss_tangent", "loss_tangent": 0.02, "frequency_hz": 10.0 },
            "time_step": { "kind": "fixed", "dt": 0.01 },
            "terminal_step": "reuse_factorization",
            "record_energy": true
        }"#;
        let config = TransientConfig::from_json_str(json).unwrap();
        assert_eq!(config.t_end, 2.5);
        assert_eq!(config.time_step, TimeStepSpec::Fixed { dt: 0.01 });
        assert_eq!(config.terminal_step, TerminalStepPolicy::ReuseFactorization);
        assert_eq!(config.eigen, EigenConfig::default());
        assert!(config.record_energy);
        assert!((config.damping.model().alpha - 0.02 * 20.0 * std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn config_rejects_invalid_values() {
        for config in [
            TransientConfig::new(0.0),
            TransientConfig::new(-1.0),
            TransientConfig::new(f64::NAN),
            TransientConfig::new(1.0).with_fixed_step(0.0),
            TransientConfig::new(1.0).with_estimated_step(-2.0),
            TransientConfig::new(1.0).with_damping_coefficient(-0.1),
            TransientConfig::new(1.0).with_loss_tangent(0.1, 0.0),
            TransientConfig::new(1.0).with_eigen_budget(0, 1e-8),
        ] {
            assert!(
                matches!(config.validate(), Err(SolverError::InvalidConfiguration(_))),
                "{config:?}"
            );
        }
        assert!(matches!(
            TransientConfig::from_json_str("{\"t_end\": \"soon\"}"),
            Err(SolverError::Json(_))
        ));
    }

    #[test]
    fn estimated_step_is_capped_at_end_time() {
        let (mass, stiffness) = single_dof(1.0, 1.0);
        let results = TransientAnalysis::new(TransientConfig::new(0.5))
            .run(
                &mass,
                &stiffness,
                &InitialConditions::at_rest(1),
                Unforced,
                DofResponse::displacement(0),
            )
            .unwrap();
        let estimate = results.step_estimate.unwrap();
        assert!((estimate.time_step - 20.0).abs() < 1e-9);
        assert_eq!(results.damping, Some(DampingModel::none()));
        assert_eq!(results.time_step, 0.5);
        assert_eq!(results.steps, 1);
        assert_eq!(results.response.times(), vec![0.0, 0.5]);
    }

    #[test]
    fn records_energy_on_request() {
        let (mass, stiffness) = single_dof(1.0, 1.0);
        let config = TransientConfig::new(1.0)
            .with_fixed_step(0.1)
            .with_energy_recording(true);
        let results = TransientAnalysis::new(config)
            .run(
                &mass,
                &stiffness,
                &InitialConditions::with_velocity(DVector::from_element(1, 1.0)),
                Unforced,
                DofResponse::displacement(0),
            )
            .unwrap();
        let energy = results.energy.unwrap();
        assert_eq!(energy.len(), results.response.len());
        assert!(energy.max_deviation_from(0.5) < 1e-12);
    }

    #[test]
    fn rejects_asymmetric_stiffness() {
        let mut mass = ConsistentMass::new(2);
        mass.add_element(ElementMass::unconstrained(DMatrix::identity(2, 2), vec![0, 1]))
            .unwrap();
        let stiffness =
            csr_from_triplets(2, 2, vec![0, 0, 1], vec![0, 1, 1], vec![2.0, -1.0, 2.0]).unwrap();
        let err = TransientAnalysis::new(TransientConfig::new(1.0).with_fixed_step(0.1)).run(
            &mass,
            &stiffness,
            &InitialConditions::at_rest(2),
            Unforced,
            DofResponse::displacement(0),
        );
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }

    #[test]
    fn run_with_system_requires_diagonal_mass() {
        let m = csr_from_triplets(2, 2, vec![0, 0, 1, 1], vec![0, 1, 0, 1], vec![2.0, 1.0, 1.0, 2.0])
            .unwrap();
        let k = csr_from_triplets(2, 2, vec![0, 1], vec![0, 1], vec![1.0, 1.0]).unwrap();
        let c = csr_from_triplets(2, 2, vec![], vec![], vec![]).unwrap();
        let system = SystemMatrices::new(m, c, k).unwrap();
        let err = TransientAnalysis::new(TransientConfig::new(1.0).with_fixed_step(0.1))
            .run_with_system(
                &system,
                &InitialConditions::at_rest(2),
                Unforced,
                DofResponse::displacement(0),
            );
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }

    #[test]
    fn run_with_system_uses_supplied_damping() {
        let system = SystemMatrices::new(
            csr_from_triplets(1, 1, vec![0], vec![0], vec![1.0]).unwrap(),
            csr_from_triplets(1, 1, vec![0], vec![0], vec![0.4]).unwrap(),
            csr_from_triplets(1, 1, vec![0], vec![0], vec![4.0]).unwrap(),
        )
        .unwrap();
        let config = TransientConfig::new(5.0)
            .with_fixed_step(0.05)
            .with_damping_coefficient(100.0)
            .with_energy_recording(true);
        let results = TransientAnalysis::new(config)
            .run_with_system(
                &system,
                &InitialConditions::with_displacement(DVector::from_element(1, 1.0)),
                Unforced,
                DofResponse::displacement(0),
            )
            .unwrap();

        assert_eq!(results.damping, None);
        let energy = results.energy.unwrap().values();
        assert!((energy[0] - 2.0).abs() < 1e-12);
        assert!(energy.windows(2).all(|w| w[1] <= w[0] + 1e-14));
        // c = 0.4 decays E by e^{-0.4·5} ≈ 0.135; α = 100 would leave almost nothing
        let ratio = energy.last().unwrap() / energy[0];
        assert!(ratio > 0.05 && ratio < 0.3, "energy ratio {ratio}");
    }

    #[test]
    fn run_with_system_rejects_asymmetric_damping() {
        let m = csr_from_triplets(2, 2, vec![0, 1], vec![0, 1], vec![1.0, 1.0]).unwrap();
        let k = csr_from_triplets(2, 2, vec![0, 1], vec![0, 1], vec![1.0, 1.0]).unwrap();
        let c = csr_from_triplets(2, 2, vec![0, 0, 1], vec![0, 1, 1], vec![0.2, 0.1, 0.2]).unwrap();
        let system = SystemMatrices::new(m, c, k).unwrap();
        let err = TransientAnalysis::new(TransientConfig::new(1.0).with_fixed_step(0.1))
            .run_with_system(
                &system,
                &InitialConditions::at_rest(2),
                Unforced,
                DofResponse::displacement(0),
            );
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }

    #[test]
    fn unrepresentable_step_count_is_rejected() {
        let (mass, stiffness) = single_dof(1.0, 1.0);
        let err = TransientAnalysis::new(TransientConfig::new(1.0).with_fixed_step(1e-20)).run(
            &mass,
            &stiffness,
            &InitialConditions::at_rest(1),
            Unforced,
            DofResponse::displacement(0),
        );
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }
}
