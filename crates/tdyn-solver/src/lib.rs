//! # tdyn-solver
//!
//! Implicit transient dynamics for linear finite element models:
//!
//! - HRZ (diagonal scaling) mass lumping with mass conservation checks
//! - Mass-proportional damping `C = α·M_d`, optionally from a loss tangent
//! - Stable step estimate `dt = s·2/√λ_max` from a Lanczos iteration that
//!   only needs matrix-vector products
//! - Sparse Cholesky factorization of the dynamic stiffness
//!   `D = M + dt/2·C + (dt/2)²·K`, reused over the whole time loop
//! - Trapezoidal (average acceleration) time marching that lands exactly on
//!   the end time
//! - Response extraction into ordered `(time, value)` series with CSV/JSON
//!   export
//!
//! [`TransientAnalysis`] chains the stages; each stage is also usable on
//! its own.

pub mod analysis;
pub mod collector;
pub mod damping;
pub mod dynamic_stiffness;
pub mod error;
pub mod integrator;
pub mod loads;
pub mod lumping;
pub mod sparse;
pub mod step_estimate;
pub mod system;

pub use analysis::{
    DampingSpec, EigenConfig, TimeStepSpec, TransientAnalysis, TransientConfig, TransientResults,
};
pub use collector::{
    DofResponse, EnergyResponse, FullState, LinearFunctional, Quantity, ResponseExtractor,
    ResponseSeries, ResultCollector, Sample, StateView,
};
pub use damping::DampingModel;
pub use dynamic_stiffness::DynamicStiffness;
pub use error::{Result, SolverError};
pub use integrator::{IntegratorState, TerminalStepPolicy, TrapezoidalIntegrator};
pub use loads::{ConstantLoad, ForceSchedule, HarmonicLoad, Unforced};
pub use lumping::{ConsistentMass, ElementMass, LumpedMass, MassLumper};
pub use step_estimate::{StableStepEstimator, StepEstimate};
pub use system::{InitialConditions, SystemMatrices};
