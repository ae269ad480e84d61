//! Implicit trapezoidal (average acceleration) time integration.
//!
//! Solves the transient problem
//!
//! ```text
//! M·ü + C·u̇ + K·u = F(t)
//! ```
//!
//! with the trapezoidal rule applied to both `u̇ = v` and the momentum
//! balance. Eliminating `U₁` leaves one linear solve per step, for the new
//! velocity:
//!
//! ```text
//! D·V₁ = M·V₀ − C·(h/2·V₀) − K·((h/2)²·V₀ + h·U₀) + h/2·(F₀ + F₁)
//! U₁   = U₀ + h/2·(V₀ + V₁)
//! D    = M + h/2·C + (h/2)²·K
//! ```
//!
//! The scheme is unconditionally stable and, without damping or loads,
//! conserves `½·VᵀMV + ½·UᵀKU` exactly (up to round-off).
//!
//! `D` depends only on the step size, so it is factored once and reused. The
//! last step is shortened to land exactly on `t_end`; what happens to `D` for
//! that step is governed by [`TerminalStepPolicy`].

use crate::collector::{ResponseExtractor, ResultCollector, StateView};
use crate::dynamic_stiffness::DynamicStiffness;
use crate::error::{Result, SolverError};
use crate::loads::ForceSchedule;
use crate::sparse::spmv;
use crate::system::{InitialConditions, SystemMatrices};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Relative (to `t_end`) gap below which the next nominal step is treated
/// as the terminal one, so no sliver step is ever taken.
pub const TIME_TOLERANCE: f64 = 1e-12;

/// Relative (to `dt`) difference below which a terminal step counts as a
/// nominal one and keeps the nominal factorization.
pub const STEP_MATCH_TOLERANCE: f64 = 1e-9;

/// Largest step count a run may need. Step times are formed as `k·dt`,
/// which is exact in `f64` only while `k` stays below 2⁵³.
pub const MAX_STEPS: u64 = 1 << 53;

/// What to do with `D` when the terminal step is shorter than `dt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStepPolicy {
    /// Factor `D` again for the shortened step (one extra factorization).
    /// Every step is then consistent with its own step size.
    #[default]
    Refactor,
    /// Keep the nominal factor for the shortened step. The last step then
    /// solves with an operator built for a longer step; the error is first
    /// order in the step mismatch and limited to that single step.
    ReuseFactorization,
}

/// Integrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorState {
    Running,
    Done,
}

/// Displacement, velocity and force at one discrete time.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSlot {
    pub displacement: DVector<f64>,
    pub velocity: DVector<f64>,
    pub force: DVector<f64>,
}

impl StateSlot {
    fn zeros(n: usize) -> Self {
        Self {
            displacement: DVector::zeros(n),
            velocity: DVector::zeros(n),
            force: DVector::zeros(n),
        }
    }
}

/// Two state slots used ping-pong style: each step reads the current slot,
/// writes the other one, then flips the index. No vectors are reallocated.
#[derive(Debug, Clone)]
pub struct StateBuffers {
    slots: [StateSlot; 2],
    current: usize,
}

impl StateBuffers {
    fn new(initial: &InitialConditions) -> Self {
        let n = initial.displacement.len();
        let mut first = StateSlot::zeros(n);
        first.displacement.copy_from(&initial.displacement);
        first.velocity.copy_from(&initial.velocity);
        Self {
            slots: [first, StateSlot::zeros(n)],
            current: 0,
        }
    }

    pub fn current(&self) -> &StateSlot {
        &self.slots[self.current]
    }

    fn current_mut(&mut self) -> &mut StateSlot {
        &mut self.slots[self.current]
    }

    /// `(current, next)` with the next slot writable.
    fn split(&mut self) -> (&StateSlot, &mut StateSlot) {
        let (a, b) = self.slots.split_at_mut(1);
        if self.current == 0 {
            (&a[0], &mut b[0])
        } else {
            (&b[0], &mut a[0])
        }
    }

    fn swap(&mut self) {
        self.current ^= 1;
    }
}

/// Time-marching loop for one simulation.
///
/// Constructed fresh per run; owns its state buffers, scratch vectors and the
/// factorization of `D`.
pub struct TrapezoidalIntegrator<'a, S: ForceSchedule> {
    system: &'a SystemMatrices,
    schedule: S,
    operator: DynamicStiffness,
    terminal_operator: Option<DynamicStiffness>,
    policy: TerminalStepPolicy,
    t_end: f64,
    time: f64,
    expected_samples: usize,
    steps_taken: usize,
    factorizations: usize,
    buffers: StateBuffers,
    rhs: DVector<f64>,
    work: DVector<f64>,
    product: DVector<f64>,
    state: IntegratorState,
}

impl<'a, S: ForceSchedule> TrapezoidalIntegrator<'a, S> {
    /// Set up the integrator at `t = 0`.
    ///
    /// The nominal step is the one `operator` was factored for.
    ///
    /// # Errors
    /// `InvalidConfiguration` if `t_end` is not positive and finite, if
    /// reaching it takes more than [`MAX_STEPS`] steps, or if the operator,
    /// initial conditions or load schedule do not match the system.
    pub fn new(
        system: &'a SystemMatrices,
        operator: DynamicStiffness,
        t_end: f64,
        initial: &InitialConditions,
        schedule: S,
    ) -> Result<Self> {
        if !(t_end > 0.0 && t_end.is_finite()) {
            return Err(SolverError::invalid(format!(
                "end time must be positive and finite, got {t_end}"
            )));
        }
        let n = system.dimension();
        if operator.dimension() != n {
            return Err(SolverError::invalid(format!(
                "dynamic stiffness has dimension {}, system has {n} DOFs",
                operator.dimension()
            )));
        }
        let expected_samples = step_count(t_end, operator.dt())?;
        initial.validate(system)?;
        schedule.validate(n)?;

        let mut buffers = StateBuffers::new(initial);
        schedule.force_at(0.0, &mut buffers.current_mut().force);

        Ok(Self {
            system,
            schedule,
            operator,
            terminal_operator: None,
            policy: TerminalStepPolicy::default(),
            t_end,
            time: 0.0,
            expected_samples,
            steps_taken: 0,
            factorizations: 1,
            buffers,
            rhs: DVector::zeros(n),
            work: DVector::zeros(n),
            product: DVector::zeros(n),
            state: IntegratorState::Running,
        })
    }

    pub fn with_terminal_policy(mut self, policy: TerminalStepPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Nominal step size.
    pub fn dt(&self) -> f64 {
        self.operator.dt()
    }

    pub fn t_end(&self) -> f64 {
        self.t_end
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn state(&self) -> IntegratorState {
        self.state
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Factorizations of `D` used so far, the initial one included.
    pub fn factorizations(&self) -> usize {
        self.factorizations
    }

    /// Number of samples a full run records (`t = 0` through `t_end`).
    pub fn expected_samples(&self) -> usize {
        self.expected_samples
    }

    /// The current state.
    pub fn view(&self) -> StateView<'_> {
        let slot = self.buffers.current();
        StateView {
            time: self.time,
            displacement: &slot.displacement,
            velocity: &slot.velocity,
            force: &slot.force,
        }
    }

    /// Advance by one step (the terminal step is shortened to hit `t_end`).
    ///
    /// Returns the state after the step. Calling this when already `Done`
    /// does nothing.
    pub fn step(&mut self) -> Result<IntegratorState> {
        if self.state == IntegratorState::Done {
            return Ok(IntegratorState::Done);
        }

        let dt = self.operator.dt();
        let nominal_next = (self.steps_taken + 1) as f64 * dt;
        let terminal = nominal_next >= self.t_end * (1.0 - TIME_TOLERANCE);
        let (t_next, mut h) = if terminal {
            (self.t_end, self.t_end - self.time)
        } else {
            (nominal_next, dt)
        };

        let shortened = terminal && (h - dt).abs() > STEP_MATCH_TOLERANCE * dt;
        if !shortened {
            h = dt;
        } else if self.policy == TerminalStepPolicy::Refactor && self.terminal_operator.is_none() {
            self.terminal_operator = Some(DynamicStiffness::factor(self.system, h)?);
            self.factorizations += 1;
            info!(dt_terminal = h, dt_nominal = dt, "refactored dynamic stiffness for terminal step");
        } else if self.policy == TerminalStepPolicy::ReuseFactorization {
            warn!(
                dt_terminal = h,
                dt_nominal = dt,
                "terminal step reuses the nominal factorization"
            );
        }

        let operator = match &self.terminal_operator {
            Some(op) if shortened => op,
            _ => &self.operator,
        };

        let (current, next) = self.buffers.split();
        next.force.fill(0.0);
        self.schedule.force_at(t_next, &mut next.force);
        advance(
            self.system,
            operator,
            h,
            current,
            next,
            &mut self.rhs,
            &mut self.work,
            &mut self.product,
        )?;

        self.buffers.swap();
        self.time = t_next;
        self.steps_taken += 1;
        debug!(step = self.steps_taken, time = self.time, h, "accepted step");

        if terminal {
            self.state = IntegratorState::Done;
        }
        Ok(self.state)
    }

    /// Run to `t_end`, handing every accepted state to `observe`.
    ///
    /// The state is observed before each step, so `t = 0` is included, and
    /// once more after the terminal step at exactly `t_end`.
    pub fn run_with<F>(&mut self, mut observe: F) -> Result<()>
    where
        F: FnMut(&StateView<'_>) -> Result<()>,
    {
        loop {
            observe(&self.view())?;
            if self.state == IntegratorState::Done {
                break;
            }
            self.step()?;
        }
        info!(
            steps = self.steps_taken,
            factorizations = self.factorizations,
            t_end = self.t_end,
            "transient run finished"
        );
        Ok(())
    }

    /// Run to `t_end`, recording into `collector`.
    ///
    /// Samples are kept only if the whole run succeeds; on error the
    /// collector is left as it was passed in.
    pub fn run<E: ResponseExtractor>(&mut self, collector: &mut ResultCollector<E>) -> Result<()> {
        collector.validate(self.system.dimension())?;
        let recorded = collector.series().len();
        let outcome = self.run_with(|state| collector.record(state));
        if outcome.is_err() {
            collector.rollback(recorded);
        }
        outcome
    }
}

/// Samples recorded over `[0, t_end]` with nominal step `dt`: the step
/// count plus the initial state.
fn step_count(t_end: f64, dt: f64) -> Result<usize> {
    let steps = (t_end / dt * (1.0 - TIME_TOLERANCE)).ceil().max(1.0);
    let samples = (steps.is_finite() && steps < MAX_STEPS as f64)
        .then(|| usize::try_from(steps as u64 + 1).ok())
        .flatten();
    samples.ok_or_else(|| {
        SolverError::invalid(format!(
            "step {dt:e} needs {steps:e} steps to reach t_end = {t_end}, limit is {MAX_STEPS}"
        ))
    })
}

/// One trapezoidal step from `current` into `next` with step size `h`.
///
/// `next.force` must already hold `F(t + h)`.
#[allow(clippy::too_many_arguments)]
fn advance(
    system: &SystemMatrices,
    operator: &DynamicStiffness,
    h: f64,
    current: &StateSlot,
    next: &mut StateSlot,
    rhs: &mut DVector<f64>,
    work: &mut DVector<f64>,
    product: &mut DVector<f64>,
) -> Result<()> {
    let half = 0.5 * h;

    spmv(&system.mass, &current.velocity, rhs);

    spmv(&system.damping, &current.velocity, product);
    rhs.axpy(-half, product, 1.0);

    // work = (h/2)²·V₀ + h·U₀
    work.copy_from(&current.displacement);
    work.axpy(half * half, &current.velocity, h);
    spmv(&system.stiffness, work, product);
    rhs.axpy(-1.0, product, 1.0);

    rhs.axpy(half, &current.force, 1.0);
    rhs.axpy(half, &next.force, 1.0);

    operator.solve_into(rhs, &mut next.velocity)?;

    next.displacement.copy_from(&current.displacement);
    next.displacement.axpy(half, &current.velocity, 1.0);
    next.displacement.axpy(half, &next.velocity, 1.0);
    Ok(())
}
