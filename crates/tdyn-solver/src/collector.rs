//! Response extraction and the append-only `(time, response)` series.

use crate::error::{Result, SolverError};
use crate::system::SystemMatrices;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Read-only view of the integrator state at one accepted time.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    pub time: f64,
    pub displacement: &'a DVector<f64>,
    pub velocity: &'a DVector<f64>,
    pub force: &'a DVector<f64>,
}

/// Reads a response quantity out of the current state.
pub trait ResponseExtractor {
    type Output;

    fn extract(&self, state: &StateView<'_>) -> Self::Output;

    /// Check the extractor against the number of free DOFs.
    fn validate(&self, _num_dofs: usize) -> Result<()> {
        Ok(())
    }
}

impl<F, T> ResponseExtractor for F
where
    F: Fn(&StateView<'_>) -> T,
{
    type Output = T;

    fn extract(&self, state: &StateView<'_>) -> T {
        self(state)
    }
}

/// Which state vector a [`DofResponse`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    #[default]
    Displacement,
    Velocity,
}

/// One component of the displacement (or velocity) vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DofResponse {
    pub dof: usize,
    #[serde(default)]
    pub quantity: Quantity,
}

impl DofResponse {
    pub fn displacement(dof: usize) -> Self {
        Self {
            dof,
            quantity: Quantity::Displacement,
        }
    }

    pub fn velocity(dof: usize) -> Self {
        Self {
            dof,
            quantity: Quantity::Velocity,
        }
    }
}

impl ResponseExtractor for DofResponse {
    type Output = f64;

    fn extract(&self, state: &StateView<'_>) -> f64 {
        match self.quantity {
            Quantity::Displacement => state.displacement[self.dof],
            Quantity::Velocity => state.velocity[self.dof],
        }
    }

    fn validate(&self, num_dofs: usize) -> Result<()> {
        if self.dof >= num_dofs {
            return Err(SolverError::invalid(format!(
                "response DOF {} out of range (system has {num_dofs} DOFs)",
                self.dof
            )));
        }
        Ok(())
    }
}

/// Weighted sum `w·U` of the displacement vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFunctional {
    pub weights: DVector<f64>,
}

impl LinearFunctional {
    pub fn new(weights: DVector<f64>) -> Self {
        Self { weights }
    }
}

impl ResponseExtractor for LinearFunctional {
    type Output = f64;

    fn extract(&self, state: &StateView<'_>) -> f64 {
        self.weights.dot(state.displacement)
    }

    fn validate(&self, num_dofs: usize) -> Result<()> {
        if self.weights.len() != num_dofs {
            return Err(SolverError::invalid(format!(
                "functional has {} weights, system has {num_dofs} DOFs",
                self.weights.len()
            )));
        }
        Ok(())
    }
}

/// The whole displacement vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullState;

impl ResponseExtractor for FullState {
    type Output = Vec<f64>;

    fn extract(&self, state: &StateView<'_>) -> Vec<f64> {
        state.displacement.as_slice().to_vec()
    }
}

/// Discrete energy `½·VᵀMV + ½·UᵀKU` of the system.
#[derive(Debug, Clone, Copy)]
pub struct EnergyResponse<'a> {
    pub system: &'a SystemMatrices,
}

impl<'a> EnergyResponse<'a> {
    pub fn new(system: &'a SystemMatrices) -> Self {
        Self { system }
    }
}

impl ResponseExtractor for EnergyResponse<'_> {
    type Output = f64;

    fn extract(&self, state: &StateView<'_>) -> f64 {
        self.system.energy(state.displacement, state.velocity)
    }
}

/// One recorded sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    pub time: f64,
    pub value: T,
}

/// Ordered `(time, value)` series, strictly increasing in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSeries<T> {
    samples: Vec<Sample<T>>,
}

impl<T> Default for ResponseSeries<T> {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
        }
    }
}

impl<T> ResponseSeries<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, time: f64, value: T) -> Result<()> {
        if let Some(last) = self.samples.last()
            && time <= last.time
        {
            return Err(SolverError::invalid(format!(
                "sample at t = {time} does not follow last sample at t = {}",
                last.time
            )));
        }
        self.samples.push(Sample { time, value });
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.samples.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample<T>] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample<T>> {
        self.samples.iter()
    }

    pub fn first(&self) -> Option<&Sample<T>> {
        self.samples.first()
    }

    pub fn last(&self) -> Option<&Sample<T>> {
        self.samples.last()
    }

    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    /// Write the series as pretty-printed JSON.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()>
    where
        T: Serialize,
    {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

impl ResponseSeries<f64> {
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// Largest `|value - reference|` over the series.
    pub fn max_deviation_from(&self, reference: f64) -> f64 {
        self.samples
            .iter()
            .map(|s| (s.value - reference).abs())
            .fold(0.0, f64::max)
    }

    /// Write `time,value` rows with a header.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<()> {
        writeln!(writer, "time,value")?;
        for s in &self.samples {
            writeln!(writer, "{},{}", s.time, s.value)?;
        }
        Ok(())
    }
}

impl ResponseSeries<Vec<f64>> {
    /// Write `time,u0,u1,...` rows with a header.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<()> {
        let width = self.samples.first().map_or(0, |s| s.value.len());
        write!(writer, "time")?;
        for i in 0..width {
            write!(writer, ",u{i}")?;
        }
        writeln!(writer)?;
        for s in &self.samples {
            write!(writer, "{}", s.time)?;
            for v in &s.value {
                write!(writer, ",{v}")?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

/// Appends one extracted response per accepted time.
pub struct ResultCollector<E: ResponseExtractor> {
    extractor: E,
    series: ResponseSeries<E::Output>,
}

impl<E: ResponseExtractor> ResultCollector<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor,
            series: ResponseSeries::new(),
        }
    }

    /// Reserve room for an expected number of samples.
    pub fn with_capacity(extractor: E, capacity: usize) -> Self {
        Self {
            extractor,
            series: ResponseSeries::with_capacity(capacity),
        }
    }

    pub fn validate(&self, num_dofs: usize) -> Result<()> {
        self.extractor.validate(num_dofs)
    }

    /// Record the response at `state.time`.
    ///
    /// # Errors
    /// `InvalidConfiguration` if the time does not advance past the last sample.
    pub fn record(&mut self, state: &StateView<'_>) -> Result<()> {
        let value = self.extractor.extract(state);
        self.series.push(state.time, value)
    }

    pub fn series(&self) -> &ResponseSeries<E::Output> {
        &self.series
    }

    /// Drop every sample recorded after the first `len`.
    pub(crate) fn rollback(&mut self, len: usize) {
        self.series.truncate(len);
    }

    pub fn into_series(self) -> ResponseSeries<E::Output> {
        self.series
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(
        time: f64,
        u: &'a DVector<f64>,
        v: &'a DVector<f64>,
        f: &'a DVector<f64>,
    ) -> StateView<'a> {
        StateView {
            time,
            displacement: u,
            velocity: v,
            force: f,
        }
    }

    #[test]
    fn dof_response_reads_requested_quantity() {
        let u = DVector::from_vec(vec![1.0, 2.0]);
        let v = DVector::from_vec(vec![3.0, 4.0]);
        let f = DVector::zeros(2);
        let state = view(0.0, &u, &v, &f);
        assert_eq!(DofResponse::displacement(1).extract(&state), 2.0);
        assert_eq!(DofResponse::velocity(0).extract(&state), 3.0);
        assert!(DofResponse::displacement(2).validate(2).is_err());
    }

    #[test]
    fn functional_and_closure_extractors() {
        let u = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let zero = DVector::zeros(3);
        let state = view(0.0, &u, &zero, &zero);
        let mean = LinearFunctional::new(DVector::from_element(3, 1.0 / 3.0));
        assert!((mean.extract(&state) - 2.0).abs() < 1e-15);
        assert!(mean.validate(4).is_err());

        let tip = |s: &StateView<'_>| s.displacement[2] * 10.0;
        assert_eq!(tip.extract(&state), 30.0);
        assert_eq!(FullState.extract(&state), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn collector_rejects_non_increasing_times() {
        let u = DVector::from_vec(vec![0.5]);
        let zero = DVector::zeros(1);
        let mut collector = ResultCollector::new(DofResponse::displacement(0));
        collector.record(&view(0.0, &u, &zero, &zero)).unwrap();
        collector.record(&view(0.1, &u, &zero, &zero)).unwrap();
        let err = collector.record(&view(0.1, &u, &zero, &zero));
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
        assert_eq!(collector.series().len(), 2);
        assert_eq!(collector.into_series().times(), vec![0.0, 0.1]);
    }

    #[test]
    fn writes_scalar_csv() {
        let u = DVector::from_vec(vec![0.25]);
        let zero = DVector::zeros(1);
        let mut collector = ResultCollector::new(DofResponse::displacement(0));
        collector.record(&view(0.0, &u, &zero, &zero)).unwrap();
        collector.record(&view(0.5, &u, &zero, &zero)).unwrap();

        let mut out = Vec::new();
        collector.series().write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "time,value\n0,0.25\n0.5,0.25\n");
    }

    #[test]
    fn writes_vector_csv_and_json() {
        let u = DVector::from_vec(vec![1.0, -1.0]);
        let zero = DVector::zeros(2);
        let mut collector = ResultCollector::new(FullState);
        collector.record(&view(0.0, &u, &zero, &zero)).unwrap();

        let mut csv = Vec::new();
        collector.series().write_csv(&mut csv).unwrap();
        assert_eq!(String::from_utf8(csv).unwrap(), "time,u0,u1\n0,1,-1\n");

        let mut json = Vec::new();
        collector.series().write_json(&mut json).unwrap();
        let parsed: ResponseSeries<Vec<f64>> = serde_json::from_slice(&json).unwrap();
        assert_eq!(&parsed, collector.series());
    }
}
