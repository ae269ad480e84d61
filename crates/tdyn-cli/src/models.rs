//! Built-in structural models and the JSON run file that describes a job.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tdyn_solver::sparse::csr_from_triplets;
use tdyn_solver::{
    ConsistentMass, DofResponse, ElementMass, HarmonicLoad, InitialConditions, SolverError,
    TransientConfig,
};

/// Parametric model definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Single mass on a spring
    Oscillator { mass: f64, stiffness: f64 },
    /// Axial bar of 2-node elements, clamped at x = 0
    Bar {
        elements: usize,
        length: f64,
        youngs_modulus: f64,
        area: f64,
        density: f64,
    },
}

/// Consistent mass and stiffness over the free DOFs.
#[derive(Debug, Clone)]
pub struct Model {
    pub mass: ConsistentMass,
    pub stiffness: CsrMatrix<f64>,
}

impl ModelSpec {
    pub fn num_dofs(&self) -> usize {
        match self {
            ModelSpec::Oscillator { .. } => 1,
            ModelSpec::Bar { elements, .. } => *elements,
        }
    }

    pub fn build(&self) -> Result<Model, SolverError> {
        match *self {
            ModelSpec::Oscillator { mass, stiffness } => {
                positive("mass", mass)?;
                positive("stiffness", stiffness)?;
                let mut m = ConsistentMass::new(1);
                m.add_element(ElementMass::unconstrained(
                    DMatrix::from_element(1, 1, mass),
                    vec![0],
                ))?;
                let k = csr_from_triplets(1, 1, vec![0], vec![0], vec![stiffness])?;
                Ok(Model { mass: m, stiffness: k })
            }
            ModelSpec::Bar {
                elements,
                length,
                youngs_modulus,
                area,
                density,
            } => {
                if elements == 0 {
                    return Err(SolverError::InvalidConfiguration(
                        "bar needs at least one element".to_string(),
                    ));
                }
                positive("length", length)?;
                positive("youngs_modulus", youngs_modulus)?;
                positive("area", area)?;
                positive("density", density)?;
                build_bar(elements, length, youngs_modulus * area, density * area)
            }
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), SolverError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(SolverError::InvalidConfiguration(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

/// Element `e` joins nodes `e` and `e + 1`; node `i` carries DOF `i - 1`
/// and node 0 is clamped.
fn build_bar(elements: usize, length: f64, ea: f64, rho_a: f64) -> Result<Model, SolverError> {
    let le = length / elements as f64;
    let me = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]) * (rho_a * le / 6.0);
    let ke = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, -1.0, 1.0]) * (ea / le);

    let mut mass = ConsistentMass::new(elements);
    let mut rows = Vec::with_capacity(4 * elements);
    let mut cols = Vec::with_capacity(4 * elements);
    let mut values = Vec::with_capacity(4 * elements);

    for e in 0..elements {
        let dofs = [e.checked_sub(1), Some(e)];
        mass.add_element(ElementMass::new(me.clone(), dofs.to_vec()))?;

        for (a, row) in dofs.iter().enumerate() {
            let Some(row) = *row else { continue };
            for (b, col) in dofs.iter().enumerate() {
                let Some(col) = *col else { continue };
                rows.push(row);
                cols.push(col);
                values.push(ke[(a, b)]);
            }
        }
    }

    let stiffness = csr_from_triplets(elements, elements, rows, cols, values)?;
    Ok(Model { mass, stiffness })
}

/// A complete job: model, analysis settings, initial state, load and the
/// response to record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFile {
    pub model: ModelSpec,
    pub analysis: TransientConfig,
    #[serde(default)]
    pub initial_displacement: Option<Vec<f64>>,
    #[serde(default)]
    pub initial_velocity: Option<Vec<f64>>,
    #[serde(default)]
    pub load: Option<HarmonicLoad>,
    /// Single DOF to record; the full displacement vector when absent
    #[serde(default)]
    pub response: Option<DofResponse>,
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self, SolverError> {
        let file = std::fs::File::open(path)?;
        let run: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        run.analysis.validate()?;
        Ok(run)
    }

    pub fn initial_conditions(&self) -> InitialConditions {
        let n = self.model.num_dofs();
        let vector = |values: &Option<Vec<f64>>| match values {
            Some(v) => DVector::from_column_slice(v),
            None => DVector::zeros(n),
        };
        InitialConditions::new(
            vector(&self.initial_displacement),
            vector(&self.initial_velocity),
        )
    }

    /// Unit mass on a unit spring released with unit velocity.
    pub fn oscillator_demo(t_end: f64) -> Self {
        Self {
            model: ModelSpec::Oscillator {
                mass: 1.0,
                stiffness: 1.0,
            },
            analysis: TransientConfig::new(t_end)
                .with_fixed_step(0.05)
                .with_energy_recording(true),
            initial_displacement: None,
            initial_velocity: Some(vec![1.0]),
            load: None,
            response: Some(DofResponse::displacement(0)),
        }
    }

    /// 1 m steel bar driven at the tip near its first axial mode.
    pub fn bar_demo(t_end: f64) -> Self {
        let elements = 20;
        Self {
            model: ModelSpec::Bar {
                elements,
                length: 1.0,
                youngs_modulus: 210e9,
                area: 1e-4,
                density: 7850.0,
            },
            analysis: TransientConfig::new(t_end)
                .with_loss_tangent(0.01, 1290.0)
                .with_estimated_step(2.0)
                .with_energy_recording(true),
            initial_displacement: None,
            initial_velocity: None,
            load: Some(HarmonicLoad::from_frequency_hz(elements - 1, 1000.0, 1200.0)),
            response: Some(DofResponse::displacement(elements - 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdyn_solver::MassLumper;

    #[test]
    fn bar_carries_full_mass() {
        let spec = ModelSpec::Bar {
            elements: 4,
            length: 2.0,
            youngs_modulus: 100.0,
            area: 0.5,
            density: 3.0,
        };
        let model = spec.build().unwrap();
        assert_eq!(model.stiffness.nrows(), 4);
        assert!((model.mass.total_mass() - 3.0).abs() < 1e-12);

        let lumped = MassLumper.lump(&model.mass).unwrap();
        assert!((lumped.constrained - 0.375).abs() < 1e-12);
        assert!((lumped.diagonal[3] - 0.375).abs() < 1e-12);
        assert!((lumped.diagonal[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn bar_stiffness_is_tridiagonal() {
        let spec = ModelSpec::Bar {
            elements: 3,
            length: 3.0,
            youngs_modulus: 2.0,
            area: 1.0,
            density: 1.0,
        };
        let k = DMatrix::from(&spec.build().unwrap().stiffness);
        let expected = DMatrix::from_row_slice(3, 3, &[4.0, -2.0, 0.0, -2.0, 4.0, -2.0, 0.0, -2.0, 2.0]);
        assert_eq!(k, expected);
    }

    #[test]
    fn rejects_bad_parameters() {
        let spec = ModelSpec::Oscillator {
            mass: 0.0,
            stiffness: 1.0,
        };
        assert!(matches!(spec.build(), Err(SolverError::InvalidConfiguration(_))));
        let spec = ModelSpec::Bar {
            elements: 0,
            length: 1.0,
            youngs_modulus: 1.0,
            area: 1.0,
            density: 1.0,
        };
        assert!(spec.build().is_err());
    }

    #[test]
    fn parses_run_file() {
        let json = r#"{
            "model": { "type": "bar", "elements": 5, "length": 1.0,
                       "youngs_modulus": 1.0, "area": 1.0, "density": 1.0 },
            "analysis": { "t_end": 0.5, "time_step": { "kind": "fixed", "dt": 0.01 } },
            "initial_velocity": [0.0, 0.0, 0.0, 0.0, 1.0],
            "response": { "dof": 4, "quantity": "velocity" }
        }"#;
        let run: RunFile = serde_json::from_str(json).unwrap();
        assert_eq!(run.model.num_dofs(), 5);
        assert_eq!(run.response, Some(DofResponse::velocity(4)));
        assert!(run.load.is_none());
        let initial = run.initial_conditions();
        assert_eq!(initial.displacement, DVector::zeros(5));
        assert_eq!(initial.velocity[4], 1.0);
    }
}
