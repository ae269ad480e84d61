//! HRZ (energy-equivalent diagonal scaling) mass lumping.
//!
//! Each element's consistent mass block is reduced to its diagonal, and the
//! diagonal is rescaled so that it carries the element's full mass:
//!
//! ```text
//! s_e   = Σᵢⱼ m_ij / Σᵢ m_ii
//! m̃_ii = s_e · m_ii
//! ```
//!
//! so `Σ m̃_ii = Σ m_ij` per element, and the lumped global diagonal carries
//! exactly the total mass of the consistent matrix. Unlike row-sum lumping,
//! HRZ never produces negative diagonal entries for higher-order elements.

use crate::error::{Result, SolverError};
use crate::sparse::{self, csr_from_triplets, diagonal_csr};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Relative tolerance used by [`MassLumper::lump`] to re-check conservation.
pub const CONSERVATION_TOLERANCE: f64 = 1e-10;

/// Consistent mass contribution of one element.
#[derive(Debug, Clone)]
pub struct ElementMass {
    /// Local consistent mass matrix (symmetric)
    pub matrix: DMatrix<f64>,
    /// Free-DOF index of each local DOF; `None` for constrained DOFs
    pub dofs: Vec<Option<usize>>,
}

impl ElementMass {
    pub fn new(matrix: DMatrix<f64>, dofs: Vec<Option<usize>>) -> Self {
        Self { matrix, dofs }
    }

    /// Element whose local DOFs are all free.
    pub fn unconstrained(matrix: DMatrix<f64>, dofs: Vec<usize>) -> Self {
        Self::new(matrix, dofs.into_iter().map(Some).collect())
    }

    /// Sum of every entry of the local matrix.
    pub fn total(&self) -> f64 {
        self.matrix.sum()
    }

    /// HRZ scale factor `Σ m_ij / Σ m_ii`.
    pub fn hrz_scale(&self) -> Option<f64> {
        let diag_sum = self.matrix.diagonal().sum();
        if diag_sum == 0.0 || !diag_sum.is_finite() {
            return None;
        }
        Some(self.total() / diag_sum)
    }
}

/// Element-wise consistent mass of a structure over `n` free DOFs.
#[derive(Debug, Clone, Default)]
pub struct ConsistentMass {
    num_dofs: usize,
    elements: Vec<ElementMass>,
}

impl ConsistentMass {
    pub fn new(num_dofs: usize) -> Self {
        Self {
            num_dofs,
            elements: Vec::new(),
        }
    }

    /// Add one element block after checking its shape and DOF map.
    pub fn add_element(&mut self, element: ElementMass) -> Result<()> {
        let size = element.dofs.len();
        if element.matrix.nrows() != size || element.matrix.ncols() != size {
            return Err(SolverError::invalid(format!(
                "element mass is {}×{} but maps {size} DOFs",
                element.matrix.nrows(),
                element.matrix.ncols()
            )));
        }
        if let Some(dof) = element.dofs.iter().flatten().find(|&&d| d >= self.num_dofs) {
            return Err(SolverError::invalid(format!(
                "element DOF {dof} out of range (system has {} DOFs)",
                self.num_dofs
            )));
        }
        self.elements.push(element);
        Ok(())
    }

    /// Treat an assembled global consistent matrix as a single block.
    pub fn from_global(matrix: &CsrMatrix<f64>) -> Result<Self> {
        let n = matrix.nrows();
        sparse::ensure_square("consistent mass", matrix, n)?;
        let mut mass = Self::new(n);
        mass.add_element(ElementMass::unconstrained(DMatrix::from(matrix), (0..n).collect()))?;
        Ok(mass)
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    pub fn elements(&self) -> &[ElementMass] {
        &self.elements
    }

    /// Total mass carried by all elements, constrained DOFs included.
    pub fn total_mass(&self) -> f64 {
        self.elements.iter().map(ElementMass::total).sum()
    }

    /// Assemble the global consistent matrix over the free DOFs.
    ///
    /// Entries coupling to constrained DOFs are dropped, so the sum of this
    /// matrix equals [`total_mass`](Self::total_mass) only when nothing is
    /// constrained.
    pub fn assemble(&self) -> Result<CsrMatrix<f64>> {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();

        for element in &self.elements {
            for (i_local, i_global) in element.dofs.iter().enumerate() {
                let Some(i_global) = *i_global else { continue };
                for (j_local, j_global) in element.dofs.iter().enumerate() {
                    let Some(j_global) = *j_global else { continue };
                    rows.push(i_global);
                    cols.push(j_global);
                    values.push(element.matrix[(i_local, j_local)]);
                }
            }
        }

        csr_from_triplets(self.num_dofs, self.num_dofs, rows, cols, values)
    }
}

/// Diagonal lumped mass over the free DOFs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LumpedMass {
    /// Lumped diagonal, one entry per free DOF
    pub diagonal: DVector<f64>,
    /// Lumped mass that landed on constrained DOFs
    pub constrained: f64,
}

impl LumpedMass {
    pub fn dimension(&self) -> usize {
        self.diagonal.len()
    }

    /// Mass on the free DOFs plus mass on constrained DOFs.
    pub fn total(&self) -> f64 {
        self.diagonal.sum() + self.constrained
    }

    /// Diagonal mass matrix in CSR form.
    pub fn to_csr(&self) -> CsrMatrix<f64> {
        diagonal_csr(&self.diagonal)
    }

    /// Verify that lumping preserved the consistent total mass.
    pub fn check_conservation(&self, consistent: &ConsistentMass, rel_tol: f64) -> Result<()> {
        let expected = consistent.total_mass();
        let actual = self.total();
        let scale = expected.abs().max(f64::MIN_POSITIVE);
        let rel_error = (actual - expected).abs() / scale;
        if rel_error > rel_tol {
            return Err(SolverError::SingularMass(format!(
                "lumped total mass {actual:.12e} differs from consistent total {expected:.12e} \
                 (relative error {rel_error:.3e})"
            )));
        }
        if rel_error > 0.1 * rel_tol {
            warn!(rel_error, "mass conservation is close to tolerance");
        }
        Ok(())
    }
}

/// Converts a consistent mass matrix into an HRZ-lumped diagonal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MassLumper;

impl MassLumper {
    /// Lump every element block and scatter the scaled diagonals.
    ///
    /// # Errors
    /// - `SingularMass` if an element's diagonal sums to zero, if a free DOF
    ///   ends up with non-positive mass, or if the conservation re-check fails.
    pub fn lump(&self, consistent: &ConsistentMass) -> Result<LumpedMass> {
        let mut diagonal = DVector::zeros(consistent.num_dofs());
        let mut constrained = 0.0;

        for (index, element) in consistent.elements().iter().enumerate() {
            let scale = element.hrz_scale().ok_or_else(|| {
                SolverError::SingularMass(format!(
                    "element {index} has a zero diagonal sum, cannot compute HRZ scale"
                ))
            })?;

            for (local, dof) in element.dofs.iter().enumerate() {
                let lumped = scale * element.matrix[(local, local)];
                match dof {
                    Some(dof) => diagonal[*dof] += lumped,
                    None => constrained += lumped,
                }
            }
        }

        if let Some((dof, &m)) = diagonal.iter().enumerate().find(|(_, m)| **m <= 0.0) {
            return Err(SolverError::SingularMass(format!(
                "DOF {dof} has lumped mass {m:.3e}, every free DOF must carry mass"
            )));
        }

        let lumped = LumpedMass {
            diagonal,
            constrained,
        };
        lumped.check_conservation(consistent, CONSERVATION_TOLERANCE)?;

        info!(
            dofs = lumped.dimension(),
            elements = consistent.elements().len(),
            total_mass = lumped.total(),
            "lumped mass matrix"
        );
        debug!(constrained_mass = constrained, "mass on constrained DOFs");

        Ok(lumped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Consistent mass of a 2-node axial bar element.
    fn bar_mass(total: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]) * (total / 6.0)
    }

    /// Consistent mass of a 3-node quadratic bar element (ρAL/30).
    fn quadratic_bar_mass(total: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[4.0, -1.0, 2.0, -1.0, 4.0, 2.0, 2.0, 2.0, 16.0])
            * (total / 30.0)
    }

    #[test]
    fn single_bar_splits_mass_evenly() {
        let mut mass = ConsistentMass::new(2);
        mass.add_element(ElementMass::unconstrained(bar_mass(3.0), vec![0, 1]))
            .unwrap();
        let lumped = MassLumper.lump(&mass).unwrap();
        assert!((lumped.diagonal[0] - 1.5).abs() < 1e-14);
        assert!((lumped.diagonal[1] - 1.5).abs() < 1e-14);
    }

    #[test]
    fn quadratic_element_stays_positive() {
        let mut mass = ConsistentMass::new(3);
        mass.add_element(ElementMass::unconstrained(quadratic_bar_mass(1.0), vec![0, 1, 2]))
            .unwrap();
        let lumped = MassLumper.lump(&mass).unwrap();
        assert!((lumped.diagonal[0] - 1.0 / 6.0).abs() < 1e-14);
        assert!((lumped.diagonal[1] - 1.0 / 6.0).abs() < 1e-14);
        assert!((lumped.diagonal[2] - 2.0 / 3.0).abs() < 1e-14);
    }

    #[test]
    fn conserves_mass_of_unconstrained_chain() {
        let n_elem = 7;
        let mut mass = ConsistentMass::new(n_elem + 1);
        for e in 0..n_elem {
            let m_e = 0.5 + e as f64 * 0.25;
            mass.add_element(ElementMass::unconstrained(bar_mass(m_e), vec![e, e + 1]))
                .unwrap();
        }
        let lumped = MassLumper.lump(&mass).unwrap();
        let consistent = mass.assemble().unwrap();
        let sum_lumped = lumped.to_csr().values().iter().sum::<f64>();
        let sum_consistent = sparse::entry_sum(&consistent);
        assert!(
            (sum_lumped - sum_consistent).abs() < 1e-12 * sum_consistent,
            "{sum_lumped} vs {sum_consistent}"
        );
        assert_eq!(lumped.constrained, 0.0);
    }

    #[test]
    fn constrained_dofs_keep_their_share_of_mass() {
        let mut mass = ConsistentMass::new(1);
        mass.add_element(ElementMass::new(bar_mass(2.0), vec![None, Some(0)]))
            .unwrap();
        let lumped = MassLumper.lump(&mass).unwrap();
        assert!((lumped.diagonal[0] - 1.0).abs() < 1e-14);
        assert!((lumped.constrained - 1.0).abs() < 1e-14);
        assert!((lumped.total() - mass.total_mass()).abs() < 1e-14);
    }

    #[test]
    fn global_matrix_lumps_as_one_block() {
        let mut mass = ConsistentMass::new(3);
        mass.add_element(ElementMass::unconstrained(bar_mass(1.0), vec![0, 1]))
            .unwrap();
        mass.add_element(ElementMass::unconstrained(bar_mass(1.0), vec![1, 2]))
            .unwrap();
        let global = mass.assemble().unwrap();
        let lumped = MassLumper
            .lump(&ConsistentMass::from_global(&global).unwrap())
            .unwrap();
        assert!((lumped.total() - 2.0).abs() < 1e-14);
        // Diagonal is (2, 4, 2)/6, so scale = 2 / (8/6)
        assert!((lumped.diagonal[1] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn zero_diagonal_is_singular() {
        let mut mass = ConsistentMass::new(2);
        let degenerate = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        mass.add_element(ElementMass::unconstrained(degenerate, vec![0, 1]))
            .unwrap();
        assert!(matches!(
            MassLumper.lump(&mass),
            Err(SolverError::SingularMass(_))
        ));
    }

    #[test]
    fn massless_dof_is_singular() {
        let mut mass = ConsistentMass::new(3);
        mass.add_element(ElementMass::unconstrained(bar_mass(1.0), vec![0, 1]))
            .unwrap();
        assert!(matches!(
            MassLumper.lump(&mass),
            Err(SolverError::SingularMass(_))
        ));
    }

    #[test]
    fn rejects_bad_element_shapes() {
        let mut mass = ConsistentMass::new(2);
        let err = mass.add_element(ElementMass::unconstrained(bar_mass(1.0), vec![0]));
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
        let err = mass.add_element(ElementMass::unconstrained(bar_mass(1.0), vec![0, 2]));
        assert!(matches!(err, Err(SolverError::InvalidConfiguration(_))));
    }

    #[test]
    fn conservation_check_flags_lost_mass() {
        let mut mass = ConsistentMass::new(2);
        mass.add_element(ElementMass::unconstrained(bar_mass(2.0), vec![0, 1]))
            .unwrap();
        let lossy = LumpedMass {
            diagonal: DVector::from_vec(vec![1.0, 0.9]),
            constrained: 0.0,
        };
        assert!(lossy.check_conservation(&mass, 1e-6).is_err());
    }
}
