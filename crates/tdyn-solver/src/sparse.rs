//! Sparse matrix helpers on top of `nalgebra-sparse`.
//!
//! System matrices live in CSR form for the repeated matrix-vector products
//! of the time loop. The dynamic stiffness operator is combined into CSC form
//! because that is what the sparse Cholesky factorization consumes.
//!
//! COO triplets are the assembly format everywhere: duplicate `(i, j)`
//! entries are summed when converting to CSR/CSC.

use crate::error::{Result, SolverError};
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix, SparseEntry};

/// Build a CSR matrix from COO triplets, summing duplicates.
pub fn csr_from_triplets(
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
) -> Result<CsrMatrix<f64>> {
    let coo = CooMatrix::try_from_triplets(nrows, ncols, rows, cols, values)
        .map_err(|e| SolverError::invalid(format!("failed to create COO matrix: {e:?}")))?;
    Ok(CsrMatrix::from(&coo))
}

/// Diagonal CSR matrix with the given diagonal.
pub fn diagonal_csr(diagonal: &DVector<f64>) -> CsrMatrix<f64> {
    let n = diagonal.len();
    let mut coo = CooMatrix::new(n, n);
    for (i, &v) in diagonal.iter().enumerate() {
        coo.push(i, i, v);
    }
    CsrMatrix::from(&coo)
}

/// `y = A·x` without allocating.
///
/// `y` must already have `A.nrows()` entries.
pub fn spmv(a: &CsrMatrix<f64>, x: &DVector<f64>, y: &mut DVector<f64>) {
    debug_assert_eq!(a.ncols(), x.len());
    debug_assert_eq!(a.nrows(), y.len());
    for (i, row) in a.row_iter().enumerate() {
        y[i] = row
            .col_indices()
            .iter()
            .zip(row.values())
            .map(|(&j, &v)| v * x[j])
            .sum();
    }
}

/// `xᵀ·A·x`.
pub fn quadratic_form(a: &CsrMatrix<f64>, x: &DVector<f64>) -> f64 {
    a.row_iter()
        .enumerate()
        .map(|(i, row)| {
            let ax_i: f64 = row
                .col_indices()
                .iter()
                .zip(row.values())
                .map(|(&j, &v)| v * x[j])
                .sum();
            x[i] * ax_i
        })
        .sum()
}

/// Sum of every stored entry.
pub fn entry_sum(a: &CsrMatrix<f64>) -> f64 {
    a.values().iter().sum()
}

/// Diagonal of a square CSR matrix (missing entries read as zero).
pub fn diagonal_of(a: &CsrMatrix<f64>) -> DVector<f64> {
    let mut diag = DVector::zeros(a.nrows().min(a.ncols()));
    for (i, j, &v) in a.triplet_iter() {
        if i == j {
            diag[i] += v;
        }
    }
    diag
}

/// Check `A = Aᵀ` entry by entry, relative to the largest magnitude.
pub fn is_symmetric(a: &CsrMatrix<f64>, rel_tol: f64) -> bool {
    if a.nrows() != a.ncols() {
        return false;
    }
    let scale = a.values().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return true;
    }
    a.triplet_iter().all(|(i, j, &v)| {
        let mirror = match a.get_entry(j, i) {
            Some(SparseEntry::NonZero(&w)) => w,
            _ => 0.0,
        };
        (v - mirror).abs() <= rel_tol * scale
    })
}

/// Fail unless `a` is `n × n`.
pub fn ensure_square(name: &str, a: &CsrMatrix<f64>, n: usize) -> Result<()> {
    if a.nrows() != n || a.ncols() != n {
        return Err(SolverError::invalid(format!(
            "{name} matrix is {}×{}, expected {n}×{n}",
            a.nrows(),
            a.ncols()
        )));
    }
    Ok(())
}

/// `Σ cᵢ·Aᵢ` as a CSC matrix.
///
/// All terms must be `n × n`. Zero coefficients skip their term entirely.
pub fn linear_combination_csc(n: usize, terms: &[(f64, &CsrMatrix<f64>)]) -> Result<CscMatrix<f64>> {
    let capacity = terms.iter().map(|(_, a)| a.nnz()).sum();
    let mut rows = Vec::with_capacity(capacity);
    let mut cols = Vec::with_capacity(capacity);
    let mut values = Vec::with_capacity(capacity);

    for &(coeff, a) in terms {
        ensure_square("operand", a, n)?;
        if coeff == 0.0 {
            continue;
        }
        for (i, j, &v) in a.triplet_iter() {
            rows.push(i);
            cols.push(j);
            values.push(coeff * v);
        }
    }

    let coo = CooMatrix::try_from_triplets(n, n, rows, cols, values)
        .map_err(|e| SolverError::invalid(format!("failed to combine matrices: {e:?}")))?;
    Ok(CscMatrix::from(&coo))
}
