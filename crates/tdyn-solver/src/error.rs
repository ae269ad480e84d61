//! Error types for transient analysis.

use thiserror::Error;

/// Result type alias using [`SolverError`].
pub type Result<T> = std::result::Result<T, SolverError>;

/// Errors that abort a transient run.
///
/// None of these are retried locally: each one means the inputs are
/// malformed or the model is numerically inconsistent, so the caller has to
/// fix the inputs and restart the whole pipeline.
#[derive(Error, Debug)]
pub enum SolverError {
    /// Mass lumping produced a zero (or negative) scale denominator or a
    /// degree of freedom without mass.
    #[error("singular mass: {0}")]
    SingularMass(String),

    /// The largest-eigenvalue estimate ran out of iterations.
    #[error(
        "eigenvalue estimate did not converge after {iterations} iterations (last estimate {last_estimate:.6e})"
    )]
    EigenNotConverged { iterations: usize, last_estimate: f64 },

    /// The dynamic stiffness operator could not be factored or solved.
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// Non-positive step, bad end time, mismatched dimensions and similar.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O errors while exporting results.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SolverError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SolverError::InvalidConfiguration(msg.into())
    }
}
