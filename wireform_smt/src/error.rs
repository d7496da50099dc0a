//! Error types for the solver backend.

use std::fmt;

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// An error raised by the proof backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    /// The IR contains a construct the backend cannot encode.
    Unsupported { construct: String },

    /// An operand has the wrong sort for its operator.
    SortMismatch { operator: String, expected: String },

    /// The underlying solver reported an internal failure.
    Backend { message: String },
}

impl SolverError {
    /// Create an unsupported-construct error.
    pub fn unsupported(construct: impl Into<String>) -> Self {
        SolverError::Unsupported {
            construct: construct.into(),
        }
    }

    /// Create a sort mismatch error.
    pub fn sort_mismatch(operator: impl Into<String>, expected: impl Into<String>) -> Self {
        SolverError::SortMismatch {
            operator: operator.into(),
            expected: expected.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        SolverError::Backend {
            message: message.into(),
        }
    }
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::Unsupported { construct } => {
                write!(f, "unsupported construct in solver input: {}", construct)
            }
            SolverError::SortMismatch { operator, expected } => {
                write!(f, "operand of \"{}\" is not of sort {}", operator, expected)
            }
            SolverError::Backend { message } => {
                write!(f, "solver backend error: {}", message)
            }
        }
    }
}

impl std::error::Error for SolverError {}
