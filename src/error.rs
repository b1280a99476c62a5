//! Error types for matrix assembly and solver execution.
//!
//! Structural errors (dimension mismatches, ordering or symmetry violations,
//! use of an unfinalized index) are fatal and reported at the point of
//! violation. Numeric non-convergence is never an error: iterative solvers
//! report it through their returned residual.

use thiserror::Error;

/// Result type alias for fallible matrix and solver operations.
pub type Result<T> = core::result::Result<T, SolverError>;

/// Error conditions raised by matrix assembly, lookup and linear algebra.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolverError {
    /// Operand dimensions are inconsistent with the matrix dimensions or
    /// block shapes.
    #[error("dimension mismatch in {operation}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Context where the mismatch occurred
        operation: &'static str,
        /// Expected scalar dimension
        expected: usize,
        /// Actual scalar dimension found
        actual: usize,
    },

    /// Insertion into a compressed index did not strictly increase the
    /// (outer, inner) pair.
    #[error("insertion at ({outer}, {inner}) breaks the compressed index ordering")]
    OrderViolation {
        /// Outer index of the offending insertion
        outer: usize,
        /// Inner index of the offending insertion
        inner: usize,
    },

    /// Insertion into a symmetric matrix targeted the unstored triangle.
    #[error("block ({row}, {col}) lies outside the stored symmetric triangle")]
    SymmetryViolation {
        /// Row of the offending insertion
        row: usize,
        /// Column of the offending insertion
        col: usize,
    },

    /// An operation requiring a finalized major index was called on a matrix
    /// whose index is not valid.
    #[error("matrix index is not finalized; {operation} requires finalize()")]
    InvalidIndexUse {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The requested operation is not available for this storage layout.
    #[error("operation {operation} is not supported for this storage layout")]
    UnsupportedLayout {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// A block that must be factorized turned out singular.
    #[error("block {index} is singular and cannot be factorized")]
    SingularBlock {
        /// Arena index of the offending block
        index: usize,
    },
}
