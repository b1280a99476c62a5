//! Non-smooth law interface and the projected block Gauss-Seidel solver.
//!
//! The solver iterates over block rows of a system `u = A x + b`, delegating
//! each row to a per-row non-smooth law. The law abstracts the local
//! complementarity problem: the second-order cone laws of [`crate::soc`] are
//! the canonical implementation, but anything satisfying [`NonSmoothLaw`]
//! plugs in.

pub mod coloring;
pub mod gauss_seidel;

pub use coloring::color_rows;
pub use gauss_seidel::{ColoringStrategy, GaussSeidel, GaussSeidelOptions};

use crate::block::Block;
use crate::types::Precision;

/// Per-row non-smooth constraint law driven by the Gauss-Seidel solver.
///
/// Implementations must be reentrant: `solve_local` is called concurrently
/// for distinct rows and must not retain state across calls.
pub trait NonSmoothLaw: Sync {
    /// Diagonal block type of the systems this law solves.
    type Block: Block;

    /// Dimension of one constraint row (2 or 3 for contact problems).
    fn dimension(&self) -> usize;

    /// Error contribution of row `index` for the candidate `(r, u)` pair;
    /// zero exactly when the pair satisfies the law.
    fn eval_local(&self, index: usize, r: &[Precision], u: &[Precision]) -> Precision;

    /// Attempts to update `r` so that `(r, w * r + b)` satisfies the law,
    /// all other rows held fixed. `scaling` is the per-row conditioning
    /// factor computed by the solver. Returns whether the local solve
    /// reached its tolerance; on failure `r` should hold the best estimate
    /// found.
    fn solve_local(
        &self,
        index: usize,
        w: &Self::Block,
        b: &[Precision],
        r: &mut [Precision],
        scaling: Precision,
    ) -> bool;
}
