//! Block capability trait and implementations over nalgebra dense types.
//!
//! A block is a small dense sub-matrix stored as one element of the sparse
//! structure. The trait exposes exactly the capabilities the sparse engine
//! and the solvers need: dimension queries, transposition, scalar-slice
//! matrix-vector kernels and accumulating block products. Dynamic blocks are
//! `DMatrix<f64>`; the 2- and 3-dimensional contact hot paths use the fixed
//! `Matrix2<f64>` / `Matrix3<f64>` types.

use crate::types::Precision;
use nalgebra::{DMatrix, Matrix2, Matrix3};

/// Capabilities required from a block of a [`crate::SparseBlockMatrix`].
///
/// Transposition must produce the same type, which restricts implementors to
/// square fixed-size blocks or dynamically sized blocks. The slice-based
/// kernels let the sparse engine work on plain `&[f64]` vector segments
/// without committing callers to a vector type.
pub trait Block: Clone + PartialEq + core::fmt::Debug + Send + Sync + 'static {
    /// A zero block of the given dimensions.
    ///
    /// Fixed-size implementations ignore the arguments (callers are expected
    /// to pass the matching dimensions; this is debug-asserted).
    fn zero(rows: usize, cols: usize) -> Self;

    /// Number of scalar rows.
    fn rows(&self) -> usize;

    /// Number of scalar columns.
    fn cols(&self) -> usize;

    /// Element access, for tests and dense expansion.
    fn get(&self, i: usize, j: usize) -> Precision;

    /// Mutable element access.
    fn set(&mut self, i: usize, j: usize, value: Precision);

    /// Whether every coefficient has magnitude at most `eps`.
    fn is_zero(&self, eps: Precision) -> bool;

    /// The transposed block.
    fn transposed(&self) -> Self;

    /// Frobenius norm.
    fn frobenius_norm(&self) -> Precision;

    /// Coefficient-wise scaling.
    fn scale_mut(&mut self, alpha: Precision);

    /// `self += alpha * other`. Dimensions must match.
    fn axpy_block(&mut self, alpha: Precision, other: &Self);

    /// Adds `alpha` to each diagonal coefficient.
    fn add_diagonal(&mut self, alpha: Precision);

    /// Smallest eigenvalue, assuming the block is symmetric.
    ///
    /// Used by the Gauss-Seidel auto-regularization to lift near-singular
    /// diagonal blocks.
    fn smallest_symmetric_eigenvalue(&self) -> Precision;

    /// `y += alpha * B * x` over scalar slices.
    fn mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision);

    /// `y += alpha * B^T * x` over scalar slices.
    fn tr_mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision);

    /// `self += op(lhs) * op(rhs)`, each operand optionally transposed.
    fn gemm_add(&mut self, lhs: &Self, rhs: &Self, transpose_lhs: bool, transpose_rhs: bool);
}

impl Block for DMatrix<Precision> {
    fn zero(rows: usize, cols: usize) -> Self {
        DMatrix::zeros(rows, cols)
    }

    fn rows(&self) -> usize {
        self.nrows()
    }

    fn cols(&self) -> usize {
        self.ncols()
    }

    fn get(&self, i: usize, j: usize) -> Precision {
        self[(i, j)]
    }

    fn set(&mut self, i: usize, j: usize, value: Precision) {
        self[(i, j)] = value;
    }

    fn is_zero(&self, eps: Precision) -> bool {
        self.iter().all(|v| v.abs() <= eps)
    }

    fn transposed(&self) -> Self {
        self.transpose()
    }

    fn frobenius_norm(&self) -> Precision {
        self.norm()
    }

    fn scale_mut(&mut self, alpha: Precision) {
        *self *= alpha;
    }

    fn axpy_block(&mut self, alpha: Precision, other: &Self) {
        debug_assert_eq!(self.shape(), other.shape());
        for (dst, src) in self.iter_mut().zip(other.iter()) {
            *dst += alpha * src;
        }
    }

    fn add_diagonal(&mut self, alpha: Precision) {
        let n = self.nrows().min(self.ncols());
        for i in 0..n {
            self[(i, i)] += alpha;
        }
    }

    fn smallest_symmetric_eigenvalue(&self) -> Precision {
        self.symmetric_eigenvalues()
            .iter()
            .cloned()
            .fold(Precision::INFINITY, Precision::min)
    }

    fn mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision) {
        debug_assert_eq!(x.len(), self.ncols());
        debug_assert_eq!(y.len(), self.nrows());
        for i in 0..self.nrows() {
            let mut acc = 0.0;
            for j in 0..self.ncols() {
                acc += self[(i, j)] * x[j];
            }
            y[i] += alpha * acc;
        }
    }

    fn tr_mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision) {
        debug_assert_eq!(x.len(), self.nrows());
        debug_assert_eq!(y.len(), self.ncols());
        for j in 0..self.ncols() {
            let mut acc = 0.0;
            for i in 0..self.nrows() {
                acc += self[(i, j)] * x[i];
            }
            y[j] += alpha * acc;
        }
    }

    fn gemm_add(&mut self, lhs: &Self, rhs: &Self, transpose_lhs: bool, transpose_rhs: bool) {
        let prod = match (transpose_lhs, transpose_rhs) {
            (false, false) => lhs * rhs,
            (true, false) => lhs.transpose() * rhs,
            (false, true) => lhs * rhs.transpose(),
            (true, true) => lhs.transpose() * rhs.transpose(),
        };
        debug_assert_eq!(self.shape(), prod.shape());
        *self += prod;
    }
}

macro_rules! impl_block_fixed {
    ($mat:ty, $dim:expr) => {
        impl Block for $mat {
            fn zero(rows: usize, cols: usize) -> Self {
                debug_assert_eq!((rows, cols), ($dim, $dim));
                let _ = (rows, cols);
                <$mat>::zeros()
            }

            fn rows(&self) -> usize {
                $dim
            }

            fn cols(&self) -> usize {
                $dim
            }

            fn get(&self, i: usize, j: usize) -> Precision {
                self[(i, j)]
            }

            fn set(&mut self, i: usize, j: usize, value: Precision) {
                self[(i, j)] = value;
            }

            fn is_zero(&self, eps: Precision) -> bool {
                self.iter().all(|v| v.abs() <= eps)
            }

            fn transposed(&self) -> Self {
                self.transpose()
            }

            fn frobenius_norm(&self) -> Precision {
                self.norm()
            }

            fn scale_mut(&mut self, alpha: Precision) {
                *self *= alpha;
            }

            fn axpy_block(&mut self, alpha: Precision, other: &Self) {
                *self += other * alpha;
            }

            fn add_diagonal(&mut self, alpha: Precision) {
                for i in 0..$dim {
                    self[(i, i)] += alpha;
                }
            }

            fn smallest_symmetric_eigenvalue(&self) -> Precision {
                self.symmetric_eigenvalues()
                    .iter()
                    .cloned()
                    .fold(Precision::INFINITY, Precision::min)
            }

            fn mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision) {
                debug_assert_eq!(x.len(), $dim);
                debug_assert_eq!(y.len(), $dim);
                for i in 0..$dim {
                    let mut acc = 0.0;
                    for j in 0..$dim {
                        acc += self[(i, j)] * x[j];
                    }
                    y[i] += alpha * acc;
                }
            }

            fn tr_mv_add(&self, x: &[Precision], y: &mut [Precision], alpha: Precision) {
                debug_assert_eq!(x.len(), $dim);
                debug_assert_eq!(y.len(), $dim);
                for j in 0..$dim {
                    let mut acc = 0.0;
                    for i in 0..$dim {
                        acc += self[(i, j)] * x[i];
                    }
                    y[j] += alpha * acc;
                }
            }

            fn gemm_add(
                &mut self,
                lhs: &Self,
                rhs: &Self,
                transpose_lhs: bool,
                transpose_rhs: bool,
            ) {
                let prod = match (transpose_lhs, transpose_rhs) {
                    (false, false) => lhs * rhs,
                    (true, false) => lhs.transpose() * rhs,
                    (false, true) => lhs * rhs.transpose(),
                    (true, true) => lhs.transpose() * rhs.transpose(),
                };
                *self += prod;
            }
        }
    };
}

impl_block_fixed!(Matrix2<Precision>, 2);
impl_block_fixed!(Matrix3<Precision>, 3);
