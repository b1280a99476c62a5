//! Block-sparse matrix-vector kernels.
//!
//! Every kernel iterates an index whose outer axis matches the output axis,
//! so writes land in disjoint vector segments and outer slices parallelize
//! without coordination. When the requested operation opposes the storage
//! orientation the kernels fall back to the cached transpose, the cached
//! minor index, or a minor index computed on the fly, in that order of
//! preference.

use super::index::{CompressedIndex, IndexIter, SparseBlockIndex, UncompressedIndex};
use super::SparseBlockMatrix;
use crate::block::Block;
use crate::error::{Result, SolverError};
use crate::types::{BlockIndex, Precision};

/// Read-only view of an index as outer slices of `(inner, ptr)` entries.
pub(crate) trait IndexView: Sync {
    /// Number of outer slices.
    fn outer_size(&self) -> usize;
    /// Entries of one outer slice.
    fn entries(&self, outer: BlockIndex) -> IndexIter<'_>;
}

impl IndexView for SparseBlockIndex {
    fn outer_size(&self) -> usize {
        SparseBlockIndex::outer_size(self)
    }

    fn entries(&self, outer: BlockIndex) -> IndexIter<'_> {
        self.slice_iter(outer)
    }
}

impl IndexView for UncompressedIndex {
    fn outer_size(&self) -> usize {
        UncompressedIndex::outer_size(self)
    }

    fn entries(&self, outer: BlockIndex) -> IndexIter<'_> {
        IndexIter::Uncompressed(self.slice(outer).iter())
    }
}

impl IndexView for CompressedIndex {
    fn outer_size(&self) -> usize {
        CompressedIndex::outer_size(self)
    }

    fn entries(&self, outer: BlockIndex) -> IndexIter<'_> {
        let (inner, ptr) = self.slice(outer);
        IndexIter::Compressed { inner, ptr, pos: 0 }
    }
}

/// Splits `v` into consecutive mutable segments delimited by `offsets`.
pub(crate) fn split_segments<'a>(
    mut v: &'a mut [Precision],
    offsets: &[usize],
) -> Vec<&'a mut [Precision]> {
    debug_assert_eq!(v.len(), *offsets.last().unwrap_or(&0));
    let mut segments = Vec::with_capacity(offsets.len().saturating_sub(1));
    for w in offsets.windows(2) {
        let (head, tail) = v.split_at_mut(w[1] - w[0]);
        segments.push(head);
        v = tail;
    }
    segments
}

/// One accumulation pass `y[outer] += alpha * op(B) * x[inner]` over every
/// entry of `idx`, parallel across outer slices.
fn spmv_pass<B: Block, V: IndexView + ?Sized>(
    idx: &V,
    blocks: &[B],
    x: &[Precision],
    in_offsets: &[usize],
    y: &mut [Precision],
    out_offsets: &[usize],
    alpha: Precision,
    transpose_kernel: bool,
) {
    let segments = split_segments(y, out_offsets);
    let run = |(outer, segment): (usize, &mut [Precision])| {
        for (inner, ptr) in idx.entries(outer) {
            let xs = &x[in_offsets[inner]..in_offsets[inner + 1]];
            if transpose_kernel {
                blocks[ptr].tr_mv_add(xs, segment, alpha);
            } else {
                blocks[ptr].mv_add(xs, segment, alpha);
            }
        }
    };
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        segments.into_par_iter().enumerate().for_each(run);
    }
    #[cfg(not(feature = "parallel"))]
    segments.into_iter().enumerate().for_each(run);
}

impl<B: Block> SparseBlockMatrix<B> {
    /// Computes `y = alpha * op(A) * x + beta * y` where `op` is the
    /// identity or, when `transpose` is set, the matrix transpose.
    ///
    /// Symmetric half-storage is expanded transparently; the diagonal
    /// blocks of a symmetric matrix are assumed numerically symmetric.
    pub fn multiply(
        &self,
        transpose: bool,
        x: &[Precision],
        y: &mut [Precision],
        alpha: Precision,
        beta: Precision,
    ) -> Result<()> {
        if !self.major_index().valid() {
            return Err(SolverError::InvalidIndexUse {
                operation: "multiply",
            });
        }
        let (in_dim, out_dim) = if transpose {
            (self.rows(), self.cols())
        } else {
            (self.cols(), self.rows())
        };
        if x.len() != in_dim {
            return Err(SolverError::DimensionMismatch {
                operation: "multiply rhs",
                expected: in_dim,
                actual: x.len(),
            });
        }
        if y.len() != out_dim {
            return Err(SolverError::DimensionMismatch {
                operation: "multiply result",
                expected: out_dim,
                actual: y.len(),
            });
        }

        if beta == 0.0 {
            y.fill(0.0);
        } else if beta != 1.0 {
            for v in y.iter_mut() {
                *v *= beta;
            }
        }

        let col_major = self.flags().is_col_major();
        let (out_offsets, in_offsets) = if transpose {
            (self.col_offsets(), self.row_offsets())
        } else {
            (self.row_offsets(), self.col_offsets())
        };

        if self.flags().is_symmetric() {
            // Stored triangle, then its mirror through the minor index (the
            // minor omits diagonal blocks, so each block contributes once
            // per side).
            spmv_pass(
                self.major_index(),
                self.blocks_slice(),
                x,
                in_offsets,
                y,
                out_offsets,
                alpha,
                col_major,
            );
            if self.transpose_cached() {
                spmv_pass(
                    self.transpose_index(),
                    self.blocks_slice(),
                    x,
                    in_offsets,
                    y,
                    out_offsets,
                    alpha,
                    col_major,
                );
            } else {
                self.with_minor_index(|minor| {
                    spmv_pass(
                        minor,
                        self.blocks_slice(),
                        x,
                        in_offsets,
                        y,
                        out_offsets,
                        alpha,
                        !col_major,
                    )
                });
            }
            return Ok(());
        }

        let aligned = transpose == col_major;
        if aligned {
            spmv_pass(
                self.major_index(),
                self.blocks_slice(),
                x,
                in_offsets,
                y,
                out_offsets,
                alpha,
                transpose,
            );
        } else if self.transpose_cached() {
            spmv_pass(
                self.transpose_index(),
                self.blocks_slice(),
                x,
                in_offsets,
                y,
                out_offsets,
                alpha,
                !transpose,
            );
        } else {
            self.with_minor_index(|minor| {
                spmv_pass(
                    minor,
                    self.blocks_slice(),
                    x,
                    in_offsets,
                    y,
                    out_offsets,
                    alpha,
                    transpose,
                )
            });
        }
        Ok(())
    }

    /// Computes `y += sum_{j != row} A[row, j] * x[j]`: the full block row
    /// minus its diagonal contribution, as consumed by the Gauss-Seidel
    /// sweep.
    ///
    /// For symmetric storage both the stored half-row and its transposed
    /// mirror are read; the mirror comes from the cached transpose when
    /// present, the minor index otherwise. A column-major matrix without a
    /// valid minor index or cached transpose cannot serve row queries and
    /// reports [`SolverError::InvalidIndexUse`].
    pub fn split_row_multiply(
        &self,
        row: BlockIndex,
        x: &[Precision],
        y: &mut [Precision],
    ) -> Result<()> {
        if !self.major_index().valid() {
            return Err(SolverError::InvalidIndexUse {
                operation: "split_row_multiply",
            });
        }
        if x.len() != self.cols() {
            return Err(SolverError::DimensionMismatch {
                operation: "split_row_multiply rhs",
                expected: self.cols(),
                actual: x.len(),
            });
        }
        if y.len() != self.block_rows(row) {
            return Err(SolverError::DimensionMismatch {
                operation: "split_row_multiply result",
                expected: self.block_rows(row),
                actual: y.len(),
            });
        }
        let col_offsets = self.col_offsets();
        let blocks = self.blocks_slice();
        let col_major = self.flags().is_col_major();

        if self.flags().is_symmetric() {
            for (inner, ptr) in self.major_index().slice_iter(row) {
                if inner == row {
                    continue;
                }
                let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                if col_major {
                    blocks[ptr].tr_mv_add(xs, y, 1.0);
                } else {
                    blocks[ptr].mv_add(xs, y, 1.0);
                }
            }
            if self.transpose_cached() {
                for (inner, ptr) in self.transpose_index().entries(row) {
                    let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                    if col_major {
                        blocks[ptr].tr_mv_add(xs, y, 1.0);
                    } else {
                        blocks[ptr].mv_add(xs, y, 1.0);
                    }
                }
            } else if self.minor_index().valid {
                for &(inner, ptr) in self.minor_index().slice(row) {
                    let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                    if col_major {
                        blocks[ptr].mv_add(xs, y, 1.0);
                    } else {
                        blocks[ptr].tr_mv_add(xs, y, 1.0);
                    }
                }
            } else {
                return Err(SolverError::InvalidIndexUse {
                    operation: "split_row_multiply (minor index)",
                });
            }
            return Ok(());
        }

        if !col_major {
            for (inner, ptr) in self.major_index().slice_iter(row) {
                if inner == row {
                    continue;
                }
                let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                blocks[ptr].mv_add(xs, y, 1.0);
            }
        } else if self.minor_index().valid {
            for &(inner, ptr) in self.minor_index().slice(row) {
                if inner == row {
                    continue;
                }
                let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                blocks[ptr].mv_add(xs, y, 1.0);
            }
        } else if self.transpose_cached() {
            for (inner, ptr) in self.transpose_index().entries(row) {
                if inner == row {
                    continue;
                }
                let xs = &x[col_offsets[inner]..col_offsets[inner + 1]];
                blocks[ptr].tr_mv_add(xs, y, 1.0);
            }
        } else {
            return Err(SolverError::InvalidIndexUse {
                operation: "split_row_multiply (row view)",
            });
        }
        Ok(())
    }

    pub(crate) fn blocks_slice(&self) -> &[B] {
        self.raw_blocks()
    }
}

/// Lazily transposed view of a matrix, consumed by multiplication routines
/// without materializing the transpose.
#[derive(Clone, Copy)]
pub struct Transpose<'a, B: Block> {
    /// The viewed matrix.
    pub matrix: &'a SparseBlockMatrix<B>,
}

impl<B: Block> SparseBlockMatrix<B> {
    /// A non-owning transposed view of this matrix.
    pub fn transpose_view(&self) -> Transpose<'_, B> {
        Transpose { matrix: self }
    }
}

impl<'a, B: Block> core::ops::Mul<&'a [Precision]> for &'a SparseBlockMatrix<B> {
    type Output = Vec<Precision>;

    /// Matrix-vector product. Panics on dimension mismatch or unfinalized
    /// index; use [`SparseBlockMatrix::multiply`] for checked evaluation.
    fn mul(self, x: &'a [Precision]) -> Vec<Precision> {
        let mut y = vec![0.0; self.rows()];
        self.multiply(false, x, &mut y, 1.0, 0.0)
            .expect("matrix * vector");
        y
    }
}

impl<'a, B: Block> core::ops::Mul<&'a [Precision]> for Transpose<'a, B> {
    type Output = Vec<Precision>;

    /// Transposed matrix-vector product. Panics on dimension mismatch or
    /// unfinalized index.
    fn mul(self, x: &'a [Precision]) -> Vec<Precision> {
        let mut y = vec![0.0; self.matrix.cols()];
        self.matrix
            .multiply(true, x, &mut y, 1.0, 0.0)
            .expect("transpose * vector");
        y
    }
}

impl<B: Block> core::ops::MulAssign<Precision> for SparseBlockMatrix<B> {
    fn mul_assign(&mut self, alpha: Precision) {
        self.scale(alpha);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Flags;
    use nalgebra::Matrix3;

    fn ones(scale: f64) -> Matrix3<f64> {
        Matrix3::from_element(scale)
    }

    fn lower() -> Matrix3<f64> {
        Matrix3::new(2.0, 0.0, 0.0, 2.0, 2.0, 0.0, 2.0, 2.0, 2.0)
    }

    fn sample(flags: Flags) -> SparseBlockMatrix<Matrix3<f64>> {
        let mut m = SparseBlockMatrix::with_flags(flags);
        m.set_rows(&[3, 3, 3]);
        m.set_cols(&[3, 3, 3]);
        *m.insert_back(0, 0).unwrap() = ones(1.0);
        *m.insert_back(1, 0).unwrap() = lower();
        *m.insert_back(2, 2).unwrap() = ones(3.0);
        m.finalize();
        m
    }

    #[test]
    fn spmv_row_major() {
        let m = sample(Flags::NONE);
        let x = vec![1.0; 9];
        let y = &m * x.as_slice();
        assert_eq!(y, vec![3.0, 3.0, 3.0, 2.0, 4.0, 6.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn spmv_symmetric_expansion() {
        let m = sample(Flags::SYMMETRIC);
        let x = vec![1.0; 9];
        let y = &m * x.as_slice();
        assert_eq!(y, vec![9.0, 7.0, 5.0, 2.0, 4.0, 6.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn spmv_symmetric_with_cached_transpose() {
        let mut m = sample(Flags::SYMMETRIC);
        m.cache_transpose();
        let x = vec![1.0; 9];
        let y = &m * x.as_slice();
        assert_eq!(y, vec![9.0, 7.0, 5.0, 2.0, 4.0, 6.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn spmv_transpose_duality() {
        let m = sample(Flags::NONE);
        let x: Vec<f64> = (0..9).map(|i| 0.5 + i as f64).collect();
        let y: Vec<f64> = (0..9).map(|i| 1.0 - 0.25 * i as f64).collect();
        let ax = &m * x.as_slice();
        let aty = m.transpose_view() * y.as_slice();
        let lhs: f64 = ax.iter().zip(&y).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(&aty).map(|(a, b)| a * b).sum();
        approx::assert_relative_eq!(lhs, rhs, epsilon = 1e-12);
    }

    #[test]
    fn spmv_alpha_beta() {
        let m = sample(Flags::NONE);
        let x = vec![1.0; 9];
        let mut y = vec![1.0; 9];
        m.multiply(false, &x, &mut y, 2.0, 0.5).unwrap();
        assert_eq!(y[0], 0.5 + 2.0 * 3.0);
        assert_eq!(y[3], 0.5 + 2.0 * 2.0);
    }

    #[test]
    fn spmv_col_major_matches_row_major() {
        let mut m = SparseBlockMatrix::with_flags(Flags::COL_MAJOR);
        m.set_rows(&[3, 3, 3]);
        m.set_cols(&[3, 3, 3]);
        *m.insert_back(0, 0).unwrap() = ones(1.0);
        *m.insert_back(1, 0).unwrap() = lower();
        *m.insert_back(2, 2).unwrap() = ones(3.0);
        m.finalize();
        let x = vec![1.0; 9];
        let mut y = vec![0.0; 9];
        m.multiply(false, &x, &mut y, 1.0, 0.0).unwrap();
        assert_eq!(y, vec![3.0, 3.0, 3.0, 2.0, 4.0, 6.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn spmv_dimension_mismatch() {
        let m = sample(Flags::NONE);
        let x = vec![1.0; 6];
        let mut y = vec![0.0; 9];
        assert!(matches!(
            m.multiply(false, &x, &mut y, 1.0, 0.0),
            Err(SolverError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn split_row_excludes_diagonal() {
        let m = sample(Flags::NONE);
        let x = vec![1.0; 9];
        let mut y = vec![1.0; 3];
        m.split_row_multiply(1, &x, &mut y).unwrap();
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
        for row in [0, 2] {
            let mut y = vec![1.0; 3];
            m.split_row_multiply(row, &x, &mut y).unwrap();
            assert_eq!(y, vec![1.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn split_row_symmetric_reads_both_halves() {
        let m = sample(Flags::SYMMETRIC);
        let x = vec![1.0; 9];
        // Row 0 sees the mirrored (0, 1) block: row sums of lower()^T.
        let mut y = vec![0.0; 3];
        m.split_row_multiply(0, &x, &mut y).unwrap();
        assert_eq!(y, vec![6.0, 4.0, 2.0]);

        let mut cached = sample(Flags::SYMMETRIC);
        cached.cache_transpose();
        let mut y2 = vec![0.0; 3];
        cached.split_row_multiply(0, &x, &mut y2).unwrap();
        assert_eq!(y, y2);
    }
}
