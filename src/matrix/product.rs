//! Sparse block matrix-matrix products.
//!
//! The product runs in two phases. The symbolic phase determines which
//! output blocks are non-empty and records, for each, the ordered list of
//! factor pairs contributing to it (with per-factor transpose flags, which
//! is how symmetric operands expose their unstored triangle). The numeric
//! phase then reduces every output block independently, in the fixed order
//! recorded symbolically, so the result is deterministic under parallelism.
//!
//! Two symbolic strategies are available: the row-wise merge walks sorted
//! row/column lists per output block, while the column-wise scatter loops
//! over the contracted axis and hashes contributions per output row. The
//! latter trades a merge step for better-oriented iteration when the
//! operand indices oppose the row-wise walk.

use super::ops::Transpose;
use super::SparseBlockMatrix;
use crate::block::Block;
use crate::error::{Result, SolverError};
use crate::types::{BlockPtr, Flags};
use fnv::FnvHashMap;
use log::debug;

/// Deferred product of two (optionally transposed) block matrices.
///
/// Built by multiplying matrices or [`Transpose`] views; nothing is
/// computed until [`eval`](Product::eval) materializes the result.
#[derive(Clone, Copy)]
pub struct Product<'a, B: Block> {
    lhs: &'a SparseBlockMatrix<B>,
    rhs: &'a SparseBlockMatrix<B>,
    transpose_lhs: bool,
    transpose_rhs: bool,
    col_wise: bool,
}

/// Ordered factor list of one output block.
#[derive(Default, Clone)]
struct Contribution {
    factors: Vec<((BlockPtr, bool), (BlockPtr, bool))>,
}

/// Per-axis entry lists of an (optionally transposed, possibly symmetric)
/// operand: `lists[a]` holds `(partner, ptr, transpose)` for every block on
/// axis slice `a`.
type EntryLists = Vec<Vec<(usize, BlockPtr, bool)>>;

impl<'a, B: Block> Product<'a, B> {
    /// A deferred `lhs * rhs` with explicit transpose flags.
    pub fn new(
        lhs: &'a SparseBlockMatrix<B>,
        rhs: &'a SparseBlockMatrix<B>,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> Self {
        Product {
            lhs,
            rhs,
            transpose_lhs,
            transpose_rhs,
            col_wise: false,
        }
    }

    /// Selects the column-wise symbolic strategy.
    pub fn col_wise(mut self, enable: bool) -> Self {
        self.col_wise = enable;
        self
    }

    /// Evaluates into a compressed row-major matrix.
    pub fn eval(&self) -> Result<SparseBlockMatrix<B>> {
        self.eval_with_flags(Flags::COMPRESSED)
    }

    /// Evaluates into a matrix with the given storage flags. A symmetric
    /// destination keeps only its lower triangle, which the caller asserts
    /// to be a valid half-storage of the (then necessarily symmetric)
    /// product. Column-major destinations are not supported.
    pub fn eval_with_flags(&self, flags: Flags) -> Result<SparseBlockMatrix<B>> {
        if flags.is_col_major() {
            return Err(SolverError::UnsupportedLayout {
                operation: "column-major product destination",
            });
        }
        if !self.lhs.is_finalized() || !self.rhs.is_finalized() {
            return Err(SolverError::InvalidIndexUse {
                operation: "product",
            });
        }

        let row_sizes = op_axis_sizes(self.lhs, true, self.transpose_lhs);
        let col_sizes = op_axis_sizes(self.rhs, false, self.transpose_rhs);
        let contracted_lhs = op_axis_sizes(self.lhs, false, self.transpose_lhs);
        let contracted_rhs = op_axis_sizes(self.rhs, true, self.transpose_rhs);
        if contracted_lhs != contracted_rhs {
            return Err(SolverError::DimensionMismatch {
                operation: "product contraction",
                expected: contracted_lhs.iter().sum(),
                actual: contracted_rhs.iter().sum(),
            });
        }
        if flags.is_symmetric() && row_sizes != col_sizes {
            return Err(SolverError::DimensionMismatch {
                operation: "symmetric product destination",
                expected: row_sizes.iter().sum(),
                actual: col_sizes.iter().sum(),
            });
        }

        let symbolic = if self.col_wise {
            self.symbolic_col_wise(row_sizes.len(), contracted_lhs.len(), flags.is_symmetric())
        } else {
            self.symbolic_row_wise(row_sizes.len(), col_sizes.len(), flags.is_symmetric())
        };
        let filled: usize = symbolic.iter().map(Vec::len).sum();
        debug!(
            "product symbolic phase: {} of {}x{} output blocks non-empty",
            filled,
            row_sizes.len(),
            col_sizes.len()
        );

        let mut out = SparseBlockMatrix::with_flags(flags);
        out.set_rows(&row_sizes);
        out.set_cols(&col_sizes);
        let mut flat: Vec<Contribution> = Vec::with_capacity(filled);
        for (i, row) in symbolic.into_iter().enumerate() {
            for (j, contribution) in row {
                out.insert_back(i, j)?;
                flat.push(contribution);
            }
        }
        out.finalize();

        // Numeric phase: every output block reduces its own factor list.
        let lhs_blocks = self.lhs.blocks_slice();
        let rhs_blocks = self.rhs.blocks_slice();
        let numeric = |(block, contribution): (&mut B, &Contribution)| {
            for &((lp, lt), (rp, rt)) in &contribution.factors {
                block.gemm_add(&lhs_blocks[lp], &rhs_blocks[rp], lt, rt);
            }
        };
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            out.raw_blocks_mut()
                .par_iter_mut()
                .zip(flat.par_iter())
                .for_each(numeric);
        }
        #[cfg(not(feature = "parallel"))]
        out.raw_blocks_mut()
            .iter_mut()
            .zip(flat.iter())
            .for_each(numeric);

        Ok(out)
    }

    /// Row-wise symbolic phase: merge sorted cursors over `rows(op(lhs))`
    /// and `cols(op(rhs))` for every candidate output block.
    fn symbolic_row_wise(
        &self,
        out_rows: usize,
        out_cols: usize,
        symmetric_dest: bool,
    ) -> Vec<Vec<(usize, Contribution)>> {
        let lhs_rows = axis_lists(self.lhs, true, self.transpose_lhs);
        let rhs_cols = axis_lists(self.rhs, false, self.transpose_rhs);

        let run = |i: usize| -> Vec<(usize, Contribution)> {
            let mut row = Vec::new();
            let last = if symmetric_dest { i + 1 } else { out_cols };
            for (j, rhs_col) in rhs_cols.iter().enumerate().take(last) {
                let mut contribution = Contribution::default();
                let (mut li, mut ri) = (0, 0);
                let lhs_row = &lhs_rows[i];
                while li < lhs_row.len() && ri < rhs_col.len() {
                    let (lk, lp, lt) = lhs_row[li];
                    let (rk, rp, rt) = rhs_col[ri];
                    if lk < rk {
                        li += 1;
                    } else if rk < lk {
                        ri += 1;
                    } else {
                        contribution.factors.push(((lp, lt), (rp, rt)));
                        li += 1;
                        ri += 1;
                    }
                }
                if !contribution.factors.is_empty() {
                    row.push((j, contribution));
                }
            }
            row
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            (0..out_rows).into_par_iter().map(run).collect()
        }
        #[cfg(not(feature = "parallel"))]
        (0..out_rows).map(run).collect()
    }

    /// Column-wise symbolic phase: scatter over the contracted axis into
    /// per-output-row hashes, then merge and canonicalize the factor order
    /// so the numeric reduction stays deterministic.
    fn symbolic_col_wise(
        &self,
        out_rows: usize,
        contracted: usize,
        symmetric_dest: bool,
    ) -> Vec<Vec<(usize, Contribution)>> {
        let lhs_cols = axis_lists(self.lhs, false, self.transpose_lhs);
        let rhs_rows = axis_lists(self.rhs, true, self.transpose_rhs);

        type Scatter = Vec<FnvHashMap<usize, Contribution>>;
        let scatter_k = |maps: &mut Scatter, k: usize| {
            for &(i, lp, lt) in &lhs_cols[k] {
                for &(j, rp, rt) in &rhs_rows[k] {
                    if symmetric_dest && j > i {
                        continue;
                    }
                    maps[i]
                        .entry(j)
                        .or_default()
                        .factors
                        .push(((lp, lt), (rp, rt)));
                }
            }
        };

        #[cfg(feature = "parallel")]
        let maps: Scatter = {
            use rayon::prelude::*;
            (0..contracted)
                .into_par_iter()
                .fold(
                    || vec![FnvHashMap::default(); out_rows],
                    |mut maps, k| {
                        scatter_k(&mut maps, k);
                        maps
                    },
                )
                .reduce(
                    || vec![FnvHashMap::default(); out_rows],
                    |mut a, b| {
                        for (dst, src) in a.iter_mut().zip(b) {
                            for (j, contribution) in src {
                                dst.entry(j)
                                    .or_default()
                                    .factors
                                    .extend(contribution.factors);
                            }
                        }
                        a
                    },
                )
        };
        #[cfg(not(feature = "parallel"))]
        let maps: Scatter = {
            let mut maps = vec![FnvHashMap::default(); out_rows];
            for k in 0..contracted {
                scatter_k(&mut maps, k);
            }
            maps
        };

        maps.into_iter()
            .map(|map| {
                let mut row: Vec<(usize, Contribution)> = map.into_iter().collect();
                row.sort_unstable_by_key(|&(j, _)| j);
                for (_, contribution) in &mut row {
                    contribution.factors.sort_unstable();
                }
                row
            })
            .collect()
    }
}

/// Block sizes of the rows (or columns) of an optionally transposed operand.
fn op_axis_sizes<B: Block>(m: &SparseBlockMatrix<B>, rows: bool, transposed: bool) -> Vec<usize> {
    let offsets = if rows != transposed {
        m.row_offsets()
    } else {
        m.col_offsets()
    };
    offsets.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Builds the per-axis entry lists of `op(m)`: `lists[a]` enumerates the
/// blocks of row `a` of `op(m)` when `rows` is set, of column `a`
/// otherwise, each tagged with the transpose flag to apply to the stored
/// block. Symmetric operands contribute their mirrored triangle with the
/// flag flipped. Lists are sorted by partner index.
fn axis_lists<B: Block>(m: &SparseBlockMatrix<B>, rows: bool, transposed: bool) -> EntryLists {
    // Rows of m^T are the columns of m, with every block transposed.
    let want_rows_of_m = rows != transposed;
    let n = if want_rows_of_m {
        m.rows_of_blocks()
    } else {
        m.cols_of_blocks()
    };
    let mut lists: EntryLists = vec![Vec::new(); n];
    let symmetric = m.flags().is_symmetric();
    let col_major = m.flags().is_col_major();
    let major = m.major_index();
    for outer in 0..major.outer_size() {
        for (inner, ptr) in major.slice_iter(outer) {
            let (r, c) = if col_major {
                (inner, outer)
            } else {
                (outer, inner)
            };
            let (axis, partner) = if want_rows_of_m { (r, c) } else { (c, r) };
            lists[axis].push((partner, ptr, transposed));
            if symmetric && r != c {
                lists[partner].push((axis, ptr, !transposed));
            }
        }
    }
    for list in &mut lists {
        list.sort_unstable_by_key(|&(partner, _, _)| partner);
    }
    lists
}

impl<'a, B: Block> core::ops::Mul for &'a SparseBlockMatrix<B> {
    type Output = Product<'a, B>;

    fn mul(self, rhs: &'a SparseBlockMatrix<B>) -> Product<'a, B> {
        Product::new(self, rhs, false, false)
    }
}

impl<'a, B: Block> core::ops::Mul<&'a SparseBlockMatrix<B>> for Transpose<'a, B> {
    type Output = Product<'a, B>;

    fn mul(self, rhs: &'a SparseBlockMatrix<B>) -> Product<'a, B> {
        Product::new(self.matrix, rhs, true, false)
    }
}

impl<'a, B: Block> core::ops::Mul<Transpose<'a, B>> for &'a SparseBlockMatrix<B> {
    type Output = Product<'a, B>;

    fn mul(self, rhs: Transpose<'a, B>) -> Product<'a, B> {
        Product::new(self, rhs.matrix, false, true)
    }
}

impl<'a, B: Block> core::ops::Mul<Transpose<'a, B>> for Transpose<'a, B> {
    type Output = Product<'a, B>;

    fn mul(self, rhs: Transpose<'a, B>) -> Product<'a, B> {
        Product::new(self.matrix, rhs.matrix, true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn dense(m: &SparseBlockMatrix<DMatrix<f64>>) -> DMatrix<f64> {
        m.to_dense()
    }

    fn build(
        flags: Flags,
        row_sizes: &[usize],
        col_sizes: &[usize],
        entries: &[(usize, usize, f64)],
    ) -> SparseBlockMatrix<DMatrix<f64>> {
        let mut m = SparseBlockMatrix::with_flags(flags);
        m.set_rows(row_sizes);
        m.set_cols(col_sizes);
        for &(i, j, seed) in entries {
            let rows = row_sizes[i];
            let cols = col_sizes[j];
            *m.insert_back(i, j).unwrap() = DMatrix::from_fn(rows, cols, |r, c| {
                seed + 0.3 * r as f64 - 0.7 * c as f64 + 0.1 * (r * c) as f64
            });
        }
        m.finalize();
        m
    }

    #[test]
    fn product_matches_dense_both_strategies() {
        let a = build(
            Flags::NONE,
            &[2, 3],
            &[2, 2, 3],
            &[(0, 0, 1.0), (0, 2, -2.0), (1, 1, 0.5), (1, 2, 2.0)],
        );
        let b = build(
            Flags::NONE,
            &[2, 2, 3],
            &[3, 2],
            &[(0, 0, 2.0), (1, 0, -1.0), (2, 1, 1.5), (2, 0, 0.25)],
        );
        let expected = dense(&a) * dense(&b);

        let row_wise = (&a * &b).eval().unwrap();
        approx::assert_relative_eq!(dense(&row_wise), expected, epsilon = 1e-12);

        let col_wise = (&a * &b).col_wise(true).eval().unwrap();
        approx::assert_relative_eq!(dense(&col_wise), expected, epsilon = 1e-12);
    }

    #[test]
    fn transposed_product_matches_dense() {
        let a = build(Flags::NONE, &[2, 3], &[2, 2], &[(0, 0, 1.0), (1, 1, -1.0)]);
        let b = build(Flags::NONE, &[2, 3], &[3, 2], &[(0, 1, 2.0), (1, 0, 0.5)]);
        let expected = dense(&a).transpose() * dense(&b);
        let got = (a.transpose_view() * &b).eval().unwrap();
        approx::assert_relative_eq!(got.to_dense(), expected, epsilon = 1e-12);
    }

    #[test]
    fn symmetric_operand_expands() {
        let s = build(
            Flags::SYMMETRIC,
            &[2, 2],
            &[2, 2],
            &[(0, 0, 1.0), (1, 0, 2.0), (1, 1, -0.5)],
        );
        let b = build(Flags::NONE, &[2, 2], &[2], &[(0, 0, 1.0), (1, 0, -2.0)]);
        let expected = dense(&s) * dense(&b);
        for col_wise in [false, true] {
            let got = (&s * &b).col_wise(col_wise).eval().unwrap();
            approx::assert_relative_eq!(got.to_dense(), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn symmetric_destination_stores_half() {
        let h = build(Flags::NONE, &[2, 2], &[3], &[(0, 0, 1.0), (1, 0, -0.5)]);
        let product = Product::new(&h, &h, false, true);
        let w = product
            .eval_with_flags(Flags::COMPRESSED | Flags::SYMMETRIC)
            .unwrap();
        let expected = dense(&h) * dense(&h).transpose();
        approx::assert_relative_eq!(w.to_dense(), expected, epsilon = 1e-12);
        // Only the lower triangle is stored.
        assert!(w.block_at(0, 1).unwrap().is_some());
        assert_eq!(w.nonzero_blocks(), 3);
    }

    #[test]
    fn contraction_mismatch_is_reported() {
        let a = build(Flags::NONE, &[2], &[2], &[(0, 0, 1.0)]);
        let b = build(Flags::NONE, &[3], &[2], &[(0, 0, 1.0)]);
        assert!(matches!(
            (&a * &b).eval(),
            Err(SolverError::DimensionMismatch { .. })
        ));
    }
}
