//! Block-sparse matrix storage and structural operations.
//!
//! A [`SparseBlockMatrix`] owns a contiguous arena of blocks and a major
//! index sliced along rows or columns. Secondary structures (the minor index
//! and the cached transpose) are derived on demand and invalidated by any
//! structural mutation. Storage behavior is selected once at construction
//! through [`Flags`]: compressed or uncompressed indexing, row- or
//! column-major slicing, and symmetric half-storage where only the triangle
//! with `inner <= outer` is kept.

pub mod index;
pub mod ops;
pub mod product;

use crate::block::Block;
use crate::error::{Result, SolverError};
use crate::types::{BlockIndex, BlockPtr, Flags, Precision};
use index::{CompressedIndex, SparseBlockIndex, UncompressedIndex};
use log::debug;
use nalgebra::DMatrix;

/// Block-sparse matrix with construction-time storage flags.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SparseBlockMatrix<B: Block> {
    rows: usize,
    cols: usize,
    flags: Flags,
    blocks: Vec<B>,
    /// Number of structural blocks; `blocks` additionally holds the cached
    /// transposed blocks past this point when the transpose is cached.
    n_blocks: usize,
    major: SparseBlockIndex,
    minor: UncompressedIndex,
    transpose: CompressedIndex,
}

impl<B: Block> SparseBlockMatrix<B> {
    /// An empty matrix with the given storage flags.
    pub fn with_flags(flags: Flags) -> Self {
        SparseBlockMatrix {
            rows: 0,
            cols: 0,
            flags,
            blocks: Vec::new(),
            n_blocks: 0,
            major: SparseBlockIndex::with_encoding(flags.is_compressed()),
            minor: UncompressedIndex::default(),
            transpose: CompressedIndex::default(),
        }
    }

    /// Storage flags fixed at construction.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Scalar row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Scalar column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of block rows.
    pub fn rows_of_blocks(&self) -> usize {
        self.row_offsets().len().saturating_sub(1)
    }

    /// Number of block columns.
    pub fn cols_of_blocks(&self) -> usize {
        self.col_offsets().len().saturating_sub(1)
    }

    /// Scalar height of block row `i`.
    pub fn block_rows(&self, i: BlockIndex) -> usize {
        let offs = self.row_offsets();
        offs[i + 1] - offs[i]
    }

    /// Scalar width of block column `j`.
    pub fn block_cols(&self, j: BlockIndex) -> usize {
        let offs = self.col_offsets();
        offs[j + 1] - offs[j]
    }

    /// Scalar offsets of block rows; `row_offsets()[i]` is the first scalar
    /// row of block row `i`.
    pub fn row_offsets(&self) -> &[usize] {
        if self.flags.is_col_major() {
            self.major.inner_offsets()
        } else {
            &self.minor.inner_offsets
        }
    }

    /// Scalar offsets of block columns.
    pub fn col_offsets(&self) -> &[usize] {
        if self.flags.is_col_major() {
            &self.minor.inner_offsets
        } else {
            self.major.inner_offsets()
        }
    }

    fn outer_of(&self, row: BlockIndex, col: BlockIndex) -> (BlockIndex, BlockIndex) {
        if self.flags.is_col_major() {
            (col, row)
        } else {
            (row, col)
        }
    }

    /// Number of structural blocks (excluding any cached transposed blocks).
    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    /// Whether the matrix holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.n_blocks == 0
    }

    /// Defines the row structure. Invalidates every cached index; for
    /// symmetric storage the column structure follows automatically.
    pub fn set_rows(&mut self, sizes: &[usize]) {
        let offs = cumulative_offsets(sizes);
        self.rows = *offs.last().unwrap_or(&0);
        if self.flags.is_col_major() {
            *self.major.inner_offsets_mut() = offs;
            self.minor.resize_outer(sizes.len());
        } else {
            self.minor.inner_offsets = offs;
            self.major.resize_outer(sizes.len());
        }
        self.invalidate_caches();
        if self.flags.is_symmetric() && self.cols != self.rows {
            self.set_cols(sizes);
        }
    }

    /// Defines the column structure. Invalidates every cached index.
    pub fn set_cols(&mut self, sizes: &[usize]) {
        let offs = cumulative_offsets(sizes);
        self.cols = *offs.last().unwrap_or(&0);
        if self.flags.is_col_major() {
            self.minor.inner_offsets = offs;
            self.major.resize_outer(sizes.len());
        } else {
            *self.major.inner_offsets_mut() = offs;
            self.minor.resize_outer(sizes.len());
        }
        self.invalidate_caches();
        if self.flags.is_symmetric() && self.rows != self.cols {
            let sizes = sizes.to_vec();
            self.set_rows(&sizes);
        }
    }

    fn invalidate_caches(&mut self) {
        self.minor.clear();
        self.transpose.clear();
        self.blocks.truncate(self.n_blocks);
    }

    /// Reserves room for `n` blocks.
    pub fn reserve(&mut self, n: usize) {
        self.blocks.reserve(n);
        if let SparseBlockIndex::Compressed(idx) = &mut self.major {
            idx.reserve(n);
        }
    }

    /// Inserts a zeroed block at `(row, col)` and returns a mutable
    /// reference to it.
    ///
    /// Compressed storage requires the `(outer, inner)` pair to strictly
    /// exceed the previous insertion ([`SolverError::OrderViolation`]);
    /// symmetric storage rejects blocks outside the stored triangle
    /// ([`SolverError::SymmetryViolation`]).
    pub fn insert_back(&mut self, row: BlockIndex, col: BlockIndex) -> Result<&mut B> {
        let (outer, inner) = self.outer_of(row, col);
        if self.flags.is_symmetric() && inner > outer {
            return Err(SolverError::SymmetryViolation { row, col });
        }
        let ptr = self.blocks.len();
        self.major.insert(outer, inner, ptr)?;
        let shape = (self.block_rows(row), self.block_cols(col));
        self.blocks.push(B::zero(shape.0, shape.1));
        self.n_blocks += 1;
        self.minor.valid = false;
        self.transpose.valid = false;
        Ok(self.blocks.last_mut().expect("block was just pushed"))
    }

    /// Out-of-order insertion, only available for uncompressed storage.
    pub fn insert(&mut self, row: BlockIndex, col: BlockIndex) -> Result<&mut B> {
        if self.flags.is_compressed() {
            return Err(SolverError::UnsupportedLayout {
                operation: "out-of-order insert",
            });
        }
        self.insert_back(row, col)
    }

    /// Finalizes the major index. Must be called after assembly and before
    /// any lookup or linear algebra. For symmetric storage this also
    /// computes the minor index, which the symmetric expansion of
    /// matrix-vector products relies on.
    pub fn finalize(&mut self) {
        self.major.finalize();
        self.minor.valid = false;
        self.transpose.valid = false;
        if self.flags.is_symmetric() {
            self.compute_minor_index();
        }
    }

    /// Whether the major index is finalized.
    pub fn is_finalized(&self) -> bool {
        self.major.valid()
    }

    /// Drops all blocks, keeping the dimensions.
    pub fn clear(&mut self) {
        self.major.clear();
        self.minor.clear();
        self.transpose.clear();
        self.blocks.clear();
        self.n_blocks = 0;
    }

    /// Total number of stored block entries in the major index.
    pub fn nonzero_blocks(&self) -> usize {
        self.major.nonzeros()
    }

    /// The block at arena offset `ptr`.
    pub fn block(&self, ptr: BlockPtr) -> &B {
        &self.blocks[ptr]
    }

    /// Mutable access to the block at arena offset `ptr`.
    pub fn block_mut(&mut self, ptr: BlockPtr) -> &mut B {
        &mut self.blocks[ptr]
    }

    /// Arena offset of the block at `(row, col)`, or `None` if the block is
    /// not stored. For symmetric storage the arguments are reflected into
    /// the stored triangle, in which case the stored block is the transpose
    /// of the requested one.
    pub fn block_ptr(&self, row: BlockIndex, col: BlockIndex) -> Result<Option<BlockPtr>> {
        if !self.major.valid() {
            return Err(SolverError::InvalidIndexUse {
                operation: "block_ptr",
            });
        }
        let (mut outer, mut inner) = self.outer_of(row, col);
        if self.flags.is_symmetric() && inner > outer {
            core::mem::swap(&mut outer, &mut inner);
        }
        Ok(self.major.lower_bound(outer, inner))
    }

    /// The block stored at `(row, col)`, if any. See [`Self::block_ptr`] for
    /// the symmetric reflection rule.
    pub fn block_at(&self, row: BlockIndex, col: BlockIndex) -> Result<Option<&B>> {
        Ok(self.block_ptr(row, col)?.map(|ptr| &self.blocks[ptr]))
    }

    /// Arena offset of the diagonal block of block-row `row`.
    ///
    /// For symmetric storage the diagonal, when present, is the last entry
    /// of its outer slice, which avoids the binary search.
    pub fn diagonal_ptr(&self, row: BlockIndex) -> Result<Option<BlockPtr>> {
        if self.flags.is_symmetric() {
            if !self.major.valid() {
                return Err(SolverError::InvalidIndexUse {
                    operation: "diagonal",
                });
            }
            Ok(self
                .major
                .last(row)
                .filter(|&(inner, _)| inner == row)
                .map(|(_, ptr)| ptr))
        } else {
            self.block_ptr(row, row)
        }
    }

    /// The diagonal block of block-row `row`, if stored.
    pub fn diagonal(&self, row: BlockIndex) -> Result<Option<&B>> {
        Ok(self.diagonal_ptr(row)?.map(|ptr| &self.blocks[ptr]))
    }

    /// Major index accessor.
    pub fn major_index(&self) -> &SparseBlockIndex {
        &self.major
    }

    /// Minor index accessor; only meaningful when valid.
    pub fn minor_index(&self) -> &UncompressedIndex {
        &self.minor
    }

    /// Whether the transpose is cached.
    pub fn transpose_cached(&self) -> bool {
        self.transpose.valid
    }

    /// Computes and caches the minor index (the transposed view of the
    /// major index; for symmetric storage it omits diagonal blocks).
    pub fn compute_minor_index(&mut self) -> bool {
        if self.minor.valid {
            return true;
        }
        debug!(
            "computing minor index ({} outer slices, {} blocks)",
            self.major.inner_size(),
            self.major.nonzeros()
        );
        let offsets = core::mem::take(&mut self.minor.inner_offsets);
        self.minor
            .set_to_transpose(&self.major, self.flags.is_symmetric());
        self.minor.inner_offsets = offsets;
        self.minor.valid
    }

    /// Runs `f` against the minor index, computing a temporary one when no
    /// valid cache exists. Lets `&self` operations (multiplication) use the
    /// transposed view without mutating the matrix.
    pub(crate) fn with_minor_index<R>(&self, f: impl FnOnce(&UncompressedIndex) -> R) -> R {
        if self.minor.valid {
            f(&self.minor)
        } else {
            let mut tmp = UncompressedIndex::default();
            tmp.set_to_transpose(&self.major, self.flags.is_symmetric());
            f(&tmp)
        }
    }

    pub(crate) fn transpose_index(&self) -> &CompressedIndex {
        &self.transpose
    }

    pub(crate) fn raw_blocks(&self) -> &[B] {
        &self.blocks
    }

    pub(crate) fn raw_blocks_mut(&mut self) -> &mut [B] {
        &mut self.blocks
    }

    /// Computes and caches the transpose: every block referenced by the
    /// minor index is transposed into a contiguous extension of the arena,
    /// indexed by a compressed copy of the minor index. Subsequent
    /// multiplications that oppose the storage orientation read this cache.
    pub fn cache_transpose(&mut self) {
        if self.transpose.valid {
            return;
        }
        self.compute_minor_index();
        let base = self.n_blocks;
        self.blocks.truncate(base);

        let mut sources: Vec<BlockPtr> = Vec::with_capacity(self.minor.nonzeros());
        self.transpose.resize_outer(self.minor.outer_size());
        self.transpose.inner_offsets = self.minor.inner_offsets.clone();
        for outer in 0..self.minor.outer_size() {
            for &(inner, ptr) in self.minor.slice(outer) {
                self.transpose
                    .insert(outer, inner, base + sources.len())
                    .expect("minor index slices are sorted");
                sources.push(ptr);
            }
        }
        self.transpose.finalize();

        #[cfg(feature = "parallel")]
        let transposed: Vec<B> = {
            use rayon::prelude::*;
            sources
                .par_iter()
                .map(|&ptr| self.blocks[ptr].transposed())
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let transposed: Vec<B> = sources
            .iter()
            .map(|&ptr| self.blocks[ptr].transposed())
            .collect();
        self.blocks.extend(transposed);
    }

    /// Removes every block whose coefficients all have magnitude at most
    /// `eps`, rebuilding the index and the arena in order.
    pub fn prune(&mut self, eps: Precision) -> Result<()> {
        let old_major = core::mem::replace(
            &mut self.major,
            SparseBlockIndex::with_encoding(self.flags.is_compressed()),
        );
        let old_blocks = core::mem::take(&mut self.blocks);
        *self.major.inner_offsets_mut() = old_major.inner_offsets().to_vec();
        self.major.resize_outer(old_major.outer_size());
        self.n_blocks = 0;

        for outer in 0..old_major.outer_size() {
            for (inner, ptr) in old_major.slice_iter(outer) {
                if !old_blocks[ptr].is_zero(eps) {
                    self.major.insert(outer, inner, self.n_blocks)?;
                    self.blocks.push(old_blocks[ptr].clone());
                    self.n_blocks += 1;
                }
            }
        }
        self.transpose.clear();
        self.minor.clear();
        self.finalize();
        Ok(())
    }

    /// Replaces `self` with the conjugated matrix `B` where
    /// `B[i, j] = A[perm[i], perm[j]]`.
    ///
    /// The block structure must be square. For symmetric storage, entries
    /// whose images land in the unstored triangle are transposed in place.
    /// The rebuild is two-pass: the permuted index is assembled first, then
    /// blocks are moved (and transposed where needed) into a fresh arena.
    pub fn apply_permutation(&mut self, perm: &[usize]) -> Result<()> {
        let n = self.major.outer_size();
        if perm.len() != n || self.rows_of_blocks() != self.cols_of_blocks() {
            return Err(SolverError::DimensionMismatch {
                operation: "apply_permutation",
                expected: n,
                actual: perm.len(),
            });
        }
        if !self.major.valid() {
            return Err(SolverError::InvalidIndexUse {
                operation: "apply_permutation",
            });
        }

        let mut inv = vec![0usize; n];
        for (i, &p) in perm.iter().enumerate() {
            inv[p] = i;
        }

        // Symbolic pass: relocate every entry into permuted coordinates.
        let mut entries: Vec<Vec<(BlockIndex, BlockPtr, bool)>> = vec![Vec::new(); n];
        for outer in 0..n {
            for (inner, ptr) in self.major.slice_iter(outer) {
                let (mut o, mut i) = (inv[outer], inv[inner]);
                let mut transpose = false;
                if self.flags.is_symmetric() && i > o {
                    core::mem::swap(&mut o, &mut i);
                    transpose = true;
                }
                entries[o].push((i, ptr, transpose));
            }
        }
        for row in &mut entries {
            row.sort_unstable_by_key(|&(inner, _, _)| inner);
        }

        // Permute the offset arrays through the block sizes.
        let permuted_offsets = |offs: &[usize]| -> Vec<usize> {
            let sizes: Vec<usize> = perm.iter().map(|&p| offs[p + 1] - offs[p]).collect();
            cumulative_offsets(&sizes)
        };
        let major_offs = permuted_offsets(self.major.inner_offsets());
        let minor_offs = permuted_offsets(&self.minor.inner_offsets);

        // Physical pass: move blocks into the new arena in index order.
        let old_blocks = core::mem::take(&mut self.blocks);
        self.major = SparseBlockIndex::with_encoding(self.flags.is_compressed());
        *self.major.inner_offsets_mut() = major_offs;
        self.major.resize_outer(n);
        self.minor.inner_offsets = minor_offs;
        self.n_blocks = 0;
        for (outer, row) in entries.iter().enumerate() {
            for &(inner, ptr, transpose) in row {
                self.major.insert(outer, inner, self.n_blocks)?;
                self.blocks.push(if transpose {
                    old_blocks[ptr].transposed()
                } else {
                    old_blocks[ptr].clone()
                });
                self.n_blocks += 1;
            }
        }
        self.transpose.clear();
        self.minor.clear();
        self.finalize();
        Ok(())
    }

    /// Copies the block dimensions (not the structure) of `source`.
    pub fn clone_dimensions<C: Block>(&mut self, source: &SparseBlockMatrix<C>) {
        let row_sizes: Vec<usize> = (0..source.rows_of_blocks())
            .map(|i| source.block_rows(i))
            .collect();
        let col_sizes: Vec<usize> = (0..source.cols_of_blocks())
            .map(|j| source.block_cols(j))
            .collect();
        self.set_rows(&row_sizes);
        self.set_cols(&col_sizes);
    }

    /// Copies the dimensions and index structure of `source`, filling the
    /// arena with zero blocks of matching shapes.
    pub fn clone_structure(&mut self, source: &SparseBlockMatrix<B>) -> Result<()> {
        self.clone_dimensions(source);
        for outer in 0..source.major.outer_size() {
            for (inner, _) in source.major.slice_iter(outer) {
                let (row, col) = if self.flags.is_col_major() {
                    (inner, outer)
                } else {
                    (outer, inner)
                };
                self.insert_back(row, col)?;
            }
        }
        if source.is_finalized() {
            self.finalize();
        }
        Ok(())
    }

    /// Produces a matrix with the same structure and converted blocks.
    /// Useful to move between dynamic and fixed block representations once
    /// the shapes are uniform.
    pub fn convert_blocks<C: Block>(&self, f: impl Fn(&B) -> C) -> Result<SparseBlockMatrix<C>> {
        let mut out = SparseBlockMatrix::<C>::with_flags(self.flags);
        out.clone_dimensions(self);
        for outer in 0..self.major.outer_size() {
            for (inner, ptr) in self.major.slice_iter(outer) {
                let (row, col) = if self.flags.is_col_major() {
                    (inner, outer)
                } else {
                    (outer, inner)
                };
                *out.insert_back(row, col)? = f(&self.blocks[ptr]);
            }
        }
        if self.is_finalized() {
            out.finalize();
        }
        Ok(out)
    }

    /// Coefficient-wise scaling of every block, cached transposes included.
    pub fn scale(&mut self, alpha: Precision) {
        for b in &mut self.blocks {
            b.scale_mut(alpha);
        }
    }

    /// SAXPY update `self += alpha * rhs`, merging the block structures.
    ///
    /// Both operands must share flags, orientation and block dimensions.
    pub fn add_scaled(&mut self, rhs: &SparseBlockMatrix<B>, alpha: Precision) -> Result<()> {
        if self.flags != rhs.flags {
            return Err(SolverError::UnsupportedLayout {
                operation: "add_scaled with mismatched flags",
            });
        }
        if self.rows != rhs.rows || self.cols != rhs.cols {
            return Err(SolverError::DimensionMismatch {
                operation: "add_scaled",
                expected: self.rows,
                actual: rhs.rows,
            });
        }
        if !self.major.valid() || !rhs.major.valid() {
            return Err(SolverError::InvalidIndexUse {
                operation: "add_scaled",
            });
        }

        let old_major = core::mem::replace(
            &mut self.major,
            SparseBlockIndex::with_encoding(self.flags.is_compressed()),
        );
        let old_blocks = core::mem::take(&mut self.blocks);
        *self.major.inner_offsets_mut() = old_major.inner_offsets().to_vec();
        self.major.resize_outer(old_major.outer_size());
        self.n_blocks = 0;

        for outer in 0..old_major.outer_size() {
            let mut lhs_it = old_major.slice_iter(outer).peekable();
            let mut rhs_it = rhs.major.slice_iter(outer).peekable();
            loop {
                let merged = match (lhs_it.peek().copied(), rhs_it.peek().copied()) {
                    (None, None) => break,
                    (Some((li, lp)), None) => {
                        lhs_it.next();
                        (li, Some(lp), None)
                    }
                    (None, Some((ri, rp))) => {
                        rhs_it.next();
                        (ri, None, Some(rp))
                    }
                    (Some((li, lp)), Some((ri, rp))) => {
                        if li < ri {
                            lhs_it.next();
                            (li, Some(lp), None)
                        } else if ri < li {
                            rhs_it.next();
                            (ri, None, Some(rp))
                        } else {
                            lhs_it.next();
                            rhs_it.next();
                            (li, Some(lp), Some(rp))
                        }
                    }
                };
                let (inner, lhs_ptr, rhs_ptr) = merged;
                let block = match (lhs_ptr, rhs_ptr) {
                    (Some(lp), Some(rp)) => {
                        let mut b = old_blocks[lp].clone();
                        b.axpy_block(alpha, rhs.block(rp));
                        b
                    }
                    (Some(lp), None) => old_blocks[lp].clone(),
                    (None, Some(rp)) => {
                        let mut b = rhs.block(rp).clone();
                        b.scale_mut(alpha);
                        b
                    }
                    (None, None) => unreachable!(),
                };
                self.major.insert(outer, inner, self.n_blocks)?;
                self.blocks.push(block);
                self.n_blocks += 1;
            }
        }
        self.transpose.clear();
        self.minor.clear();
        self.finalize();
        Ok(())
    }

    /// Iterates the stored blocks as `(row, col, block)` triples in major
    /// index order. Symmetric storage yields only the stored triangle.
    pub fn block_entries(&self) -> impl Iterator<Item = (BlockIndex, BlockIndex, &B)> + '_ {
        let col_major = self.flags.is_col_major();
        (0..self.major.outer_size()).flat_map(move |outer| {
            self.major.slice_iter(outer).map(move |(inner, ptr)| {
                let (r, c) = if col_major {
                    (inner, outer)
                } else {
                    (outer, inner)
                };
                (r, c, &self.blocks[ptr])
            })
        })
    }

    /// Expands the matrix into a dense scalar matrix, mirroring the stored
    /// triangle of symmetric storage. Intended for tests and debugging.
    pub fn to_dense(&self) -> DMatrix<Precision> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        let row_offs = self.row_offsets();
        let col_offs = self.col_offsets();
        for outer in 0..self.major.outer_size() {
            for (inner, ptr) in self.major.slice_iter(outer) {
                let (r, c) = if self.flags.is_col_major() {
                    (inner, outer)
                } else {
                    (outer, inner)
                };
                let block = &self.blocks[ptr];
                for i in 0..block.rows() {
                    for j in 0..block.cols() {
                        dense[(row_offs[r] + i, col_offs[c] + j)] += block.get(i, j);
                        if self.flags.is_symmetric() && r != c {
                            dense[(row_offs[c] + j, col_offs[r] + i)] += block.get(i, j);
                        }
                    }
                }
            }
        }
        dense
    }
}

fn cumulative_offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offs = Vec::with_capacity(sizes.len() + 1);
    offs.push(0);
    for &s in sizes {
        offs.push(offs.last().unwrap() + s);
    }
    offs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Flags;
    use nalgebra::Matrix3;

    fn ones_block(scale: f64) -> Matrix3<f64> {
        Matrix3::from_element(scale)
    }

    fn lower_block() -> Matrix3<f64> {
        Matrix3::new(2.0, 0.0, 0.0, 2.0, 2.0, 0.0, 2.0, 2.0, 2.0)
    }

    fn sample_matrix(flags: Flags) -> SparseBlockMatrix<Matrix3<f64>> {
        let mut m = SparseBlockMatrix::with_flags(flags);
        m.set_rows(&[3, 3, 3]);
        m.set_cols(&[3, 3, 3]);
        *m.insert_back(0, 0).unwrap() = ones_block(1.0);
        *m.insert_back(1, 0).unwrap() = lower_block();
        *m.insert_back(2, 2).unwrap() = ones_block(3.0);
        m.finalize();
        m
    }

    #[test]
    fn lookup_after_finalize() {
        let m = sample_matrix(Flags::NONE);
        assert_eq!(m.n_blocks(), 3);
        assert!(m.block_at(1, 0).unwrap().is_some());
        assert!(m.block_at(0, 1).unwrap().is_none());
        assert_eq!(m.diagonal(2).unwrap(), Some(&ones_block(3.0)));
        assert_eq!(m.diagonal(1).unwrap(), None);
    }

    #[test]
    fn lookup_requires_finalize() {
        let mut m: SparseBlockMatrix<Matrix3<f64>> = SparseBlockMatrix::with_flags(Flags::NONE);
        m.set_rows(&[3]);
        m.set_cols(&[3]);
        m.insert_back(0, 0).unwrap();
        assert!(matches!(
            m.block_at(0, 0),
            Err(SolverError::InvalidIndexUse { .. })
        ));
    }

    #[test]
    fn symmetric_rejects_upper_triangle() {
        let mut m: SparseBlockMatrix<Matrix3<f64>> =
            SparseBlockMatrix::with_flags(Flags::SYMMETRIC);
        m.set_rows(&[3, 3]);
        assert!(matches!(
            m.insert_back(0, 1),
            Err(SolverError::SymmetryViolation { row: 0, col: 1 })
        ));
    }

    #[test]
    fn symmetric_lookup_reflects() {
        let m = sample_matrix(Flags::SYMMETRIC);
        // (0, 1) reflects to the stored (1, 0) block.
        assert_eq!(m.block_at(0, 1).unwrap(), Some(&lower_block()));
        // Symmetric finalize computes the minor index.
        assert!(m.minor_index().valid);
        assert_eq!(m.minor_index().slice(0), &[(1, 1)]);
    }

    #[test]
    fn compressed_enforces_order() {
        let mut m: SparseBlockMatrix<Matrix3<f64>> =
            SparseBlockMatrix::with_flags(Flags::COMPRESSED);
        m.set_rows(&[3, 3]);
        m.set_cols(&[3, 3]);
        m.insert_back(0, 1).unwrap();
        assert!(matches!(
            m.insert_back(0, 0),
            Err(SolverError::OrderViolation { .. })
        ));
        m.insert_back(1, 0).unwrap();
        m.finalize();
        assert_eq!(m.nonzero_blocks(), 2);
    }

    #[test]
    fn prune_drops_zero_blocks() {
        let mut m = sample_matrix(Flags::NONE);
        *m.block_mut(m.block_ptr(2, 2).unwrap().unwrap()) = Matrix3::zeros();
        m.prune(1e-12).unwrap();
        assert_eq!(m.n_blocks(), 2);
        assert!(m.block_at(2, 2).unwrap().is_none());
        assert!(m.block_at(1, 0).unwrap().is_some());
        // Idempotence.
        let before = m.clone();
        m.prune(1e-12).unwrap();
        assert_eq!(before, m);
    }

    #[test]
    fn permutation_roundtrip() {
        let mut m = sample_matrix(Flags::NONE);
        let dense = m.to_dense();
        let perm = [2usize, 0, 1];
        let mut inv = [0usize; 3];
        for (i, &p) in perm.iter().enumerate() {
            inv[p] = i;
        }
        m.apply_permutation(&perm).unwrap();
        let permuted = m.to_dense();
        for bi in 0..3 {
            for bj in 0..3 {
                for i in 0..3 {
                    for j in 0..3 {
                        assert_eq!(
                            permuted[(3 * bi + i, 3 * bj + j)],
                            dense[(3 * perm[bi] + i, 3 * perm[bj] + j)]
                        );
                    }
                }
            }
        }
        m.apply_permutation(&inv).unwrap();
        assert_eq!(m.to_dense(), dense);
    }

    #[test]
    fn symmetric_permutation_transposes_mirrored_blocks() {
        let mut m = sample_matrix(Flags::SYMMETRIC);
        let dense = m.to_dense();
        let perm = [1usize, 0, 2];
        m.apply_permutation(&perm).unwrap();
        let permuted = m.to_dense();
        for i in 0..9 {
            for j in 0..9 {
                let (bi, oi) = (i / 3, i % 3);
                let (bj, oj) = (j / 3, j % 3);
                assert_eq!(
                    permuted[(i, j)],
                    dense[(3 * perm[bi] + oi, 3 * perm[bj] + oj)]
                );
            }
        }
    }

    #[test]
    fn cache_transpose_appends_blocks() {
        let mut m = sample_matrix(Flags::NONE);
        m.cache_transpose();
        assert!(m.transpose_cached());
        assert_eq!(m.n_blocks(), 3);
        // The cached (0, 1) transpose of block (1, 0).
        let tr = m.transpose_index();
        let (_, ptr) = tr.last(0).unwrap();
        assert_eq!(m.block(ptr), &lower_block().transpose());
    }

    #[test]
    fn add_scaled_merges_structures() {
        let mut a = sample_matrix(Flags::NONE);
        let mut b: SparseBlockMatrix<Matrix3<f64>> = SparseBlockMatrix::with_flags(Flags::NONE);
        b.clone_dimensions(&a);
        *b.insert_back(0, 0).unwrap() = ones_block(1.0);
        *b.insert_back(1, 1).unwrap() = ones_block(2.0);
        b.finalize();
        let expected = a.to_dense() + 0.5 * b.to_dense();
        a.add_scaled(&b, 0.5).unwrap();
        assert_eq!(a.to_dense(), expected);
        assert_eq!(a.n_blocks(), 4);
    }
}
