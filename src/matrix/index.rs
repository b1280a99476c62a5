//! Sparse block index encodings.
//!
//! An index maps each outer slice (a block row for row-major storage) to an
//! ordered list of `(inner, block_ptr)` pairs. Two encodings share one
//! capability set: the uncompressed form accepts out-of-order insertion and
//! sorts on [`finalize`](UncompressedIndex::finalize); the compressed form
//! stores three flat arrays and requires strictly increasing insertion.
//! Both carry the `inner_offsets` array giving the scalar offset of every
//! block along the inner axis, which is what segments vectors during linear
//! algebra.

use crate::error::{Result, SolverError};
use crate::types::{BlockIndex, BlockPtr};

/// Uncompressed sparse block index: one vector of `(inner, ptr)` pairs per
/// outer slice.
///
/// Also serves as the minor (transposed-view) index of a matrix, where block
/// pointers cannot be contiguous.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UncompressedIndex {
    /// Scalar offset of each inner block; `inner_offsets[k+1] - inner_offsets[k]`
    /// is the width of inner block `k`.
    pub inner_offsets: Vec<usize>,
    outer: Vec<Vec<(BlockIndex, BlockPtr)>>,
    /// True after a successful finalize; cleared by any mutation.
    pub valid: bool,
}

impl UncompressedIndex {
    /// Resets the index to `size` empty outer slices.
    pub fn resize_outer(&mut self, size: usize) {
        self.outer.clear();
        self.outer.resize(size, Vec::new());
        self.valid = false;
    }

    /// Number of outer slices.
    pub fn outer_size(&self) -> usize {
        self.outer.len()
    }

    /// Number of inner blocks, from the offsets array.
    pub fn inner_size(&self) -> usize {
        self.inner_offsets.len().saturating_sub(1)
    }

    /// Appends an entry to an outer slice. Any order is accepted; `finalize`
    /// restores the sorted invariant.
    pub fn insert(&mut self, outer: BlockIndex, inner: BlockIndex, ptr: BlockPtr) {
        self.outer[outer].push((inner, ptr));
        self.valid = false;
    }

    /// Sorts every outer slice by inner index, in parallel across slices.
    ///
    /// Duplicate `(outer, inner)` pairs are forbidden once finalized; this is
    /// checked in debug builds only.
    pub fn finalize(&mut self) {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.outer
                .par_iter_mut()
                .for_each(|row| row.sort_unstable_by_key(|&(inner, _)| inner));
        }
        #[cfg(not(feature = "parallel"))]
        for row in &mut self.outer {
            row.sort_unstable_by_key(|&(inner, _)| inner);
        }
        debug_assert!(self
            .outer
            .iter()
            .all(|row| row.windows(2).all(|w| w[0].0 < w[1].0)));
        self.valid = true;
    }

    /// Drops all entries, keeping the outer size and offsets.
    pub fn clear(&mut self) {
        for row in &mut self.outer {
            row.clear();
        }
        self.valid = false;
    }

    /// Entries of one outer slice, sorted by inner once finalized.
    pub fn slice(&self, outer: BlockIndex) -> &[(BlockIndex, BlockPtr)] {
        &self.outer[outer]
    }

    /// The greatest-inner entry of an outer slice.
    pub fn last(&self, outer: BlockIndex) -> Option<(BlockIndex, BlockPtr)> {
        self.outer[outer].last().copied()
    }

    /// Total number of stored entries.
    pub fn nonzeros(&self) -> usize {
        self.outer.iter().map(Vec::len).sum()
    }

    /// Binary search for `inner` within an outer slice. Requires `valid`.
    pub fn lower_bound(&self, outer: BlockIndex, inner: BlockIndex) -> Option<BlockPtr> {
        let row = &self.outer[outer];
        row.binary_search_by_key(&inner, |&(i, _)| i)
            .ok()
            .map(|pos| row[pos].1)
    }

    /// Rebuilds `self` as the transpose of `source`, swapping inner and
    /// outer axes. For a symmetric source the diagonal entries are omitted,
    /// so the result lists exactly the mirrored half of the off-diagonal
    /// blocks.
    pub fn set_to_transpose(&mut self, source: &SparseBlockIndex, symmetric: bool) {
        self.resize_outer(source.inner_size());
        for outer in 0..source.outer_size() {
            for (inner, ptr) in source.slice_iter(outer) {
                if symmetric && inner >= outer {
                    continue;
                }
                self.outer[inner].push((outer, ptr));
            }
        }
        self.finalize();
        self.valid = source.valid();
    }
}

/// Compressed sparse block index: monotone `outer_ptr` plus flat parallel
/// `inner` and `ptr` arrays.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompressedIndex {
    /// Scalar offset of each inner block.
    pub inner_offsets: Vec<usize>,
    outer_ptr: Vec<usize>,
    inner: Vec<BlockIndex>,
    ptr: Vec<BlockPtr>,
    /// Outer slices with a start recorded so far.
    frontier: usize,
    /// True after a successful finalize; cleared by any mutation.
    pub valid: bool,
}

impl CompressedIndex {
    /// Resets the index to `size` empty outer slices.
    pub fn resize_outer(&mut self, size: usize) {
        self.outer_ptr.clear();
        self.outer_ptr.resize(size + 1, 0);
        self.inner.clear();
        self.ptr.clear();
        self.frontier = 0;
        self.valid = false;
    }

    /// Number of outer slices.
    pub fn outer_size(&self) -> usize {
        self.outer_ptr.len().saturating_sub(1)
    }

    /// Number of inner blocks, from the offsets array.
    pub fn inner_size(&self) -> usize {
        self.inner_offsets.len().saturating_sub(1)
    }

    /// Reserves room for `n` entries.
    pub fn reserve(&mut self, n: usize) {
        self.inner.reserve(n);
        self.ptr.reserve(n);
    }

    /// Appends an entry. The `(outer, inner)` pair must strictly exceed the
    /// previously inserted one.
    pub fn insert(&mut self, outer: BlockIndex, inner: BlockIndex, ptr: BlockPtr) -> Result<()> {
        let in_order = match self.last_position() {
            None => true,
            Some((last_outer, last_inner)) => {
                outer > last_outer || (outer == last_outer && inner > last_inner)
            }
        };
        if !in_order || outer >= self.outer_size() {
            return Err(SolverError::OrderViolation { outer, inner });
        }
        while self.frontier < outer {
            self.frontier += 1;
            self.outer_ptr[self.frontier] = self.inner.len();
        }
        self.inner.push(inner);
        self.ptr.push(ptr);
        self.valid = false;
        Ok(())
    }

    fn last_position(&self) -> Option<(BlockIndex, BlockIndex)> {
        self.inner.last().map(|&inner| (self.frontier, inner))
    }

    /// Seals the trailing outer pointers and marks the index valid.
    pub fn finalize(&mut self) {
        let end = self.inner.len();
        let n = self.outer_size();
        while self.frontier < n {
            self.frontier += 1;
            self.outer_ptr[self.frontier] = end;
        }
        self.valid = true;
    }

    /// Drops all entries, keeping the outer size and offsets.
    pub fn clear(&mut self) {
        let n = self.outer_size();
        self.resize_outer(n);
    }

    fn range(&self, outer: BlockIndex) -> core::ops::Range<usize> {
        self.outer_ptr[outer]..self.outer_ptr[outer + 1]
    }

    /// Entries of one outer slice as parallel (inner, ptr) subslices.
    pub fn slice(&self, outer: BlockIndex) -> (&[BlockIndex], &[BlockPtr]) {
        let r = self.range(outer);
        (&self.inner[r.clone()], &self.ptr[r])
    }

    /// The greatest-inner entry of an outer slice.
    pub fn last(&self, outer: BlockIndex) -> Option<(BlockIndex, BlockPtr)> {
        let r = self.range(outer);
        if r.is_empty() {
            None
        } else {
            Some((self.inner[r.end - 1], self.ptr[r.end - 1]))
        }
    }

    /// Total number of stored entries.
    pub fn nonzeros(&self) -> usize {
        self.inner.len()
    }

    /// Binary search for `inner` within an outer slice. Requires `valid`.
    pub fn lower_bound(&self, outer: BlockIndex, inner: BlockIndex) -> Option<BlockPtr> {
        let r = self.range(outer);
        self.inner[r.clone()]
            .binary_search(&inner)
            .ok()
            .map(|pos| self.ptr[r.start + pos])
    }

}

/// A major index in either encoding, selected at matrix construction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SparseBlockIndex {
    /// Out-of-order friendly encoding.
    Uncompressed(UncompressedIndex),
    /// Flat three-array encoding with ordered insertion.
    Compressed(CompressedIndex),
}

impl SparseBlockIndex {
    /// An empty index with the requested encoding.
    pub fn with_encoding(compressed: bool) -> Self {
        if compressed {
            SparseBlockIndex::Compressed(CompressedIndex::default())
        } else {
            SparseBlockIndex::Uncompressed(UncompressedIndex::default())
        }
    }

    /// Whether the index uses the compressed encoding.
    pub fn is_compressed(&self) -> bool {
        matches!(self, SparseBlockIndex::Compressed(_))
    }

    /// Whether the index has been finalized and not mutated since.
    pub fn valid(&self) -> bool {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.valid,
            SparseBlockIndex::Compressed(idx) => idx.valid,
        }
    }

    /// The scalar offsets of the inner axis.
    pub fn inner_offsets(&self) -> &[usize] {
        match self {
            SparseBlockIndex::Uncompressed(idx) => &idx.inner_offsets,
            SparseBlockIndex::Compressed(idx) => &idx.inner_offsets,
        }
    }

    /// Mutable access to the inner offsets array.
    pub fn inner_offsets_mut(&mut self) -> &mut Vec<usize> {
        match self {
            SparseBlockIndex::Uncompressed(idx) => &mut idx.inner_offsets,
            SparseBlockIndex::Compressed(idx) => &mut idx.inner_offsets,
        }
    }

    /// Resets the index to `size` empty outer slices.
    pub fn resize_outer(&mut self, size: usize) {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.resize_outer(size),
            SparseBlockIndex::Compressed(idx) => idx.resize_outer(size),
        }
    }

    /// Number of outer slices.
    pub fn outer_size(&self) -> usize {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.outer_size(),
            SparseBlockIndex::Compressed(idx) => idx.outer_size(),
        }
    }

    /// Number of inner blocks.
    pub fn inner_size(&self) -> usize {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.inner_size(),
            SparseBlockIndex::Compressed(idx) => idx.inner_size(),
        }
    }

    /// Appends an entry, enforcing the encoding's ordering rule.
    pub fn insert(&mut self, outer: BlockIndex, inner: BlockIndex, ptr: BlockPtr) -> Result<()> {
        match self {
            SparseBlockIndex::Uncompressed(idx) => {
                idx.insert(outer, inner, ptr);
                Ok(())
            }
            SparseBlockIndex::Compressed(idx) => idx.insert(outer, inner, ptr),
        }
    }

    /// Finalizes the index (sort or seal).
    pub fn finalize(&mut self) {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.finalize(),
            SparseBlockIndex::Compressed(idx) => idx.finalize(),
        }
    }

    /// Drops all entries, keeping the outer size and offsets.
    pub fn clear(&mut self) {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.clear(),
            SparseBlockIndex::Compressed(idx) => idx.clear(),
        }
    }

    /// Total number of stored entries.
    pub fn nonzeros(&self) -> usize {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.nonzeros(),
            SparseBlockIndex::Compressed(idx) => idx.nonzeros(),
        }
    }

    /// Iterator over the `(inner, ptr)` entries of one outer slice.
    pub fn slice_iter(&self, outer: BlockIndex) -> IndexIter<'_> {
        match self {
            SparseBlockIndex::Uncompressed(idx) => IndexIter::Uncompressed(idx.slice(outer).iter()),
            SparseBlockIndex::Compressed(idx) => {
                let (inner, ptr) = idx.slice(outer);
                IndexIter::Compressed { inner, ptr, pos: 0 }
            }
        }
    }

    /// The greatest-inner entry of an outer slice.
    pub fn last(&self, outer: BlockIndex) -> Option<(BlockIndex, BlockPtr)> {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.last(outer),
            SparseBlockIndex::Compressed(idx) => idx.last(outer),
        }
    }

    /// O(log k) lookup of `inner` within an outer slice. Requires `valid`.
    pub fn lower_bound(&self, outer: BlockIndex, inner: BlockIndex) -> Option<BlockPtr> {
        match self {
            SparseBlockIndex::Uncompressed(idx) => idx.lower_bound(outer, inner),
            SparseBlockIndex::Compressed(idx) => idx.lower_bound(outer, inner),
        }
    }
}

/// Iterator over one outer slice of a [`SparseBlockIndex`].
pub enum IndexIter<'a> {
    /// Iteration over an uncompressed slice.
    Uncompressed(core::slice::Iter<'a, (BlockIndex, BlockPtr)>),
    /// Iteration over the flat compressed arrays.
    Compressed {
        /// Inner indices of the slice
        inner: &'a [BlockIndex],
        /// Block pointers of the slice
        ptr: &'a [BlockPtr],
        /// Cursor
        pos: usize,
    },
}

impl<'a> Iterator for IndexIter<'a> {
    type Item = (BlockIndex, BlockPtr);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IndexIter::Uncompressed(it) => it.next().copied(),
            IndexIter::Compressed { inner, ptr, pos } => {
                if *pos < inner.len() {
                    let item = (inner[*pos], ptr[*pos]);
                    *pos += 1;
                    Some(item)
                } else {
                    None
                }
            }
        }
    }
}
