//! Greedy block-row coloring.
//!
//! Two rows must not be updated concurrently by a deterministic
//! Gauss-Seidel sweep when they share a block column or when either reads
//! the segment the other writes. The greedy coloring groups rows into
//! classes free of such conflicts; classes are iterated sequentially and
//! rows within a class in parallel.

use crate::block::Block;
use crate::matrix::SparseBlockMatrix;
use crate::types::BlockIndex;

/// Colors the block rows of `matrix` so that no two rows in the same class
/// share a block column, and no row shares a class with a block row whose
/// segment it reads. Returns the color classes, each a sorted list of row
/// indices, together covering every row.
pub fn color_rows<B: Block>(matrix: &SparseBlockMatrix<B>) -> Vec<Vec<BlockIndex>> {
    let n = matrix.rows_of_blocks();
    let symmetric = matrix.flags().is_symmetric();
    let col_major = matrix.flags().is_col_major();

    // Row -> columns and column -> rows adjacency, expanding the symmetric
    // triangle.
    let mut row_cols: Vec<Vec<BlockIndex>> = vec![Vec::new(); n];
    let mut col_rows: Vec<Vec<BlockIndex>> = vec![Vec::new(); matrix.cols_of_blocks()];
    let major = matrix.major_index();
    for outer in 0..major.outer_size() {
        for (inner, _) in major.slice_iter(outer) {
            let (r, c) = if col_major {
                (inner, outer)
            } else {
                (outer, inner)
            };
            row_cols[r].push(c);
            col_rows[c].push(r);
            if symmetric && r != c {
                row_cols[c].push(r);
                col_rows[r].push(c);
            }
        }
    }

    let mut colors = vec![usize::MAX; n];
    let mut n_colors = 0;
    let mut used = Vec::new();
    for row in 0..n {
        used.clear();
        used.resize(n_colors + 1, false);
        for &col in &row_cols[row] {
            // The row whose segment this row reads conflicts directly,
            // whether or not it stores a diagonal block of its own.
            if col != row && col < n && colors[col] != usize::MAX {
                used[colors[col]] = true;
            }
            for &other in &col_rows[col] {
                if other != row && colors[other] != usize::MAX {
                    used[colors[other]] = true;
                }
            }
        }
        // Rows reading this row's segment conflict as well, so the pair is
        // separated no matter which of the two is colored first.
        if row < col_rows.len() {
            for &reader in &col_rows[row] {
                if reader != row && colors[reader] != usize::MAX {
                    used[colors[reader]] = true;
                }
            }
        }
        let color = used.iter().position(|&taken| !taken).unwrap_or(n_colors);
        colors[row] = color;
        n_colors = n_colors.max(color + 1);
    }

    classes_from_colors(&colors, n_colors)
}

/// Groups per-row colors into color classes.
pub fn classes_from_colors(colors: &[usize], n_colors: usize) -> Vec<Vec<BlockIndex>> {
    let mut classes = vec![Vec::new(); n_colors];
    for (row, &color) in colors.iter().enumerate() {
        classes[color].push(row);
    }
    classes.retain(|class| !class.is_empty());
    classes
}
