//! Projected block Gauss-Seidel solver.
//!
//! Solves constrained systems of the form `u = A x + b, law(x, u)` by
//! sweeping block rows: each row update removes the row's own contribution
//! through [`SparseBlockMatrix::split_row_multiply`] and delegates the local
//! problem to the law. The global residual is evaluated periodically (a full
//! matrix-vector product, hence not every sweep), the best iterate seen is
//! kept, and rows whose updates stall are temporarily frozen.
//!
//! Deterministic parallel sweeps group rows into color classes free of
//! column conflicts. The non-deterministic mode trades reproducibility for
//! throughput by sweeping contiguous row partitions concurrently, each
//! against a stale snapshot of the other partitions.

use crate::block::Block;
use crate::error::{Result, SolverError};
use crate::matrix::SparseBlockMatrix;
use crate::solver::coloring::{classes_from_colors, color_rows};
use crate::solver::NonSmoothLaw;
use crate::types::{BlockIndex, Precision};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Row ordering strategy for deterministic sweeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ColoringStrategy {
    /// Greedy coloring computed from the matrix structure.
    #[default]
    Auto,
    /// No coloring: deterministic sweeps run sequentially.
    None,
    /// Caller-supplied color per block row.
    Custom(Vec<usize>),
}

/// Parameters of the Gauss-Seidel iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussSeidelOptions {
    /// Global residual threshold below which the solve succeeds.
    pub tol: Precision,
    /// Maximum number of sweeps.
    pub max_iters: usize,
    /// Number of sweeps between global residual evaluations; each
    /// evaluation costs a full matrix-vector product.
    pub eval_every: usize,
    /// Step norm under which a row is considered stalled.
    pub skip_tol: Precision,
    /// Number of consecutive stalled sweeps after which a row is frozen,
    /// and the number of sweeps it stays frozen.
    pub skip_iters: usize,
    /// When positive, diagonal blocks are shifted so their smallest
    /// eigenvalue reaches this value; the proximal correction term keeps
    /// the fixed point unchanged.
    pub auto_regularization: Precision,
    /// Worker thread cap; zero uses the runtime default.
    pub max_threads: usize,
    /// Whether sweeps must be reproducible. Deterministic sweeps use
    /// coloring; non-deterministic sweeps partition rows across threads.
    pub deterministic: bool,
    /// Row coloring strategy for deterministic sweeps.
    pub coloring: ColoringStrategy,
}

impl Default for GaussSeidelOptions {
    fn default() -> Self {
        GaussSeidelOptions {
            tol: 1e-6,
            max_iters: 250,
            eval_every: 25,
            skip_tol: 1e-6,
            skip_iters: 10,
            auto_regularization: 0.0,
            max_threads: 0,
            deterministic: false,
            coloring: ColoringStrategy::Auto,
        }
    }
}

/// Residual callback invoked at every global evaluation.
pub type Callback<'a> = Box<dyn Fn(usize, Precision) + Send + Sync + 'a>;

/// Projected block Gauss-Seidel solver over a block-sparse matrix.
///
/// The matrix is supplied through [`set_matrix`](GaussSeidel::set_matrix),
/// which caches the diagonal blocks, the per-row scaling and the optional
/// regularization shifts. `solve` may then be called repeatedly with
/// different laws and right-hand sides.
pub struct GaussSeidel<'a, B: Block> {
    matrix: Option<&'a SparseBlockMatrix<B>>,
    local_matrices: Vec<B>,
    scaling: Vec<Precision>,
    regularization: Vec<Precision>,
    options: GaussSeidelOptions,
    callback: Option<Callback<'a>>,
    abort: Option<Arc<AtomicBool>>,
}

impl<'a, B: Block> Default for GaussSeidel<'a, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, B: Block> GaussSeidel<'a, B> {
    /// A solver with default options and no matrix.
    pub fn new() -> Self {
        GaussSeidel {
            matrix: None,
            local_matrices: Vec::new(),
            scaling: Vec::new(),
            regularization: Vec::new(),
            options: GaussSeidelOptions::default(),
            callback: None,
            abort: None,
        }
    }

    /// A solver bound to `matrix`.
    pub fn with_matrix(matrix: &'a SparseBlockMatrix<B>) -> Result<Self> {
        let mut solver = Self::new();
        solver.set_matrix(matrix)?;
        Ok(solver)
    }

    /// Current options.
    pub fn options(&self) -> &GaussSeidelOptions {
        &self.options
    }

    /// Mutable options access.
    pub fn options_mut(&mut self) -> &mut GaussSeidelOptions {
        &mut self.options
    }

    /// Sets the residual tolerance.
    pub fn set_tol(&mut self, tol: Precision) {
        self.options.tol = tol;
    }

    /// Sets the maximum number of sweeps.
    pub fn set_max_iters(&mut self, iters: usize) {
        self.options.max_iters = iters;
    }

    /// Sets the number of sweeps between residual evaluations.
    pub fn set_eval_every(&mut self, every: usize) {
        self.options.eval_every = every.max(1);
    }

    /// Sets the stall threshold of the row freezing heuristic.
    pub fn set_skip_tol(&mut self, tol: Precision) {
        self.options.skip_tol = tol;
    }

    /// Sets the stall count and freeze duration of the row freezing
    /// heuristic.
    pub fn set_skip_iters(&mut self, iters: usize) {
        self.options.skip_iters = iters;
    }

    /// Sets the auto-regularization target; takes effect at the next
    /// [`set_matrix`](GaussSeidel::set_matrix) call.
    pub fn set_auto_regularization(&mut self, target: Precision) {
        self.options.auto_regularization = target;
    }

    /// Caps the number of worker threads; zero uses the runtime default.
    pub fn set_max_threads(&mut self, threads: usize) {
        self.options.max_threads = threads;
    }

    /// Chooses between reproducible colored sweeps and faster partitioned
    /// sweeps.
    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.options.deterministic = deterministic;
    }

    /// Sets the coloring strategy for deterministic sweeps.
    pub fn set_coloring(&mut self, coloring: ColoringStrategy) {
        self.options.coloring = coloring;
    }

    /// Registers a callback invoked as `(sweep, residual)` at every global
    /// residual evaluation.
    pub fn set_callback(&mut self, callback: Callback<'a>) {
        self.callback = Some(callback);
    }

    /// Removes the residual callback.
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Installs a cooperative cancellation flag, checked between sweeps.
    pub fn set_abort_flag(&mut self, flag: Arc<AtomicBool>) {
        self.abort = Some(flag);
    }

    /// Binds the solver to a matrix: caches the diagonal blocks
    /// (regularized when requested), and the per-row scaling
    /// `s_k = 1 / max(1, ||A_kk||_F)`.
    pub fn set_matrix(&mut self, matrix: &'a SparseBlockMatrix<B>) -> Result<()> {
        if !matrix.is_finalized() {
            return Err(SolverError::InvalidIndexUse {
                operation: "set_matrix",
            });
        }
        if matrix.rows() != matrix.cols() {
            return Err(SolverError::DimensionMismatch {
                operation: "set_matrix",
                expected: matrix.rows(),
                actual: matrix.cols(),
            });
        }
        let n = matrix.rows_of_blocks();
        self.local_matrices.clear();
        self.scaling.clear();
        self.regularization.clear();
        for k in 0..n {
            let d = matrix.block_rows(k);
            let mut local = match matrix.diagonal(k)? {
                Some(block) => block.clone(),
                None => B::zero(d, d),
            };
            let norm = local.frobenius_norm();
            let mut shift = 0.0;
            if self.options.auto_regularization > 0.0 {
                shift = (self.options.auto_regularization
                    - local.smallest_symmetric_eigenvalue())
                .max(0.0);
                local.add_diagonal(shift);
            }
            self.local_matrices.push(local);
            self.regularization.push(shift);
            self.scaling.push(1.0 / norm.max(1.0));
        }
        self.matrix = Some(matrix);
        Ok(())
    }

    /// Scaled global error of a candidate `(x, u)` pair, averaged over the
    /// block rows.
    pub fn eval<L>(&self, law: &L, u: &[Precision], x: &[Precision]) -> Result<Precision>
    where
        L: NonSmoothLaw<Block = B>,
    {
        let matrix = self.require_matrix()?;
        if u.len() != matrix.rows() || x.len() != matrix.rows() {
            return Err(SolverError::DimensionMismatch {
                operation: "eval",
                expected: matrix.rows(),
                actual: u.len().max(x.len()),
            });
        }
        Ok(self.eval_segments(matrix, law, u, x))
    }

    /// Runs the projected Gauss-Seidel iteration on `u = A x + b` under
    /// `law`, warm-starting from `x`. Returns the best residual seen; a
    /// value below the tolerance means success, anything else is the
    /// convergence failure signal. `x` holds the best iterate on return.
    pub fn solve<L>(&self, law: &L, b: &[Precision], x: &mut [Precision]) -> Result<Precision>
    where
        L: NonSmoothLaw<Block = B>,
    {
        let matrix = self.require_matrix()?;
        if b.len() != matrix.rows() || x.len() != matrix.rows() {
            return Err(SolverError::DimensionMismatch {
                operation: "solve",
                expected: matrix.rows(),
                actual: b.len().min(x.len()),
            });
        }
        for k in 0..matrix.rows_of_blocks() {
            if matrix.block_rows(k) != law.dimension() {
                return Err(SolverError::DimensionMismatch {
                    operation: "solve (law dimension)",
                    expected: law.dimension(),
                    actual: matrix.block_rows(k),
                });
            }
        }
        self.validate_row_access(matrix)?;

        #[cfg(feature = "parallel")]
        {
            if self.options.max_threads > 0 {
                match rayon::ThreadPoolBuilder::new()
                    .num_threads(self.options.max_threads)
                    .build()
                {
                    Ok(pool) => return pool.install(|| self.solve_loop(matrix, law, b, x)),
                    Err(err) => warn!("falling back to the global thread pool: {err}"),
                }
            }
        }
        self.solve_loop(matrix, law, b, x)
    }

    fn require_matrix(&self) -> Result<&'a SparseBlockMatrix<B>> {
        self.matrix.ok_or(SolverError::InvalidIndexUse {
            operation: "solve (matrix not set)",
        })
    }

    /// Row queries need either a row-oriented major index or a cached
    /// transposed view.
    fn validate_row_access(&self, matrix: &SparseBlockMatrix<B>) -> Result<()> {
        let needs_mirror = matrix.flags().is_col_major() || matrix.flags().is_symmetric();
        if needs_mirror && !(matrix.minor_index().valid || matrix.transpose_cached()) {
            return Err(SolverError::InvalidIndexUse {
                operation: "gauss-seidel row access",
            });
        }
        Ok(())
    }

    fn eval_segments<L>(
        &self,
        matrix: &SparseBlockMatrix<B>,
        law: &L,
        u: &[Precision],
        x: &[Precision],
    ) -> Precision
    where
        L: NonSmoothLaw<Block = B>,
    {
        let offsets = matrix.row_offsets();
        let n = matrix.rows_of_blocks();
        let mut err = 0.0;
        for k in 0..n {
            let seg = offsets[k]..offsets[k + 1];
            err += self.scaling[k] * law.eval_local(k, &x[seg.clone()], &u[seg]);
        }
        if n > 0 {
            err / n as Precision
        } else {
            0.0
        }
    }

    fn global_residual<L>(
        &self,
        matrix: &SparseBlockMatrix<B>,
        law: &L,
        b: &[Precision],
        x: &[Precision],
    ) -> Result<Precision>
    where
        L: NonSmoothLaw<Block = B>,
    {
        let mut u = vec![0.0; matrix.rows()];
        matrix.multiply(false, x, &mut u, 1.0, 0.0)?;
        for (uv, bv) in u.iter_mut().zip(b) {
            *uv += bv;
        }
        Ok(self.eval_segments(matrix, law, &u, x))
    }

    fn solve_loop<L>(
        &self,
        matrix: &SparseBlockMatrix<B>,
        law: &L,
        b: &[Precision],
        x: &mut [Precision],
    ) -> Result<Precision>
    where
        L: NonSmoothLaw<Block = B>,
    {
        let n = matrix.rows_of_blocks();
        let offsets: Vec<usize> = matrix.row_offsets().to_vec();
        let opts = &self.options;

        // Evaluate the warm start and the zero candidate, keep the better.
        let mut err_best = self.global_residual(matrix, law, b, x)?;
        let zeros = vec![0.0; x.len()];
        let err_zero = self.eval_segments(matrix, law, b, &zeros);
        if err_zero < err_best {
            x.fill(0.0);
            err_best = err_zero;
        }
        let mut x_best = x.to_vec();
        let mut err_prev = err_best;
        debug!("gauss-seidel start: residual {err_best:.3e} over {n} rows");
        if err_best < opts.tol {
            return Ok(err_best);
        }

        let classes: Option<Vec<Vec<BlockIndex>>> = if opts.deterministic {
            match &opts.coloring {
                ColoringStrategy::Auto => Some(color_rows(matrix)),
                ColoringStrategy::None => None,
                ColoringStrategy::Custom(colors) => {
                    if colors.len() != n {
                        return Err(SolverError::DimensionMismatch {
                            operation: "solve (custom coloring)",
                            expected: n,
                            actual: colors.len(),
                        });
                    }
                    let n_colors = colors.iter().copied().max().map_or(0, |c| c + 1);
                    Some(classes_from_colors(colors, n_colors))
                }
            }
        } else {
            None
        };

        let mut small = vec![0u32; n];
        let mut frozen = vec![0u32; n];
        let mut diverged = false;

        let row_update = |k: BlockIndex, x_read: &[Precision]| -> Option<(Vec<Precision>, Precision)> {
            let seg = offsets[k]..offsets[k + 1];
            let mut local_b = b[seg.clone()].to_vec();
            matrix
                .split_row_multiply(k, x_read, &mut local_b)
                .expect("row access was validated before the sweep");
            let prev = &x_read[seg];
            if self.regularization[k] > 0.0 {
                for (lb, pv) in local_b.iter_mut().zip(prev) {
                    *lb -= self.regularization[k] * pv;
                }
            }
            let mut xk = prev.to_vec();
            if law.solve_local(k, &self.local_matrices[k], &local_b, &mut xk, self.scaling[k]) {
                let step = xk
                    .iter()
                    .zip(prev)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<Precision>()
                    .sqrt();
                Some((xk, step))
            } else {
                // Local failure: the row keeps its pre-step value.
                None
            }
        };

        for sweep in 1..=opts.max_iters {
            if let Some(flag) = &self.abort {
                if flag.load(Ordering::Relaxed) {
                    debug!("gauss-seidel aborted at sweep {sweep}");
                    break;
                }
            }

            let mut active = vec![true; n];
            if opts.skip_iters > 0 {
                for k in 0..n {
                    if frozen[k] > 0 {
                        frozen[k] -= 1;
                        active[k] = false;
                    }
                }
            }

            let apply = |k: BlockIndex,
                             result: Option<(Vec<Precision>, Precision)>,
                             x: &mut [Precision],
                             small: &mut [u32],
                             frozen: &mut [u32]| {
                if let Some((xk, step)) = result {
                    x[offsets[k]..offsets[k + 1]].copy_from_slice(&xk);
                    if opts.skip_iters > 0 {
                        if step < opts.skip_tol {
                            small[k] += 1;
                            if small[k] as usize >= opts.skip_iters {
                                frozen[k] = opts.skip_iters as u32;
                                small[k] = 0;
                            }
                        } else {
                            small[k] = 0;
                        }
                    }
                }
            };

            match &classes {
                Some(classes) => {
                    // Colored deterministic sweep: no two rows of a class
                    // share a column, so every class member reads only
                    // segments that stay fixed during the class pass.
                    for class in classes {
                        let members: Vec<BlockIndex> =
                            class.iter().copied().filter(|&k| active[k]).collect();
                        let results = map_rows(&members, &row_update, x);
                        for (k, result) in results {
                            apply(k, result, x, &mut small, &mut frozen);
                        }
                    }
                }
                None if opts.deterministic || n < 2 => {
                    for k in 0..n {
                        if !active[k] {
                            continue;
                        }
                        let result = row_update(k, x);
                        apply(k, result, x, &mut small, &mut frozen);
                    }
                }
                None => {
                    // Partitioned sweep: Gauss-Seidel inside each contiguous
                    // partition, stale reads across partitions.
                    let results = partitioned_sweep(n, &offsets, &active, &row_update, x);
                    for (k, result) in results {
                        apply(k, result, x, &mut small, &mut frozen);
                    }
                }
            }

            if sweep % opts.eval_every == 0 || sweep == opts.max_iters {
                let err = self.global_residual(matrix, law, b, x)?;
                trace!("gauss-seidel sweep {sweep}: residual {err:.3e}");
                if let Some(callback) = &self.callback {
                    callback(sweep, err);
                }
                if !err.is_finite() {
                    warn!("gauss-seidel diverged at sweep {sweep} (non-finite residual)");
                    x.copy_from_slice(&x_best);
                    break;
                }
                if err < err_best {
                    err_best = err;
                    x_best.copy_from_slice(x);
                } else {
                    if !diverged && err > 10.0 * err_best {
                        warn!(
                            "gauss-seidel residual grew from {err_best:.3e} to {err:.3e}; \
                             restoring best iterate"
                        );
                        diverged = true;
                    }
                    if err >= err_prev {
                        x.copy_from_slice(&x_best);
                    }
                }
                err_prev = err;
                if err_best < opts.tol {
                    break;
                }
            }
        }

        x.copy_from_slice(&x_best);
        Ok(err_best)
    }
}

/// Applies `row_update` to each listed row against an immutable view of
/// `x`, in parallel when available.
fn map_rows<F>(
    rows: &[BlockIndex],
    row_update: &F,
    x: &[Precision],
) -> Vec<(BlockIndex, Option<(Vec<Precision>, Precision)>)>
where
    F: Fn(BlockIndex, &[Precision]) -> Option<(Vec<Precision>, Precision)> + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        rows.par_iter().map(|&k| (k, row_update(k, x))).collect()
    }
    #[cfg(not(feature = "parallel"))]
    rows.iter().map(|&k| (k, row_update(k, x))).collect()
}

/// Sweeps contiguous row partitions concurrently. Each partition updates a
/// private copy of `x` so its own rows chain Gauss-Seidel style, while
/// other partitions are read at their pre-sweep values.
fn partitioned_sweep<F>(
    n: usize,
    offsets: &[usize],
    active: &[bool],
    row_update: &F,
    x: &[Precision],
) -> Vec<(BlockIndex, Option<(Vec<Precision>, Precision)>)>
where
    F: Fn(BlockIndex, &[Precision]) -> Option<(Vec<Precision>, Precision)> + Sync,
{
    #[cfg(feature = "parallel")]
    let n_parts = rayon::current_num_threads().clamp(1, n.max(1));
    #[cfg(not(feature = "parallel"))]
    let n_parts = 1;

    let chunk = n.div_ceil(n_parts);
    let ranges: Vec<core::ops::Range<usize>> = (0..n_parts)
        .map(|p| (p * chunk).min(n)..((p + 1) * chunk).min(n))
        .filter(|r| !r.is_empty())
        .collect();

    let run = |range: &core::ops::Range<usize>| {
        let mut local_x = x.to_vec();
        let mut results = Vec::with_capacity(range.len());
        for k in range.clone() {
            if !active[k] {
                continue;
            }
            let result = row_update(k, &local_x);
            if let Some((xk, _)) = &result {
                local_x[offsets[k]..offsets[k + 1]].copy_from_slice(xk);
            }
            results.push((k, result));
        }
        results
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        ranges.par_iter().flat_map_iter(|r| run(r)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    ranges.iter().flat_map(|r| run(r)).collect()
}
