//! # Block-sparse Gauss-Seidel solver for cone complementarity problems
//!
//! This crate solves large second-order-cone complementarity problems
//! (SOCCP) arising from discrete contact mechanics with Coulomb friction.
//! It is built from three cooperating layers:
//!
//! - a **block-sparse matrix engine** ([`SparseBlockMatrix`]) with
//!   compressed or uncompressed row/column-major indexing, symmetric
//!   half-storage, transpose caching, block-wise matrix-vector products and
//!   two-phase sparse matrix-matrix products;
//! - a **projected block Gauss-Seidel solver** ([`GaussSeidel`])
//!   parameterized by an arbitrary per-row non-smooth law
//!   ([`NonSmoothLaw`]), with deterministic colored or partitioned parallel
//!   sweeps, best-iterate tracking and stalled-row freezing;
//! - **local SOCCP solvers** ([`soc`]) combining a non-smooth Newton
//!   iteration on the cone Fischer-Burmeister reformulation with an
//!   enumerative quartic-root fallback.
//!
//! ## Quick start
//!
//! ```rust
//! use blockgs::{Flags, GaussSeidel, SocLaw3, SparseBlockMatrix};
//! use nalgebra::Matrix3;
//!
//! // Three decoupled contacts with unit Delassus blocks.
//! let mut w = SparseBlockMatrix::<Matrix3<f64>>::with_flags(Flags::SYMMETRIC);
//! w.set_rows(&[3, 3, 3]);
//! for i in 0..3 {
//!     *w.insert_back(i, i)? = Matrix3::identity();
//! }
//! w.finalize();
//!
//! let law = SocLaw3::coulomb(vec![0.5; 3]);
//! let b = vec![-1.0, 0.0, 0.0, -1.0, 0.0, 0.0, -1.0, 0.0, 0.0];
//! let mut r = vec![0.0; 9];
//!
//! let mut solver = GaussSeidel::with_matrix(&w)?;
//! solver.set_deterministic(true);
//! let residual = solver.solve(&law, &b, &mut r)?;
//! assert!(residual < 1e-6);
//! # Ok::<(), blockgs::SolverError>(())
//! ```
//!
//! ## Concurrency
//!
//! All parallelism is fork-join inside individual operations, behind the
//! `parallel` feature (enabled by default). Matrix-vector products
//! parallelize over independent outer slices; the matrix-matrix product
//! parallelizes both its symbolic and numeric phases; the Gauss-Seidel
//! sweep offers a reproducible colored mode and a faster partitioned mode
//! whose iterates depend on the partition count.

#![warn(missing_docs, clippy::all)]
#![allow(clippy::float_cmp)] // Numerical code often requires exact comparisons

pub mod block;
pub mod error;
pub mod friction;
pub mod matrix;
pub mod soc;
pub mod solver;
pub mod types;

pub use block::Block;
pub use error::{Result, SolverError};
pub use friction::{DualFrictionProblem3, PrimalFrictionProblem};
pub use matrix::index::{CompressedIndex, SparseBlockIndex, UncompressedIndex};
pub use matrix::ops::Transpose;
pub use matrix::product::Product;
pub use matrix::SparseBlockMatrix;
pub use soc::{
    poly_real_roots, real_roots, solve_contact_2, solve_contact_3, RootFilter, SocLaw2, SocLaw3,
    Strategy,
};
pub use solver::{ColoringStrategy, GaussSeidel, GaussSeidelOptions, NonSmoothLaw};
pub use types::{BlockIndex, BlockPtr, Flags, Precision};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
