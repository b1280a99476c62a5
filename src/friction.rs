//! Discrete frictional contact problems over the block-sparse engine.
//!
//! The primal data is the usual mechanical quintuple: mass matrix `M`,
//! deformation gradient `H`, contact-basis rotations `E`, external impulses
//! `f` and free velocity `w`. [`DualFrictionProblem3::compute_from`] reduces
//! it to the dual form `u = W r + b` with the Delassus operator
//! `W = H M^-1 H^T`, which the Gauss-Seidel solver then handles under a
//! Coulomb or plain SOCCP law. The Cadoux fixed point alternates SOCCP
//! inner solves with an update of the tangential slip, recovering the
//! Coulomb solution through a sequence of convex problems.

use crate::error::{Result, SolverError};
use crate::matrix::product::Product;
use crate::matrix::SparseBlockMatrix;
use crate::soc::SocLaw3;
use crate::solver::GaussSeidel;
use crate::types::{Flags, Precision};
use log::debug;
use nalgebra::{DMatrix, Matrix3};

/// Primal data of a 3-dimensional frictional contact problem.
///
/// `mass` must be block-diagonal: its per-block dense factorization is what
/// makes the Delassus assembly tractable.
#[derive(Debug, Clone)]
pub struct PrimalFrictionProblem {
    /// Mass matrix `M`, block-diagonal.
    pub mass: SparseBlockMatrix<DMatrix<Precision>>,
    /// Deformation gradient `H` (one 3-row block row per contact).
    pub h: SparseBlockMatrix<DMatrix<Precision>>,
    /// World-to-contact-basis rotations `E`, block-diagonal.
    pub e: SparseBlockMatrix<DMatrix<Precision>>,
    /// External impulses, one scalar per degree of freedom.
    pub f: Vec<Precision>,
    /// Free velocity, one scalar per contact coordinate.
    pub w: Vec<Precision>,
    /// Coulomb friction coefficient per contact.
    pub mu: Vec<Precision>,
}

/// Dual (reduced) frictional contact problem `u = W r + b`.
#[derive(Debug, Clone)]
pub struct DualFrictionProblem3 {
    /// Delassus operator, symmetric with 3x3 blocks.
    pub w: SparseBlockMatrix<Matrix3<Precision>>,
    /// Affine term of the dual system.
    pub b: Vec<Precision>,
    /// Coulomb friction coefficient per contact.
    pub mu: Vec<Precision>,
    permutation: Vec<usize>,
    inv_permutation: Vec<usize>,
}

impl DualFrictionProblem3 {
    /// Assembles the dual problem: `W = H M^-1 H^T` and
    /// `b = E^T w - H M^-1 f`.
    pub fn compute_from(primal: &PrimalFrictionProblem) -> Result<Self> {
        let minv = invert_block_diagonal(&primal.mass)?;

        let inner = Product::new(&minv, &primal.h, false, true).eval()?;
        let w_dyn = Product::new(&primal.h, &inner, false, false)
            .eval_with_flags(Flags::COMPRESSED | Flags::SYMMETRIC)?;
        let w = w_dyn.convert_blocks(|block| Matrix3::from_fn(|i, j| block[(i, j)]))?;
        debug!(
            "assembled Delassus operator: {} contacts, {} blocks",
            w.rows_of_blocks(),
            w.n_blocks()
        );

        let mut etw = vec![0.0; primal.e.cols()];
        primal.e.multiply(true, &primal.w, &mut etw, 1.0, 0.0)?;
        let mut mf = vec![0.0; minv.rows()];
        minv.multiply(false, &primal.f, &mut mf, 1.0, 0.0)?;
        let mut b = etw;
        primal.h.multiply(false, &mf, &mut b, -1.0, 1.0)?;

        Ok(DualFrictionProblem3 {
            w,
            b,
            mu: primal.mu.clone(),
            permutation: Vec::new(),
            inv_permutation: Vec::new(),
        })
    }

    /// Number of contacts.
    pub fn contacts(&self) -> usize {
        self.mu.len()
    }

    /// Whether a block-row permutation is currently applied.
    pub fn permuted(&self) -> bool {
        !self.permutation.is_empty()
    }

    /// Permutes the contacts of the problem in place: contact `i` of the
    /// permuted problem is contact `perm[i]` of the original. Reordering
    /// contacts can markedly change Gauss-Seidel convergence.
    pub fn apply_permutation(&mut self, perm: &[usize]) -> Result<()> {
        if self.permuted() {
            return Err(SolverError::UnsupportedLayout {
                operation: "apply_permutation on an already permuted problem",
            });
        }
        self.w.apply_permutation(perm)?;
        permute_chunks(perm, 3, &mut self.b);
        permute_scalars(perm, &mut self.mu);
        self.permutation = perm.to_vec();
        self.inv_permutation = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            self.inv_permutation[p] = i;
        }
        Ok(())
    }

    /// Undoes a previously applied permutation.
    pub fn undo_permutation(&mut self) -> Result<()> {
        if !self.permuted() {
            return Ok(());
        }
        let inv = self.inv_permutation.clone();
        self.w.apply_permutation(&inv)?;
        permute_chunks(&inv, 3, &mut self.b);
        permute_scalars(&inv, &mut self.mu);
        self.permutation.clear();
        self.inv_permutation.clear();
        Ok(())
    }

    /// Solves the problem with the given Gauss-Seidel solver. With
    /// `static_problem` the plain SOCCP law applies (no De Saxce shift);
    /// otherwise the Coulomb law. `r` is both warm start and result, in the
    /// original contact order even when the problem is permuted.
    pub fn solve_with<'a>(
        &'a self,
        gs: &mut GaussSeidel<'a, Matrix3<Precision>>,
        r: &mut [Precision],
        static_problem: bool,
    ) -> Result<Precision> {
        gs.set_matrix(&self.w)?;
        if self.permuted() {
            permute_chunks(&self.permutation, 3, r);
        }
        let law = if static_problem {
            SocLaw3::socqp(self.mu.clone())
        } else {
            SocLaw3::coulomb(self.mu.clone())
        };
        let res = gs.solve(&law, &self.b, r)?;
        if self.permuted() {
            permute_chunks(&self.inv_permutation, 3, r);
        }
        Ok(res)
    }

    /// Evaluates the residual of a candidate `r` with the solver's error
    /// function.
    pub fn eval_with<'a>(
        &'a self,
        gs: &mut GaussSeidel<'a, Matrix3<Precision>>,
        r: &[Precision],
        static_problem: bool,
    ) -> Result<Precision> {
        gs.set_matrix(&self.w)?;
        let mut r = r.to_vec();
        if self.permuted() {
            permute_chunks(&self.permutation, 3, &mut r);
        }
        let mut u = vec![0.0; self.w.rows()];
        self.w.multiply(false, &r, &mut u, 1.0, 0.0)?;
        for (uv, bv) in u.iter_mut().zip(&self.b) {
            *uv += bv;
        }
        let law = if static_problem {
            SocLaw3::socqp(self.mu.clone())
        } else {
            SocLaw3::coulomb(self.mu.clone())
        };
        gs.eval(&law, &u, &r)
    }

    /// Solves the Coulomb problem through the Cadoux fixed-point iteration:
    /// each outer step solves a plain SOCCP whose right-hand side carries
    /// the previous tangential slip, and the Coulomb residual drives the
    /// stopping test. `callback`, when present, receives
    /// `(outer iteration, Coulomb residual)`.
    pub fn solve_cadoux<'a>(
        &'a self,
        gs: &mut GaussSeidel<'a, Matrix3<Precision>>,
        r: &mut [Precision],
        cadoux_iterations: usize,
        callback: Option<&(dyn Fn(usize, Precision) + Sync)>,
    ) -> Result<Precision> {
        let n = self.contacts();
        gs.set_matrix(&self.w)?;
        if self.permuted() {
            permute_chunks(&self.permutation, 3, r);
        }

        let coulomb = SocLaw3::coulomb(self.mu.clone());
        let socqp = SocLaw3::socqp(self.mu.clone());

        let tol = gs.options().tol;
        // The outer loop stalls when the inner solves are too loose.
        gs.set_tol(0.1 * tol);

        let mut s = vec![0.0; self.w.rows()];
        let mut res = Precision::INFINITY;
        for outer in 0..cadoux_iterations {
            self.w.multiply(false, r, &mut s, 1.0, 0.0)?;
            for (sv, bv) in s.iter_mut().zip(&self.b) {
                *sv += bv;
            }
            res = gs.eval(&coulomb, &s, r)?;
            debug!("cadoux iteration {outer}: residual {res:.3e}");
            if let Some(callback) = callback {
                callback(outer, res);
            }
            if outer > 0 && res < tol {
                break;
            }

            // De Saxce shift of the current velocity, then the convex
            // inner problem.
            for i in 0..n {
                let nt = s[3 * i + 1].hypot(s[3 * i + 2]);
                s[3 * i] = nt * self.mu[i];
                s[3 * i + 1] = 0.0;
                s[3 * i + 2] = 0.0;
            }
            for (sv, bv) in s.iter_mut().zip(&self.b) {
                *sv += bv;
            }
            gs.solve(&socqp, &s, r)?;
        }

        gs.set_tol(tol);
        if self.permuted() {
            permute_chunks(&self.inv_permutation, 3, r);
        }
        Ok(res)
    }
}

/// Per-block dense inverse of a block-diagonal matrix.
fn invert_block_diagonal(
    mass: &SparseBlockMatrix<DMatrix<Precision>>,
) -> Result<SparseBlockMatrix<DMatrix<Precision>>> {
    let mut minv = SparseBlockMatrix::with_flags(mass.flags());
    minv.clone_structure(mass)?;

    let sources: Vec<usize> = (0..mass.major_index().outer_size())
        .flat_map(|outer| mass.major_index().slice_iter(outer).map(|(_, ptr)| ptr))
        .collect();

    let invert = |&ptr: &usize| -> Result<DMatrix<Precision>> {
        mass.block(ptr)
            .clone()
            .try_inverse()
            .ok_or(SolverError::SingularBlock { index: ptr })
    };
    #[cfg(feature = "parallel")]
    let inverted: Result<Vec<DMatrix<Precision>>> = {
        use rayon::prelude::*;
        sources.par_iter().map(invert).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let inverted: Result<Vec<DMatrix<Precision>>> = sources.iter().map(invert).collect();

    for (dst, src) in minv.raw_blocks_mut().iter_mut().zip(inverted?) {
        *dst = src;
    }
    Ok(minv)
}

/// Reorders fixed-size chunks of `v`: chunk `i` receives chunk `perm[i]`.
fn permute_chunks(perm: &[usize], width: usize, v: &mut [Precision]) {
    let old = v.to_vec();
    for (i, &p) in perm.iter().enumerate() {
        v[width * i..width * (i + 1)].copy_from_slice(&old[width * p..width * (p + 1)]);
    }
}

fn permute_scalars(perm: &[usize], v: &mut [Precision]) {
    let old = v.to_vec();
    for (i, &p) in perm.iter().enumerate() {
        v[i] = old[p];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Two bodies of 3 degrees of freedom each, two contacts; the second
    /// contact couples both bodies. `H` has full row rank, so the Delassus
    /// operator is positive definite and the solution unique.
    fn two_contact_primal() -> PrimalFrictionProblem {
        let mut mass = SparseBlockMatrix::with_flags(Flags::NONE);
        mass.set_rows(&[3, 3]);
        mass.set_cols(&[3, 3]);
        *mass.insert_back(0, 0).unwrap() = DMatrix::identity(3, 3) * 2.0;
        *mass.insert_back(1, 1).unwrap() = DMatrix::identity(3, 3) * 1.5;
        mass.finalize();

        let mut h = SparseBlockMatrix::with_flags(Flags::NONE);
        h.set_rows(&[3, 3]);
        h.set_cols(&[3, 3]);
        *h.insert_back(0, 0).unwrap() = DMatrix::identity(3, 3);
        *h.insert_back(1, 0).unwrap() = DMatrix::from_row_slice(
            3,
            3,
            &[0.3, 0.0, 0.0, 0.0, 0.2, 0.0, 0.1, 0.0, 0.3],
        );
        *h.insert_back(1, 1).unwrap() = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.0, 0.0, 0.0, 0.8, 0.0, 0.0, 0.0, 1.2],
        );
        h.finalize();

        let mut e = SparseBlockMatrix::with_flags(Flags::NONE);
        e.set_rows(&[3, 3]);
        e.set_cols(&[3, 3]);
        *e.insert_back(0, 0).unwrap() = DMatrix::identity(3, 3);
        *e.insert_back(1, 1).unwrap() = DMatrix::identity(3, 3);
        e.finalize();

        PrimalFrictionProblem {
            mass,
            h,
            e,
            f: vec![0.0; 6],
            w: vec![-1.0, 0.0, 0.0, -1.0, 0.0, 0.0],
            mu: vec![0.5, 0.5],
        }
    }

    #[test]
    fn dual_assembly_matches_dense_algebra() {
        let primal = two_contact_primal();
        let dual = DualFrictionProblem3::compute_from(&primal).unwrap();

        let m = primal.mass.to_dense();
        let h = primal.h.to_dense();
        let minv = m.try_inverse().unwrap();
        let w_expected = &h * minv * h.transpose();
        assert_relative_eq!(dual.w.to_dense(), w_expected, epsilon = 1e-12);
        assert_eq!(dual.b, primal.w);
    }

    #[test]
    fn gauss_seidel_solves_dual_problem() {
        let primal = two_contact_primal();
        let dual = DualFrictionProblem3::compute_from(&primal).unwrap();
        let mut gs = GaussSeidel::new();
        gs.set_deterministic(true);
        let mut r = vec![0.0; 6];
        let res = dual.solve_with(&mut gs, &mut r, false).unwrap();
        assert!(res < 1e-6, "residual {res}");
        // Forces push along the contact normals.
        assert!(r[0] > 0.0);
        assert!(r[3] > 0.0);
    }

    #[test]
    fn cadoux_converges_on_two_contacts() {
        let primal = two_contact_primal();
        let dual = DualFrictionProblem3::compute_from(&primal).unwrap();
        let mut gs = GaussSeidel::new();
        gs.set_deterministic(true);
        let mut r = vec![0.0; 6];
        let res = dual.solve_cadoux(&mut gs, &mut r, 20, None).unwrap();
        assert!(res < 1e-6, "residual {res}");
    }

    #[test]
    fn permutation_roundtrip_preserves_solution() {
        let primal = two_contact_primal();
        let mut dual = DualFrictionProblem3::compute_from(&primal).unwrap();
        let mut r_plain = vec![0.0; 6];
        {
            let mut gs = GaussSeidel::new();
            gs.set_deterministic(true);
            dual.solve_with(&mut gs, &mut r_plain, true).unwrap();
        }

        dual.apply_permutation(&[1, 0]).unwrap();
        assert!(dual.permuted());
        let mut r_perm = vec![0.0; 6];
        {
            let mut gs = GaussSeidel::new();
            gs.set_deterministic(true);
            dual.solve_with(&mut gs, &mut r_perm, true).unwrap();
        }
        for (a, b) in r_plain.iter().zip(&r_perm) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        dual.undo_permutation().unwrap();
        assert!(!dual.permuted());
    }
}
