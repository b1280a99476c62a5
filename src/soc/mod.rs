//! Second-order cone laws and their local solvers.
//!
//! [`SocLaw3`] / [`SocLaw2`] adapt the per-contact solvers of
//! [`local_solver`] to the [`NonSmoothLaw`] interface consumed by the
//! Gauss-Seidel solver. The Coulomb construction applies the De Saxce
//! change of variable, turning the friction law into a genuine cone
//! complementarity; the plain construction solves the associated SOCCP
//! directly, which is what the Cadoux fixed-point iterates on.

pub mod fischer_burmeister;
pub mod local_solver;
pub mod polynomial;

pub use local_solver::{solve_contact_2, solve_contact_3, Strategy};
pub use polynomial::{poly_real_roots, real_roots, RootFilter};

use crate::solver::NonSmoothLaw;
use crate::types::Precision;
use local_solver::{contact_residual_2, contact_residual_3};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// Default local tolerance on the squared FB residual, `eps^(3/4)`.
pub fn default_local_tolerance() -> Precision {
    Precision::EPSILON.powf(0.75)
}

/// Second-order cone law over 3-dimensional contacts.
///
/// Holds one friction coefficient per contact. Rows are indexed by the
/// contact number; the law is stateless across calls, as the solver
/// requires.
#[derive(Debug, Clone)]
pub struct SocLaw3 {
    mu: Vec<Precision>,
    de_saxce: bool,
    strategy: Strategy,
    local_tol: Precision,
}

impl SocLaw3 {
    /// Coulomb friction law (De Saxce change of variable applied).
    pub fn coulomb(mu: Vec<Precision>) -> Self {
        SocLaw3 {
            mu,
            de_saxce: true,
            strategy: Strategy::Hybrid,
            local_tol: default_local_tolerance(),
        }
    }

    /// Plain SOCCP law, for static problems and Cadoux inner solves.
    pub fn socqp(mu: Vec<Precision>) -> Self {
        SocLaw3 {
            mu,
            de_saxce: false,
            strategy: Strategy::Hybrid,
            local_tol: default_local_tolerance(),
        }
    }

    /// Overrides the local solver strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Overrides the local tolerance on the squared FB residual.
    pub fn with_local_tolerance(mut self, tol: Precision) -> Self {
        self.local_tol = tol;
        self
    }

    /// Number of contacts covered by the law.
    pub fn contacts(&self) -> usize {
        self.mu.len()
    }
}

impl NonSmoothLaw for SocLaw3 {
    type Block = Matrix3<Precision>;

    fn dimension(&self) -> usize {
        3
    }

    fn eval_local(&self, index: usize, r: &[Precision], u: &[Precision]) -> Precision {
        let r = Vector3::new(r[0], r[1], r[2]);
        let u = Vector3::new(u[0], u[1], u[2]);
        contact_residual_3(&r, &u, self.mu[index], self.de_saxce)
    }

    fn solve_local(
        &self,
        index: usize,
        w: &Matrix3<Precision>,
        b: &[Precision],
        r: &mut [Precision],
        scaling: Precision,
    ) -> bool {
        let b = Vector3::new(b[0], b[1], b[2]);
        let mut local_r = Vector3::new(r[0], r[1], r[2]);
        let res = solve_contact_3(
            w,
            &b,
            &mut local_r,
            self.mu[index],
            self.local_tol,
            scaling,
            self.de_saxce,
            self.strategy,
        );
        r[0] = local_r.x;
        r[1] = local_r.y;
        r[2] = local_r.z;
        res <= self.local_tol
    }
}

/// Second-order cone law over 2-dimensional contacts.
#[derive(Debug, Clone)]
pub struct SocLaw2 {
    mu: Vec<Precision>,
    de_saxce: bool,
    strategy: Strategy,
    local_tol: Precision,
}

impl SocLaw2 {
    /// Coulomb friction law (De Saxce change of variable applied).
    pub fn coulomb(mu: Vec<Precision>) -> Self {
        SocLaw2 {
            mu,
            de_saxce: true,
            strategy: Strategy::Hybrid,
            local_tol: default_local_tolerance(),
        }
    }

    /// Plain SOCCP law.
    pub fn socqp(mu: Vec<Precision>) -> Self {
        SocLaw2 {
            mu,
            de_saxce: false,
            strategy: Strategy::Hybrid,
            local_tol: default_local_tolerance(),
        }
    }

    /// Overrides the local solver strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Number of contacts covered by the law.
    pub fn contacts(&self) -> usize {
        self.mu.len()
    }
}

impl NonSmoothLaw for SocLaw2 {
    type Block = Matrix2<Precision>;

    fn dimension(&self) -> usize {
        2
    }

    fn eval_local(&self, index: usize, r: &[Precision], u: &[Precision]) -> Precision {
        let r = Vector2::new(r[0], r[1]);
        let u = Vector2::new(u[0], u[1]);
        contact_residual_2(&r, &u, self.mu[index], self.de_saxce)
    }

    fn solve_local(
        &self,
        index: usize,
        w: &Matrix2<Precision>,
        b: &[Precision],
        r: &mut [Precision],
        scaling: Precision,
    ) -> bool {
        let b = Vector2::new(b[0], b[1]);
        let mut local_r = Vector2::new(r[0], r[1]);
        let res = solve_contact_2(
            w,
            &b,
            &mut local_r,
            self.mu[index],
            self.local_tol,
            scaling,
            self.de_saxce,
            self.strategy,
        );
        r[0] = local_r.x;
        r[1] = local_r.y;
        res <= self.local_tol
    }
}
