//! Hybrid one-contact SOCCP solvers.
//!
//! Each contact solves: find `r` with `u = W r + b` such that `r` lies in
//! the friction cone of coefficient `mu`, the (optionally De Saxce shifted)
//! velocity lies in the dual cone, and the two are orthogonal. The primary
//! attack is a non-smooth Newton iteration on the cone Fischer-Burmeister
//! reformulation, safeguarded by a half-step line search; the backstop
//! enumerates the closed-form candidates: vanishing force, sticking, and
//! the sliding branch whose friction multiplier is a root of a univariate
//! quartic (quadratic in dimension 2). Both safeguards are required: Newton
//! alone stalls on ill-conditioned diagonal blocks, and the enumeration
//! alone cannot polish well-conditioned interior solutions as cheaply.

use super::fischer_burmeister::{fb2, fb2_with_jacobian, fb3, fb3_with_jacobian, fb_scalar};
use super::polynomial::{poly_real_roots, RootFilter};
use crate::types::Precision;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// Root-finding strategy of the local solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Non-smooth Newton only.
    PureNewton,
    /// Closed-form candidate enumeration only.
    PureEnumerative,
    /// Newton first, enumeration when the residual stays above tolerance.
    #[default]
    Hybrid,
    /// Enumeration first, Newton to polish failures.
    RevHybrid,
}

const NEWTON_MAX_ITERS: usize = 25;
const SIGMA2: Precision = 1e-4;
const HALF_STEP: Precision = 0.5;
/// Below this coefficient the cone collapses to the normal ray.
const MU_ZERO: Precision = 1e-12;

/// Squared FB residual of a candidate `(r, u)` pair for a 3-dimensional
/// contact. Zero exactly on solutions.
pub(crate) fn contact_residual_3(
    r: &Vector3<Precision>,
    u: &Vector3<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> Precision {
    if mu <= MU_ZERO {
        return fb_scalar(r.x, u.x).powi(2) + r.y * r.y + r.z * r.z;
    }
    let nut = u.y.hypot(u.z);
    let un = u.x + if de_saxce { mu * nut } else { 0.0 };
    let x = Vector3::new(r.x, r.y / mu, r.z / mu);
    let y = Vector3::new(un / mu, u.y, u.z);
    fb3(&x, &y).norm_squared()
}

/// Squared FB residual for a 2-dimensional contact.
pub(crate) fn contact_residual_2(
    r: &Vector2<Precision>,
    u: &Vector2<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> Precision {
    if mu <= MU_ZERO {
        return fb_scalar(r.x, u.x).powi(2) + r.y * r.y;
    }
    let un = u.x + if de_saxce { mu * u.y.abs() } else { 0.0 };
    let x = Vector2::new(r.x, r.y / mu);
    let y = Vector2::new(un / mu, u.y);
    fb2(&x, &y).norm_squared()
}

/// Solves one 3-dimensional contact. Returns the squared FB residual of the
/// final iterate; success is a return value at most `tol`.
#[allow(clippy::too_many_arguments)]
pub fn solve_contact_3(
    w: &Matrix3<Precision>,
    b: &Vector3<Precision>,
    r: &mut Vector3<Precision>,
    mu: Precision,
    tol: Precision,
    scaling: Precision,
    de_saxce: bool,
    strategy: Strategy,
) -> Precision {
    let s = if scaling > 0.0 { scaling } else { 1.0 };
    let w = w * s;
    let b = b * s;
    let mu = mu.max(0.0);

    if mu <= MU_ZERO {
        // Frictionless: scalar linear complementarity on the normal axis.
        r.y = 0.0;
        r.z = 0.0;
        let w00 = w[(0, 0)];
        r.x = if w00 > 1e-14 { (-b.x / w00).max(0.0) } else { 0.0 };
        return fb_scalar(r.x, w00 * r.x + b.x).powi(2);
    }

    match strategy {
        Strategy::PureNewton => newton_3(&w, &b, r, mu, tol, de_saxce),
        Strategy::PureEnumerative => enumerative_3(&w, &b, r, mu, de_saxce),
        Strategy::Hybrid => {
            let mut res = newton_3(&w, &b, r, mu, tol, de_saxce);
            if res > tol {
                let mut candidate = *r;
                let alt = enumerative_3(&w, &b, &mut candidate, mu, de_saxce);
                if alt < res {
                    *r = candidate;
                    res = alt;
                }
            }
            res
        }
        Strategy::RevHybrid => {
            let mut res = enumerative_3(&w, &b, r, mu, de_saxce);
            if res > tol {
                let mut candidate = *r;
                let alt = newton_3(&w, &b, &mut candidate, mu, tol, de_saxce);
                if alt < res {
                    *r = candidate;
                    res = alt;
                }
            }
            res
        }
    }
}

/// Solves one 2-dimensional contact; see [`solve_contact_3`].
#[allow(clippy::too_many_arguments)]
pub fn solve_contact_2(
    w: &Matrix2<Precision>,
    b: &Vector2<Precision>,
    r: &mut Vector2<Precision>,
    mu: Precision,
    tol: Precision,
    scaling: Precision,
    de_saxce: bool,
    strategy: Strategy,
) -> Precision {
    let s = if scaling > 0.0 { scaling } else { 1.0 };
    let w = w * s;
    let b = b * s;
    let mu = mu.max(0.0);

    if mu <= MU_ZERO {
        r.y = 0.0;
        let w00 = w[(0, 0)];
        r.x = if w00 > 1e-14 { (-b.x / w00).max(0.0) } else { 0.0 };
        return fb_scalar(r.x, w00 * r.x + b.x).powi(2);
    }

    match strategy {
        Strategy::PureNewton => newton_2(&w, &b, r, mu, tol, de_saxce),
        Strategy::PureEnumerative => enumerative_2(&w, &b, r, mu, de_saxce),
        Strategy::Hybrid => {
            let mut res = newton_2(&w, &b, r, mu, tol, de_saxce);
            if res > tol {
                let mut candidate = *r;
                let alt = enumerative_2(&w, &b, &mut candidate, mu, de_saxce);
                if alt < res {
                    *r = candidate;
                    res = alt;
                }
            }
            res
        }
        Strategy::RevHybrid => {
            let mut res = enumerative_2(&w, &b, r, mu, de_saxce);
            if res > tol {
                let mut candidate = *r;
                let alt = newton_2(&w, &b, &mut candidate, mu, tol, de_saxce);
                if alt < res {
                    *r = candidate;
                    res = alt;
                }
            }
            res
        }
    }
}

/// FB value and Jacobian of the scaled reformulation at `r`.
fn merit_jacobian_3(
    w: &Matrix3<Precision>,
    b: &Vector3<Precision>,
    r: &Vector3<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> (Vector3<Precision>, Matrix3<Precision>) {
    let u = w * r + b;
    let nut = u.y.hypot(u.z);
    let un = u.x + if de_saxce { mu * nut } else { 0.0 };
    let x = Vector3::new(r.x, r.y / mu, r.z / mu);
    let y = Vector3::new(un / mu, u.y, u.z);
    let (phi, dphi_dx, dphi_dy) = fb3_with_jacobian(&x, &y);

    let inv_mu = 1.0 / mu;
    let dx_dr = Matrix3::new(1.0, 0.0, 0.0, 0.0, inv_mu, 0.0, 0.0, 0.0, inv_mu);
    let mut dtilde_du = Matrix3::identity();
    if de_saxce && nut > 1e-12 {
        dtilde_du[(0, 1)] = mu * u.y / nut;
        dtilde_du[(0, 2)] = mu * u.z / nut;
    }
    let dy_du = Matrix3::new(inv_mu, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0) * dtilde_du;
    let jac = dphi_dx * dx_dr + dphi_dy * dy_du * w;
    (phi, jac)
}

fn merit_jacobian_2(
    w: &Matrix2<Precision>,
    b: &Vector2<Precision>,
    r: &Vector2<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> (Vector2<Precision>, Matrix2<Precision>) {
    let u = w * r + b;
    let un = u.x + if de_saxce { mu * u.y.abs() } else { 0.0 };
    let x = Vector2::new(r.x, r.y / mu);
    let y = Vector2::new(un / mu, u.y);
    let (phi, dphi_dx, dphi_dy) = fb2_with_jacobian(&x, &y);

    let inv_mu = 1.0 / mu;
    let dx_dr = Matrix2::new(1.0, 0.0, 0.0, inv_mu);
    let mut dtilde_du = Matrix2::identity();
    if de_saxce && u.y.abs() > 1e-12 {
        dtilde_du[(0, 1)] = mu * u.y.signum();
    }
    let dy_du = Matrix2::new(inv_mu, 0.0, 0.0, 1.0) * dtilde_du;
    let jac = dphi_dx * dx_dr + dphi_dy * dy_du * w;
    (phi, jac)
}

/// Damped non-smooth Newton on the FB reformulation, keeping the best
/// iterate seen. The half-step safeguard engages whenever the direction is
/// non-descending for the squared merit.
fn newton_3(
    w: &Matrix3<Precision>,
    b: &Vector3<Precision>,
    r: &mut Vector3<Precision>,
    mu: Precision,
    tol: Precision,
    de_saxce: bool,
) -> Precision {
    let value = |r: &Vector3<Precision>| {
        let u = w * r + b;
        contact_residual_3(r, &u, mu, de_saxce)
    };

    let phi_init = value(r);
    if phi_init < tol {
        return phi_init;
    }
    let phi_zero = value(&Vector3::zeros());
    let mut phi_best;
    let mut r_best;
    if phi_zero < phi_init {
        phi_best = phi_zero;
        r_best = Vector3::zeros();
        *r = Vector3::zeros();
        if phi_zero < tol {
            return phi_zero;
        }
    } else {
        phi_best = phi_init;
        r_best = *r;
    }

    for _ in 0..NEWTON_MAX_ITERS {
        let (phi_vec, jac) = merit_jacobian_3(w, b, r, mu, de_saxce);
        let phi = phi_vec.norm_squared();
        if phi < tol {
            return phi;
        }
        if phi < phi_best {
            phi_best = phi;
            r_best = *r;
        }
        let grad = jac.transpose() * phi_vec;
        let Some(mut dr) = jac.lu().solve(&(-phi_vec)) else {
            break;
        };
        let proj = dr.dot(&grad);
        if proj > 0.0 || proj * proj < SIGMA2 * dr.norm_squared() * grad.norm_squared() {
            dr *= HALF_STEP;
        }
        *r += dr;
    }

    let phi_final = value(r);
    if phi_final < phi_best {
        return phi_final;
    }
    *r = r_best;
    phi_best
}

fn newton_2(
    w: &Matrix2<Precision>,
    b: &Vector2<Precision>,
    r: &mut Vector2<Precision>,
    mu: Precision,
    tol: Precision,
    de_saxce: bool,
) -> Precision {
    let value = |r: &Vector2<Precision>| {
        let u = w * r + b;
        contact_residual_2(r, &u, mu, de_saxce)
    };

    let phi_init = value(r);
    if phi_init < tol {
        return phi_init;
    }
    let phi_zero = value(&Vector2::zeros());
    let mut phi_best;
    let mut r_best;
    if phi_zero < phi_init {
        phi_best = phi_zero;
        r_best = Vector2::zeros();
        *r = Vector2::zeros();
        if phi_zero < tol {
            return phi_zero;
        }
    } else {
        phi_best = phi_init;
        r_best = *r;
    }

    for _ in 0..NEWTON_MAX_ITERS {
        let (phi_vec, jac) = merit_jacobian_2(w, b, r, mu, de_saxce);
        let phi = phi_vec.norm_squared();
        if phi < tol {
            return phi;
        }
        if phi < phi_best {
            phi_best = phi;
            r_best = *r;
        }
        let grad = jac.transpose() * phi_vec;
        let Some(mut dr) = jac.lu().solve(&(-phi_vec)) else {
            break;
        };
        let proj = dr.dot(&grad);
        if proj > 0.0 || proj * proj < SIGMA2 * dr.norm_squared() * grad.norm_squared() {
            dr *= HALF_STEP;
        }
        *r += dr;
    }

    let phi_final = value(r);
    if phi_final < phi_best {
        return phi_final;
    }
    *r = r_best;
    phi_best
}

// Small dense polynomial helpers for the sliding-branch elimination.
fn lin_mul(a: [Precision; 2], b: [Precision; 2]) -> [Precision; 3] {
    [a[0] * b[0], a[0] * b[1] + a[1] * b[0], a[1] * b[1]]
}

fn det2_lin(
    a: [Precision; 2],
    b: [Precision; 2],
    c: [Precision; 2],
    d: [Precision; 2],
) -> [Precision; 3] {
    let ad = lin_mul(a, d);
    let bc = lin_mul(b, c);
    [ad[0] - bc[0], ad[1] - bc[1], ad[2] - bc[2]]
}

fn quad_mul(a: [Precision; 3], b: [Precision; 3]) -> [Precision; 5] {
    let mut out = [0.0; 5];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

/// Closed-form candidate enumeration for a 3-dimensional contact.
///
/// Sliding-branch elimination: with `G = diag(g_n, 1, 1)` encoding the
/// normal condition (`g_n = 0` under De Saxce, `-mu^2` for the plain
/// SOCCP), the stationarity system reads `(W + k G) r = -b` with `k` the
/// ratio of tangential velocity to tangential force. Writing
/// `m(k) = adj(W + k G) (-b)`, the cone constraint
/// `|r_T| = mu r_N` becomes the quartic `|m_T|^2 - mu^2 m_N^2 = 0`.
/// Near-singular systems (isotropic sliding) are recovered through the
/// cone constraint instead of the normal equation.
fn enumerative_3(
    w: &Matrix3<Precision>,
    b: &Vector3<Precision>,
    r: &mut Vector3<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> Precision {
    let value = |candidate: &Vector3<Precision>| {
        let u = w * candidate + b;
        contact_residual_3(candidate, &u, mu, de_saxce)
    };

    let mut candidates: Vec<Vector3<Precision>> = Vec::with_capacity(10);
    candidates.push(Vector3::zeros());
    if let Some(stick) = w.lu().solve(&(-b)) {
        candidates.push(stick);
    }

    let gn = if de_saxce { 0.0 } else { -mu * mu };
    let lin = |i: usize, j: usize| -> [Precision; 2] {
        let slope = if i == j {
            if i == 0 {
                gn
            } else {
                1.0
            }
        } else {
            0.0
        };
        [w[(i, j)], slope]
    };
    let (l00, l01, l02) = (lin(0, 0), lin(0, 1), lin(0, 2));
    let (l10, l11, l12) = (lin(1, 0), lin(1, 1), lin(1, 2));
    let (l20, l21, l22) = (lin(2, 0), lin(2, 1), lin(2, 2));

    let adj = [
        [
            det2_lin(l11, l12, l21, l22),
            neg3(det2_lin(l01, l02, l21, l22)),
            det2_lin(l01, l02, l11, l12),
        ],
        [
            neg3(det2_lin(l10, l12, l20, l22)),
            det2_lin(l00, l02, l20, l22),
            neg3(det2_lin(l00, l02, l10, l12)),
        ],
        [
            det2_lin(l10, l11, l20, l21),
            neg3(det2_lin(l00, l01, l20, l21)),
            det2_lin(l00, l01, l10, l11),
        ],
    ];
    let mut m = [[0.0; 3]; 3];
    for (i, row) in adj.iter().enumerate() {
        for (j, quad) in row.iter().enumerate() {
            for (c, &coeff) in quad.iter().enumerate() {
                m[i][c] -= coeff * b[j];
            }
        }
    }
    let mut quartic = quad_mul(m[1], m[1]);
    let m2_sq = quad_mul(m[2], m[2]);
    let m0_sq = quad_mul(m[0], m[0]);
    for c in 0..5 {
        quartic[c] += m2_sq[c] - mu * mu * m0_sq[c];
    }

    let bt = Vector2::new(b.y, b.z);
    let wtn = Vector2::new(w[(1, 0)], w[(2, 0)]);
    let wnt = Vector2::new(w[(0, 1)], w[(0, 2)]);
    for k in poly_real_roots(&quartic, RootFilter::All) {
        if k < -1e-9 || !k.is_finite() {
            continue;
        }
        let k = k.max(0.0);
        let a = Matrix2::new(w[(1, 1)] + k, w[(1, 2)], w[(2, 1)], w[(2, 2)] + k);
        let Some(a_inv) = a.try_inverse() else {
            continue;
        };
        let p = -(a_inv * bt);
        let q = -(a_inv * wtn);
        let shift = if de_saxce { 0.0 } else { mu * mu * k };
        let coef = w[(0, 0)] - shift + wnt.dot(&q);
        if coef.abs() > 1e-12 {
            let rn = -(b.x + wnt.dot(&p)) / coef;
            if rn > 0.0 {
                let rt = p + q * rn;
                candidates.push(Vector3::new(rn, rt.x, rt.y));
            }
        }
        for rn in poly_real_roots(
            &[
                p.norm_squared(),
                2.0 * p.dot(&q),
                q.norm_squared() - mu * mu,
            ],
            RootFilter::StrictlyPositive,
        ) {
            let rt = p + q * rn;
            candidates.push(Vector3::new(rn, rt.x, rt.y));
        }
    }

    let mut best = value(r);
    let mut r_best = *r;
    for candidate in candidates {
        if !candidate.iter().all(|v| v.is_finite()) {
            continue;
        }
        let res = value(&candidate);
        if res < best {
            best = res;
            r_best = candidate;
        }
    }
    *r = r_best;
    best
}

/// Closed-form candidate enumeration for a 2-dimensional contact; the
/// sliding branch reduces to a quadratic.
fn enumerative_2(
    w: &Matrix2<Precision>,
    b: &Vector2<Precision>,
    r: &mut Vector2<Precision>,
    mu: Precision,
    de_saxce: bool,
) -> Precision {
    let value = |candidate: &Vector2<Precision>| {
        let u = w * candidate + b;
        contact_residual_2(candidate, &u, mu, de_saxce)
    };

    let mut candidates: Vec<Vector2<Precision>> = Vec::with_capacity(8);
    candidates.push(Vector2::zeros());
    if let Some(stick) = w.lu().solve(&(-b)) {
        candidates.push(stick);
    }

    let gn = if de_saxce { 0.0 } else { -mu * mu };
    // adj(W + kG) rows applied to -b, each entry linear in k.
    let m0 = [
        -(w[(1, 1)] * b.x) + w[(0, 1)] * b.y,
        -b.x,
    ];
    let m1 = [
        w[(1, 0)] * b.x - w[(0, 0)] * b.y,
        -gn * b.y,
    ];
    let quadratic = [
        m1[0] * m1[0] - mu * mu * m0[0] * m0[0],
        2.0 * (m1[0] * m1[1] - mu * mu * m0[0] * m0[1]),
        m1[1] * m1[1] - mu * mu * m0[1] * m0[1],
    ];

    for k in poly_real_roots(&quadratic, RootFilter::All) {
        if k < -1e-9 || !k.is_finite() {
            continue;
        }
        let k = k.max(0.0);
        let a = w[(1, 1)] + k;
        if a.abs() < 1e-14 {
            continue;
        }
        let p = -b.y / a;
        let q = -w[(1, 0)] / a;
        let shift = if de_saxce { 0.0 } else { mu * mu * k };
        let coef = w[(0, 0)] - shift + w[(0, 1)] * q;
        if coef.abs() > 1e-12 {
            let rn = -(b.x + w[(0, 1)] * p) / coef;
            if rn > 0.0 {
                candidates.push(Vector2::new(rn, p + q * rn));
            }
        }
        for rn in poly_real_roots(
            &[p * p, 2.0 * p * q, q * q - mu * mu],
            RootFilter::StrictlyPositive,
        ) {
            candidates.push(Vector2::new(rn, p + q * rn));
        }
    }

    let mut best = value(r);
    let mut r_best = *r;
    for candidate in candidates {
        if !candidate.iter().all(|v| v.is_finite()) {
            continue;
        }
        let res = value(&candidate);
        if res < best {
            best = res;
            r_best = candidate;
        }
    }
    *r = r_best;
    best
}

fn neg3(a: [Precision; 3]) -> [Precision; 3] {
    [-a[0], -a[1], -a[2]]
}
