//! Fischer-Burmeister functions over second-order cones.
//!
//! The FB function `phi(x, y) = x + y - sqrt(x o x + y o y)` (with `o` the
//! Jordan product of the cone algebra and `sqrt` its spectral square root)
//! vanishes exactly when `x` and `y` lie in the cone and are orthogonal.
//! The solvers consume both the value and its generalized Jacobian; near the
//! points where the arrow matrix of the square root loses rank, a small
//! regularization keeps the linearization usable.

use crate::types::Precision;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

const SINGULAR_SHIFT: Precision = 1e-10;

/// Scalar Fischer-Burmeister function, used by the degenerate frictionless
/// path.
pub(crate) fn fb_scalar(a: Precision, b: Precision) -> Precision {
    a + b - a.hypot(b)
}

/// Arrow (Jordan multiplication) matrix of a 3-dimensional cone vector.
fn arrow3(w: &Vector3<Precision>) -> Matrix3<Precision> {
    Matrix3::new(w.x, w.y, w.z, w.y, w.x, 0.0, w.z, 0.0, w.x)
}

fn arrow2(w: &Vector2<Precision>) -> Matrix2<Precision> {
    Matrix2::new(w.x, w.y, w.y, w.x)
}

/// Spectral square root of `z = x o x + y o y`, whose eigenvalues are
/// non-negative by construction.
fn jordan_sqrt3(z: &Vector3<Precision>) -> Vector3<Precision> {
    let zt = Vector2::new(z.y, z.z);
    let nzt = zt.norm();
    let l1 = (z.x - nzt).max(0.0).sqrt();
    let l2 = (z.x + nzt).max(0.0).sqrt();
    if nzt <= Precision::EPSILON * z.x.abs().max(1.0) {
        Vector3::new(z.x.max(0.0).sqrt(), 0.0, 0.0)
    } else {
        let half_dir = zt * (0.5 * (l2 - l1) / nzt);
        Vector3::new(0.5 * (l1 + l2), half_dir.x, half_dir.y)
    }
}

fn jordan_sqrt2(z: &Vector2<Precision>) -> Vector2<Precision> {
    let nzt = z.y.abs();
    let l1 = (z.x - nzt).max(0.0).sqrt();
    let l2 = (z.x + nzt).max(0.0).sqrt();
    Vector2::new(0.5 * (l1 + l2), 0.5 * (l2 - l1) * z.y.signum())
}

fn square_sum3(x: &Vector3<Precision>, y: &Vector3<Precision>) -> Vector3<Precision> {
    Vector3::new(
        x.norm_squared() + y.norm_squared(),
        2.0 * (x.x * x.y + y.x * y.y),
        2.0 * (x.x * x.z + y.x * y.z),
    )
}

fn square_sum2(x: &Vector2<Precision>, y: &Vector2<Precision>) -> Vector2<Precision> {
    Vector2::new(
        x.norm_squared() + y.norm_squared(),
        2.0 * (x.x * x.y + y.x * y.y),
    )
}

/// FB value over the 3-dimensional second-order cone.
pub(crate) fn fb3(x: &Vector3<Precision>, y: &Vector3<Precision>) -> Vector3<Precision> {
    x + y - jordan_sqrt3(&square_sum3(x, y))
}

/// FB value over the 2-dimensional second-order cone.
pub(crate) fn fb2(x: &Vector2<Precision>, y: &Vector2<Precision>) -> Vector2<Precision> {
    x + y - jordan_sqrt2(&square_sum2(x, y))
}

/// FB value together with its partial Jacobians
/// `dphi/dx = I - L_s^-1 L_x` and `dphi/dy = I - L_s^-1 L_y`.
pub(crate) fn fb3_with_jacobian(
    x: &Vector3<Precision>,
    y: &Vector3<Precision>,
) -> (Vector3<Precision>, Matrix3<Precision>, Matrix3<Precision>) {
    let mut s = jordan_sqrt3(&square_sum3(x, y));
    let phi = x + y - s;
    let scale = s.x.abs().max(1.0);
    let inv = loop {
        match arrow3(&s).try_inverse() {
            Some(inv) => break inv,
            None => s.x += SINGULAR_SHIFT * scale,
        }
    };
    let dx = Matrix3::identity() - inv * arrow3(x);
    let dy = Matrix3::identity() - inv * arrow3(y);
    (phi, dx, dy)
}

/// Two-dimensional counterpart of [`fb3_with_jacobian`].
pub(crate) fn fb2_with_jacobian(
    x: &Vector2<Precision>,
    y: &Vector2<Precision>,
) -> (Vector2<Precision>, Matrix2<Precision>, Matrix2<Precision>) {
    let mut s = jordan_sqrt2(&square_sum2(x, y));
    let phi = x + y - s;
    let scale = s.x.abs().max(1.0);
    let inv = loop {
        match arrow2(&s).try_inverse() {
            Some(inv) => break inv,
            None => s.x += SINGULAR_SHIFT * scale,
        }
    };
    let dx = Matrix2::identity() - inv * arrow2(x);
    let dy = Matrix2::identity() - inv * arrow2(y);
    (phi, dx, dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fb_vanishes_on_complementary_pair() {
        // x on the cone boundary, y on the boundary, x . y = 0.
        let x = Vector3::new(1.0, 1.0, 0.0);
        let y = Vector3::new(0.5, -0.5, 0.0);
        let phi = fb3(&x, &y);
        assert_relative_eq!(phi.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn fb_nonzero_outside_cone() {
        let x = Vector3::new(-1.0, 0.0, 0.0);
        let y = Vector3::zeros();
        assert!(fb3(&x, &y).norm() > 1.0);
    }

    #[test]
    fn fb_interior_times_zero() {
        // Strictly interior x with y = 0: phi = 0.
        let x = Vector3::new(2.0, 0.5, -0.3);
        let y = Vector3::zeros();
        assert_relative_eq!(fb3(&x, &y).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let x = Vector3::new(1.2, 0.3, -0.4);
        let y = Vector3::new(0.8, -0.2, 0.5);
        let (phi, dx, dy) = fb3_with_jacobian(&x, &y);
        let h = 1e-7;
        for i in 0..3 {
            let mut xp = x;
            xp[i] += h;
            let dphi = (fb3(&xp, &y) - phi) / h;
            for j in 0..3 {
                assert_relative_eq!(dx[(j, i)], dphi[j], epsilon = 1e-5);
            }
            let mut yp = y;
            yp[i] += h;
            let dphi = (fb3(&x, &yp) - phi) / h;
            for j in 0..3 {
                assert_relative_eq!(dy[(j, i)], dphi[j], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn two_dimensional_fb() {
        let x = Vector2::new(1.0, 1.0);
        let y = Vector2::new(0.5, -0.5);
        assert_relative_eq!(fb2(&x, &y).norm(), 0.0, epsilon = 1e-12);
        let (_, dx, _) = fb2_with_jacobian(&Vector2::new(1.0, 0.2), &Vector2::new(0.3, 0.1));
        assert!(dx.norm() > 0.0);
    }
}
