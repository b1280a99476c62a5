//! Real roots of low-degree monic polynomials.
//!
//! The enumerative contact solver reduces its sliding branch to a quartic
//! (or quadratic in two dimensions) whose real roots are candidate friction
//! multipliers. Quartics go through Ferrari's resolvent-cubic factorization;
//! every root is polished by a few Newton steps, which also absorbs the
//! conditioning loss of the closed-form path.

use num_traits::Float;

/// Sign filter applied to the returned roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootFilter {
    /// Keep every real root.
    #[default]
    All,
    /// Keep roots strictly greater than zero.
    StrictlyPositive,
    /// Keep roots strictly less than zero.
    StrictlyNegative,
}

fn cst<T: Float>(x: f64) -> T {
    T::from(x).expect("constant representable in any float type")
}

/// Real roots, with multiplicity, of the monic polynomial
/// `x^N + c[N-1] x^(N-1) + ... + c[0]`, sorted ascending.
///
/// Supported degrees are 2, 3 and 4.
pub fn real_roots<T: Float, const N: usize>(coeffs: &[T; N], filter: RootFilter) -> Vec<T> {
    let mut roots = match N {
        2 => monic_quadratic(coeffs[0], coeffs[1]),
        3 => monic_cubic(coeffs[0], coeffs[1], coeffs[2]),
        4 => monic_quartic(coeffs[0], coeffs[1], coeffs[2], coeffs[3]),
        _ => panic!("unsupported polynomial degree {N}"),
    };
    roots.retain(|&r| match filter {
        RootFilter::All => true,
        RootFilter::StrictlyPositive => r > T::zero(),
        RootFilter::StrictlyNegative => r < T::zero(),
    });
    roots
}

/// Real roots of `c[d] x^d + ... + c[0]` for any degree up to 4, tolerating
/// vanishing leading coefficients.
pub fn poly_real_roots<T: Float>(coeffs: &[T], filter: RootFilter) -> Vec<T> {
    let scale = coeffs
        .iter()
        .fold(T::zero(), |acc, &c| acc.max(c.abs()))
        .max(T::one());
    let eps = scale * cst::<T>(1e-14);
    let mut degree = coeffs.len().saturating_sub(1);
    while degree > 0 && coeffs[degree].abs() <= eps {
        degree -= 1;
    }
    if degree == 0 {
        return Vec::new();
    }
    let lead = coeffs[degree];
    let mut roots = match degree {
        1 => vec![-coeffs[0] / lead],
        2 => monic_quadratic(coeffs[0] / lead, coeffs[1] / lead),
        3 => monic_cubic(coeffs[0] / lead, coeffs[1] / lead, coeffs[2] / lead),
        _ => monic_quartic(
            coeffs[0] / lead,
            coeffs[1] / lead,
            coeffs[2] / lead,
            coeffs[3] / lead,
        ),
    };
    roots.retain(|&r| match filter {
        RootFilter::All => true,
        RootFilter::StrictlyPositive => r > T::zero(),
        RootFilter::StrictlyNegative => r < T::zero(),
    });
    roots
}

fn monic_quadratic<T: Float>(c0: T, c1: T) -> Vec<T> {
    let disc = c1 * c1 - cst::<T>(4.0) * c0;
    if disc < T::zero() {
        return Vec::new();
    }
    let sq = disc.sqrt();
    let half = cst::<T>(0.5);
    let mut roots = vec![(-c1 - sq) * half, (-c1 + sq) * half];
    roots.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
    roots
}

fn monic_cubic<T: Float>(c0: T, c1: T, c2: T) -> Vec<T> {
    let third = cst::<T>(1.0 / 3.0);
    let shift = c2 * third;
    // Depressed cubic t^3 + p t + q with x = t - shift.
    let p = c1 - c2 * c2 * third;
    let q = c0 - c1 * c2 * third + cst::<T>(2.0 / 27.0) * c2 * c2 * c2;

    let mut roots = if p.abs() < cst(1e-300) {
        vec![cbrt(-q)]
    } else {
        let disc = q * q * cst::<T>(0.25) + p * p * p * cst::<T>(1.0 / 27.0);
        if disc > T::zero() {
            let sq = disc.sqrt();
            let half_q = q * cst::<T>(0.5);
            vec![cbrt(-half_q + sq) + cbrt(-half_q - sq)]
        } else {
            // Three real roots, via the trigonometric form.
            let m = (-p * third).sqrt();
            let arg = (cst::<T>(3.0) * q / (cst::<T>(2.0) * p * m))
                .max(-T::one())
                .min(T::one());
            let theta = arg.acos() * third;
            let two_pi_third = cst::<T>(2.0 * core::f64::consts::PI / 3.0);
            (0..3)
                .map(|k| {
                    cst::<T>(2.0) * m * (theta - two_pi_third * cst::<T>(k as f64)).cos()
                })
                .collect()
        }
    };
    for r in &mut roots {
        *r = *r - shift;
    }
    roots.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
    roots
}

fn monic_quartic<T: Float>(c0: T, c1: T, c2: T, c3: T) -> Vec<T> {
    let quarter = cst::<T>(0.25);
    let shift = c3 * quarter;
    // Depressed quartic y^4 + p y^2 + q y + r with x = y - shift.
    let c3_2 = c3 * c3;
    let p = c2 - cst::<T>(3.0 / 8.0) * c3_2;
    let q = c1 - cst::<T>(0.5) * c3 * c2 + cst::<T>(1.0 / 8.0) * c3_2 * c3;
    let r = c0 - quarter * c3 * c1 + cst::<T>(1.0 / 16.0) * c3_2 * c2
        - cst::<T>(3.0 / 256.0) * c3_2 * c3_2;

    let scale = T::one().max(p.abs()).max(q.abs()).max(r.abs());
    let tiny = scale * cst::<T>(1e-12);

    let mut roots: Vec<T> = Vec::with_capacity(4);
    if q.abs() <= tiny {
        // Biquadratic: z^2 + p z + r = 0, y = +/- sqrt(z).
        for z in monic_quadratic(r, p) {
            if z > tiny {
                let s = z.sqrt();
                roots.push(-s);
                roots.push(s);
            } else if z.abs() <= tiny {
                roots.push(T::zero());
                roots.push(T::zero());
            }
        }
    } else {
        // Ferrari: factor through the largest root of the resolvent cubic
        // z^3 + 2p z^2 + (p^2 - 4r) z - q^2 = 0, which is non-negative.
        let resolvent = monic_cubic(
            -q * q,
            p * p - cst::<T>(4.0) * r,
            cst::<T>(2.0) * p,
        );
        let z = resolvent
            .last()
            .copied()
            .unwrap_or(T::zero())
            .max(T::zero());
        let alpha = z.sqrt();
        if alpha <= tiny {
            for z in monic_quadratic(r, p) {
                if z > tiny {
                    let s = z.sqrt();
                    roots.push(-s);
                    roots.push(s);
                } else if z.abs() <= tiny {
                    roots.push(T::zero());
                    roots.push(T::zero());
                }
            }
        } else {
            let half = cst::<T>(0.5);
            let beta = (p + z - q / alpha) * half;
            let gamma = (p + z + q / alpha) * half;
            roots.extend(monic_quadratic(beta, alpha));
            roots.extend(monic_quadratic(gamma, -alpha));
        }
    }

    for root in &mut roots {
        let mut x = *root - shift;
        // Newton polish on the undepressed quartic.
        for _ in 0..3 {
            let f = (((x + c3) * x + c2) * x + c1) * x + c0;
            let df = ((cst::<T>(4.0) * x + cst::<T>(3.0) * c3) * x + cst::<T>(2.0) * c2) * x + c1;
            if df.abs() < cst(1e-300) {
                break;
            }
            let step = f / df;
            x = x - step;
            if step.abs() <= x.abs() * cst(1e-15) {
                break;
            }
        }
        *root = x;
    }
    roots.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
    roots
}

fn cbrt<T: Float>(x: T) -> T {
    if x < T::zero() {
        -(-x).powf(cst(1.0 / 3.0))
    } else {
        x.powf(cst(1.0 / 3.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic_roots_and_filters() {
        let roots = real_roots(&[-1.0, 0.0], RootFilter::All);
        assert_eq!(roots, vec![-1.0, 1.0]);
        let roots = real_roots(&[-1.0, 0.0], RootFilter::StrictlyPositive);
        assert_eq!(roots, vec![1.0]);
        let roots = real_roots(&[-1.0, 0.0], RootFilter::StrictlyNegative);
        assert_eq!(roots, vec![-1.0]);

        // x^2 + 1: no real roots.
        assert!(real_roots(&[1.0, 0.0], RootFilter::All).is_empty());

        // x^2 - 2x + 1: double root at 1, reported twice.
        let roots = real_roots(&[1.0, -2.0], RootFilter::All);
        assert_eq!(roots.len(), 2);
        assert_relative_eq!(roots[0], 1.0);
        assert_relative_eq!(roots[1], 1.0);
    }

    #[test]
    fn cubic_three_real_roots() {
        // (x - 1)(x + 1)(x - 2) = x^3 - 2x^2 - x + 2
        let roots = real_roots(&[2.0, -1.0, -2.0], RootFilter::All);
        assert_eq!(roots.len(), 3);
        assert_relative_eq!(roots[0], -1.0, epsilon = 1e-10);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-10);
        assert_relative_eq!(roots[2], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn cubic_single_real_root() {
        // x^3 + x + 2 = (x + 1)(x^2 - x + 2)
        let roots = real_roots(&[2.0, 1.0, 0.0], RootFilter::All);
        assert_eq!(roots.len(), 1);
        assert_relative_eq!(roots[0], -1.0, epsilon = 1e-10);
    }

    #[test]
    fn quartic_four_real_roots() {
        // (x^2 - 1)(x^2 - 4) = x^4 - 5x^2 + 4
        let roots = real_roots(&[4.0, 0.0, -5.0, 0.0], RootFilter::All);
        assert_eq!(roots.len(), 4);
        for (root, expected) in roots.iter().zip([-2.0, -1.0, 1.0, 2.0]) {
            assert_relative_eq!(root, &expected, epsilon = 1e-10);
        }
        let positive = real_roots(&[4.0, 0.0, -5.0, 0.0], RootFilter::StrictlyPositive);
        assert_eq!(positive.len(), 2);
    }

    #[test]
    fn quartic_with_odd_terms() {
        // (x - 3)(x + 2)(x^2 + x + 1) = x^4 - 6x^2 - 7x - 6... compute:
        // (x - 3)(x + 2) = x^2 - x - 6; times (x^2 + x + 1):
        // x^4 + x^3 + x^2 - x^3 - x^2 - x - 6x^2 - 6x - 6 = x^4 - 6x^2 - 7x - 6
        let roots = real_roots(&[-6.0, -7.0, -6.0, 0.0], RootFilter::All);
        assert_eq!(roots.len(), 2);
        assert_relative_eq!(roots[0], -2.0, epsilon = 1e-9);
        assert_relative_eq!(roots[1], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn general_poly_handles_degenerate_leading_coefficient() {
        // 0 x^4 + 0 x^3 + x^2 - 1: degree falls through to the quadratic.
        let roots = poly_real_roots(&[-1.0, 0.0, 1.0, 0.0, 0.0], RootFilter::All);
        assert_eq!(roots.len(), 2);
        assert_relative_eq!(roots[0], -1.0, epsilon = 1e-12);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn double_quartic_root_survives_polish() {
        // (x - 0.625)^2 (x + 0.9)^2, the shape produced by isotropic
        // sliding problems.
        let a = 0.625;
        let b = -0.9;
        // (x^2 - 2ax + a^2)(x^2 - 2bx + b^2)
        let c0 = a * a * b * b;
        let c1 = -2.0 * (a * a * b + a * b * b);
        let c2 = a * a + b * b + 4.0 * a * b;
        let c3 = -2.0 * (a + b);
        let roots = real_roots(&[c0, c1, c2, c3], RootFilter::StrictlyPositive);
        assert!(!roots.is_empty());
        for root in roots {
            assert_relative_eq!(root, a, epsilon = 1e-5);
        }
    }
}
