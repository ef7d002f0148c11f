/// Hybrid 1-D root finding.
use tracing::debug;

use crate::core::{EPSILON, Float};

/// Largest integer multiplier applied to both endpoints while searching for a
/// sign change.
const MAX_WIDENING: i32 = 10;

/// Finds a root of `f` on `[a, b]` with Brent's method.
///
/// The interval is widened by integer multiples of the endpoints, up to 10x,
/// when it does not bracket a sign change. If no bracketing interval can be
/// found this way, 0.0 is returned and the failure is logged. Both endpoints
/// are scaled by the same multiplier, so intervals straddling zero may never
/// bracket; this matches the historical behavior and is only reported.
///
/// Returns the abscissa with |f(x)| <= tol, or the best approximation found
/// after `max_iter` iterations.
pub(crate) fn brent<F>(mut f: F, a: Float, b: Float, tol: Float, max_iter: usize) -> Float
where
    F: FnMut(Float) -> Float,
{
    let (mut a, mut b) = (a, b);
    let mut fa = f(a);
    let mut fb = f(b);

    if fa * fb >= 0.0 {
        let (a0, b0) = (a, b);
        let mut bracketed = false;
        for mult in 2..=MAX_WIDENING {
            let m = mult as Float;
            a = a0 * m;
            b = b0 * m;
            fa = f(a);
            fb = f(b);
            if fa * fb < 0.0 {
                bracketed = true;
                break;
            }
        }
        if !bracketed {
            debug!(a = a0, b = b0, "brent: no sign change after widening");
            return 0.0;
        }
    }

    // c mirrors the previous value of b so that [b, c] always brackets.
    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = b - a;

    for _ in 0..max_iter {
        if fb * fc > 0.0 {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = 2.0 * EPSILON * b.abs() + 0.5 * tol;
        let m = 0.5 * (c - b);

        if m.abs() <= tol1 || fb == 0.0 || fb.abs() <= tol {
            return b;
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // Attempt inverse quadratic interpolation, falling back to the
            // secant rule when only two distinct ordinates are available.
            let s = fb / fa;
            let (mut p, mut q) = if a == c || fa == fc {
                (2.0 * m * s, 1.0 - s)
            } else {
                let q0 = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * m * q0 * (q0 - r) - (b - a) * (r - 1.0)),
                    (q0 - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };

            if p > 0.0 {
                q = -q;
            }
            p = p.abs();

            // Contraction bound: reject steps that do not shrink fast enough.
            let min1 = 3.0 * m * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < Float::min(min1, min2) {
                e = d;
                d = p / q;
            } else {
                d = m;
                e = m;
            }
        } else {
            d = m;
            e = m;
        }

        a = b;
        fa = fb;
        if d.abs() > tol1 {
            b += d;
        } else {
            b += if m > 0.0 { tol1 } else { -tol1 };
        }
        fb = f(b);
    }

    b
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_brent_cubic() {
        // x^3 - 2x - 5 has a single real root near 2.0945515.
        let root = brent(|x| x * x * x - 2.0 * x - 5.0, 2.0, 3.0, 1e-12, 100);
        assert_abs_diff_eq!(root, 2.0945514815423265, epsilon = 1e-9);
    }

    #[test]
    fn test_brent_transcendental() {
        let root = brent(|x| x.cos() - x, 0.0, 1.0, 1e-12, 100);
        assert_abs_diff_eq!(root, 0.7390851332151607, epsilon = 1e-9);
    }

    #[test]
    fn test_brent_widening_brackets_root() {
        // [0.5, 1] does not bracket x = 4.5; the multiplier search does.
        let root = brent(|x| x - 4.5, 0.5, 1.0, 1e-12, 100);
        assert_abs_diff_eq!(root, 4.5, epsilon = 1e-9);
    }

    #[test]
    fn test_brent_unbracketable_returns_zero() {
        let root = brent(|x| x * x + 1.0, 1.0, 2.0, 1e-12, 100);
        assert_eq!(root, 0.0);
    }
}
