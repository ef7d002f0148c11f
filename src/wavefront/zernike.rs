//! Orthonormal Zernike decomposition of wavefront maps.
//!
//! Polynomials are indexed in the OSA/ANSI single-index scheme,
//! j = (n(n + 2) + m) / 2, and normalized so that the basis is orthonormal
//! over the unit disk: sqrt(n + 1) for m = 0 and sqrt(2(n + 1)) otherwise.
//! Piston and tilt are solved analytically; higher orders are fit with a
//! modified Gram-Schmidt factorization of the sampled basis, which stays
//! well-conditioned on partially vignetted pupils where the continuous
//! orthogonality no longer holds.
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::core::Float;

/// Columns with a Gram-Schmidt norm below this fraction of their original
/// norm are treated as degenerate and receive a zero coefficient.
const DEGENERACY_TOL: Float = 1e-12;

/// Consistency factor relating the median absolute deviation to a standard
/// deviation for normal data.
const MAD_SCALE: Float = 1.4826;

/// Indices removed by the default low-order display transform: piston, both
/// tilts, and defocus.
pub const LOW_ORDER_REMOVAL: [usize; 4] = [0, 1, 2, 4];

/// Configuration of the Zernike fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZernikeOptions {
    /// Highest OSA/ANSI index to fit. Defaults to a conservative cap of 6
    /// when unset; always limited by the number of valid samples.
    pub max_j: Option<usize>,
    /// Reject outlying samples from the high-order fit by a MAD criterion.
    pub outlier_rejection: bool,
    /// Multiplier on the scaled MAD forming the rejection threshold.
    pub outlier_k: Float,
    /// Absolute floor of the rejection threshold, in µm.
    pub outlier_min_abs: Float,
}

impl Default for ZernikeOptions {
    fn default() -> Self {
        Self {
            max_j: None,
            outlier_rejection: true,
            outlier_k: 6.0,
            outlier_min_abs: 1e-3,
        }
    }
}

const DEFAULT_MAX_J: usize = 6;

/// An orthonormal Zernike model of an OPD map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZernikeFit {
    /// Coefficients c_j in µm, OSA/ANSI indexed from j = 0.
    pub coefficients: Vec<Float>,
    /// RMS of the fit residual over the accepted samples, in µm.
    pub residual_rms: Float,
    /// The highest index actually fit.
    pub max_j: usize,
    /// Pupil radius used to normalize sample coordinates, in mm.
    pub normalization_radius_mm: Float,
    /// Number of samples excluded from the high-order fit.
    pub outliers_rejected: usize,
    /// True when too few samples were available for any fit beyond piston.
    pub skipped: bool,
}

/// The (n, m) orders of the OSA/ANSI single index.
pub fn osa_orders(j: usize) -> (u32, i32) {
    let mut n = 0u32;
    let mut first_of_row = 0usize;
    loop {
        let row_len = (n + 1) as usize;
        if j < first_of_row + row_len {
            let m = -(n as i32) + 2 * (j - first_of_row) as i32;
            return (n, m);
        }
        first_of_row += row_len;
        n += 1;
    }
}

fn factorial(k: u32) -> Float {
    (1..=k).fold(1.0, |acc, v| acc * v as Float)
}

fn radial(n: u32, m_abs: u32, rho: Float) -> Float {
    let upper = (n - m_abs) / 2;
    let mut sum = 0.0;
    for k in 0..=upper {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        let num = factorial(n - k);
        let den = factorial(k) * factorial((n + m_abs) / 2 - k) * factorial((n - m_abs) / 2 - k);
        sum += sign * num / den * rho.powi((n - 2 * k) as i32);
    }
    sum
}

/// Evaluates the orthonormal Zernike polynomial Z_j at normalized pupil
/// coordinates.
pub fn zernike(j: usize, x: Float, y: Float) -> Float {
    let (n, m) = osa_orders(j);
    let rho = (x * x + y * y).sqrt();
    let theta = y.atan2(x);

    let norm = if m == 0 {
        ((n + 1) as Float).sqrt()
    } else {
        (2.0 * (n + 1) as Float).sqrt()
    };
    let angular = if m > 0 {
        (m as Float * theta).cos()
    } else if m < 0 {
        ((-m) as Float * theta).sin()
    } else {
        1.0
    };

    norm * radial(n, m.unsigned_abs(), rho) * angular
}

/// Evaluates a coefficient vector at normalized pupil coordinates.
pub fn evaluate(coefficients: &[Float], x: Float, y: Float) -> Float {
    coefficients
        .iter()
        .enumerate()
        .map(|(j, c)| c * zernike(j, x, y))
        .sum()
}

/// Evaluates only the listed indices of a coefficient vector.
pub fn evaluate_subset(coefficients: &[Float], subset: &[usize], x: Float, y: Float) -> Float {
    subset
        .iter()
        .filter_map(|&j| coefficients.get(j).map(|c| c * zernike(j, x, y)))
        .sum()
}

fn median(values: &mut [Float]) -> Float {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(Float::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Fits an orthonormal Zernike model to OPD samples.
///
/// Samples are (x, y, opd) triples with coordinates already normalized to the
/// unit pupil and OPD in µm. Points outside the unit disk or with non-finite
/// OPD are ignored. The OPD is centered on its mean before fitting, so the
/// reported piston coefficient is zero by construction.
pub(crate) fn fit(
    samples: &[(Float, Float, Float)],
    normalization_radius_mm: Float,
    options: &ZernikeOptions,
) -> ZernikeFit {
    let pts: Vec<(Float, Float, Float)> = samples
        .iter()
        .copied()
        .filter(|(x, y, w)| w.is_finite() && x * x + y * y <= 1.0)
        .collect();

    let requested = options.max_j.unwrap_or(DEFAULT_MAX_J);

    if pts.len() < 6 {
        return ZernikeFit {
            coefficients: vec![0.0],
            residual_rms: Float::NAN,
            max_j: 0,
            normalization_radius_mm,
            outliers_rejected: 0,
            skipped: true,
        };
    }

    // Center the OPD and rescale for conditioning.
    let n_pts = pts.len() as Float;
    let mean = pts.iter().map(|(_, _, w)| w).sum::<Float>() / n_pts;
    let (min, max) = pts.iter().fold((Float::MAX, Float::MIN), |(lo, hi), (_, _, w)| {
        (lo.min(w - mean), hi.max(w - mean))
    });
    let scale = Float::max(1.0, max - min);

    let centered: Vec<(Float, Float, Float)> = pts
        .iter()
        .map(|(x, y, w)| (*x, *y, (w - mean) / scale))
        .collect();

    // Analytic tilt from the 2x2 normal equations over Z1 = 2y, Z2 = 2x.
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    let (mut bx, mut by) = (0.0, 0.0);
    for (x, y, w) in centered.iter() {
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
        bx += w * x;
        by += w * y;
    }
    let a11 = 4.0 * syy;
    let a12 = 4.0 * sxy;
    let a22 = 4.0 * sxx;
    let det = a11 * a22 - a12 * a12;
    let (c1, c2) = if det.abs() < 1e-20 {
        (0.0, 0.0)
    } else {
        (
            (2.0 * by * a22 - 2.0 * bx * a12) / det,
            (2.0 * bx * a11 - 2.0 * by * a12) / det,
        )
    };

    let residual: Vec<Float> = centered
        .iter()
        .map(|(x, y, w)| w - c1 * 2.0 * y - c2 * 2.0 * x)
        .collect();

    // MAD outlier rejection over the centered residual.
    let mut keep: Vec<bool> = vec![true; centered.len()];
    let mut outliers_rejected = 0;
    if options.outlier_rejection {
        let mut sorted = residual.clone();
        let med = median(&mut sorted);
        let mut deviations: Vec<Float> = residual.iter().map(|r| (r - med).abs()).collect();
        let mad = median(&mut deviations);
        let threshold = Float::max(options.outlier_min_abs / scale, options.outlier_k * MAD_SCALE * mad);

        let kept: Vec<bool> = residual.iter().map(|r| (r - med).abs() <= threshold).collect();
        let n_kept = kept.iter().filter(|k| **k).count();
        if n_kept >= 10 {
            outliers_rejected = kept.len() - n_kept;
            keep = kept;
        }
    }

    let fit_pts: Vec<usize> = (0..centered.len()).filter(|&i| keep[i]).collect();

    // Conservative order selection from the surviving point count.
    let conservative = ((fit_pts.len() as Float) / 3.0).sqrt().floor() as usize;
    let max_j = usize::min(requested, conservative.max(2));

    let mut coefficients = vec![0.0; max_j + 1];
    if max_j >= 1 {
        coefficients[1] = c1;
    }
    if max_j >= 2 {
        coefficients[2] = c2;
    }

    let mut residual_rms;
    if max_j >= 3 {
        let n_rows = fit_pts.len();
        let n_cols = max_j - 2;

        let mut design = Array2::<Float>::zeros((n_rows, n_cols));
        let mut rhs = Array1::<Float>::zeros(n_rows);
        for (row, &i) in fit_pts.iter().enumerate() {
            let (x, y, _) = centered[i];
            for col in 0..n_cols {
                design[[row, col]] = zernike(col + 3, x, y);
            }
            rhs[row] = residual[i];
        }

        // Modified Gram-Schmidt with degenerate-column skipping.
        let mut q = design.clone();
        let mut r = Array2::<Float>::zeros((n_cols, n_cols));
        let mut degenerate = vec![false; n_cols];
        for col in 0..n_cols {
            let norm0 = design.column(col).dot(&design.column(col)).sqrt();
            for prev in 0..col {
                if degenerate[prev] {
                    continue;
                }
                let proj = q.column(prev).dot(&q.column(col));
                r[[prev, col]] = proj;
                let prev_col = q.column(prev).to_owned();
                let mut col_mut = q.column_mut(col);
                col_mut.zip_mut_with(&prev_col, |c, p| *c -= proj * p);
            }
            let norm = q.column(col).dot(&q.column(col)).sqrt();
            if norm <= DEGENERACY_TOL * norm0.max(1e-300) {
                degenerate[col] = true;
                q.column_mut(col).fill(0.0);
                continue;
            }
            r[[col, col]] = norm;
            q.column_mut(col).mapv_inplace(|v| v / norm);
        }

        let mut projections = Array1::<Float>::zeros(n_cols);
        for col in 0..n_cols {
            if !degenerate[col] {
                projections[col] = q.column(col).dot(&rhs);
            }
        }

        // Back-substitute R x = a, skipping degenerate columns.
        let mut x = vec![0.0; n_cols];
        for col in (0..n_cols).rev() {
            if degenerate[col] {
                continue;
            }
            let mut acc = projections[col];
            for upper in col + 1..n_cols {
                acc -= r[[col, upper]] * x[upper];
            }
            x[col] = acc / r[[col, col]];
        }

        for (col, &value) in x.iter().enumerate() {
            coefficients[col + 3] = value;
        }

        // Residual over the accepted samples.
        let mut ss = 0.0;
        for row in 0..n_rows {
            let mut model = 0.0;
            for col in 0..n_cols {
                model += design[[row, col]] * x[col];
            }
            let res = rhs[row] - model;
            ss += res * res;
        }
        residual_rms = (ss / n_rows as Float).sqrt();
    } else {
        let mut ss = 0.0;
        for &i in fit_pts.iter() {
            ss += residual[i] * residual[i];
        }
        residual_rms = (ss / fit_pts.len() as Float).sqrt();
    }

    for c in coefficients.iter_mut() {
        *c *= scale;
    }
    residual_rms *= scale;

    ZernikeFit {
        coefficients,
        residual_rms,
        max_j,
        normalization_radius_mm,
        outliers_rejected,
        skipped: false,
    }
}

impl ZernikeFit {
    /// Evaluates the fitted model at normalized pupil coordinates, in µm.
    pub fn evaluate(&self, x: Float, y: Float) -> Float {
        evaluate(&self.coefficients, x, y)
    }

    /// Evaluates the model restricted to a subset of indices, in µm.
    pub fn evaluate_subset(&self, subset: &[usize], x: Float, y: Float) -> Float {
        evaluate_subset(&self.coefficients, subset, x, y)
    }
}
