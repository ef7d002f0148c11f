//! Streaming statistics and display transforms for OPD maps.
use serde::{Deserialize, Serialize};

use crate::core::Float;
use crate::wavefront::{OpdMode, PupilMode};

/// Summary statistics over the finite samples of a map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapStatistics {
    /// Number of nonzero finite samples.
    pub count: usize,
    pub mean: Float,
    pub rms: Float,
    pub min: Float,
    pub max: Float,
    pub peak_to_peak: Float,
}

/// Statistics layers reported with every wavefront map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavefrontReport {
    /// Piston-removed statistics; the primary figure of merit.
    pub primary: MapStatistics,
    /// As-measured statistics.
    pub raw: MapStatistics,
    /// Statistics of the residual after removing the low-order Zernike
    /// model. Absent when the fit was skipped.
    pub aberration: Option<MapStatistics>,
    /// Plane-fit-removed statistics for display.
    pub display: MapStatistics,
    pub pupil_mode: PupilMode,
    pub opd_mode: OpdMode,
    pub zernike_skipped: bool,
}

/// Computes statistics over an iterator of samples in a single streaming
/// pass. Non-finite samples are ignored.
///
/// With `remove_piston` the mean is subtracted before the RMS, min, and max
/// are reported; the subtraction is exact because the accumulators carry the
/// raw first and second moments.
pub fn statistics(values: impl Iterator<Item = Float>, remove_piston: bool) -> MapStatistics {
    let mut n = 0usize;
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut min = Float::INFINITY;
    let mut max = Float::NEG_INFINITY;

    for v in values {
        if !v.is_finite() {
            continue;
        }
        n += 1;
        if v != 0.0 {
            count += 1;
        }
        sum += v;
        sum_sq += v * v;
        min = min.min(v);
        max = max.max(v);
    }

    if n == 0 {
        return MapStatistics {
            count: 0,
            mean: Float::NAN,
            rms: Float::NAN,
            min: Float::NAN,
            max: Float::NAN,
            peak_to_peak: Float::NAN,
        };
    }

    let n_f = n as Float;
    let mean = sum / n_f;
    let peak_to_peak = max - min;

    if remove_piston {
        let variance = Float::max(0.0, sum_sq / n_f - mean * mean);
        MapStatistics {
            count,
            mean: 0.0,
            rms: variance.sqrt(),
            min: min - mean,
            max: max - mean,
            peak_to_peak,
        }
    } else {
        MapStatistics {
            count,
            mean,
            rms: (sum_sq / n_f).sqrt(),
            min,
            max,
            peak_to_peak,
        }
    }
}

/// Removes the least-squares plane z = a + bx + cy from a set of samples.
///
/// This is a view transform: it returns the residuals and never mutates the
/// input. Non-finite samples pass through unchanged.
pub fn plane_fit_removed(samples: &[(Float, Float, Float)]) -> Vec<Float> {
    // Normal equations over the finite samples.
    let mut s = [[0.0; 3]; 3];
    let mut b = [0.0; 3];
    for &(x, y, v) in samples.iter() {
        if !v.is_finite() {
            continue;
        }
        let row = [1.0, x, y];
        for i in 0..3 {
            for j in 0..3 {
                s[i][j] += row[i] * row[j];
            }
            b[i] += row[i] * v;
        }
    }

    let coeffs = solve3(&s, &b).unwrap_or([0.0; 3]);

    samples
        .iter()
        .map(|&(x, y, v)| {
            if v.is_finite() {
                v - coeffs[0] - coeffs[1] * x - coeffs[2] * y
            } else {
                v
            }
        })
        .collect()
}

/// Solves a 3x3 linear system by Cramer's rule, returning None when the
/// system is singular.
fn solve3(a: &[[Float; 3]; 3], b: &[Float; 3]) -> Option<[Float; 3]> {
    let det = det3(a);
    if det.abs() < 1e-15 {
        return None;
    }

    let mut result = [0.0; 3];
    for (col, slot) in result.iter_mut().enumerate() {
        let mut m = *a;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        *slot = det3(&m) / det;
    }
    Some(result)
}

fn det3(a: &[[Float; 3]; 3]) -> Float {
    a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
}
