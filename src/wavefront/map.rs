//! Wavefront-map assembly.
//!
//! The orchestrator samples the pupil on a square grid in center-out BFS
//! order, carrying origin-continuity hints between neighboring cells,
//! evaluates the OPD of every reachable sample against the reference ray,
//! fits an orthonormal Zernike model, and derives statistics. Sampling is
//! single-threaded and cooperative: progress, cancellation, and yield hooks
//! are observed at documented checkpoints.
use std::collections::HashMap;

use anyhow::{Result, anyhow};
use ndarray::Array2;
use serde::Serialize;

use crate::core::{Float, MM_TO_UM, math::vec3::Vec3};
use crate::specs::fields::Field;
use crate::trace::Ray;
use crate::wavefront::{
    DisplayMode, GridPattern, OpdMode, PupilMode, ReferenceSurface, WavefrontCalculator,
    diagnostics::{CancelToken, Cancelled, FailureKind},
    marginal_ray::MarginalRay,
    reference::ReferenceRay,
    stats::{MapStatistics, WavefrontReport, plane_fit_removed, statistics},
    zernike::{LOW_ORDER_REMOVAL, ZernikeFit, ZernikeOptions},
};

/// Cancellation is observed every this many samples.
const CANCEL_CHECK_INTERVAL: usize = 256;
/// At most this many progress emissions during the sampling phase.
const MAX_PROGRESS_POINTS: usize = 100;
/// Rendered maps mask samples above this pupil radius.
const DISPLAY_TRIM_DEFAULT: Float = 0.995;
/// Reference-sphere corrections larger than this fall back to a plane-wave
/// reference, in mm.
const HUGE_CORRECTION_MM: Float = 10.0;

/// Phases reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapPhase {
    Reference,
    Sampling,
    Fitting,
    Rendering,
    Done,
}

/// A progress report emitted at phase boundaries and sampling milestones.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MapProgress {
    pub phase: MapPhase,
    pub completed: usize,
    pub total: usize,
}

/// Options of a wavefront-map calculation.
///
/// The yield hook is called at documented checkpoints so that a host
/// scheduler can keep an interactive UI responsive; the orchestrator itself
/// never suspends.
#[derive(Default)]
pub struct MapOptions {
    pub opd_mode: OpdMode,
    pub display_mode: DisplayMode,
    /// Pupil coordinates span [-pupil_range, pupil_range].
    pub pupil_range: Option<Float>,
    pub zernike: ZernikeOptions,
    pub render_from_zernike: bool,
    pub record_rays: bool,
    /// Overrides the mm-per-unit-pupil scale of entrance-mode sampling.
    /// Defaults to the designed stop radius, never the effective entrance
    /// radius.
    pub entrance_pupil_scale: Option<Float>,
    /// Pins the infinite pupil mode, disabling all auto-switching.
    pub forced_pupil_mode: Option<PupilMode>,
    pub cancel: Option<CancelToken>,
    pub progress: Option<Box<dyn FnMut(MapProgress)>>,
    pub yield_hook: Option<Box<dyn FnMut()>>,
}

/// Everything derived from one wavefront-map calculation.
#[derive(Debug, Clone, Serialize)]
pub struct WavefrontMap {
    pub grid_size: usize,
    pub pattern: GridPattern,
    pub pupil_x: Array2<Float>,
    pub pupil_y: Array2<Float>,
    /// Physically reachable cells. Render trims never clear this mask.
    pub valid_mask: Array2<bool>,
    pub opd_um: Array2<Float>,
    pub opd_waves: Array2<Float>,
    /// The appended exact-center sample for even grid sizes.
    pub exact_center_opd_um: Option<Float>,
    pub zernike: Option<ZernikeFit>,
    pub report: WavefrontReport,
    pub metadata: MapMetadata,
    /// Launch rays of the valid cells, when requested.
    #[serde(skip)]
    pub rays: Option<Vec<((usize, usize), Ray)>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapMetadata {
    pub pupil_mode: PupilMode,
    pub opd_mode: OpdMode,
    pub display_mode: DisplayMode,
    pub reference: ReferenceSurface,
    pub wavelength_um: Float,
    pub stop_semi_diameter_mm: Float,
    pub entrance_effective_radius_mm: Option<Float>,
    pub pupil_range: Float,
    /// The sampling pass was restarted after a pupil-mode switch.
    pub restarted: bool,
    pub relaxed_reference_tolerance: bool,
    pub invalid_histogram: HashMap<FailureKind, usize>,
    pub termination_diagnosis: Option<String>,
    pub rendered_from_zernike: bool,
    pub display_trim: Float,
}

/// Center-out breadth-first traversal of a square grid.
///
/// Expansion is 4-neighbor from the central cells, with a deterministic
/// `iy * g + ix` tiebreak inside each ring so that identical inputs always
/// sample in the same order.
fn bfs_order(g: usize) -> Vec<(usize, usize)> {
    let centers: Vec<usize> = if g % 2 == 0 {
        vec![g / 2 - 1, g / 2]
    } else {
        vec![(g - 1) / 2]
    };

    let mut visited = vec![false; g * g];
    let mut order = Vec::with_capacity(g * g);
    let mut layer: Vec<(usize, usize)> = centers
        .iter()
        .flat_map(|&iy| centers.iter().map(move |&ix| (ix, iy)))
        .collect();
    layer.sort_by_key(|&(ix, iy)| iy * g + ix);
    for &(ix, iy) in &layer {
        visited[iy * g + ix] = true;
    }

    while !layer.is_empty() {
        order.extend(layer.iter().copied());
        let mut next = Vec::new();
        for &(ix, iy) in &layer {
            let neighbors = [
                (ix.wrapping_sub(1), iy),
                (ix + 1, iy),
                (ix, iy.wrapping_sub(1)),
                (ix, iy + 1),
            ];
            for (nx, ny) in neighbors {
                if nx < g && ny < g && !visited[ny * g + nx] {
                    visited[ny * g + nx] = true;
                    next.push((nx, ny));
                }
            }
        }
        next.sort_by_key(|&(ix, iy)| iy * g + ix);
        layer = next;
    }

    order
}

impl WavefrontCalculator {
    /// Computes the OPD of a single pupil sample, in µm. NaN on any failure.
    ///
    /// The chief sample (0, 0) short-circuits to exactly 0 without
    /// re-tracing once the reference is established.
    pub fn calculate_opd(&self, px: Float, py: Float, field: &Field, mode: OpdMode) -> Float {
        if !px.is_finite() || !py.is_finite() {
            return Float::NAN;
        }
        if px * px + py * py > 1.0 {
            return Float::NAN;
        }

        let key = field.key();
        let reference = match self.current_reference(&key) {
            Some(r) => r,
            None => match self.establish_reference(field, self.forced_mode(None)) {
                Ok(r) => r,
                Err(_) => return Float::NAN,
            },
        };

        if px == 0.0 && py == 0.0 {
            return 0.0;
        }

        match self.solve_with_retry(px, py, field, Vec::new(), false) {
            Ok(solved) => self.opd_um(&solved, &reference, mode, field).0,
            Err(_) => Float::NAN,
        }
    }

    /// The OPD of a solved sample against the reference, in µm, together
    /// with the reference surface actually used.
    fn opd_um(
        &self,
        solved: &MarginalRay,
        reference: &ReferenceRay,
        mode: OpdMode,
        field: &Field,
    ) -> (Float, ReferenceSurface) {
        let infinite = self.field_is_infinite(field);
        let opl = self.path_opl_um(&solved.path, infinite);
        if !opl.is_finite() {
            return (Float::NAN, ReferenceSurface::PlaneWave { fell_back: false });
        }
        let simple = opl - reference.opl_um;

        match mode {
            OpdMode::Simple => (simple, ReferenceSurface::PlaneWave { fell_back: false }),
            OpdMode::ReferenceSphere => match self.reference_sphere(reference) {
                ReferenceSurface::Sphere { radius_mm } => {
                    let points = solved.path.points();
                    let center = reference
                        .path
                        .points()
                        .last()
                        .copied()
                        .unwrap_or(Vec3::zero());
                    let pre_eval = points[points.len() - 2];
                    let distance = (pre_eval - center).length();
                    let correction_mm = distance - radius_mm;

                    if correction_mm.abs() > HUGE_CORRECTION_MM {
                        // A huge geometric correction: keep the usable
                        // plane-wave difference and record the fallback.
                        (simple, ReferenceSurface::PlaneWave { fell_back: true })
                    } else {
                        let media = self.media();
                        let n_img = media
                            .segment_indices()
                            .last()
                            .copied()
                            .unwrap_or(1.0);
                        (
                            simple - n_img * correction_mm * MM_TO_UM,
                            ReferenceSurface::Sphere { radius_mm },
                        )
                    }
                }
                plane => (simple, plane),
            },
        }
    }

    /// The reference sphere through the chief-ray image point.
    ///
    /// Near-afocal references (a chief ray parallel to but displaced from
    /// the evaluation axis) fall back to a plane wave with an infinite
    /// radius reported through the fallback flag.
    fn reference_sphere(&self, reference: &ReferenceRay) -> ReferenceSurface {
        let points = reference.path.points();
        if points.len() < 2 {
            return ReferenceSurface::PlaneWave { fell_back: true };
        }
        let center = points[points.len() - 1];
        let pre_eval = points[points.len() - 2];
        let chord = center - pre_eval;
        let radius_mm = chord.length();
        if radius_mm == 0.0 {
            return ReferenceSurface::PlaneWave { fell_back: true };
        }

        let eval_surface = self
            .model()
            .surface_at_point(self.model().recorded_surfaces().len());
        if let Some(surface) = eval_surface {
            let (_, _, e_z) = surface.axes();
            let dir = chord.normalize();
            let parallel = dir.cross(e_z).length() < 1e-9;
            let lateral = (pre_eval - surface.origin()).cross(e_z).length();
            if parallel && lateral > 1e-6 {
                return ReferenceSurface::PlaneWave { fell_back: true };
            }
        }

        ReferenceSurface::Sphere { radius_mm }
    }

    /// Generates a complete wavefront map for a field.
    pub fn generate_wavefront_map(
        &self,
        field: &Field,
        grid_size: usize,
        pattern: GridPattern,
        mut options: MapOptions,
    ) -> Result<WavefrontMap> {
        field.validate()?;
        if grid_size < 2 {
            return Err(anyhow!("The sampling grid must be at least 2 x 2."));
        }

        let g = grid_size;
        let total = g * g;
        let pupil_range = options.pupil_range.unwrap_or(1.0);
        if !pupil_range.is_finite() || pupil_range <= 0.0 {
            return Err(anyhow!("The pupil range must be a positive number."));
        }

        let forced = self.forced_mode(options.forced_pupil_mode);
        let infinite = self.field_is_infinite(field);
        self.set_entrance_scale_override(options.entrance_pupil_scale);

        // Fresh maps start from stop mode unless the mode is pinned.
        match forced {
            Some(mode) => self.set_pupil_mode(mode),
            None => self.set_pupil_mode(PupilMode::Stop),
        }

        let order = bfs_order(g);
        let coord = |i: usize| -> Float {
            pupil_range * (2.0 * i as Float / (g - 1) as Float - 1.0)
        };
        let progress_stride = usize::max(1, total / MAX_PROGRESS_POINTS);
        let yield_interval = usize::max(32, g);

        let mut restarted = false;
        let mut pass = 0;
        let max_passes = if forced.is_some() || !infinite { 1 } else { 2 };

        let reference;
        let opd_um;
        let valid_mask;
        let histogram;
        let rays;
        let reference_surface;
        'pass: loop {
            pass += 1;
            emit_progress(&mut options.progress, MapPhase::Reference, 0, total);
            check_cancel(&options.cancel)?;

            let mode_before = self.pupil_mode();
            let pass_reference = self.establish_reference(field, forced)?;
            if self.pupil_mode() != mode_before {
                // The reference ladder switched the sampling mode; this pass
                // already runs in the new mode.
                restarted = true;
            }

            let mut pass_opd = Array2::<Float>::from_elem((g, g), Float::NAN);
            let mut pass_mask = Array2::<bool>::from_elem((g, g), false);
            let mut pass_histogram: HashMap<FailureKind, usize> = HashMap::new();
            let mut pass_rays: Vec<((usize, usize), Ray)> = Vec::new();
            let mut hints: Vec<Option<Vec3>> = vec![None; total];
            let mut n_valid = 0usize;
            let mut reference_surface_used = match options.opd_mode {
                OpdMode::Simple => ReferenceSurface::PlaneWave { fell_back: false },
                OpdMode::ReferenceSphere => self.reference_sphere(&pass_reference),
            };

            emit_progress(&mut options.progress, MapPhase::Sampling, 0, total);

            for (sample_idx, &(ix, iy)) in order.iter().enumerate() {
                if sample_idx % CANCEL_CHECK_INTERVAL == 0 {
                    check_cancel(&options.cancel)?;
                }
                if sample_idx % yield_interval == 0 {
                    if let Some(hook) = options.yield_hook.as_mut() {
                        hook();
                    }
                }
                if sample_idx % progress_stride == 0 {
                    emit_progress(
                        &mut options.progress,
                        MapPhase::Sampling,
                        sample_idx,
                        total,
                    );
                }

                let px = coord(ix);
                let py = coord(iy);
                let rho = (px * px + py * py).sqrt();

                if matches!(pattern, GridPattern::Circular) && rho > pupil_range + 1e-12 {
                    continue;
                }

                if px == 0.0 && py == 0.0 {
                    // The chief sample is the reference itself.
                    pass_opd[[iy, ix]] = 0.0;
                    pass_mask[[iy, ix]] = true;
                    n_valid += 1;
                    if options.record_rays {
                        pass_rays.push(((ix, iy), pass_reference.ray));
                    }
                    continue;
                }

                let cell_hints = neighbor_hints(&hints, g, ix, iy);
                match self.solve_with_retry(px, py, field, cell_hints, false) {
                    Ok(solved) => {
                        let (opd, surface) =
                            self.opd_um(&solved, &pass_reference, options.opd_mode, field);
                        if let ReferenceSurface::PlaneWave { fell_back: true } = surface {
                            reference_surface_used = surface;
                        }
                        if opd.is_finite() {
                            pass_opd[[iy, ix]] = opd;
                            pass_mask[[iy, ix]] = true;
                            n_valid += 1;
                            hints[iy * g + ix] = solved.origin_delta;
                            if options.record_rays {
                                pass_rays.push(((ix, iy), solved.ray));
                            }
                        } else {
                            *pass_histogram.entry(FailureKind::Numeric).or_insert(0) += 1;
                        }
                    }
                    Err(failure) => {
                        *pass_histogram.entry(failure.kind()).or_insert(0) += 1;
                    }
                }
            }

            if n_valid == 0 {
                if infinite
                    && self.pupil_mode() == PupilMode::Stop
                    && forced.is_none()
                    && pass < max_passes
                {
                    // No sample anywhere: retry the whole map in entrance
                    // mode.
                    restarted = true;
                    self.set_pupil_mode(PupilMode::Entrance);
                    continue 'pass;
                }
                return Err(anyhow!(
                    "no valid samples: the full grid yielded zero finite OPD values"
                ));
            }

            reference = pass_reference;
            opd_um = pass_opd;
            valid_mask = pass_mask;
            histogram = pass_histogram;
            rays = pass_rays;
            reference_surface = reference_surface_used;
            break;
        }

        check_cancel(&options.cancel)?;
        emit_progress(&mut options.progress, MapPhase::Fitting, total, total);

        // Pupil coordinate arrays.
        let mut pupil_x = Array2::<Float>::zeros((g, g));
        let mut pupil_y = Array2::<Float>::zeros((g, g));
        for iy in 0..g {
            for ix in 0..g {
                pupil_x[[iy, ix]] = coord(ix);
                pupil_y[[iy, ix]] = coord(iy);
            }
        }

        // The appended exact-center sample for even grids.
        let exact_center_opd_um = (g % 2 == 0).then_some(0.0);

        // Zernike fit over the valid unit-pupil samples.
        let mut fit_samples: Vec<(Float, Float, Float)> = Vec::new();
        for iy in 0..g {
            for ix in 0..g {
                if valid_mask[[iy, ix]] {
                    fit_samples.push((pupil_x[[iy, ix]], pupil_y[[iy, ix]], opd_um[[iy, ix]]));
                }
            }
        }
        if let Some(center) = exact_center_opd_um {
            fit_samples.push((0.0, 0.0, center));
        }

        let normalization_radius = match self.pupil_mode() {
            PupilMode::Stop => self.model().stop_semi_diameter(),
            PupilMode::Entrance => self
                .entrance_config(field, false)
                .map(|c| c.r_scale)
                .unwrap_or_else(|| self.model().stop_semi_diameter()),
        };
        let fit = Some(crate::wavefront::zernike::fit(
            &fit_samples,
            normalization_radius,
            &options.zernike,
        ));
        let zernike_skipped = fit.as_ref().map(|f| f.skipped).unwrap_or(true);

        // Optional re-render of the map from the fitted model.
        let mut opd_um = opd_um;
        let mut rendered = false;
        if options.render_from_zernike {
            if let Some(fit) = fit.as_ref().filter(|f| !f.skipped) {
                emit_progress(&mut options.progress, MapPhase::Rendering, total, total);
                for iy in 0..g {
                    for ix in 0..g {
                        let px = pupil_x[[iy, ix]];
                        let py = pupil_y[[iy, ix]];
                        let rho = (px * px + py * py).sqrt();
                        if !valid_mask[[iy, ix]] || rho > DISPLAY_TRIM_DEFAULT {
                            // NaN outside the validity mask preserves the
                            // physical vignetting in rendered maps.
                            opd_um[[iy, ix]] = Float::NAN;
                        } else {
                            opd_um[[iy, ix]] = fit.evaluate(px, py);
                        }
                    }
                }
                rendered = true;
            }
        }

        let opd_waves = opd_um.mapv(|v| v / self.wavelength_um());

        // Statistics layers.
        let raw = statistics(opd_um.iter().copied(), false);
        let primary = statistics(opd_um.iter().copied(), true);
        let aberration = fit.as_ref().filter(|f| !f.skipped).map(|f| {
            statistics(
                (0..g * g).map(|i| {
                    let (iy, ix) = (i / g, i % g);
                    if valid_mask[[iy, ix]] {
                        opd_um[[iy, ix]]
                            - f.evaluate_subset(&LOW_ORDER_REMOVAL, pupil_x[[iy, ix]], pupil_y[[iy, ix]])
                    } else {
                        Float::NAN
                    }
                }),
                false,
            )
        });
        let display = display_statistics(&pupil_x, &pupil_y, &opd_um, options.display_mode);

        let report = WavefrontReport {
            primary,
            raw,
            aberration,
            display,
            pupil_mode: self.pupil_mode(),
            opd_mode: options.opd_mode,
            zernike_skipped,
        };

        let termination_diagnosis = self
            .last_ray_calculation()
            .and_then(|r| r.failure)
            .map(|f| f.to_string());

        let metadata = MapMetadata {
            pupil_mode: self.pupil_mode(),
            opd_mode: options.opd_mode,
            display_mode: options.display_mode,
            reference: reference_surface,
            wavelength_um: self.wavelength_um(),
            stop_semi_diameter_mm: self.model().stop_semi_diameter(),
            entrance_effective_radius_mm: self.entrance_effective_radius(field),
            pupil_range,
            restarted,
            relaxed_reference_tolerance: reference.relaxed,
            invalid_histogram: histogram,
            termination_diagnosis,
            rendered_from_zernike: rendered,
            display_trim: DISPLAY_TRIM_DEFAULT,
        };

        emit_progress(&mut options.progress, MapPhase::Done, total, total);

        Ok(WavefrontMap {
            grid_size: g,
            pattern,
            pupil_x,
            pupil_y,
            valid_mask,
            opd_um,
            opd_waves,
            exact_center_opd_um,
            zernike: fit,
            report,
            metadata,
            rays: options.record_rays.then_some(rays),
        })
    }
}

fn display_statistics(
    pupil_x: &Array2<Float>,
    pupil_y: &Array2<Float>,
    opd_um: &Array2<Float>,
    mode: DisplayMode,
) -> MapStatistics {
    match mode {
        DisplayMode::Default => statistics(opd_um.iter().copied(), true),
        DisplayMode::PistonTiltRemoved => {
            let samples: Vec<(Float, Float, Float)> = pupil_x
                .iter()
                .zip(pupil_y.iter())
                .zip(opd_um.iter())
                .map(|((x, y), v)| (*x, *y, *v))
                .collect();
            let residuals = plane_fit_removed(&samples);
            statistics(residuals.into_iter(), false)
        }
    }
}

fn neighbor_hints(hints: &[Option<Vec3>], g: usize, ix: usize, iy: usize) -> Vec<Vec3> {
    let mut out = Vec::with_capacity(4);
    let neighbors = [
        (ix.wrapping_sub(1), iy),
        (ix + 1, iy),
        (ix, iy.wrapping_sub(1)),
        (ix, iy + 1),
    ];
    for (nx, ny) in neighbors {
        if nx < g && ny < g {
            if let Some(delta) = hints[ny * g + nx] {
                out.push(delta);
            }
        }
    }
    out
}

fn emit_progress(
    progress: &mut Option<Box<dyn FnMut(MapProgress)>>,
    phase: MapPhase,
    completed: usize,
    total: usize,
) {
    if let Some(cb) = progress.as_mut() {
        cb(MapProgress {
            phase,
            completed,
            total,
        });
    }
}

fn check_cancel(cancel: &Option<CancelToken>) -> Result<()> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(Cancelled {
                reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
            }
            .into());
        }
    }
    Ok(())
}
