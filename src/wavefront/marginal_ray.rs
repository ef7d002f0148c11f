//! Stop-hit marginal-ray solver.
//!
//! Given a normalized pupil coordinate, finds a ray whose trace crosses the
//! stop plane at the corresponding stop-local target. Finite fields adjust
//! an aim point from the object; infinite fields carry a fixed direction and
//! adjust the launch origin. The solve proceeds through the states seeded ->
//! stop search -> polish -> accept/miss -> eval trace; a switch of the pupil
//! sampling mode is a caller-level restart, never an internal transition.
use crate::core::{Float, math::vec3::Vec3};
use crate::specs::fields::Field;
use crate::trace::{Ray, RayPath};
use crate::wavefront::{PupilMode, WavefrontCalculator, diagnostics::RayFailure};

/// Tight convergence tolerance on the stop-local residual, in mm.
const TOL_SLOW: Float = 0.03;
const TOL_FAST_INFINITE: Float = 0.08;
const TOL_FAST_FINITE: Float = 0.06;

const GAIN_SLOW: Float = 0.70;
const GAIN_FAST: Float = 0.65;

const ITERS_FINITE_SLOW: usize = 8;
const ITERS_FINITE_FAST: usize = 5;
// The infinite path needs a larger budget than the finite one: the update
// step is clamped in absolute millimeters, and an unhinted seed can start
// several clamp-lengths away from the target.
const ITERS_INFINITE_SLOW: usize = 24;
const ITERS_INFINITE_FAST: usize = 8;

/// Base of the stop-miss rejection tolerance, in mm.
const MISS_BASE_SLOW: Float = 0.10;
const MISS_BASE_FAST: Float = 0.12;
const MISS_TOL_MIN: Float = 0.06;
const MISS_TOL_MAX: Float = 0.25;

/// Fast mode accepts early once the residual drops below this fraction of
/// the stop-miss tolerance.
const EARLY_ACCEPT_FRACTION: Float = 0.65;

/// Neighbor-continuity origin deltas are clamped to this length, in mm.
const HINT_CLAMP_MM: Float = 50.0;

/// Residual above which a near-rim finite solve falls back to the chief-ray
/// direction solver, in mm.
const RIM_FALLBACK_RESIDUAL_MM: Float = 0.3;

/// Tikhonov damping of the least-squares polish step.
const POLISH_LAMBDA: Float = 1e-3;
const POLISH_SCALES: [Float; 5] = [1.0, 0.7, 0.5, 0.3, 0.15];

/// Golden angle, used to spread multi-start offsets.
const GOLDEN_ANGLE: Float = 2.399963229728653;

/// Stop-local target fractions probed by the stop-center candidate search.
const CENTER_SEARCH_FRACTIONS: [Float; 6] = [0.0, 0.25, 0.5, 0.75, 0.9, 1.0];

/// Options of a single marginal-ray solve.
#[derive(Debug, Clone, Default)]
pub(crate) struct SolveOptions {
    pub fast: bool,
    /// The solve at the pupil origin that establishes the reference ray.
    pub is_reference: bool,
    /// Doubles the stop-miss tolerance; recorded for diagnostics.
    pub relax_stop_miss_tol: bool,
    /// Neighbor-continuity origin deltas, relative to the geometric origin.
    pub hints: Vec<Vec3>,
}

impl SolveOptions {
    pub fn fast() -> Self {
        Self {
            fast: true,
            ..Self::default()
        }
    }
}

/// A successfully solved marginal ray.
#[derive(Debug, Clone)]
pub(crate) struct MarginalRay {
    pub ray: Ray,
    /// The full path through every recorded surface.
    pub path: RayPath,
    /// Residual distance from the requested stop-local target, in mm.
    pub stop_error_mm: Float,
    /// Solved origin minus the geometric origin; the continuity hint passed
    /// to neighboring cells. Infinite stop-mode solves only.
    pub origin_delta: Option<Vec3>,
}

impl WavefrontCalculator {
    /// Solves a marginal ray for a pupil coordinate, dispatching on the
    /// field type and the pupil sampling mode.
    pub(crate) fn generate_marginal_ray(
        &self,
        px: Float,
        py: Float,
        field: &Field,
        opts: &SolveOptions,
    ) -> Result<MarginalRay, RayFailure> {
        let result = if self.field_is_infinite(field) {
            match self.pupil_mode() {
                PupilMode::Stop => self.solve_marginal_infinite(px, py, field, opts),
                PupilMode::Entrance => self.solve_marginal_entrance(px, py, field, opts),
            }
        } else {
            self.solve_marginal_finite(px, py, field, opts)
        };

        match &result {
            Ok(solved) => self.record_last(crate::wavefront::diagnostics::LastRayCalculation {
                pupil: (px, py),
                pupil_mode: self.pupil_mode(),
                ray: Some(solved.ray),
                success: true,
                failure: None,
                stop_error_mm: Some(solved.stop_error_mm),
            }),
            Err(failure) => self.record_failure(px, py, failure.clone()),
        }

        result
    }

    /// Fast solve with a single slow retry for unreachable stops.
    ///
    /// Stop misses are not retried: empirically a slow retry does not
    /// salvage them.
    pub(crate) fn solve_with_retry(
        &self,
        px: Float,
        py: Float,
        field: &Field,
        hints: Vec<Vec3>,
        is_reference: bool,
    ) -> Result<MarginalRay, RayFailure> {
        let fast = SolveOptions {
            fast: true,
            is_reference,
            hints: hints.clone(),
            ..SolveOptions::default()
        };
        match self.generate_marginal_ray(px, py, field, &fast) {
            Err(RayFailure::StopUnreachable) => {
                let slow = SolveOptions {
                    fast: false,
                    is_reference,
                    hints,
                    ..SolveOptions::default()
                };
                self.generate_marginal_ray(px, py, field, &slow)
            }
            other => other,
        }
    }

    /// The stop-miss rejection tolerance for a sample.
    pub(crate) fn stop_miss_tol(&self, rho: Float, field: &Field, opts: &SolveOptions) -> Float {
        let base = if opts.fast { MISS_BASE_FAST } else { MISS_BASE_SLOW };
        let rim = if rho >= 0.9 { 0.03 } else { 0.0 };
        let angle = match field {
            Field::Angle { .. } => {
                let alpha = field.max_abs();
                if alpha >= 10.0 {
                    0.05
                } else if alpha >= 2.0 {
                    0.02
                } else {
                    0.0
                }
            }
            Field::Height { .. } => 0.0,
        };
        let tol = (base + rim + angle).clamp(MISS_TOL_MIN, MISS_TOL_MAX);
        if opts.relax_stop_miss_tol { 2.0 * tol } else { tol }
    }

    /// Finite-field path: iterate an aim point from the object toward the
    /// stop-local target.
    fn solve_marginal_finite(
        &self,
        px: Float,
        py: Float,
        field: &Field,
        opts: &SolveOptions,
    ) -> Result<MarginalRay, RayFailure> {
        let obj = self.object_point(field).ok_or(RayFailure::Numeric)?;
        let r_stop = self.model().stop_semi_diameter();
        let (e_x, e_y, _) = self.stop_axes();
        let rho = (px * px + py * py).sqrt();

        let center = self.model().stop_surface().origin();
        let target = center + e_x * (px * r_stop) + e_y * (py * r_stop);

        let tol = if opts.fast { TOL_FAST_FINITE } else { TOL_SLOW };
        let gain = if opts.fast { GAIN_FAST } else { GAIN_SLOW };
        let max_iters = if opts.fast {
            ITERS_FINITE_FAST
        } else {
            ITERS_FINITE_SLOW
        };
        let step_clamp = Float::max(0.5, 0.12 * r_stop);

        let mut aim = target;
        let mut ray = Ray::aimed_at(obj, aim);
        let mut err = Float::INFINITY;

        for _ in 0..max_iters {
            ray = Ray::aimed_at(obj, aim);
            let hit = self
                .stop_intersection(&ray)
                .ok_or(RayFailure::StopUnreachable)?;
            let (err_x, err_y) = self.stop_local_error(hit, target);
            err = (err_x * err_x + err_y * err_y).sqrt();
            if err <= tol {
                break;
            }
            let mut step = (e_x * err_x + e_y * err_y) * gain;
            let len = step.length();
            if len > step_clamp {
                step = step * (step_clamp / len);
            }
            aim -= step;
        }

        // Near the rim a stubborn residual falls back to the direction
        // solver, aimed at the corrected target point.
        if err > RIM_FALLBACK_RESIDUAL_MM && (0.9..=1.01).contains(&rho) {
            if let Some(dir) = self.solve_finite_direction(obj, aim) {
                if let Ok(candidate) = Ray::new(obj, dir) {
                    if let Some(hit) = self.stop_intersection(&candidate) {
                        let (err_x, err_y) = self.stop_local_error(hit, target);
                        let fallback_err = (err_x * err_x + err_y * err_y).sqrt();
                        if fallback_err < err {
                            ray = candidate;
                            err = fallback_err;
                        }
                    }
                }
            }
        }

        let miss_tol = self.stop_miss_tol(rho, field, opts);
        if rho <= 1.0 && err > miss_tol {
            return Err(RayFailure::StopMiss {
                err_mm: err,
                tol_mm: miss_tol,
            });
        }

        let path = self.trace_to_eval(&ray);
        if !self.path_is_complete(&path) {
            return Err(eval_unreachable(&path));
        }

        Ok(MarginalRay {
            ray,
            path,
            stop_error_mm: err,
            origin_delta: None,
        })
    }

    /// Infinite-field path: the direction is fixed by the field; iterate the
    /// launch origin on a back plane toward the stop-local target.
    fn solve_marginal_infinite(
        &self,
        px: Float,
        py: Float,
        field: &Field,
        opts: &SolveOptions,
    ) -> Result<MarginalRay, RayFailure> {
        let key = field.key();
        let r_stop = self.model().stop_semi_diameter();
        let (e_x, e_y, _) = self.stop_axes();
        let rho = (px * px + py * py).sqrt();
        let dir = self.field_direction(field);

        let tol = if opts.fast { TOL_FAST_INFINITE } else { TOL_SLOW };
        let gain = if opts.fast { GAIN_FAST } else { GAIN_SLOW };
        let max_iters = if opts.fast {
            ITERS_INFINITE_FAST
        } else {
            ITERS_INFINITE_SLOW
        };
        let miss_tol = self.stop_miss_tol(rho, field, opts);
        let step_clamp = Float::max(0.5, r_stop * if rho >= 0.9 { 0.18 } else { 0.12 });

        let mut searched_center = false;

        // A successful stop-center search restarts the solve against the
        // corrected target exactly once.
        'restart: loop {
            let center = self.stop_center_for(&key);
            let target = center + e_x * (px * r_stop) + e_y * (py * r_stop);
            let o_geo = self.back_projected_origin(dir, target, 0.0);

            let mut origin = self.apply_hints(o_geo, dir, target, &opts.hints, opts.fast);

            let mut reseeded = false;
            let mut had_hit = false;
            let mut best: Option<(Vec3, Float)> = None;

            let mut it = 0;
            while it < max_iters {
                it += 1;
                let ray = Ray::new(origin, dir).map_err(|_| RayFailure::Numeric)?;
                match self.stop_intersection(&ray) {
                    None => {
                        if opts.fast && !had_hit && !reseeded {
                            // Reseed from the geometric guess with a boosted
                            // back distance.
                            reseeded = true;
                            let b = target.z() - o_geo.z();
                            let boost = Float::min(200.0, Float::max(40.0, 0.5 * b));
                            origin = self.back_projected_origin(dir, target, boost);
                            continue;
                        }
                        if opts.is_reference
                            && !searched_center
                            && !self.stop_center_overrides.borrow().contains_key(&key)
                        {
                            searched_center = true;
                            if self.search_stop_center(&key, dir, r_stop) {
                                continue 'restart;
                            }
                        }
                        if best.is_some() {
                            break;
                        }
                        return Err(RayFailure::StopUnreachable);
                    }
                    Some(hit) => {
                        had_hit = true;
                        let (err_x, err_y) = self.stop_local_error(hit, target);
                        let err = (err_x * err_x + err_y * err_y).sqrt();
                        if best.is_none_or(|(_, b)| err < b) {
                            best = Some((origin, err));
                        }
                        if err <= tol {
                            break;
                        }
                        if opts.fast && err <= Float::max(tol, EARLY_ACCEPT_FRACTION * miss_tol) {
                            break;
                        }
                        let mut step = (e_x * err_x + e_y * err_y) * gain;
                        let len = step.length();
                        if len > step_clamp {
                            step = step * (step_clamp / len);
                        }
                        origin -= step;
                    }
                }
            }

            let (mut origin, mut err) = best.ok_or(RayFailure::StopUnreachable)?;

            // Least-squares polish near the rim in slow mode.
            if !opts.fast && rho >= 0.85 && err > 0.06 {
                let delta = Float::max(0.3, 0.02 * r_stop);
                for _ in 0..3 {
                    if err <= tol {
                        break;
                    }
                    match self.polish_step(origin, dir, target, delta, err) {
                        Some((better_origin, better_err)) => {
                            origin = better_origin;
                            err = better_err;
                        }
                        None => break,
                    }
                }
            }

            // Near-threshold polish: shrink the difference step and, if the
            // residual still straddles the tolerance, multi-start locally.
            if rho >= 0.75 && err > miss_tol / 2.0 && err < miss_tol {
                let mut delta = Float::max(0.3, 0.02 * r_stop);
                for _ in 0..12 {
                    if err <= tol {
                        break;
                    }
                    match self.polish_step(origin, dir, target, delta, err) {
                        Some((better_origin, better_err)) => {
                            origin = better_origin;
                            err = better_err;
                        }
                        None => break,
                    }
                    delta = Float::max(0.03, delta * 0.85);
                }

                if err > miss_tol / 2.0 && err < miss_tol {
                    let radius = Float::min(2.0, Float::max(0.6, 0.035 * r_stop));
                    for k in 0..8 {
                        let theta = k as Float * GOLDEN_ANGLE;
                        let offset = e_x * (radius * theta.cos()) + e_y * (radius * theta.sin());
                        if let Some(candidate_err) =
                            self.stop_error_at(origin + offset, dir, target)
                        {
                            if candidate_err < err {
                                origin = origin + offset;
                                err = candidate_err;
                            }
                        }
                    }
                }
            }

            if rho <= 1.0 && err > miss_tol {
                return Err(RayFailure::StopMiss {
                    err_mm: err,
                    tol_mm: miss_tol,
                });
            }

            let ray = Ray::new(origin, dir).map_err(|_| RayFailure::Numeric)?;
            let path = self.trace_to_eval(&ray);
            if !self.path_is_complete(&path) {
                return Err(eval_unreachable(&path));
            }

            return Ok(MarginalRay {
                ray,
                path,
                stop_error_mm: err,
                origin_delta: Some(origin - o_geo),
            });
        }
    }

    /// Chooses the starting origin from neighbor-continuity hints.
    ///
    /// Fast mode takes the first hint; slow mode evaluates every hint plus
    /// the geometric origin and keeps the smallest stop-local error.
    fn apply_hints(
        &self,
        o_geo: Vec3,
        dir: Vec3,
        target: Vec3,
        hints: &[Vec3],
        fast: bool,
    ) -> Vec3 {
        if hints.is_empty() {
            return o_geo;
        }

        let clamp = |delta: Vec3| -> Vec3 {
            let len = delta.length();
            if len > HINT_CLAMP_MM {
                delta * (HINT_CLAMP_MM / len)
            } else {
                delta
            }
        };

        if fast {
            return o_geo + clamp(hints[0]);
        }

        let mut best = o_geo;
        let mut best_err = self
            .stop_error_at(o_geo, dir, target)
            .unwrap_or(Float::INFINITY);
        for hint in hints.iter() {
            let candidate = o_geo + clamp(*hint);
            if let Some(err) = self.stop_error_at(candidate, dir, target) {
                if err < best_err {
                    best = candidate;
                    best_err = err;
                }
            }
        }
        best
    }

    /// The stop-local residual of a trial origin, when its trace reaches the
    /// stop.
    fn stop_error_at(&self, origin: Vec3, dir: Vec3, target: Vec3) -> Option<Float> {
        let ray = Ray::new(origin, dir).ok()?;
        let hit = self.stop_intersection(&ray)?;
        let (err_x, err_y) = self.stop_local_error(hit, target);
        Some((err_x * err_x + err_y * err_y).sqrt())
    }

    /// One damped least-squares step on the stop-local residual with a
    /// backtracking line search. Returns the improved origin, or None when
    /// no scale improves the residual.
    fn polish_step(
        &self,
        origin: Vec3,
        dir: Vec3,
        target: Vec3,
        delta: Float,
        current_err: Float,
    ) -> Option<(Vec3, Float)> {
        let (e_x, e_y, _) = self.stop_axes();

        let eval = |o: Vec3| -> Option<(Float, Float)> {
            let ray = Ray::new(o, dir).ok()?;
            let hit = self.stop_intersection(&ray)?;
            Some(self.stop_local_error(hit, target))
        };

        let f0 = eval(origin)?;

        // Central differences of the residual w.r.t. origin offsets along
        // the stop-local axes.
        let fxp = eval(origin + e_x * delta)?;
        let fxm = eval(origin - e_x * delta)?;
        let fyp = eval(origin + e_y * delta)?;
        let fym = eval(origin - e_y * delta)?;

        let j11 = (fxp.0 - fxm.0) / (2.0 * delta);
        let j21 = (fxp.1 - fxm.1) / (2.0 * delta);
        let j12 = (fyp.0 - fym.0) / (2.0 * delta);
        let j22 = (fyp.1 - fym.1) / (2.0 * delta);

        // Damped least squares: (J^T J + lambda I) d = J^T f.
        let a11 = j11 * j11 + j21 * j21 + POLISH_LAMBDA;
        let a12 = j11 * j12 + j21 * j22;
        let a22 = j12 * j12 + j22 * j22 + POLISH_LAMBDA;
        let b1 = j11 * f0.0 + j21 * f0.1;
        let b2 = j12 * f0.0 + j22 * f0.1;

        let det = a11 * a22 - a12 * a12;
        if det.abs() < 1e-15 {
            return None;
        }
        let d1 = (b1 * a22 - b2 * a12) / det;
        let d2 = (b2 * a11 - b1 * a12) / det;
        let full_step = e_x * d1 + e_y * d2;

        for scale in POLISH_SCALES {
            let candidate = origin - full_step * scale;
            if let Some(err) = self.stop_error_at(candidate, dir, target) {
                if err < current_err {
                    return Some((candidate, err));
                }
            }
        }
        None
    }

    /// Searches a sparse stop-local grid for a reachable stop point and
    /// installs the one closest to the center as this field's stop-center
    /// override. Returns true when an override was installed.
    fn search_stop_center(
        &self,
        key: &crate::specs::fields::FieldKey,
        dir: Vec3,
        r_stop: Float,
    ) -> bool {
        let stop_origin = self.model().stop_surface().origin();
        let (e_x, e_y, _) = self.stop_axes();

        let mut best: Option<(Vec3, Float)> = None;
        for fraction in CENTER_SEARCH_FRACTIONS {
            let all = [
                (fraction, 0.0),
                (-fraction, 0.0),
                (0.0, fraction),
                (0.0, -fraction),
            ];
            let offsets = if fraction == 0.0 { &all[..1] } else { &all[..] };
            for &(ox, oy) in offsets {
                let candidate = stop_origin + e_x * (ox * r_stop) + e_y * (oy * r_stop);
                if self.probe_stop_target(dir, candidate) {
                    let radius = (ox * ox + oy * oy).sqrt();
                    if best.is_none_or(|(_, b)| radius < b) {
                        best = Some((candidate, radius));
                    }
                }
            }
        }

        match best {
            Some((center, _)) => {
                tracing::debug!("installing stop-center override for vignetted field");
                self.stop_center_overrides.borrow_mut().insert(*key, center);
                true
            }
            None => false,
        }
    }

    /// Whether a short damped iteration can land a ray near a candidate stop
    /// point.
    fn probe_stop_target(&self, dir: Vec3, target: Vec3) -> bool {
        let (e_x, e_y, _) = self.stop_axes();
        let mut origin = self.back_projected_origin(dir, target, 0.0);

        for _ in 0..6 {
            let Ok(ray) = Ray::new(origin, dir) else {
                return false;
            };
            let Some(hit) = self.stop_intersection(&ray) else {
                return false;
            };
            let (err_x, err_y) = self.stop_local_error(hit, target);
            let err = (err_x * err_x + err_y * err_y).sqrt();
            if err <= MISS_BASE_SLOW {
                return true;
            }
            origin -= (e_x * err_x + e_y * err_y) * GAIN_SLOW;
        }
        false
    }
}

fn eval_unreachable(path: &RayPath) -> RayFailure {
    RayFailure::EvalUnreachable {
        surface_index: path.termination().map(|t| t.surface_index),
        surface_kind: path.termination().map(|t| t.surface_kind),
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};

    /// Stop in front of the lens: the stop-hit problem is nearly linear.
    fn stop_first_singlet() -> WavefrontCalculator {
        WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(Float::INFINITY),
                SurfaceSpec::stop(2.0, 2.0),
                SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(12.5, Float::INFINITY, 0.0, 46.6, MaterialSpec::Air),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap()
    }

    /// Stop buried behind the lens.
    fn stop_behind_singlet() -> WavefrontCalculator {
        WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(Float::INFINITY),
                SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(12.5, Float::INFINITY, 0.0, 23.3, MaterialSpec::Air),
                SurfaceSpec::stop(2.0, 23.3),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap()
    }

    /// Tiny lens far in front of a deep stop: heavily vignetted off axis.
    fn vignetting_system() -> WavefrontCalculator {
        WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(Float::INFINITY),
                SurfaceSpec::conic(5.0, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(5.0, Float::INFINITY, 0.0, 20.0, MaterialSpec::Air),
                SurfaceSpec::stop(4.0, 26.0),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap()
    }

    #[test]
    fn test_on_axis_center_sample() {
        let calc = stop_first_singlet();
        let solved = calc
            .generate_marginal_ray(0.0, 0.0, &Field::on_axis(), &SolveOptions::default())
            .unwrap();

        assert!(solved.stop_error_mm < 0.03);
        assert!(calc.path_is_complete(&solved.path));
    }

    #[test]
    fn test_rim_sample_hits_requested_target() {
        let calc = stop_first_singlet();
        let solved = calc
            .generate_marginal_ray(0.0, 1.0, &Field::on_axis(), &SolveOptions::default())
            .unwrap();

        // The stop sits in front of the lens, so the stop-local hit must be
        // at the requested 2.0 mm target height.
        let hit = calc.stop_intersection(&solved.ray).unwrap();
        assert_abs_diff_eq!(hit.y(), 2.0, epsilon = 0.05);
    }

    #[test]
    fn test_oblique_field_converges() {
        let calc = stop_behind_singlet();
        let field = Field::Angle { x: 0.0, y: 5.0 };
        let solved = calc
            .generate_marginal_ray(0.5, -0.5, &field, &SolveOptions::default())
            .unwrap();

        let miss_tol = calc.stop_miss_tol(0.7071, &field, &SolveOptions::default());
        assert!(solved.stop_error_mm <= miss_tol);
        assert!(solved.origin_delta.is_some());
    }

    #[test]
    fn test_fast_mode_accepts_earlier() {
        let calc = stop_behind_singlet();
        let field = Field::Angle { x: 0.0, y: 5.0 };

        // Fast mode is used with continuity hints from a neighboring solve,
        // the way the map orchestrator drives it.
        let neighbor = calc
            .generate_marginal_ray(0.25, 0.25, &field, &SolveOptions::default())
            .unwrap();
        let hints = vec![neighbor.origin_delta.unwrap()];

        let fast = calc
            .generate_marginal_ray(
                0.3,
                0.3,
                &field,
                &SolveOptions {
                    fast: true,
                    hints: hints.clone(),
                    ..SolveOptions::default()
                },
            )
            .unwrap();
        let slow = calc
            .generate_marginal_ray(
                0.3,
                0.3,
                &field,
                &SolveOptions {
                    hints,
                    ..SolveOptions::default()
                },
            )
            .unwrap();

        assert!(slow.stop_error_mm <= fast.stop_error_mm + 1e-9);
    }

    #[test]
    fn test_vignetted_sample_fails_with_reason() {
        let calc = vignetting_system();
        let field = Field::Angle { x: 0.0, y: 20.0 };

        let result = calc.generate_marginal_ray(0.0, 0.0, &field, &SolveOptions::fast());

        assert!(result.is_err());
        let record = calc.last_ray_calculation().unwrap();
        assert!(!record.success);
        assert!(record.failure.is_some());
    }

    #[test]
    fn test_stop_miss_tolerance_schedule() {
        let calc = stop_behind_singlet();
        let slow = SolveOptions::default();
        let fast = SolveOptions::fast();
        let wide = Field::Angle { x: 0.0, y: 15.0 };
        let narrow = Field::on_axis();

        // Base values.
        assert_abs_diff_eq!(calc.stop_miss_tol(0.5, &narrow, &slow), 0.10);
        assert_abs_diff_eq!(calc.stop_miss_tol(0.5, &narrow, &fast), 0.12);
        // Rim and angle contributions.
        assert_abs_diff_eq!(calc.stop_miss_tol(0.95, &narrow, &slow), 0.13);
        assert_abs_diff_eq!(calc.stop_miss_tol(0.5, &wide, &slow), 0.15);
        // Clamped at the top.
        assert_abs_diff_eq!(calc.stop_miss_tol(0.95, &wide, &fast), 0.20);

        let relaxed = SolveOptions {
            relax_stop_miss_tol: true,
            ..SolveOptions::default()
        };
        assert_abs_diff_eq!(calc.stop_miss_tol(0.5, &narrow, &relaxed), 0.20);
    }

    #[test]
    fn test_hints_seed_the_solve() {
        let calc = stop_behind_singlet();
        let field = Field::Angle { x: 0.0, y: 5.0 };

        // Solve once without hints and once seeded with the solved delta.
        let base = calc
            .generate_marginal_ray(0.5, 0.0, &field, &SolveOptions::default())
            .unwrap();
        let hint = base.origin_delta.unwrap();

        let seeded = calc
            .generate_marginal_ray(
                0.5,
                0.0,
                &field,
                &SolveOptions {
                    hints: vec![hint],
                    ..SolveOptions::default()
                },
            )
            .unwrap();

        assert!(seeded.stop_error_mm <= base.stop_error_mm + 1e-9);
    }

    #[test]
    fn test_finite_field_marginal() {
        let calc = WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(200.0),
                SurfaceSpec::stop(2.0, 2.0),
                SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(12.5, Float::INFINITY, 0.0, 60.0, MaterialSpec::Air),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap();
        let field = Field::Height { x: 0.0, y: 1.0 };

        let solved = calc
            .generate_marginal_ray(0.0, 0.8, &field, &SolveOptions::default())
            .unwrap();

        assert!(solved.stop_error_mm <= 0.03);
        assert!(solved.origin_delta.is_none());
        // The launch point is the object point.
        assert_abs_diff_eq!(solved.ray.pos().y(), 1.0);
        assert_abs_diff_eq!(solved.ray.pos().z(), -200.0);
    }
}
