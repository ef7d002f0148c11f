//! Best-effort entrance-pupil sampling.
//!
//! When stop-mode sampling declares the stop unreachable for an infinite
//! field, pupil coordinates are mapped onto a launch plane ahead of the
//! first physical surface instead. Rays are launched on that plane with the
//! field direction and no stop-hit gating; rays that fail to reach the
//! evaluation surface are simply masked out of the map.
use std::time::Instant;

use crate::core::{Float, math::vec3::Vec3};
use crate::specs::fields::Field;
use crate::trace::Ray;
use crate::wavefront::{
    WavefrontCalculator,
    diagnostics::RayFailure,
    marginal_ray::{MarginalRay, SolveOptions},
};

/// Wall-clock budget of the launch-center search, in milliseconds.
const SEARCH_BUDGET_FAST_MS: u128 = 80;
const SEARCH_BUDGET_SLOW_MS: u128 = 180;

/// Spiral samples probed per candidate launch plane.
const SPIRAL_SAMPLES: usize = 200;

const BISECT_ITERS_FAST: usize = 8;
const BISECT_ITERS_SLOW: usize = 12;

const GOLDEN_ANGLE: Float = 2.399963229728653;

/// A per-field entrance-pupil configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntranceConfig {
    /// Launch-plane center whose ray reaches the evaluation surface.
    pub center: Vec3,
    /// Effective entrance radius: the largest traceable offset, in mm.
    pub r_eff: Float,
    /// Pupil scale in mm per unit pupil coordinate. Fixed to the designed
    /// stop radius so that the pupil scale stays consistent across fields;
    /// rays outside the reachable region become masked samples.
    pub r_scale: Float,
}

impl WavefrontCalculator {
    /// The entrance-pupil configuration for a field, built once and cached.
    pub(crate) fn entrance_config(&self, field: &Field, fast: bool) -> Option<EntranceConfig> {
        let key = field.key();
        if let Some(config) = self.entrance_configs.borrow().get(&key) {
            return Some(*config);
        }

        let config = self.build_entrance_config(field, fast)?;
        self.entrance_configs.borrow_mut().insert(key, config);
        Some(config)
    }

    /// The effective entrance radius for a field, when a configuration has
    /// been built.
    pub(crate) fn entrance_effective_radius(&self, field: &Field) -> Option<Float> {
        self.entrance_configs
            .borrow()
            .get(&field.key())
            .map(|c| c.r_eff)
    }

    fn build_entrance_config(&self, field: &Field, fast: bool) -> Option<EntranceConfig> {
        let dir = self.field_direction(field);
        let center = self.find_launch_center(field, dir, fast)?;
        let r_eff = self.effective_radius(center, dir, fast);

        Some(EntranceConfig {
            center,
            r_eff,
            r_scale: self
                .entrance_scale_override
                .get()
                .unwrap_or_else(|| self.model().stop_semi_diameter()),
        })
    }

    /// Finds a launch point whose ray reaches the evaluation surface.
    ///
    /// Prefers the chief-ray launch point when one is cached for this field;
    /// otherwise probes candidate planes ahead of the first surface with a
    /// golden-angle spiral around the geometric guess, under a wall-clock
    /// budget.
    fn find_launch_center(&self, field: &Field, dir: Vec3, fast: bool) -> Option<Vec3> {
        if let Some(chief) = self.chief_rays.borrow().get(&field.key()) {
            if self.reaches_eval(chief.pos(), dir) {
                return Some(chief.pos());
            }
        }

        let z_first = self.model().first_surface_z();
        let planes = [
            z_first - 10.0,
            z_first - 50.0,
            z_first - 500.0,
            z_first - 1000.0,
            z_first - 2000.0,
            -25.0,
            -50.0,
            -100.0,
            -200.0,
        ];
        let budget_ms = if fast {
            SEARCH_BUDGET_FAST_MS
        } else {
            SEARCH_BUDGET_SLOW_MS
        };
        let started = Instant::now();

        let stop_center = self.model().stop_surface().origin();
        let r_max = Float::max(2.0 * self.model().largest_semi_diameter(), 10.0);
        let spiral_scale = r_max / (SPIRAL_SAMPLES as Float).sqrt();

        for plane in planes {
            // Geometric guess: the stop center back-projected onto this
            // plane along the field direction.
            let d_z = Float::max(dir.m(), 1e-9);
            let guess = stop_center - dir * ((stop_center.z() - plane) / d_z);

            for k in 0..SPIRAL_SAMPLES {
                if started.elapsed().as_millis() > budget_ms {
                    return None;
                }
                let radius = spiral_scale * (k as Float).sqrt();
                let theta = k as Float * GOLDEN_ANGLE;
                let candidate = Vec3::new(
                    guess.x() + radius * theta.cos(),
                    guess.y() + radius * theta.sin(),
                    plane,
                );
                if self.reaches_eval(candidate, dir) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Bisects the largest traceable offsets along the four launch-plane
    /// half-axes and combines them into the effective radius.
    fn effective_radius(&self, center: Vec3, dir: Vec3, fast: bool) -> Float {
        let iters = if fast {
            BISECT_ITERS_FAST
        } else {
            BISECT_ITERS_SLOW
        };
        let r_max = Float::max(2.0 * self.model().largest_semi_diameter(), 10.0);
        let axes = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
        ];

        let mut extents = [0.0; 4];
        for (slot, axis) in extents.iter_mut().zip(axes.iter()) {
            if self.reaches_eval(center + *axis * r_max, dir) {
                *slot = r_max;
                continue;
            }
            let mut lo = 0.0;
            let mut hi = r_max;
            for _ in 0..iters {
                let mid = 0.5 * (lo + hi);
                if self.reaches_eval(center + *axis * mid, dir) {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            *slot = lo;
        }

        let min = extents.iter().copied().fold(Float::INFINITY, Float::min);
        if min > 0.0 {
            min
        } else {
            // Some half-axes degenerate to zero; report the widest instead.
            extents.iter().copied().fold(0.0, Float::max)
        }
    }

    fn reaches_eval(&self, origin: Vec3, dir: Vec3) -> bool {
        match Ray::new(origin, dir) {
            Ok(ray) => self.path_is_complete(&self.trace_to_eval(&ray)),
            Err(_) => false,
        }
    }

    /// Entrance-mode marginal ray: a plain launch-plane offset with no
    /// stop-hit gating.
    pub(crate) fn solve_marginal_entrance(
        &self,
        px: Float,
        py: Float,
        field: &Field,
        opts: &SolveOptions,
    ) -> Result<MarginalRay, RayFailure> {
        let config = self
            .entrance_config(field, opts.fast)
            .ok_or(RayFailure::StopUnreachable)?;

        let origin = config.center
            + Vec3::new(px * config.r_scale, py * config.r_scale, 0.0);
        let ray = Ray::new(origin, self.field_direction(field)).map_err(|_| RayFailure::Numeric)?;

        let path = self.trace_to_eval(&ray);
        if !self.path_is_complete(&path) {
            return Err(RayFailure::EvalUnreachable {
                surface_index: path.termination().map(|t| t.surface_index),
                surface_kind: path.termination().map(|t| t.surface_kind),
            });
        }

        Ok(MarginalRay {
            ray,
            path,
            stop_error_mm: 0.0,
            origin_delta: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};
    use crate::wavefront::PupilMode;

    /// A small diverging front element ahead of a deep stop. Well off axis
    /// the geometric seeds toward the stop are blocked by the front rim, but
    /// an off-center bundle still threads the stop aperture.
    fn retrofocus_front() -> WavefrontCalculator {
        WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(Float::INFINITY),
                SurfaceSpec::conic(5.0, -15.45, 0.0, 2.0, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(5.0, Float::INFINITY, 0.0, 18.0, MaterialSpec::Air),
                SurfaceSpec::stop(2.0, 30.0),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap()
    }

    #[test]
    fn test_entrance_config_on_axis() {
        let calc = retrofocus_front();
        let config = calc.entrance_config(&Field::on_axis(), false).unwrap();

        // On axis the geometric guess itself is traceable.
        assert!(config.center.z() < calc.model().first_surface_z());
        assert!(config.r_eff > 0.0);
        assert_eq!(config.r_scale, 2.0);
    }

    #[test]
    fn test_entrance_config_is_cached() {
        let calc = retrofocus_front();
        let field = Field::on_axis();

        let first = calc.entrance_config(&field, false).unwrap();
        let second = calc.entrance_config(&field, false).unwrap();

        assert_eq!(first.center, second.center);
        assert_eq!(calc.entrance_configs.borrow().len(), 1);
    }

    #[test]
    fn test_effective_radius_below_designed_stop() {
        let calc = retrofocus_front();
        let field = Field::Angle { x: 0.0, y: 20.0 };
        let config = calc.entrance_config(&field, false).unwrap();

        // At 20 degrees the small front lens limits the traceable region to
        // less than the designed stop radius.
        assert!(config.r_eff < 4.0, "r_eff = {}", config.r_eff);
        assert!(config.r_eff > 0.0);
    }

    #[test]
    fn test_entrance_marginal_masks_unreachable_cells() {
        let calc = retrofocus_front();
        calc.set_pupil_mode(PupilMode::Entrance);
        let field = Field::Angle { x: 0.0, y: 20.0 };

        let center = calc.solve_marginal_entrance(0.0, 0.0, &field, &SolveOptions::default());
        assert!(center.is_ok());

        // Far rim cells fall outside the reachable region and are masked.
        let rim = calc.solve_marginal_entrance(1.0, 1.0, &field, &SolveOptions::default());
        assert!(matches!(rim, Err(RayFailure::EvalUnreachable { .. })));
    }
}
