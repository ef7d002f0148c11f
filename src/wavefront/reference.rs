//! Reference-ray policy.
//!
//! The reference ray fixes the optical path against which every pupil
//! sample's OPD is measured. Establishing it walks a fallback ladder: a
//! strict center solve, a tolerance-relaxed solve, the Newton chief ray, a
//! pupil-mode switch to entrance sampling, and finally a coarse geometric
//! scan. Only when every rung fails does the wavefront map abort.
use anyhow::{Result, anyhow};
use tracing::debug;

use crate::core::{Float, math::vec3::Vec3};
use crate::specs::fields::{Field, FieldKey};
use crate::trace::{Ray, RayPath};
use crate::wavefront::{
    PupilMode, WavefrontCalculator,
    diagnostics::RayFailure,
    marginal_ray::{MarginalRay, SolveOptions},
};

/// Launch-plane z positions scanned by the geometric fallback, in mm.
const FALLBACK_PLANES: [Float; 4] = [-25.0, -50.0, -100.0, -200.0];
/// Lateral offsets scanned by the geometric fallback, in mm.
const FALLBACK_OFFSETS: [Float; 8] = [0.0, 1.0, 3.0, 7.0, 15.0, 30.0, 60.0, 120.0];

/// The established reference ray and its optical path.
#[derive(Debug, Clone)]
pub(crate) struct ReferenceRay {
    pub key: FieldKey,
    pub mode: PupilMode,
    pub ray: Ray,
    pub path: RayPath,
    pub opl_um: Float,
    /// The stop-miss tolerance had to be relaxed to establish this
    /// reference.
    pub relaxed: bool,
}

impl WavefrontCalculator {
    /// Establishes and caches the reference ray for a field, returning its
    /// optical path length in µm.
    pub fn set_reference_ray(&self, field: &Field) -> Result<Float> {
        field.validate()?;

        let key = field.key();
        if let Some(reference) = self.reference.borrow().as_ref() {
            if reference.key == key && reference.mode == self.pupil_mode() {
                return Ok(reference.opl_um);
            }
        }

        self.establish_reference(field, None).map(|r| r.opl_um)
    }

    /// The cached reference for a field, if it is current.
    pub(crate) fn current_reference(&self, key: &FieldKey) -> Option<ReferenceRay> {
        self.reference
            .borrow()
            .as_ref()
            .filter(|r| r.key == *key && r.mode == self.pupil_mode())
            .cloned()
    }

    /// Runs the reference fallback ladder.
    ///
    /// `forced` pins the pupil mode: when set, the automatic stop-to-
    /// entrance switch is disabled.
    pub(crate) fn establish_reference(
        &self,
        field: &Field,
        forced: Option<PupilMode>,
    ) -> Result<ReferenceRay> {
        let infinite = self.field_is_infinite(field);
        let mut relaxed = false;

        // 1. Strict solve at the pupil origin.
        let strict_opts = SolveOptions {
            is_reference: true,
            ..SolveOptions::default()
        };
        let first_failure;
        let mut solved = match self.generate_marginal_ray(0.0, 0.0, field, &strict_opts) {
            Ok(s) => {
                first_failure = None;
                Some(s)
            }
            Err(f) => {
                first_failure = Some(f);
                None
            }
        };

        // 2. Retry with a relaxed stop-miss tolerance.
        if solved.is_none() {
            let relaxed_opts = SolveOptions {
                is_reference: true,
                relax_stop_miss_tol: true,
                ..SolveOptions::default()
            };
            if let Ok(s) = self.generate_marginal_ray(0.0, 0.0, field, &relaxed_opts) {
                debug!("reference established with relaxed stop-miss tolerance");
                relaxed = true;
                solved = Some(s);
            }
        }

        // 3. An unreachable stop in infinite stop mode: try the Newton chief
        // ray, then switch the sampling mode unless pinned.
        if solved.is_none()
            && infinite
            && self.pupil_mode() == PupilMode::Stop
            && matches!(first_failure, Some(RayFailure::StopUnreachable))
        {
            if let Some(chief) = self.chief_ray(field) {
                let path = self.trace_to_eval(&chief);
                if self.path_is_complete(&path) {
                    solved = Some(MarginalRay {
                        ray: chief,
                        path,
                        stop_error_mm: 0.0,
                        origin_delta: None,
                    });
                }
            }

            if solved.is_none() && forced.is_none() {
                self.set_pupil_mode(PupilMode::Entrance);
                if let Ok(s) = self.generate_marginal_ray(0.0, 0.0, field, &strict_opts) {
                    solved = Some(s);
                }
            }
        }

        // 4. Coarse geometric scan over launch planes and lateral offsets.
        if solved.is_none() && infinite {
            solved = self.geometric_reference_fallback(field);
        }

        match solved {
            Some(s) => {
                let opl_um = self.path_opl_um(&s.path, infinite);
                if !opl_um.is_finite() {
                    return Err(anyhow!(
                        "the reference ray has a non-finite optical path length"
                    ));
                }
                let reference = ReferenceRay {
                    key: field.key(),
                    mode: self.pupil_mode(),
                    ray: s.ray,
                    path: s.path,
                    opl_um,
                    relaxed,
                };
                self.reference.replace(Some(reference.clone()));
                Ok(reference)
            }
            None => Err(self.no_reference_error(field)),
        }
    }

    /// Scans candidate start planes and lateral offsets for any ray of the
    /// field direction that reaches the evaluation surface.
    fn geometric_reference_fallback(&self, field: &Field) -> Option<MarginalRay> {
        let dir = self.field_direction(field);
        let d_z = Float::max(dir.m(), 1e-9);
        let stop_center = self.model().stop_surface().origin();

        for plane in FALLBACK_PLANES {
            let base = stop_center - dir * ((stop_center.z() - plane) / d_z);
            for offset in FALLBACK_OFFSETS {
                let all = [(offset, 0.0), (-offset, 0.0), (0.0, offset), (0.0, -offset)];
                let candidates = if offset == 0.0 { &all[..1] } else { &all[..] };
                for &(dx, dy) in candidates {
                    let origin = Vec3::new(base.x() + dx, base.y() + dy, plane);
                    let Ok(ray) = Ray::new(origin, dir) else {
                        continue;
                    };
                    let path = self.trace_to_eval(&ray);
                    if self.path_is_complete(&path) {
                        debug!(plane, offset, "reference from geometric fallback scan");
                        return Some(MarginalRay {
                            ray,
                            path,
                            stop_error_mm: Float::NAN,
                            origin_delta: None,
                        });
                    }
                }
            }
        }
        None
    }

    /// Builds the fatal no-reference error with a vignetting hint.
    fn no_reference_error(&self, field: &Field) -> anyhow::Error {
        let termination = self
            .last_ray_calculation()
            .and_then(|r| r.failure)
            .map(|f| f.to_string());

        let hint = match (field, self.vignetting_boundary(field)) {
            (Field::Angle { .. }, Some((bx, by))) => format!(
                " (center ray becomes traceable around angle≈({bx:.2}, {by:.2}) deg)"
            ),
            _ => String::new(),
        };

        match termination {
            Some(reason) => anyhow!(
                "no reference ray: field likely vignetted/out-of-FOV{hint}; last failure: {reason}"
            ),
            None => anyhow!("no reference ray: field likely vignetted/out-of-FOV{hint}"),
        }
    }

    /// Binary-searches the field-angle scale at which the center ray becomes
    /// traceable. Returns the boundary angles in degrees.
    fn vignetting_boundary(&self, field: &Field) -> Option<(Float, Float)> {
        let Field::Angle { x, y } = field else {
            return None;
        };

        let traceable = |scale: Float| -> bool {
            let scaled = Field::Angle {
                x: x * scale,
                y: y * scale,
            };
            let dir = self.field_direction(&scaled);
            let target = self.model().stop_surface().origin();
            let origin = self.back_projected_origin(dir, target, 0.0);
            match Ray::new(origin, dir) {
                Ok(ray) => self.path_is_complete(&self.trace_to_eval(&ray)),
                Err(_) => false,
            }
        };

        if !traceable(0.0) {
            return None;
        }

        let mut lo = 0.0;
        let mut hi = 1.0;
        for _ in 0..10 {
            let mid = 0.5 * (lo + hi);
            if traceable(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some((x * lo, y * lo))
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};

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
    fn test_reference_on_axis() {
        let calc = stop_first_singlet();
        let opl = calc.set_reference_ray(&Field::on_axis()).unwrap();

        // Accumulation starts at the stop: 2 + 46.6 mm in air plus the
        // glass path, in µm.
        let expected = (2.0 + 46.6) * 1e3 + 1.515 * 5.3e3;
        assert_abs_diff_eq!(opl, expected, epsilon = 1.0);
    }

    #[test]
    fn test_reference_is_cached() {
        let calc = stop_first_singlet();
        let field = Field::Angle { x: 0.0, y: 2.0 };

        let first = calc.set_reference_ray(&field).unwrap();
        let second = calc.set_reference_ray(&field).unwrap();

        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn test_reference_invalidated_by_field_change() {
        let calc = stop_first_singlet();

        calc.set_reference_ray(&Field::on_axis()).unwrap();
        let key_a = calc.reference.borrow().as_ref().unwrap().key;

        calc.set_reference_ray(&Field::Angle { x: 0.0, y: 2.0 }).unwrap();
        let key_b = calc.reference.borrow().as_ref().unwrap().key;

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_vignetted_field_switches_to_entrance_mode() {
        let calc = retrofocus_front();
        let field = Field::Angle { x: 0.0, y: 20.0 };

        let reference = calc.establish_reference(&field, None).unwrap();

        assert_eq!(calc.pupil_mode(), PupilMode::Entrance);
        assert_eq!(reference.mode, PupilMode::Entrance);
        assert!(reference.opl_um.is_finite());
    }

    #[test]
    fn test_forced_stop_mode_disables_switch() {
        let calc = retrofocus_front();
        let field = Field::Angle { x: 0.0, y: 20.0 };

        let result = calc.establish_reference(&field, Some(PupilMode::Stop));

        // Pinned to stop mode the ladder may still find a geometric
        // fallback ray, but it must never leave stop mode.
        assert_eq!(calc.pupil_mode(), PupilMode::Stop);
        if let Ok(reference) = result {
            assert_eq!(reference.mode, PupilMode::Stop);
        }
    }
}
