//! Chief/center-ray generation.
//!
//! A chief ray reaches the nominal stop center for a given field. Finite
//! fields solve for a launch direction from the object point; infinite
//! fields have a fixed direction and solve for a launch origin on a back
//! plane instead.
use crate::core::{Float, math::roots::brent, math::vec3::Vec3};
use crate::specs::fields::Field;
use crate::trace::Ray;
use crate::wavefront::WavefrontCalculator;

/// Central-difference step of the stop-hit Jacobian, in mm.
const DIFF_STEP_MM: Float = 1e-5;
/// Damping factor of the 2D Newton refinement.
const DAMPING: Float = 0.7;
/// Convergence tolerance on the stop-hit residual, in mm.
const NEWTON_TOL_MM: Float = 1e-6;
const NEWTON_MAX_ITER: usize = 50;
/// Jacobians below this determinant magnitude are treated as singular.
const SINGULAR_DET: Float = 1e-15;

/// Minimum clearance between the launch plane and the first physical
/// surface, in mm.
const BACK_MARGIN_MM: Float = 10.0;
/// Largest lateral excursion allowed when back-projecting an origin, in mm.
const LATERAL_BUDGET_MM: Float = 500.0;

impl WavefrontCalculator {
    /// The chief ray for a field, solved on demand and cached.
    ///
    /// Failed solves are never cached so that later attempts with different
    /// solver state can still succeed.
    pub(crate) fn chief_ray(&self, field: &Field) -> Option<Ray> {
        let key = field.key();
        if let Some(ray) = self.chief_rays.borrow().get(&key) {
            return Some(*ray);
        }

        let ray = self.solve_chief(field)?;
        self.chief_rays.borrow_mut().insert(key, ray);
        Some(ray)
    }

    fn solve_chief(&self, field: &Field) -> Option<Ray> {
        let stop_center = self.model().stop_surface().origin();

        if self.field_is_infinite(field) {
            let dir = self.field_direction(field);
            let origin = self.solve_infinite_origin(dir, stop_center)?;
            Ray::new(origin, dir).ok()
        } else {
            let obj = self.object_point(field)?;
            let dir = self
                .solve_finite_direction(obj, stop_center)
                .or_else(|| self.finite_direction_fallback(obj, stop_center))?;
            Ray::new(obj, dir).ok()
        }
    }

    /// Solves for a launch direction from a finite object point to a target
    /// on the stop plane by Brent inversion of the stop-local residual, one
    /// axis at a time.
    pub(crate) fn solve_finite_direction(&self, obj: Vec3, target: Vec3) -> Option<Vec3> {
        let (e_x, e_y, _) = self.stop_axes();
        let span = Float::max(self.model().stop_semi_diameter(), 1.0);

        let mut failed = false;
        let mut aim_u = 0.0;
        let mut aim_v = 0.0;

        // The residual along one stop axis as a function of the aim offset
        // along that axis, with the other held fixed.
        let mut residual = |u: Float, v: Float, failed: &mut bool| -> (Float, Float) {
            let aim = target + e_x * u + e_y * v;
            let ray = Ray::aimed_at(obj, aim);
            match self.stop_intersection(&ray) {
                Some(hit) => self.stop_local_error(hit, target),
                None => {
                    *failed = true;
                    (0.0, 0.0)
                }
            }
        };

        for _ in 0..2 {
            aim_u = brent(
                |u| {
                    let (err_x, _) = residual(u, aim_v, &mut failed);
                    err_x
                },
                -span,
                span,
                NEWTON_TOL_MM,
                NEWTON_MAX_ITER,
            );
            aim_v = brent(
                |v| {
                    let (_, err_y) = residual(aim_u, v, &mut failed);
                    err_y
                },
                -span,
                span,
                NEWTON_TOL_MM,
                NEWTON_MAX_ITER,
            );
            if failed {
                return None;
            }
        }

        let (err_x, err_y) = residual(aim_u, aim_v, &mut failed);
        let err = (err_x * err_x + err_y * err_y).sqrt();
        if failed || err > 1e-4 {
            return None;
        }

        Some((target + e_x * aim_u + e_y * aim_v - obj).normalize())
    }

    /// Aims at a virtual stop point and corrects it by damped stop-local
    /// residual feedback. The fallback when Brent inversion fails.
    pub(crate) fn finite_direction_fallback(&self, obj: Vec3, target: Vec3) -> Option<Vec3> {
        let (e_x, e_y, _) = self.stop_axes();
        let mut aim = target;
        let mut err_mag = Float::INFINITY;

        for _ in 0..NEWTON_MAX_ITER {
            let ray = Ray::aimed_at(obj, aim);
            let hit = self.stop_intersection(&ray)?;
            let (err_x, err_y) = self.stop_local_error(hit, target);
            err_mag = (err_x * err_x + err_y * err_y).sqrt();
            if err_mag <= NEWTON_TOL_MM {
                break;
            }
            aim -= (e_x * err_x + e_y * err_y) * DAMPING;
        }

        (err_mag <= 1e-4).then(|| (aim - obj).normalize())
    }

    /// Solves for a launch origin of an infinite-field ray so that it crosses
    /// the stop plane at the target.
    ///
    /// Starts from the geometric back-projection and refines the transverse
    /// origin with a damped 2D Newton iteration on the stop-local residual,
    /// using a numerical Jacobian from central differences.
    pub(crate) fn solve_infinite_origin(&self, dir: Vec3, target: Vec3) -> Option<Vec3> {
        let seed = self.back_projected_origin(dir, target, 0.0);
        let z_plane = seed.z();

        let residual = |x: Float, y: Float| -> Option<(Float, Float)> {
            let ray = Ray::new(Vec3::new(x, y, z_plane), dir).ok()?;
            let hit = self.stop_intersection(&ray)?;
            Some(self.stop_local_error(hit, target))
        };

        let mut x = seed.x();
        let mut y = seed.y();

        for _ in 0..NEWTON_MAX_ITER {
            let (fx, fy) = residual(x, y)?;
            let err_mag = (fx * fx + fy * fy).sqrt();
            if err_mag <= NEWTON_TOL_MM {
                return Some(Vec3::new(x, y, z_plane));
            }

            let h = DIFF_STEP_MM;
            let (fxp, fyp) = residual(x + h, y)?;
            let (fxm, fym) = residual(x - h, y)?;
            let (fxp2, fyp2) = residual(x, y + h)?;
            let (fxm2, fym2) = residual(x, y - h)?;

            let j11 = (fxp - fxm) / (2.0 * h);
            let j21 = (fyp - fym) / (2.0 * h);
            let j12 = (fxp2 - fxm2) / (2.0 * h);
            let j22 = (fyp2 - fym2) / (2.0 * h);

            let det = j11 * j22 - j12 * j21;
            if det.abs() < SINGULAR_DET {
                return None;
            }

            let dx = (fx * j22 - fy * j12) / det;
            let dy = (fy * j11 - fx * j21) / det;
            x -= DAMPING * dx;
            y -= DAMPING * dy;
        }

        None
    }

    /// Geometric back-projection of a stop-plane target along a fixed
    /// direction onto a launch plane before the first physical surface.
    ///
    /// The back distance keeps at least a 10 mm margin before the first
    /// surface and limits the lateral excursion of the origin.
    pub(crate) fn back_projected_origin(&self, dir: Vec3, target: Vec3, boost: Float) -> Vec3 {
        let z_first = self.model().first_surface_z();
        let d_z = Float::max(dir.m(), 1e-9);

        let clearance = target.z() - z_first + BACK_MARGIN_MM;
        let mut b = [15.0, 50.0, clearance]
            .into_iter()
            .fold(0.0, Float::max);

        let slope = (dir.k() * dir.k() + dir.l() * dir.l()).sqrt() / d_z;
        if slope * b > LATERAL_BUDGET_MM {
            b = Float::max(LATERAL_BUDGET_MM / slope, clearance);
        }
        b += boost;

        target - dir * (b / d_z)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};

    fn infinite_singlet() -> WavefrontCalculator {
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

    fn finite_singlet() -> WavefrontCalculator {
        WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(100.0),
                SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
                SurfaceSpec::conic(12.5, Float::INFINITY, 0.0, 20.0, MaterialSpec::Air),
                SurfaceSpec::stop(2.0, 40.0),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap()
    }

    #[test]
    fn test_back_projection_clears_first_surface() {
        let calc = infinite_singlet();
        let dir = calc.field_direction(&Field::Angle { x: 0.0, y: 5.0 });
        let target = calc.model().stop_surface().origin();

        let origin = calc.back_projected_origin(dir, target, 0.0);

        assert!(origin.z() <= calc.model().first_surface_z() - 10.0);
    }

    #[test]
    fn test_chief_ray_on_axis_runs_down_the_axis() {
        let calc = infinite_singlet();
        let ray = calc.chief_ray(&Field::on_axis()).unwrap();

        // On axis the chief ray is the axial ray.
        assert_abs_diff_eq!(ray.pos().x(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ray.pos().y(), 0.0, epsilon = 1e-6);

        let hit = calc.stop_intersection(&ray).unwrap();
        assert_abs_diff_eq!(hit.x(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(hit.y(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_chief_ray_off_axis_reaches_stop_center() {
        let calc = infinite_singlet();
        let field = Field::Angle { x: 0.0, y: 3.0 };
        let ray = calc.chief_ray(&field).unwrap();

        let hit = calc.stop_intersection(&ray).unwrap();
        let target = calc.model().stop_surface().origin();
        let (err_x, err_y) = calc.stop_local_error(hit, target);

        assert!((err_x * err_x + err_y * err_y).sqrt() < 1e-5);
    }

    #[test]
    fn test_chief_ray_finite_field() {
        let calc = finite_singlet();
        let field = Field::Height { x: 0.0, y: 2.0 };
        let ray = calc.chief_ray(&field).unwrap();

        assert_abs_diff_eq!(ray.pos().y(), 2.0);
        assert_abs_diff_eq!(ray.pos().z(), -100.0);

        let hit = calc.stop_intersection(&ray).unwrap();
        let target = calc.model().stop_surface().origin();
        let (err_x, err_y) = calc.stop_local_error(hit, target);

        assert!((err_x * err_x + err_y * err_y).sqrt() < 1e-4);
    }

    #[test]
    fn test_chief_ray_is_cached() {
        let calc = infinite_singlet();
        let field = Field::Angle { x: 0.0, y: 3.0 };

        let first = calc.chief_ray(&field).unwrap();
        let second = calc.chief_ray(&field).unwrap();

        assert_eq!(first.pos(), second.pos());
        assert_eq!(calc.chief_rays.borrow().len(), 1);
    }
}
