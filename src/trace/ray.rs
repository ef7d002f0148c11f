use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::{Float, math::vec3::Vec3, sequential_model::Surface};

/// Convergence tolerance of the Newton-Raphson intersection, in integer
/// multiples of the machine epsilon.
const TOL: Float = Float::EPSILON;

/// A single ray to be traced through an optical system.
///
/// # Attributes
/// - pos: Position of the ray
/// - dir: Direction of the ray (direction cosines)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ray {
    pos: Vec3,
    dir: Vec3,
}

impl Ray {
    pub fn new(pos: Vec3, dir: Vec3) -> Result<Self> {
        if !dir.is_unit() {
            bail!("Ray direction must be a unit vector");
        }
        Ok(Self { pos, dir })
    }

    /// Builds a ray toward a target point, normalizing the direction.
    pub fn aimed_at(pos: Vec3, target: Vec3) -> Self {
        Self {
            pos,
            dir: (target - pos).normalize(),
        }
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn dir(&self) -> Vec3 {
        self.dir
    }

    /// Transform the ray into the local coordinate system of a surface from
    /// the global system.
    pub(crate) fn to_local(&self, surf: &Surface) -> Self {
        Self {
            pos: surf.rot() * (self.pos - surf.origin()),
            dir: surf.rot() * self.dir,
        }
    }

    /// Transform the ray from the local coordinate system of a surface into
    /// the global system.
    pub(crate) fn to_global(&self, surf: &Surface) -> Self {
        Self {
            pos: surf.rot().transpose() * self.pos + surf.origin(),
            dir: surf.rot().transpose() * self.dir,
        }
    }

    /// Finds the intersection point of the ray with a surface and the surface
    /// normal at that point, in the surface-local frame.
    ///
    /// If no intersection is found, then this function returns an error.
    ///
    /// # Arguments
    /// - surf: Surface to intersect with
    /// - max_iter: Maximum number of iterations for the Newton-Raphson method
    pub(crate) fn intersect(&self, surf: &Surface, max_iter: usize) -> Result<(Vec3, Vec3)> {
        if self.dir.m() == 0.0 {
            bail!("Ray travels parallel to the surface plane");
        }

        // Initial guess for the intersection point
        let mut s_1 = 0.0;

        // Find the distance along the ray to the z=0 plane; use this as the
        // initial value for s
        let mut s = -self.pos.z() / self.dir.m();

        let mut p: Vec3;
        let mut sag: Float;
        let mut norm: Vec3;
        for ctr in 0..max_iter {
            // Compute the current estimate of the intersection point from the
            // distance s
            p = self.pos + self.dir * s;

            // Update the distance s using the Newton-Raphson method
            (sag, norm) = surf.sag_norm(p);
            let denom = norm.dot(self.dir);
            if denom == 0.0 || !denom.is_finite() || !sag.is_finite() {
                bail!("Ray intersection did not converge");
            }
            s -= (p.z() - sag) / denom;

            // Check for convergence by comparing the current and previous
            // values of s
            if (s - s_1).abs() / Float::max(s.abs(), Float::max(s_1.abs(), 1.0)) < TOL {
                break;
            }

            if ctr == max_iter - 1 {
                bail!("Ray intersection did not converge");
            }

            s_1 = s;
        }

        // Compute the final intersection point and surface normal
        p = self.pos + self.dir * s;
        (_, norm) = surf.sag_norm(p);

        if !p.is_finite() {
            bail!("Ray intersection did not converge");
        }

        Ok((p, norm))
    }

    /// Redirects the ray at a surface by refraction, in the surface-local
    /// frame.
    ///
    /// Accepts the surface normal at the intersection point as an argument to
    /// avoid recomputing it. Returns false on total internal reflection.
    pub(crate) fn refract(&mut self, norm: Vec3, n_0: Float, n_1: Float) -> bool {
        let mu = n_0 / n_1;

        // Orient the normal along the propagation direction.
        let mut norm = norm;
        let mut cos_theta_1 = self.dir.dot(norm);
        if cos_theta_1 < 0.0 {
            norm = -norm;
            cos_theta_1 = -cos_theta_1;
        }

        let radicand = 1.0 - mu * mu * (1.0 - cos_theta_1 * cos_theta_1);
        if radicand < 0.0 {
            return false;
        }

        let term_1 = norm * radicand.sqrt();
        let term_2 = (self.dir - norm * cos_theta_1) * mu;

        self.dir = term_1 + term_2;
        true
    }

    /// Redirects the ray at a mirror surface, in the surface-local frame.
    pub(crate) fn reflect(&mut self, norm: Vec3) {
        self.dir = self.dir - norm * (2.0 * self.dir.dot(norm));
    }

    /// Displace the ray to the given location.
    pub(crate) fn displace(&mut self, pos: Vec3) {
        self.pos = pos;
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::core::sequential_model::SequentialModel;
    use crate::specs::surfaces::SurfaceSpec;

    fn flat_surface_model() -> SequentialModel {
        SequentialModel::new(vec![
            SurfaceSpec::object(10.0),
            SurfaceSpec::stop(4.0, 0.0),
            SurfaceSpec::image(),
        ])
        .unwrap()
    }

    #[test]
    fn test_rays_new_non_unit_dir() {
        let pos = Vec3::new(0.0, 0.0, 0.0);
        let dir = Vec3::new(0.0, 0.0, 2.0);

        assert!(Ray::new(pos, dir).is_err());
    }

    #[test]
    fn test_ray_intersection_flat_surface() {
        let model = flat_surface_model();
        let surf = &model.surfaces()[0];

        let ray = Ray::new(Vec3::new(0.0, 1.0, -1.0), Vec3::new(0.0, 0.0, 1.0)).unwrap();
        let local = ray.to_local(surf);
        let (p, norm) = local.intersect(surf, 1000).unwrap();

        assert_abs_diff_eq!(p.y(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.z(), 0.0, epsilon = 1e-12);
        assert_eq!(norm, Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_refract_snells_law() {
        let mut ray = Ray::new(
            Vec3::zero(),
            Vec3::new(0.0, (0.5 as Float).sqrt(), (0.5 as Float).sqrt()),
        )
        .unwrap();
        let norm = Vec3::new(0.0, 0.0, 1.0);

        assert!(ray.refract(norm, 1.0, 1.5));

        // sin(45 deg) / 1.5
        let expected_sin = (0.5 as Float).sqrt() / 1.5;
        assert_abs_diff_eq!(ray.dir().l(), expected_sin, epsilon = 1e-12);
        assert_abs_diff_eq!(ray.dir().length(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_refract_total_internal_reflection() {
        let mut ray = Ray::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, (0.5 as Float).sqrt(), (0.5 as Float).sqrt()),
        )
        .unwrap();
        let norm = Vec3::new(0.0, 0.0, 1.0);

        // 45 degrees incidence from glass to air exceeds the critical angle.
        assert!(!ray.refract(norm, 1.5, 1.0));
    }

    #[test]
    fn test_reflect_flips_axial_component() {
        let mut ray = Ray::new(
            Vec3::zero(),
            Vec3::new(0.0, (0.5 as Float).sqrt(), (0.5 as Float).sqrt()),
        )
        .unwrap();
        ray.reflect(Vec3::new(0.0, 0.0, 1.0));

        assert_abs_diff_eq!(ray.dir().l(), (0.5 as Float).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(ray.dir().m(), -((0.5 as Float).sqrt()), epsilon = 1e-12);
    }
}
