/// Surface-table geometry for sequential wavefront analysis.
///
/// The surface table is walked once at construction. A frame cursor composes
/// coord-break decenters and tilts so that every physical surface carries a
/// global origin and an orthonormal local basis. Physical surfaces up to the
/// evaluation/stop surface are "recorded": ray paths contain one point per
/// recorded surface, with point 0 being the ray origin.
use anyhow::{Result, anyhow};
use tracing::warn;

use crate::core::{
    Float, INFINITE_APERTURE,
    math::{mat3::Mat3, vec3::Vec3},
};
use crate::specs::surfaces::{SurfaceKind, SurfaceSpec};

/// Derived geometry of one recorded surface.
#[derive(Debug, Clone)]
pub(crate) struct Surface {
    spec_index: usize,
    kind: SurfaceKind,
    origin: Vec3,
    /// Rotation from the global frame into the surface-local frame.
    rot: Mat3,
    semi_diameter: Float,
    radius_of_curvature: Float,
    conic_constant: Float,
}

/// A sequential optical system with per-surface frames resolved.
#[derive(Debug)]
pub struct SequentialModel {
    specs: Vec<SurfaceSpec>,
    surfaces: Vec<Surface>,
    recorded: Vec<usize>,
    point_of: Vec<Option<usize>>,
    stop_index: usize,
    eval_index: usize,
    object_thickness: Float,
    sum_thickness: Float,
}

impl Surface {
    pub fn spec_index(&self) -> usize {
        self.spec_index
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn rot(&self) -> Mat3 {
        self.rot
    }

    pub fn semi_diameter(&self) -> Float {
        self.semi_diameter
    }

    /// The surface-local basis vectors expressed in the global frame.
    pub fn axes(&self) -> (Vec3, Vec3, Vec3) {
        (self.rot.row(0), self.rot.row(1), self.rot.row(2))
    }

    /// Surface sag and unit normal at a transverse position in the local
    /// frame.
    pub fn sag_norm(&self, pos: Vec3) -> (Float, Vec3) {
        let roc = self.radius_of_curvature;
        if roc.is_infinite() {
            return (0.0, Vec3::new(0.0, 0.0, 1.0));
        }

        let r2 = pos.x() * pos.x() + pos.y() * pos.y();

        let a = r2 / roc;
        let sag = a / (1.0 + (1.0 - (1.0 + self.conic_constant) * a / roc).sqrt());

        let denom =
            (roc.powi(4) - (1.0 + self.conic_constant) * r2 * roc.powi(2)).sqrt();
        let dfdx = -pos.x() * roc / denom;
        let dfdy = -pos.y() * roc / denom;
        let norm = Vec3::new(dfdx, dfdy, 1.0).normalize();

        (sag, norm)
    }

    /// Determines whether a transverse point is outside the clear aperture of
    /// the surface, with an absolute slack in mm.
    ///
    /// The axial z-position is ignored.
    pub fn outside_clear_aperture(&self, pos: Vec3, slack: Float) -> bool {
        if self.semi_diameter.is_infinite() {
            return false;
        }
        let r_transv = pos.x() * pos.x() + pos.y() * pos.y();
        let r_max = self.semi_diameter + slack;

        r_transv > r_max * r_max
    }
}

impl SequentialModel {
    /// Creates a new sequential model from a surface table.
    ///
    /// The first row must be the object surface. The aperture stop is selected
    /// by the documented precedence rules; systems without any identifiable
    /// stop fall back to the middle of the table with a warning.
    pub fn new(specs: Vec<SurfaceSpec>) -> Result<Self> {
        Self::validate_specs(&specs)?;

        let surfaces = Self::resolve_frames(&specs);

        let all_recorded: Vec<usize> = surfaces.iter().map(|s| s.spec_index).collect();
        let stop_index = Self::select_stop(&specs, &all_recorded);
        let eval_index = Self::select_eval(&specs, &all_recorded);

        // Recording stops at the later of the stop and evaluation surfaces.
        let last = usize::max(stop_index, eval_index);
        let surfaces: Vec<Surface> = surfaces
            .into_iter()
            .filter(|s| s.spec_index <= last)
            .collect();
        let recorded: Vec<usize> = surfaces.iter().map(|s| s.spec_index).collect();

        let mut point_of = vec![None; specs.len()];
        for (i, &spec_index) in recorded.iter().enumerate() {
            point_of[spec_index] = Some(i + 1);
        }

        let object_thickness = specs[0].thickness;
        let sum_thickness = specs
            .iter()
            .skip(1)
            .map(|s| s.thickness.abs())
            .filter(|t| t.is_finite())
            .sum();

        Ok(Self {
            specs,
            surfaces,
            recorded,
            point_of,
            stop_index,
            eval_index,
            object_thickness,
            sum_thickness,
        })
    }

    /// Overrides the automatically selected stop surface.
    ///
    /// Out-of-range indices are clamped to the middle of the table.
    pub fn with_stop_index(mut self, index: usize) -> Self {
        let index = if self.point_of.get(index).copied().flatten().is_none() {
            let fallback = self.nearest_recorded(self.specs.len() / 2);
            warn!(
                requested = index,
                clamped = fallback,
                "stop index out of range; clamped to the middle of the table"
            );
            fallback
        } else {
            index
        };
        self.stop_index = index;
        self
    }

    pub fn specs(&self) -> &[SurfaceSpec] {
        &self.specs
    }

    /// Geometry of the recorded surfaces, in ray-path order.
    pub(crate) fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    /// Indices of the recorded (non-break, non-object) surfaces.
    pub fn recorded_surfaces(&self) -> &[usize] {
        &self.recorded
    }

    /// Maps a surface-table index to its ray-path point index.
    ///
    /// Point 0 is the ray origin; recorded surface k occupies point k + 1.
    pub fn point_index_of(&self, surface_index: usize) -> Option<usize> {
        self.point_of.get(surface_index).copied().flatten()
    }

    /// Geometry of the recorded surface at a given ray-path point index.
    pub(crate) fn surface_at_point(&self, point_index: usize) -> Option<&Surface> {
        if point_index == 0 {
            return None;
        }
        self.surfaces.get(point_index - 1)
    }

    pub fn origin(&self, surface_index: usize) -> Option<Vec3> {
        let point = self.point_index_of(surface_index)?;
        Some(self.surfaces[point - 1].origin)
    }

    pub fn axes(&self, surface_index: usize) -> Option<(Vec3, Vec3, Vec3)> {
        let point = self.point_index_of(surface_index)?;
        Some(self.surfaces[point - 1].axes())
    }

    pub fn stop_index(&self) -> usize {
        self.stop_index
    }

    pub fn eval_index(&self) -> usize {
        self.eval_index
    }

    pub(crate) fn stop_surface(&self) -> &Surface {
        let point = self.point_index_of(self.stop_index).expect(
            "The stop surface is always recorded.",
        );
        &self.surfaces[point - 1]
    }

    pub fn stop_semi_diameter(&self) -> Float {
        let sd = self.stop_surface().semi_diameter;
        if sd.is_finite() && sd < INFINITE_APERTURE {
            sd
        } else {
            // Unbounded stops fall back to the largest finite aperture.
            self.largest_semi_diameter()
        }
    }

    pub fn object_thickness(&self) -> Float {
        self.object_thickness
    }

    /// Total of all finite surface-to-surface thicknesses, in mm.
    pub fn sum_thickness(&self) -> Float {
        self.sum_thickness
    }

    /// Global z of the first recorded surface.
    pub(crate) fn first_surface_z(&self) -> Float {
        self.surfaces
            .first()
            .map(|s| s.origin.z())
            .unwrap_or(0.0)
    }

    /// Returns the largest finite semi-diameter of any recorded surface.
    pub fn largest_semi_diameter(&self) -> Float {
        self.surfaces
            .iter()
            .map(|s| s.semi_diameter)
            .filter(|sd| sd.is_finite() && *sd < INFINITE_APERTURE)
            .fold(0.0, Float::max)
    }

    fn validate_specs(specs: &[SurfaceSpec]) -> Result<()> {
        if specs.is_empty() {
            return Err(anyhow!("The surface table must not be empty."));
        }
        if !matches!(specs[0].kind, SurfaceKind::Object) {
            return Err(anyhow!(
                "The first row of the surface table must be the object surface."
            ));
        }
        if !specs.iter().skip(1).any(|s| s.is_physical()) {
            return Err(anyhow!(
                "The surface table must contain at least one physical surface."
            ));
        }
        for spec in specs.iter() {
            spec.validate()?;
        }
        Ok(())
    }

    /// Walks the table with a frame cursor, producing geometry for every
    /// physical surface.
    fn resolve_frames(specs: &[SurfaceSpec]) -> Vec<Surface> {
        let mut surfaces = Vec::new();

        // The first surface after the object sits at z = 0 by convention.
        let mut origin = Vec3::zero();
        let mut rot = Mat3::identity();
        // Flipped upon reflection so that thicknesses advance backwards.
        let mut sense = 1.0;

        for (i, spec) in specs.iter().enumerate().skip(1) {
            match spec.kind {
                SurfaceKind::CoordBreak => {
                    let (e_x, e_y, _) = (rot.row(0), rot.row(1), rot.row(2));
                    origin += e_x * spec.decenter[0] + e_y * spec.decenter[1];
                    let tilt = Mat3::from_euler_angles(
                        spec.tilt[0].to_radians(),
                        spec.tilt[1].to_radians(),
                        spec.tilt[2].to_radians(),
                    );
                    rot = tilt.transpose() * rot;
                }
                _ => {
                    surfaces.push(Surface {
                        spec_index: i,
                        kind: spec.kind,
                        origin,
                        rot,
                        semi_diameter: spec.semi_diameter,
                        radius_of_curvature: spec.radius_of_curvature,
                        conic_constant: spec.conic_constant,
                    });
                    if matches!(spec.kind, SurfaceKind::Reflecting) {
                        sense = -sense;
                    }
                }
            }

            let e_z = rot.row(2);
            origin += e_z * (sense * spec.thickness);
        }

        surfaces
    }

    /// Selects the aperture stop. First matching rule wins.
    fn select_stop(specs: &[SurfaceSpec], recorded: &[usize]) -> usize {
        let candidates: Vec<usize> = recorded
            .iter()
            .copied()
            .filter(|&i| !matches!(specs[i].kind, SurfaceKind::Image))
            .collect();

        // 1. An explicit stop row.
        if let Some(&i) = candidates
            .iter()
            .find(|&&i| matches!(specs[i].kind, SurfaceKind::Stop))
        {
            return i;
        }

        // 2. A comment marking the stop.
        if let Some(&i) = candidates.iter().find(|&&i| {
            let comment = specs[i].comment.to_lowercase();
            comment.contains("stop") || comment.contains("aperture") || comment.contains("絞り")
        }) {
            return i;
        }

        // 3. The legacy type marker.
        if let Some(&i) = candidates.iter().find(|&&i| specs[i].legacy_stop) {
            return i;
        }

        // 4. The infinite-aperture sentinel.
        if let Some(&i) = candidates
            .iter()
            .find(|&&i| specs[i].semi_diameter == INFINITE_APERTURE)
        {
            return i;
        }

        // 5. The strictly smallest positive semi-diameter.
        let smallest = candidates
            .iter()
            .copied()
            .filter(|&i| {
                let sd = specs[i].semi_diameter;
                sd.is_finite() && sd > 0.0 && sd < INFINITE_APERTURE
            })
            .min_by(|&a, &b| {
                specs[a]
                    .semi_diameter
                    .total_cmp(&specs[b].semi_diameter)
            });
        if let Some(i) = smallest {
            return i;
        }

        // No rule matched; fall back to the middle of the table.
        let fallback = Self::nearest_in(recorded, specs.len() / 2);
        warn!(
            index = fallback,
            "no aperture stop identified; falling back to the middle of the table"
        );
        fallback
    }

    /// The evaluation surface: the last image-kind recorded surface, else the
    /// last recorded surface.
    fn select_eval(specs: &[SurfaceSpec], recorded: &[usize]) -> usize {
        recorded
            .iter()
            .copied()
            .filter(|&i| matches!(specs[i].kind, SurfaceKind::Image))
            .next_back()
            .unwrap_or_else(|| {
                *recorded
                    .last()
                    .expect("There is always at least one recorded surface.")
            })
    }

    fn nearest_recorded(&self, target: usize) -> usize {
        Self::nearest_in(&self.recorded, target)
    }

    fn nearest_in(recorded: &[usize], target: usize) -> usize {
        recorded
            .iter()
            .copied()
            .min_by_key(|&i| i.abs_diff(target))
            .expect("There is always at least one recorded surface.")
    }
}
