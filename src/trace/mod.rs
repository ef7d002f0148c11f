//! Sequential single-ray tracing.
//!
//! Rays are traced surface by surface with the technique of Spencer and
//! Murty, JOSA (1962): transform into the local frame of each recorded
//! surface, intersect by Newton-Raphson, test the clear aperture, redirect by
//! refraction or reflection, and transform back. Coord-break and object rows
//! contribute frame transforms only and never appear in the path.
mod ray;

pub use ray::Ray;

use serde::{Deserialize, Serialize};

use crate::core::{Float, math::vec3::Vec3, sequential_model::SequentialModel};
use crate::specs::surfaces::SurfaceKind;

const MAX_INTERSECTION_ITER: usize = 1000;

/// Why a trace ended before the requested surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    ApertureBlock,
    MissedSurface,
    TotalInternalReflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    /// Surface-table index of the terminating surface.
    pub surface_index: usize,
    pub surface_kind: SurfaceKind,
    pub reason: TerminationReason,
}

/// The intersection points of one ray with the recorded surfaces.
///
/// Point 0 is the launch position; point k (k >= 1) lies on recorded surface
/// k - 1. A path shorter than requested carries the termination that cut it
/// off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RayPath {
    points: Vec<Vec3>,
    termination: Option<Termination>,
}

impl RayPath {
    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Whether the path reached the given point index.
    pub fn reached(&self, point_index: usize) -> bool {
        self.points.len() > point_index
    }

    /// The path point at a given index, if reached.
    pub fn point(&self, point_index: usize) -> Option<Vec3> {
        self.points.get(point_index).copied()
    }
}

/// Options controlling a single trace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TraceOptions {
    /// Trace no further than this ray-path point index.
    pub max_point: usize,
    /// Apply the clear-aperture test at the final traced surface.
    pub clip_last: bool,
    /// Absolute slack in mm applied to the stop surface aperture test,
    /// so that rays accepted within the stop-miss tolerance are not clipped
    /// by the knife edge of the stop itself.
    pub stop_slack: Float,
}

impl TraceOptions {
    pub fn to_point(max_point: usize) -> Self {
        Self {
            max_point,
            clip_last: true,
            stop_slack: 0.0,
        }
    }
}

/// Traces a ray sequentially through the recorded surfaces.
///
/// `segment_indices[k]` is the refractive index of the medium between path
/// points k and k+1. The trace is deterministic given its inputs.
pub(crate) fn trace(
    model: &SequentialModel,
    segment_indices: &[Float],
    ray: &Ray,
    opts: TraceOptions,
) -> RayPath {
    let mut points = Vec::with_capacity(opts.max_point + 1);
    points.push(ray.pos());

    let mut current = *ray;
    let stop_point = model.point_index_of(model.stop_index());

    for (idx, surf) in model.surfaces().iter().enumerate() {
        let point_index = idx + 1;
        if point_index > opts.max_point {
            break;
        }

        let mut local = current.to_local(surf);

        let (pos, norm) = match local.intersect(surf, MAX_INTERSECTION_ITER) {
            Ok(res) => res,
            Err(_) => {
                return RayPath {
                    points,
                    termination: Some(Termination {
                        surface_index: surf.spec_index(),
                        surface_kind: surf.kind(),
                        reason: TerminationReason::MissedSurface,
                    }),
                };
            }
        };

        let is_last = point_index == opts.max_point;
        let slack = if Some(point_index) == stop_point {
            opts.stop_slack
        } else {
            0.0
        };
        if (!is_last || opts.clip_last) && surf.outside_clear_aperture(pos, slack) {
            return RayPath {
                points,
                termination: Some(Termination {
                    surface_index: surf.spec_index(),
                    surface_kind: surf.kind(),
                    reason: TerminationReason::ApertureBlock,
                }),
            };
        }

        local.displace(pos);

        let n_0 = segment_indices
            .get(point_index - 1)
            .copied()
            .unwrap_or(1.0);
        let n_1 = segment_indices
            .get(point_index)
            .copied()
            .unwrap_or(n_0);

        match surf.kind() {
            SurfaceKind::Refracting if n_0 != n_1 => {
                if !local.refract(norm, n_0, n_1) {
                    return RayPath {
                        points,
                        termination: Some(Termination {
                            surface_index: surf.spec_index(),
                            surface_kind: surf.kind(),
                            reason: TerminationReason::TotalInternalReflection,
                        }),
                    };
                }
            }
            SurfaceKind::Reflecting => local.reflect(norm),
            // Stops, images, and index-matched surfaces pass rays unchanged.
            _ => {}
        }

        current = local.to_global(surf);
        points.push(current.pos());
    }

    RayPath {
        points,
        termination: None,
    }
}
