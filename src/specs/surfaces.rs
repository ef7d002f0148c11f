use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::Float;

/// Specifies the role of a row in the surface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceKind {
    Object,
    Refracting,
    Reflecting,
    /// Applies a decenter and tilt to all following surfaces; never
    /// intersected by rays and never recorded in a ray path.
    CoordBreak,
    Stop,
    Image,
}

/// Specifies the medium following a surface.
///
/// Named materials are resolved through a [GlassCatalog](crate::GlassCatalog);
/// manual indices bypass the catalog; everything else is air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum MaterialSpec {
    #[default]
    Air,
    Manual(Float),
    Named(String),
}

/// Specifies a single row of a sequential surface table.
///
/// Rows are uniform: every surface carries the full set of fields and the
/// `kind` selects which ones are meaningful. Decenter and tilt apply to
/// coord-break rows only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSpec {
    pub kind: SurfaceKind,
    pub radius_of_curvature: Float,
    pub conic_constant: Float,
    pub semi_diameter: Float,
    /// Distance to the next surface along the local optical axis, in mm.
    pub thickness: Float,
    pub material: MaterialSpec,
    /// Transverse decenter (x, y) in mm, coord-break rows only.
    pub decenter: [Float; 2],
    /// Tilt about (x, y, z) in degrees, coord-break rows only.
    pub tilt: [Float; 3],
    /// Legacy stop marker carried over from imported tables.
    pub legacy_stop: bool,
    pub comment: String,
}

impl Default for SurfaceSpec {
    fn default() -> Self {
        Self {
            kind: SurfaceKind::Refracting,
            radius_of_curvature: Float::INFINITY,
            conic_constant: 0.0,
            semi_diameter: Float::INFINITY,
            thickness: 0.0,
            material: MaterialSpec::Air,
            decenter: [0.0; 2],
            tilt: [0.0; 3],
            legacy_stop: false,
            comment: String::new(),
        }
    }
}

impl SurfaceSpec {
    /// An object surface a distance `thickness` before the first physical
    /// surface. Use an infinite thickness for objects at infinity.
    pub fn object(thickness: Float) -> Self {
        Self {
            kind: SurfaceKind::Object,
            thickness,
            ..Self::default()
        }
    }

    pub fn conic(
        semi_diameter: Float,
        radius_of_curvature: Float,
        conic_constant: Float,
        thickness: Float,
        material: MaterialSpec,
    ) -> Self {
        Self {
            kind: SurfaceKind::Refracting,
            semi_diameter,
            radius_of_curvature,
            conic_constant,
            thickness,
            material,
            ..Self::default()
        }
    }

    pub fn mirror(
        semi_diameter: Float,
        radius_of_curvature: Float,
        conic_constant: Float,
        thickness: Float,
    ) -> Self {
        Self {
            kind: SurfaceKind::Reflecting,
            semi_diameter,
            radius_of_curvature,
            conic_constant,
            thickness,
            ..Self::default()
        }
    }

    pub fn stop(semi_diameter: Float, thickness: Float) -> Self {
        Self {
            kind: SurfaceKind::Stop,
            semi_diameter,
            thickness,
            ..Self::default()
        }
    }

    pub fn coord_break(decenter: [Float; 2], tilt: [Float; 3], thickness: Float) -> Self {
        Self {
            kind: SurfaceKind::CoordBreak,
            decenter,
            tilt,
            thickness,
            ..Self::default()
        }
    }

    pub fn image() -> Self {
        Self {
            kind: SurfaceKind::Image,
            ..Self::default()
        }
    }

    /// Whether rays physically intersect this surface.
    pub fn is_physical(&self) -> bool {
        !matches!(self.kind, SurfaceKind::Object | SurfaceKind::CoordBreak)
    }

    /// Validate the surface specification.
    pub fn validate(&self) -> Result<()> {
        if self.radius_of_curvature.is_nan() {
            anyhow::bail!("Surface radius of curvature must be a number");
        }
        if self.semi_diameter.is_nan() || self.semi_diameter < 0.0 {
            anyhow::bail!("Surface semi-diameter must be a non-negative number");
        }
        if self.thickness.is_nan() {
            anyhow::bail!("Surface thickness must be a number");
        }
        if !matches!(self.kind, SurfaceKind::Object) && self.thickness.is_infinite() {
            anyhow::bail!("Only the object surface may have an infinite thickness");
        }
        Ok(())
    }
}
