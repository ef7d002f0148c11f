//! Wavefront aberration analysis.
//!
//! The [WavefrontCalculator] owns a sequential model and computes, for a
//! given field point, the optical path difference between marginal rays and
//! a reference ray across the pupil, a Zernike decomposition of the
//! resulting map, and derived statistics.
pub(crate) mod chief_ray;
pub(crate) mod diagnostics;
pub(crate) mod map;
pub(crate) mod marginal_ray;
pub(crate) mod opl;
pub(crate) mod pupil;
pub(crate) mod reference;
pub(crate) mod stats;
pub(crate) mod zernike;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::{
    Float,
    math::vec3::Vec3,
    refractive_index::GlassCatalog,
    sequential_model::SequentialModel,
};
use crate::specs::{
    fields::{Field, FieldKey},
    surfaces::SurfaceSpec,
};
use crate::trace::{Ray, RayPath, TraceOptions, trace};

use diagnostics::{LastRayCalculation, RayFailure};
use opl::MediaTable;
use pupil::EntranceConfig;
use reference::ReferenceRay;

/// Environment override for the infinite-field pupil sampling mode, read
/// once at calculator construction.
const FORCED_MODE_ENV: &str = "WAVEFRONT_FORCED_PUPIL_MODE";

/// Aperture slack applied at the stop surface when tracing accepted rays to
/// the evaluation surface, so that rays within the stop-miss tolerance are
/// not clipped by the knife edge of the stop itself.
pub(crate) const STOP_APERTURE_SLACK_MM: Float = 0.3;

/// How pupil coordinates are mapped to rays for infinite fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PupilMode {
    /// Rays are solved to hit stop-local targets; the physical default.
    Stop,
    /// Best-effort sampling on an entrance plane when the stop cannot be
    /// reached for this field.
    Entrance,
}

/// How the OPD of a sample is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpdMode {
    /// OPL difference against the reference ray.
    #[default]
    Simple,
    /// OPD against the reference sphere through the chief-ray image point.
    ReferenceSphere,
}

/// The reference surface actually used for a map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReferenceSurface {
    Sphere { radius_mm: Float },
    /// Plane-wave reference; `fell_back` marks the near-afocal or
    /// huge-correction fallback from reference-sphere mode.
    PlaneWave { fell_back: bool },
}

/// The layout of pupil samples in a wavefront map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GridPattern {
    #[default]
    Circular,
    Rectangular,
}

/// Display transform applied to rendered OPD values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayMode {
    #[default]
    Default,
    PistonTiltRemoved,
}

/// Computes wavefront aberrations of a sequential optical system.
///
/// The calculator owns immutable surface-table geometry and mutable
/// per-field caches (chief rays, the reference ray, entrance-pupil
/// configurations, stop-center overrides, and the medium table). Caches are
/// mutated only during solve calls; the type is deliberately not Sync, and
/// one instance must not be shared across threads without external
/// serialization.
pub struct WavefrontCalculator {
    model: SequentialModel,
    wavelength_um: Float,
    catalog: Option<Box<dyn GlassCatalog>>,
    env_forced_mode: Option<PupilMode>,

    pupil_mode: Cell<PupilMode>,
    entrance_scale_override: Cell<Option<Float>>,
    chief_rays: RefCell<HashMap<FieldKey, Ray>>,
    stop_center_overrides: RefCell<HashMap<FieldKey, Vec3>>,
    entrance_configs: RefCell<HashMap<FieldKey, EntranceConfig>>,
    reference: RefCell<Option<ReferenceRay>>,
    media_cache: RefCell<Option<MediaTable>>,
    last_calc: RefCell<Option<LastRayCalculation>>,
}

impl WavefrontCalculator {
    /// Creates a calculator for a surface table at a wavelength in µm.
    pub fn new(specs: Vec<SurfaceSpec>, wavelength_um: Float) -> Result<Self> {
        if !wavelength_um.is_finite() || wavelength_um <= 0.0 {
            return Err(anyhow!("The wavelength must be a positive number of µm."));
        }
        let model = SequentialModel::new(specs)?;

        let env_forced_mode = match std::env::var(FORCED_MODE_ENV).as_deref() {
            Ok("stop") => Some(PupilMode::Stop),
            Ok("entrance") => Some(PupilMode::Entrance),
            _ => None,
        };

        Ok(Self {
            model,
            wavelength_um,
            catalog: None,
            env_forced_mode,
            pupil_mode: Cell::new(env_forced_mode.unwrap_or(PupilMode::Stop)),
            entrance_scale_override: Cell::new(None),
            chief_rays: RefCell::new(HashMap::new()),
            stop_center_overrides: RefCell::new(HashMap::new()),
            entrance_configs: RefCell::new(HashMap::new()),
            reference: RefCell::new(None),
            media_cache: RefCell::new(None),
            last_calc: RefCell::new(None),
        })
    }

    /// Attaches a glass catalog for named-material lookups.
    pub fn with_catalog(mut self, catalog: Box<dyn GlassCatalog>) -> Self {
        self.catalog = Some(catalog);
        self.media_cache.replace(None);
        self
    }

    pub fn model(&self) -> &SequentialModel {
        &self.model
    }

    pub fn wavelength_um(&self) -> Float {
        self.wavelength_um
    }

    /// The pupil sampling mode currently in effect for infinite fields.
    pub fn pupil_mode(&self) -> PupilMode {
        self.pupil_mode.get()
    }

    /// A clone of the most recent single-ray diagnostic record.
    pub fn last_ray_calculation(&self) -> Option<LastRayCalculation> {
        self.last_calc.borrow().clone()
    }

    /// The forced pupil mode: an explicit option wins over the environment
    /// override.
    pub(crate) fn forced_mode(&self, from_options: Option<PupilMode>) -> Option<PupilMode> {
        from_options.or(self.env_forced_mode)
    }

    /// Switches the pupil mode, clearing every per-field cache.
    pub(crate) fn set_pupil_mode(&self, mode: PupilMode) {
        if self.pupil_mode.get() != mode {
            tracing::debug!(?mode, "switching infinite pupil sampling mode");
            self.pupil_mode.set(mode);
            self.clear_field_caches();
        }
    }

    /// Overrides the mm-per-unit-pupil scale of entrance-mode sampling.
    ///
    /// By default the designed stop radius is used, never the effective
    /// entrance radius, so that the pupil scale stays consistent across
    /// fields. Changing the override invalidates cached entrance
    /// configurations.
    pub(crate) fn set_entrance_scale_override(&self, scale: Option<Float>) {
        if self.entrance_scale_override.get() != scale {
            self.entrance_scale_override.set(scale);
            self.entrance_configs.borrow_mut().clear();
        }
    }

    pub(crate) fn clear_field_caches(&self) {
        self.chief_rays.borrow_mut().clear();
        self.stop_center_overrides.borrow_mut().clear();
        self.entrance_configs.borrow_mut().clear();
        self.reference.replace(None);
    }

    pub(crate) fn record_last(&self, record: LastRayCalculation) {
        self.last_calc.replace(Some(record));
    }

    pub(crate) fn record_failure(&self, px: Float, py: Float, failure: RayFailure) {
        self.record_last(LastRayCalculation {
            pupil: (px, py),
            pupil_mode: self.pupil_mode.get(),
            ray: None,
            success: false,
            stop_error_mm: match &failure {
                RayFailure::StopMiss { err_mm, .. } => Some(*err_mm),
                _ => None,
            },
            failure: Some(failure),
        });
    }

    /// Whether pupil sampling for this field uses the infinite-object path.
    ///
    /// Height fields degrade to the infinite path when the object sits at
    /// infinity, since no finite object point exists.
    pub(crate) fn field_is_infinite(&self, field: &Field) -> bool {
        field.is_infinite() || !self.model.object_thickness().is_finite()
    }

    /// The object point of a finite field, in global coordinates.
    pub(crate) fn object_point(&self, field: &Field) -> Option<Vec3> {
        match field {
            Field::Height { x, y } => {
                let t_obj = self.model.object_thickness();
                t_obj.is_finite().then(|| Vec3::new(*x, *y, -t_obj))
            }
            Field::Angle { .. } => None,
        }
    }

    /// The launch direction of an infinite field.
    pub(crate) fn field_direction(&self, field: &Field) -> Vec3 {
        let (ax, ay) = match field {
            Field::Angle { x, y } => (x.to_radians(), y.to_radians()),
            Field::Height { .. } => (0.0, 0.0),
        };
        Vec3::new(
            ax.sin() * ay.cos(),
            ay.sin() * ax.cos(),
            ax.cos() * ay.cos(),
        )
        .normalize()
    }

    /// The stop-plane center used as the pupil origin for a field,
    /// accounting for any cached stop-center override.
    pub(crate) fn stop_center_for(&self, key: &FieldKey) -> Vec3 {
        self.stop_center_overrides
            .borrow()
            .get(key)
            .copied()
            .unwrap_or_else(|| self.model.stop_surface().origin())
    }

    pub(crate) fn stop_axes(&self) -> (Vec3, Vec3, Vec3) {
        self.model.stop_surface().axes()
    }

    /// Signed stop-local coordinates of a global point relative to a target
    /// on the stop plane.
    pub(crate) fn stop_local_error(&self, point: Vec3, target: Vec3) -> (Float, Float) {
        let (e_x, e_y, _) = self.stop_axes();
        let delta = point - target;
        (delta.dot(e_x), delta.dot(e_y))
    }

    /// Traces a ray to the stop plane, without clipping at the stop itself
    /// so that the miss distance can be measured.
    pub(crate) fn trace_to_stop(&self, ray: &Ray) -> RayPath {
        let stop_point = self
            .model
            .point_index_of(self.model.stop_index())
            .unwrap_or(1);
        let media = self.media();
        trace(
            &self.model,
            media.segment_indices(),
            ray,
            TraceOptions {
                max_point: stop_point,
                clip_last: false,
                stop_slack: 0.0,
            },
        )
    }

    /// The stop-plane intersection of a ray, if the trace reaches it.
    pub(crate) fn stop_intersection(&self, ray: &Ray) -> Option<Vec3> {
        let stop_point = self
            .model
            .point_index_of(self.model.stop_index())
            .unwrap_or(1);
        self.trace_to_stop(ray).point(stop_point)
    }

    /// Traces a ray through every recorded surface.
    pub(crate) fn trace_to_eval(&self, ray: &Ray) -> RayPath {
        let media = self.media();
        trace(
            &self.model,
            media.segment_indices(),
            ray,
            TraceOptions {
                max_point: self.model.recorded_surfaces().len(),
                clip_last: true,
                stop_slack: STOP_APERTURE_SLACK_MM,
            },
        )
    }

    /// Whether a full path reached every recorded surface.
    pub(crate) fn path_is_complete(&self, path: &RayPath) -> bool {
        path.points().len() == self.model.recorded_surfaces().len() + 1
    }
}

impl std::fmt::Debug for WavefrontCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavefrontCalculator")
            .field("wavelength_um", &self.wavelength_um)
            .field("pupil_mode", &self.pupil_mode.get())
            .field("num_surfaces", &self.model.specs().len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};

    fn singlet() -> WavefrontCalculator {
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

    #[test]
    fn test_new_rejects_bad_wavelength() {
        assert!(WavefrontCalculator::new(vec![SurfaceSpec::object(1.0)], 0.0).is_err());
        assert!(
            WavefrontCalculator::new(vec![SurfaceSpec::object(1.0)], Float::NAN).is_err()
        );
    }

    #[test]
    fn test_field_direction_on_axis() {
        let calc = singlet();
        let dir = calc.field_direction(&Field::on_axis());

        assert_abs_diff_eq!(dir.m(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_field_direction_oblique() {
        let calc = singlet();
        let dir = calc.field_direction(&Field::Angle { x: 0.0, y: 5.0 });

        assert_abs_diff_eq!(dir.l(), (5.0 as Float).to_radians().sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(dir.length(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_object_point_finite_only() {
        let calc = singlet();
        assert!(calc.object_point(&Field::Height { x: 1.0, y: 2.0 }).is_none());

        let finite = WavefrontCalculator::new(
            vec![
                SurfaceSpec::object(100.0),
                SurfaceSpec::stop(2.0, 10.0),
                SurfaceSpec::image(),
            ],
            0.5876,
        )
        .unwrap();
        let obj = finite
            .object_point(&Field::Height { x: 1.0, y: 2.0 })
            .unwrap();
        assert_abs_diff_eq!(obj.z(), -100.0);
        assert_abs_diff_eq!(obj.x(), 1.0);
    }

    #[test]
    fn test_mode_switch_clears_caches() {
        let calc = singlet();
        calc.chief_rays.borrow_mut().insert(
            Field::on_axis().key(),
            Ray::new(Vec3::zero(), Vec3::new(0.0, 0.0, 1.0)).unwrap(),
        );

        calc.set_pupil_mode(PupilMode::Entrance);

        assert!(calc.chief_rays.borrow().is_empty());
        assert_eq!(calc.pupil_mode(), PupilMode::Entrance);
    }
}
