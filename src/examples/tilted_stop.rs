//! The convexplano singlet with its stop tilted by a coord break.
//!
//! The stop plane is tilted about x and restored before the lens, so
//! stop-local residuals are measured against a rotated basis while the rest
//! of the system stays on axis.
use crate::{MaterialSpec, SurfaceSpec, WavefrontCalculator};

pub const WAVELENGTH: f64 = 0.5876;

pub fn surfaces(tilt_deg: f64) -> Vec<SurfaceSpec> {
    vec![
        SurfaceSpec::object(f64::INFINITY),
        SurfaceSpec::coord_break([0.0, 0.0], [tilt_deg, 0.0, 0.0], 0.0),
        SurfaceSpec::stop(1.5, 0.0),
        SurfaceSpec::coord_break([0.0, 0.0], [-tilt_deg, 0.0, 0.0], 2.0),
        SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
        SurfaceSpec::conic(12.5, f64::INFINITY, 0.0, 46.6, MaterialSpec::Air),
        SurfaceSpec::image(),
    ]
}

pub fn calculator(tilt_deg: f64) -> WavefrontCalculator {
    WavefrontCalculator::new(surfaces(tilt_deg), WAVELENGTH)
        .expect("The tilted-stop example must be valid.")
}
