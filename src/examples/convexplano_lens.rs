//! A stopped-down f = 50 mm convexplano lens with the object at infinity.
use crate::{MaterialSpec, SurfaceSpec, WavefrontCalculator};

/// The d line, in µm.
pub const WAVELENGTH: f64 = 0.5876;

pub fn surfaces() -> Vec<SurfaceSpec> {
    vec![
        SurfaceSpec::object(f64::INFINITY),
        SurfaceSpec::stop(1.5, 2.0),
        SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
        SurfaceSpec::conic(12.5, f64::INFINITY, 0.0, 46.6, MaterialSpec::Air),
        SurfaceSpec::image(),
    ]
}

pub fn calculator() -> WavefrontCalculator {
    WavefrontCalculator::new(surfaces(), WAVELENGTH)
        .expect("The convexplano example must be valid.")
}
