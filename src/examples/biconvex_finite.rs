//! A biconvex singlet imaging a finite object near unit magnification.
use crate::{MaterialSpec, SurfaceSpec, WavefrontCalculator};

pub const WAVELENGTH: f64 = 0.5876;

pub fn surfaces() -> Vec<SurfaceSpec> {
    vec![
        SurfaceSpec::object(100.0),
        SurfaceSpec::stop(1.5, 2.0),
        SurfaceSpec::conic(12.5, 51.7, 0.0, 6.0, MaterialSpec::Manual(1.515)),
        SurfaceSpec::conic(12.5, -51.7, 0.0, 93.0, MaterialSpec::Air),
        SurfaceSpec::image(),
    ]
}

pub fn calculator() -> WavefrontCalculator {
    WavefrontCalculator::new(surfaces(), WAVELENGTH)
        .expect("The biconvex example must be valid.")
}
