/// Data types and numerics shared across the wavefront engine.
pub(crate) mod math;
pub(crate) mod refractive_index;
pub(crate) mod sequential_model;

pub(crate) type Float = f64;

pub(crate) const EPSILON: Float = Float::EPSILON;
pub(crate) const PI: Float = std::f64::consts::PI;

/// Sentinel semi-diameter used by legacy tables to mark the aperture stop.
pub(crate) const INFINITE_APERTURE: Float = 1.0e10;

/// Millimeters to micrometers.
pub(crate) const MM_TO_UM: Float = 1.0e3;
