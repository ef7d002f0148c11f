//! Wavefront aberration analysis for sequential optical systems.
//!
//! The core structure is the [WavefrontCalculator](struct@WavefrontCalculator),
//! which owns a [SequentialModel](struct@SequentialModel) built from a table
//! of [SurfaceSpec](struct@SurfaceSpec) rows. For a field point it computes,
//! per pupil sample, the optical path difference (OPD) between a marginal
//! ray solved onto the aperture stop and a reference ray, assembles the
//! samples into a [WavefrontMap](struct@WavefrontMap), fits an orthonormal
//! Zernike model, and reports statistics.
//!
//! Pupil sampling for fields at infinity normally targets the stop plane
//! directly; when a field is so heavily vignetted that no ray reaches the
//! stop center, sampling restarts in a best-effort entrance-pupil mode.
//! Per-sample failures never abort a map; they are counted in an
//! invalid-reason histogram and the affected cells are masked.
//!
//! # Quick Start
//! ```rust
//! use wavefront_rs::{
//!     Field, GridPattern, MapOptions, MaterialSpec, SurfaceSpec, WavefrontCalculator,
//! };
//!
//! // A stopped-down f = 50 mm convexplano lens with the object at infinity.
//! let surfaces = vec![
//!     SurfaceSpec::object(f64::INFINITY),
//!     SurfaceSpec::stop(1.5, 2.0),
//!     SurfaceSpec::conic(12.5, 25.8, 0.0, 5.3, MaterialSpec::Manual(1.515)),
//!     SurfaceSpec::conic(12.5, f64::INFINITY, 0.0, 46.6, MaterialSpec::Air),
//!     SurfaceSpec::image(),
//! ];
//!
//! // Analyze at the d line.
//! let calculator = WavefrontCalculator::new(surfaces, 0.5876).unwrap();
//!
//! let field = Field::Angle { x: 0.0, y: 1.0 };
//! let map = calculator
//!     .generate_wavefront_map(&field, 16, GridPattern::Circular, MapOptions::default())
//!     .unwrap();
//!
//! println!(
//!     "RMS wavefront error: {:.4} waves",
//!     map.report.primary.rms / map.metadata.wavelength_um
//! );
//! ```
mod core;
mod specs;
mod trace;
mod wavefront;

// API
pub mod examples;
pub use core::{
    math::vec3::Vec3,
    refractive_index::{ConstantCatalog, GlassCatalog},
    sequential_model::SequentialModel,
};
pub use specs::{
    fields::Field,
    surfaces::{MaterialSpec, SurfaceKind, SurfaceSpec},
};
pub use trace::{Ray, RayPath, Termination, TerminationReason};
pub use wavefront::{
    DisplayMode, GridPattern, OpdMode, PupilMode, ReferenceSurface, WavefrontCalculator,
    diagnostics::{CancelToken, Cancelled, FailureKind, LastRayCalculation, RayFailure},
    map::{MapMetadata, MapOptions, MapPhase, MapProgress, WavefrontMap},
    stats::{MapStatistics, WavefrontReport, plane_fit_removed, statistics},
    zernike::{
        LOW_ORDER_REMOVAL, ZernikeFit, ZernikeOptions, evaluate, evaluate_subset, osa_orders,
        zernike,
    },
};
