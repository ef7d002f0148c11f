//! Failure taxonomy, cancellation, and the last-ray diagnostic record.
use std::fmt;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::core::Float;
use crate::specs::surfaces::SurfaceKind;
use crate::trace::Ray;
use crate::wavefront::PupilMode;

/// The coarse class of a per-sample failure, used for histogram counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    StopUnreachable,
    StopMiss,
    EvalUnreachable,
    Numeric,
}

/// Why a single pupil sample produced no OPD value.
///
/// These are ordinary values, not errors: the orchestrator aggregates them
/// and only escalates when no sample at all is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RayFailure {
    /// No traced ray reached the stop plane.
    StopUnreachable,
    /// The solved ray crossed the stop plane too far from the requested
    /// pupil point.
    StopMiss { err_mm: Float, tol_mm: Float },
    /// The ray hit the stop but was blocked before the evaluation surface.
    EvalUnreachable {
        surface_index: Option<usize>,
        surface_kind: Option<SurfaceKind>,
    },
    /// A non-finite intermediate or a singular Jacobian.
    Numeric,
}

impl RayFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            RayFailure::StopUnreachable => FailureKind::StopUnreachable,
            RayFailure::StopMiss { .. } => FailureKind::StopMiss,
            RayFailure::EvalUnreachable { .. } => FailureKind::EvalUnreachable,
            RayFailure::Numeric => FailureKind::Numeric,
        }
    }
}

impl fmt::Display for RayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RayFailure::StopUnreachable => write!(f, "no ray reached the stop plane"),
            RayFailure::StopMiss { err_mm, tol_mm } => write!(
                f,
                "stop missed by {err_mm:.4} mm (tolerance {tol_mm:.4} mm)"
            ),
            RayFailure::EvalUnreachable {
                surface_index: Some(index),
                surface_kind: Some(kind),
            } => write!(
                f,
                "ray blocked before the evaluation surface at surface {index} ({kind:?})"
            ),
            RayFailure::EvalUnreachable { .. } => {
                write!(f, "ray blocked before the evaluation surface")
            }
            RayFailure::Numeric => write!(f, "numerical failure in the ray solve"),
        }
    }
}

/// A value record of the most recent single-ray calculation.
///
/// Owned by the calculator and handed out by clone so that consumers never
/// hold references into solver internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRayCalculation {
    pub pupil: (Float, Float),
    pub pupil_mode: PupilMode,
    pub ray: Option<Ray>,
    pub success: bool,
    pub failure: Option<RayFailure>,
    /// Residual distance from the requested stop-local target, in mm.
    pub stop_error_mm: Option<Float>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// A cooperative cancellation token.
///
/// The token is observed at documented checkpoints; tripping it makes the
/// orchestrator return a [Cancelled] error carrying the reason.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(reason.into());
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// The cancellation signal propagated out of a cancelled calculation.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub reason: String,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calculation cancelled: {}", self.reason)
    }
}

impl std::error::Error for Cancelled {}
