use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::Float;

/// Specifies an object field point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Field {
    /// Field angles with respect to the optical axis, in degrees.
    ///
    /// An angular field implies an object at infinity.
    Angle { x: Float, y: Float },

    /// The x, y position of the object field point in mm.
    ///
    /// (0, 0) corresponds to the optical axis.
    Height { x: Float, y: Float },
}

/// A canonical cache key for per-field state.
///
/// Field coordinates are keyed by their bit patterns so that caches are
/// invalidated exactly when the field setting changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FieldKey {
    kind: u8,
    a: u64,
    b: u64,
}

impl Field {
    pub fn on_axis() -> Self {
        Self::Angle { x: 0.0, y: 0.0 }
    }

    /// Whether this field implies an object at infinity.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Field::Angle { .. })
    }

    /// The largest absolute field coordinate, in the field's own units.
    pub fn max_abs(&self) -> Float {
        match self {
            Field::Angle { x, y } | Field::Height { x, y } => Float::max(x.abs(), y.abs()),
        }
    }

    /// Validate the field specification.
    pub fn validate(&self) -> Result<()> {
        match self {
            Field::Angle { x, y } => {
                if x.is_nan() || y.is_nan() {
                    anyhow::bail!("Field angles must be numbers");
                }
                if x.abs() > 90.0 || y.abs() > 90.0 {
                    anyhow::bail!("Field angles must be in the range [-90, 90] degrees");
                }
            }
            Field::Height { x, y } => {
                if x.is_nan() || y.is_nan() {
                    anyhow::bail!("Field heights must be numbers");
                }
                if x.is_infinite() || y.is_infinite() {
                    anyhow::bail!("Field heights must be finite");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn key(&self) -> FieldKey {
        match self {
            Field::Angle { x, y } => FieldKey {
                kind: 0,
                a: x.to_bits(),
                b: y.to_bits(),
            },
            Field::Height { x, y } => FieldKey {
                kind: 1,
                a: x.to_bits(),
                b: y.to_bits(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_field_validate() {
        assert!(Field::Angle { x: 5.0, y: 0.0 }.validate().is_ok());
        assert!(Field::Angle { x: 95.0, y: 0.0 }.validate().is_err());
        assert!(
            Field::Angle {
                x: Float::NAN,
                y: 0.0
            }
            .validate()
            .is_err()
        );
        assert!(Field::Height { x: 0.0, y: 1.0 }.validate().is_ok());
        assert!(
            Field::Height {
                x: Float::INFINITY,
                y: 0.0
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_field_key_distinguishes_kinds() {
        let angle = Field::Angle { x: 1.0, y: 2.0 };
        let height = Field::Height { x: 1.0, y: 2.0 };

        assert_ne!(angle.key(), height.key());
        assert_eq!(angle.key(), Field::Angle { x: 1.0, y: 2.0 }.key());
    }

    #[test]
    fn test_angular_fields_are_infinite() {
        assert!(Field::on_axis().is_infinite());
        assert!(!Field::Height { x: 0.0, y: 0.0 }.is_infinite());
    }
}
