/// Refractive-index resolution for surface materials.
use crate::core::Float;
use crate::specs::surfaces::{MaterialSpec, SurfaceSpec};

/// A source of refractive indices for named materials.
///
/// This is a trait so that different material databases may be implemented;
/// the engine itself ships none.
pub trait GlassCatalog {
    /// The real refractive index of a named material at a wavelength in µm,
    /// or None when the material is unknown.
    fn refractive_index(&self, name: &str, wavelength_um: Float) -> Option<Float>;
}

/// A catalog with a single, wavelength-independent entry. Useful for tests.
#[derive(Debug, Clone)]
pub struct ConstantCatalog {
    pub name: String,
    pub n: Float,
}

impl GlassCatalog for ConstantCatalog {
    fn refractive_index(&self, name: &str, _wavelength_um: Float) -> Option<Float> {
        (name == self.name).then_some(self.n)
    }
}

/// Resolves the refractive index of the medium following a surface.
///
/// Priority: catalog lookup, then the manual index field, then 1.0.
pub(crate) fn resolve_index(
    spec: &SurfaceSpec,
    catalog: Option<&dyn GlassCatalog>,
    wavelength_um: Float,
) -> Float {
    match &spec.material {
        MaterialSpec::Air => 1.0,
        MaterialSpec::Manual(n) => *n,
        MaterialSpec::Named(name) => catalog
            .and_then(|c| c.refractive_index(name, wavelength_um))
            .unwrap_or(1.0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolution_priority() {
        let catalog = ConstantCatalog {
            name: "N-BK7".to_string(),
            n: 1.5168,
        };

        let named = SurfaceSpec {
            material: MaterialSpec::Named("N-BK7".to_string()),
            ..SurfaceSpec::default()
        };
        assert_eq!(resolve_index(&named, Some(&catalog), 0.5876), 1.5168);

        // Unknown names fall through to 1.0.
        let unknown = SurfaceSpec {
            material: MaterialSpec::Named("UNOBTANIUM".to_string()),
            ..SurfaceSpec::default()
        };
        assert_eq!(resolve_index(&unknown, Some(&catalog), 0.5876), 1.0);

        let manual = SurfaceSpec {
            material: MaterialSpec::Manual(1.7),
            ..SurfaceSpec::default()
        };
        assert_eq!(resolve_index(&manual, None, 0.5876), 1.7);

        let air = SurfaceSpec::default();
        assert_eq!(resolve_index(&air, Some(&catalog), 0.5876), 1.0);
    }
}
