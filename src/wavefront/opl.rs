//! Optical path length along a traced ray.
use crate::core::{
    Float, MM_TO_UM, refractive_index::resolve_index, sequential_model::SequentialModel,
};
use crate::specs::surfaces::SurfaceKind;
use crate::trace::RayPath;
use crate::wavefront::WavefrontCalculator;

/// Cache key for the per-segment medium table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MediaKey {
    wavelength_bits: u64,
    num_surfaces: usize,
    num_recorded: usize,
    stop_index: usize,
    eval_index: usize,
}

/// Refractive indices of the media between consecutive ray-path points.
#[derive(Debug, Clone)]
pub(crate) struct MediaTable {
    key: MediaKey,
    segment_indices: Vec<Float>,
}

impl MediaTable {
    pub fn segment_indices(&self) -> &[Float] {
        &self.segment_indices
    }
}

pub(crate) fn media_key(model: &SequentialModel, wavelength_um: Float) -> MediaKey {
    MediaKey {
        wavelength_bits: wavelength_um.to_bits(),
        num_surfaces: model.specs().len(),
        num_recorded: model.recorded_surfaces().len(),
        stop_index: model.stop_index(),
        eval_index: model.eval_index(),
    }
}

/// Builds the per-segment medium table.
///
/// Segment 0 uses the object-space index; segment k (k >= 1) uses the medium
/// following recorded surface k - 1. Mirrors carry the previous medium.
pub(crate) fn build_media_table(
    model: &SequentialModel,
    catalog: Option<&dyn crate::GlassCatalog>,
    wavelength_um: Float,
) -> MediaTable {
    let specs = model.specs();
    let mut segment_indices = Vec::with_capacity(model.recorded_surfaces().len() + 1);

    segment_indices.push(resolve_index(&specs[0], catalog, wavelength_um));

    for &row in model.recorded_surfaces() {
        let n = if matches!(specs[row].kind, SurfaceKind::Reflecting) {
            *segment_indices
                .last()
                .expect("The object-space index is always present.")
        } else {
            resolve_index(&specs[row], catalog, wavelength_um)
        };
        segment_indices.push(n);
    }

    MediaTable {
        key: media_key(model, wavelength_um),
        segment_indices,
    }
}

/// Computes the optical path length of a full ray path, in µm.
///
/// Returns NaN for incomplete paths, non-finite intermediates, or segments
/// longer than five times the total system thickness. Accumulation begins at
/// `start_point`: 0 for finite systems, the stop-plane point for infinite
/// systems so that the arbitrary entrance plane does not dominate the OPD.
pub(crate) fn optical_path(
    path: &RayPath,
    media: &MediaTable,
    expected_points: usize,
    start_point: usize,
    max_segment_mm: Float,
) -> Float {
    let points = path.points();
    if points.len() < expected_points {
        return Float::NAN;
    }

    let mut opl_um = 0.0;
    for i in start_point..expected_points - 1 {
        let d_mm = (points[i + 1] - points[i]).length();
        if !d_mm.is_finite() || d_mm > max_segment_mm {
            return Float::NAN;
        }
        let n = media.segment_indices[i.min(media.segment_indices.len() - 1)];
        opl_um += n * d_mm * MM_TO_UM;
    }

    if opl_um.is_finite() { opl_um } else { Float::NAN }
}

impl WavefrontCalculator {
    /// The medium table for the current wavelength, rebuilt when the key no
    /// longer matches.
    pub(crate) fn media(&self) -> MediaTable {
        let key = media_key(self.model(), self.wavelength_um());
        {
            let cache = self.media_cache.borrow();
            if let Some(table) = cache.as_ref() {
                if table.key == key {
                    return table.clone();
                }
            }
        }
        let table = build_media_table(
            self.model(),
            self.catalog.as_deref(),
            self.wavelength_um(),
        );
        *self.media_cache.borrow_mut() = Some(table.clone());
        table
    }

    /// Maximum believable segment length: five times the total thickness.
    pub(crate) fn max_segment_mm(&self) -> Float {
        5.0 * self.model().sum_thickness().max(1.0)
    }

    /// OPL of a path to the evaluation surface, in µm.
    pub(crate) fn path_opl_um(&self, path: &RayPath, infinite: bool) -> Float {
        let model = self.model();
        let expected = model.recorded_surfaces().len() + 1;
        let start = if infinite {
            model
                .point_index_of(model.stop_index())
                .unwrap_or(0)
        } else {
            0
        };
        optical_path(path, &self.media(), expected, start, self.max_segment_mm())
    }
}
