use crate::enums::Orientation;

use glam::{DMat3, DVec3};
use ndarray::{Array3, ShapeError};
use rayon::prelude::*;

/// Integer structure id stored in a label volume. `0` is background.
pub type LabelId = u16;

/// A canonical scalar voxel grid.
///
/// Data is stored `[z, y, x]` in standard layout, so the flat buffer is
/// row-major with x varying fastest. Sizes are reported as `[x, y, z]`.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelVolume {
    data: Array3<f32>,
    spacing: DVec3,
    origin: DVec3,
    /// Columns are the physical directions of the x, y and z index axes.
    direction: Option<DMat3>,
    scalar_range: (f32, f32),
}

impl VoxelVolume {
    pub fn new(data: Array3<f32>) -> Self {
        let scalar_range = Self::compute_range(&data);
        Self {
            data,
            spacing: DVec3::ONE,
            origin: DVec3::ZERO,
            direction: Some(DMat3::IDENTITY),
            scalar_range,
        }
    }

    /// Build a volume from a flat x-fastest buffer of `size = [x, y, z]`.
    pub fn from_flat(size: [usize; 3], data: Vec<f32>) -> Result<Self, ShapeError> {
        let array = Array3::from_shape_vec((size[2], size[1], size[0]), data)?;
        Ok(Self::new(array))
    }

    pub fn with_spacing(mut self, spacing: DVec3) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_origin(mut self, origin: DVec3) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_direction(mut self, direction: Option<DMat3>) -> Self {
        self.direction = direction;
        self
    }

    /// Override the scalar range reported by the decoder.
    pub fn with_scalar_range(mut self, range: (f32, f32)) -> Self {
        if range.0.is_finite() && range.1.is_finite() && range.0 <= range.1 {
            self.scalar_range = range;
        }
        self
    }

    /// Grid size as `[x, y, z]`.
    pub fn size(&self) -> [usize; 3] {
        let (z, y, x) = self.data.dim();
        [x, y, z]
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> DVec3 {
        self.spacing
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn direction(&self) -> Option<DMat3> {
        self.direction
    }

    pub fn scalar_range(&self) -> (f32, f32) {
        self.scalar_range
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    /// Number of slices available for a plane.
    pub fn extent(&self, orientation: Orientation) -> usize {
        self.size()[orientation.normal_axis()]
    }

    /// Clamp an arbitrary requested index into `[0, extent - 1]`.
    pub fn clamp_index(&self, orientation: Orientation, index: i64) -> usize {
        let extent = self.extent(orientation);
        if extent == 0 {
            return 0;
        }
        index.clamp(0, extent as i64 - 1) as usize
    }

    /// Intensities rescaled to `[0, 1]` over the scalar range.
    pub fn normalized_intensities(&self) -> Array3<f32> {
        let (min, max) = self.scalar_range;
        let span = max - min;
        let mut out = self.data.clone();
        if span <= f32::EPSILON {
            out.fill(0.0);
            return out;
        }
        let inv_span = 1.0 / span;
        out.par_mapv_inplace(|v| ((v - min) * inv_span).clamp(0.0, 1.0));
        out
    }

    pub(crate) fn into_parts(self) -> (Array3<f32>, DVec3, DVec3, Option<DMat3>, (f32, f32)) {
        (
            self.data,
            self.spacing,
            self.origin,
            self.direction,
            self.scalar_range,
        )
    }

    pub(crate) fn from_parts(
        data: Array3<f32>,
        spacing: DVec3,
        origin: DVec3,
        direction: Option<DMat3>,
        scalar_range: (f32, f32),
    ) -> Self {
        Self {
            data,
            spacing,
            origin,
            direction,
            scalar_range,
        }
    }

    fn compute_range(data: &Array3<f32>) -> (f32, f32) {
        let slice = match data.as_slice() {
            Some(slice) => slice,
            None => return Self::compute_range(&data.as_standard_layout().to_owned()),
        };
        let (min, max) = slice
            .par_iter()
            .filter(|v| v.is_finite())
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), &v| (lo.min(v), hi.max(v)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );
        if min > max { (0.0, 0.0) } else { (min, max) }
    }
}

/// Integer label grid aligned to a base [`VoxelVolume`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelVolume {
    data: Array3<LabelId>,
}

impl LabelVolume {
    pub fn new(data: Array3<LabelId>) -> Self {
        Self { data }
    }

    pub fn from_flat(size: [usize; 3], data: Vec<LabelId>) -> Result<Self, ShapeError> {
        let array = Array3::from_shape_vec((size[2], size[1], size[0]), data)?;
        Ok(Self::new(array))
    }

    /// Convert a decoded scalar mask into label ids. Negative and
    /// non-finite values become background.
    pub fn from_scalars(volume: &VoxelVolume) -> Self {
        let data = volume.data().mapv(|v| {
            if v.is_finite() && v > 0.0 {
                v.round().min(LabelId::MAX as f32) as LabelId
            } else {
                0
            }
        });
        Self { data }
    }

    pub fn size(&self) -> [usize; 3] {
        let (z, y, x) = self.data.dim();
        [x, y, z]
    }

    pub fn data(&self) -> &Array3<LabelId> {
        &self.data
    }

    #[inline]
    pub fn label(&self, x: usize, y: usize, z: usize) -> LabelId {
        self.data[[z, y, x]]
    }

    /// Whether this mask can be overlaid on `base`.
    pub fn matches(&self, base: &VoxelVolume) -> bool {
        self.size() == base.size()
    }

    pub(crate) fn into_data(self) -> Array3<LabelId> {
        self.data
    }
}
