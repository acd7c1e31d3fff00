//! Canonicalisation of voxel axis directions.
//!
//! Any index axis whose direction cosine points against its physical axis
//! (negative diagonal entry) is reversed so that every view can assume a
//! non-negative diagonal. Label volumes are reversed with the same
//! [`AxisFlips`] so overlays stay aligned.

use crate::volume::{LabelVolume, VoxelVolume};

use glam::{DMat3, DVec3};
use ndarray::{Array3, Axis};
use tracing::debug;

/// Which index axes (`[x, y, z]`) were reversed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisFlips(pub [bool; 3]);

impl AxisFlips {
    pub const NONE: AxisFlips = AxisFlips([false; 3]);

    pub fn from_direction(direction: &DMat3) -> Self {
        AxisFlips([0, 1, 2].map(|axis| direction.col(axis)[axis] < 0.0))
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|&flip| flip)
    }

    fn apply<T: Clone>(&self, mut data: Array3<T>) -> Array3<T> {
        for (axis, &flip) in self.0.iter().enumerate() {
            if flip {
                // Index axis x is the last array axis.
                data.invert_axis(Axis(2 - axis));
            }
        }
        data.as_standard_layout().into_owned()
    }
}

pub struct OrientationNormalizer;

impl OrientationNormalizer {
    /// Normalize a volume, returning it together with the flips applied.
    ///
    /// Volumes without a direction matrix, or that need no flip, are
    /// returned as-is without copying the voxel buffer.
    pub fn normalize(volume: VoxelVolume) -> (VoxelVolume, AxisFlips) {
        let Some(direction) = volume.direction() else {
            return (volume, AxisFlips::NONE);
        };
        let flips = AxisFlips::from_direction(&direction);
        if !flips.any() {
            return (volume, flips);
        }

        let size = volume.size();
        let (data, spacing, origin, _, range) = volume.into_parts();
        let mut columns = [direction.x_axis, direction.y_axis, direction.z_axis];
        let mut new_origin = origin;
        for (axis, &flip) in flips.0.iter().enumerate() {
            if !flip {
                continue;
            }
            // The last voxel along the axis becomes the first one.
            let steps = size[axis].saturating_sub(1) as f64;
            new_origin += columns[axis] * spacing[axis] * steps;
            columns[axis] = -columns[axis];
        }
        debug!(?flips, ?size, "reversed voxel order to canonical orientation");

        let direction = DMat3::from_cols(columns[0], columns[1], columns[2]);
        let volume = VoxelVolume::from_parts(
            flips.apply(data),
            spacing,
            new_origin,
            Some(direction),
            range,
        );
        (volume, flips)
    }

    /// Convenience wrapper that drops the flip record.
    pub fn normalize_volume(volume: VoxelVolume) -> VoxelVolume {
        Self::normalize(volume).0
    }

    /// Reverse a label volume along the same axes as its base volume.
    pub fn apply_to_labels(labels: LabelVolume, flips: AxisFlips) -> LabelVolume {
        if !flips.any() {
            return labels;
        }
        LabelVolume::new(flips.apply(labels.into_data()))
    }
}

/// Physical position of the voxel at index `[x, y, z]`.
pub fn index_to_physical(volume: &VoxelVolume, index: [usize; 3]) -> DVec3 {
    let direction = volume.direction().unwrap_or(DMat3::IDENTITY);
    let scaled = DVec3::new(index[0] as f64, index[1] as f64, index[2] as f64) * volume.spacing();
    volume.origin() + direction * scaled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(size: [usize; 3], direction: DMat3) -> VoxelVolume {
        let n = size[0] * size[1] * size[2];
        VoxelVolume::from_flat(size, (0..n).map(|v| v as f32).collect())
            .unwrap()
            .with_direction(Some(direction))
    }

    #[test]
    fn identity_direction_is_untouched() {
        let volume = ramp([2, 2, 2], DMat3::IDENTITY);
        let (normalized, flips) = OrientationNormalizer::normalize(volume.clone());
        assert_eq!(flips, AxisFlips::NONE);
        assert_eq!(normalized, volume);
    }

    #[test]
    fn missing_direction_passes_through() {
        let volume = ramp([2, 2, 2], DMat3::IDENTITY).with_direction(None);
        let (normalized, flips) = OrientationNormalizer::normalize(volume.clone());
        assert!(!flips.any());
        assert_eq!(normalized, volume);
    }

    #[test]
    fn flipping_z_reverses_slices() {
        let direction = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0));
        let volume = ramp([2, 1, 3], direction).with_spacing(DVec3::new(1.0, 1.0, 2.5));
        let (normalized, flips) = OrientationNormalizer::normalize(volume);
        assert_eq!(flips, AxisFlips([false, false, true]));
        assert_eq!(normalized.value(0, 0, 0), 4.0);
        assert_eq!(normalized.value(1, 0, 2), 1.0);
        assert_eq!(normalized.direction().unwrap(), DMat3::IDENTITY);
        // Voxel (0,0,0) now sits where old voxel (0,0,2) was: z = -(2 * 2.5).
        assert_eq!(normalized.origin(), DVec3::new(0.0, 0.0, -5.0));
    }

    #[test]
    fn physical_positions_survive_normalization() {
        let direction = DMat3::from_diagonal(DVec3::new(-1.0, 1.0, -1.0));
        let volume = ramp([3, 2, 2], direction).with_origin(DVec3::new(10.0, 0.0, 5.0));
        let before = index_to_physical(&volume, [2, 1, 0]);
        let value = volume.value(2, 1, 0);
        let (normalized, _) = OrientationNormalizer::normalize(volume);
        let after = index_to_physical(&normalized, [0, 1, 1]);
        assert_eq!(normalized.value(0, 1, 1), value);
        assert!((before - after).length() < 1e-9);
    }

    #[test]
    fn labels_follow_base_flips() {
        let labels = LabelVolume::from_flat([3, 1, 1], vec![1, 2, 3]).unwrap();
        let flipped = OrientationNormalizer::apply_to_labels(labels, AxisFlips([true, false, false]));
        assert_eq!(flipped.data().as_slice().unwrap(), &[3, 2, 1]);
    }
}
