//! Property tests for orientation normalization, windowing and transfer
//! function construction.

use glam::{DMat3, DVec3};
use proptest::prelude::*;
use voxel_view::{
    AxisFlips, OrientationNormalizer, Preset, TransferFunction, VoxelVolume, WindowLevel,
};

fn size_strategy() -> impl Strategy<Value = [usize; 3]> {
    [1usize..5, 1usize..5, 1usize..5]
}

fn sign_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![Just(1.0), Just(-1.0)]
}

fn volume_strategy() -> impl Strategy<Value = VoxelVolume> {
    (size_strategy(), [sign_strategy(), sign_strategy(), sign_strategy()], any::<bool>()).prop_flat_map(
        |(size, signs, swap_xy)| {
            let n = size.iter().product::<usize>();
            prop::collection::vec(-2000.0f32..2000.0, n).prop_map(move |data| {
                let mut cols = [DVec3::X, DVec3::Y, DVec3::Z];
                if swap_xy {
                    // Oblique-free permutation: diagonal entries of x and y become 0.
                    cols.swap(0, 1);
                }
                let cols = [0, 1, 2].map(|i| cols[i] * signs[i]);
                VoxelVolume::from_flat(size, data)
                    .unwrap()
                    .with_spacing(DVec3::new(0.7, 0.7, 2.5))
                    .with_origin(DVec3::new(-100.0, 20.0, 5.0))
                    .with_direction(Some(DMat3::from_cols(cols[0], cols[1], cols[2])))
            })
        },
    )
}

proptest! {
    #[test]
    fn normalization_is_idempotent(volume in volume_strategy()) {
        let once = OrientationNormalizer::normalize_volume(volume);
        let (twice, flips) = OrientationNormalizer::normalize(once.clone());
        prop_assert_eq!(flips, AxisFlips::NONE);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn normalized_diagonal_is_non_negative(volume in volume_strategy()) {
        let normalized = OrientationNormalizer::normalize_volume(volume);
        let direction = normalized.direction().unwrap();
        for axis in 0..3 {
            prop_assert!(direction.col(axis)[axis] >= 0.0);
        }
    }

    #[test]
    fn normalization_keeps_voxel_multiset(volume in volume_strategy()) {
        let mut before: Vec<f32> = volume.data().iter().copied().collect();
        let normalized = OrientationNormalizer::normalize_volume(volume);
        let mut after: Vec<f32> = normalized.data().iter().copied().collect();
        before.sort_by(f32::total_cmp);
        after.sort_by(f32::total_cmp);
        prop_assert_eq!(before, after);
    }

    #[test]
    fn linear_ramp_opacity_is_monotone(
        min in -4000.0f32..4000.0,
        span in 0.0f32..8000.0,
        samples in 2usize..2048,
    ) {
        let tf = TransferFunction::build(&Preset::linear_ramp(), (min, min + span), samples);
        prop_assert_eq!(tf.len(), samples);
        for pair in tf.samples().windows(2) {
            prop_assert!(pair[1][3] >= pair[0][3]);
        }
    }

    #[test]
    fn window_output_is_monotone(
        level in -1000.0f32..1000.0,
        width in 0.001f32..4000.0,
        a in -5000.0f32..5000.0,
        b in -5000.0f32..5000.0,
    ) {
        let window = WindowLevel::new(level, width);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(window.eval(lo) <= window.eval(hi));
    }
}
