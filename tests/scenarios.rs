//! End-to-end rendering scenarios through the public `Viewer` API.

use std::sync::Arc;

use approx::assert_relative_eq;
use futures::executor::block_on;
use glam::{DMat3, DVec3};
use voxel_view::{
    CoreConfig, DicomSeriesDecoder, LabelVolume, Orientation, OrientationNormalizer, Structure,
    Viewer, VoxelVolume, WindowLevel, extract_slice,
};

fn viewer() -> Viewer {
    Viewer::new(CoreConfig::default(), Arc::new(DicomSeriesDecoder::default()))
}

fn cube_0_to_7() -> VoxelVolume {
    VoxelVolume::from_flat([2, 2, 2], (0..8).map(|v| v as f32).collect()).unwrap()
}

#[test]
fn axial_pixel_uses_flipped_source_voxel() {
    let mut viewer = viewer();
    block_on(viewer.replace_volume(cube_0_to_7(), None));
    viewer.state().update(|state| {
        state.set_window(3.5, 7.0);
        state.set_slice(Orientation::Axial, 0);
        state.set_crosshair(false);
    });

    let image = viewer.render_slice(Orientation::Axial).unwrap();
    // Row 0 shows y = 1: voxel [0, 1, 0] holds 2.
    let expected = ((2.0f32 / 7.0) * 255.0).round() as u8;
    assert_eq!(expected, 73);
    assert_eq!(image.get_pixel(0, 0).0, [expected, expected, expected, 255]);
}

#[test]
fn structure_colour_blends_over_grey() {
    let mut viewer = viewer();
    let volume = VoxelVolume::from_flat([1, 1, 1], vec![128.0]).unwrap();
    block_on(viewer.replace_volume(volume, None));
    viewer.replace_structures(vec![
        Structure::new("organs", "Spleen").with_label(5).with_color([200, 50, 50]),
    ]);
    viewer.registry().set_opacity("organs__Spleen", 50.0);
    viewer.set_labels(LabelVolume::from_flat([1, 1, 1], vec![5]).unwrap());
    viewer.state().update(|state| {
        // [0, 255] window: value 128 renders as grey 128.
        state.set_window(127.5, 255.0);
        state.set_crosshair(false);
    });

    let image = viewer.render_slice(Orientation::Coronal).unwrap();
    let [r, g, b, _] = image.get_pixel(0, 0).0;
    assert_eq!(r, 146);
    assert_eq!(g, 109);
    assert_eq!(b, 109);

    viewer.registry().set_visible("organs__Spleen", false);
    let image = viewer.render_slice(Orientation::Coronal).unwrap();
    assert_eq!(image.get_pixel(0, 0).0, [128, 128, 128, 255]);
}

#[test]
fn negative_x_direction_reverses_x_only() {
    let direction = DMat3::from_cols(
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::new(0.0, 1.0, 0.0),
        DVec3::new(0.0, 0.0, 1.0),
    );
    let volume = cube_0_to_7().with_direction(Some(direction));
    let normalized = OrientationNormalizer::normalize_volume(volume);

    for z in 0..2 {
        for y in 0..2 {
            for x in 0..2 {
                let source = (1 - x) + 2 * y + 4 * z;
                assert_eq!(normalized.value(x, y, z), source as f32);
            }
        }
    }
    let direction = normalized.direction().unwrap();
    assert_eq!(direction.x_axis, DVec3::X);
    assert_eq!(direction.y_axis, DVec3::Y);
    assert_eq!(direction.z_axis, DVec3::Z);
}

#[test]
fn threshold_above_maximum_renders_nothing() {
    let mut viewer = viewer();
    block_on(viewer.replace_volume(cube_0_to_7(), None));
    viewer.state().update(|state| state.set_threshold(1.0));
    let frame = block_on(viewer.render_volume(16, 16)).unwrap();
    assert_eq!(frame.max_alpha(), 0.0);
}

#[test]
fn clip_off_matches_full_clip() {
    let mut viewer = viewer();
    let volume = VoxelVolume::from_flat([4, 4, 4], (0..64).map(|v| (v % 7) as f32).collect()).unwrap();
    block_on(viewer.replace_volume(volume, None));
    viewer.set_preset("Natural").unwrap();

    let unclipped = block_on(viewer.render_volume(12, 12)).unwrap();
    viewer.state().update(|state| {
        state.set_clip_enabled(true);
        for axis in 0..3 {
            state.set_clip(axis, 1.0);
        }
    });
    let full = block_on(viewer.render_volume(12, 12)).unwrap();
    assert_eq!(unclipped, full);
    assert!(unclipped.max_alpha() > 0.0);

    viewer.state().update(|state| state.set_clip(0, 0.0));
    let clipped = block_on(viewer.render_volume(12, 12)).unwrap();
    assert!(clipped.max_alpha() < unclipped.max_alpha());
}

#[test]
fn window_maps_bounds_and_centre() {
    let window = WindowLevel::new(40.0, 400.0);
    assert_eq!(window.eval(-160.0), 0);
    assert_eq!(window.eval(240.0), 255);
    assert!((127..=128).contains(&window.eval(40.0)));
}

#[test]
fn out_of_range_slice_equals_last_slice() {
    let volume = VoxelVolume::from_flat([3, 4, 5], (0..60).map(|v| v as f32).collect()).unwrap();
    let window = WindowLevel::from_range(0.0, 59.0);
    for orientation in Orientation::ALL {
        let last = volume.extent(orientation) as i64 - 1;
        let clamped_high = extract_slice(&volume, orientation, 1_000, window, None);
        let clamped_low = extract_slice(&volume, orientation, -3, window, None);
        assert_eq!(clamped_high, extract_slice(&volume, orientation, last, window, None));
        assert_eq!(clamped_low, extract_slice(&volume, orientation, 0, window, None));
    }

    let mut viewer = viewer();
    block_on(viewer.replace_volume(volume, None));
    viewer.state().update(|state| state.set_slice(Orientation::Axial, 99));
    assert_eq!(viewer.state().get().slice(Orientation::Axial), 4);
}

#[test]
fn letterboxed_presentation_keeps_aspect() {
    let mut viewer = viewer();
    let volume = VoxelVolume::from_flat([4, 2, 1], (0..8).map(|v| v as f32).collect()).unwrap();
    block_on(viewer.replace_volume(volume, None));
    let viewport = viewer.viewport(Orientation::Axial, (100, 100)).unwrap();
    assert_relative_eq!(viewport.scale(), 25.0);
    assert_eq!(viewport.offset(), (0.0, 25.0));

    let presented = viewer.present_slice(Orientation::Axial, (100, 100)).unwrap();
    assert_eq!(presented.dimensions(), (100, 100));
    assert_eq!(presented.get_pixel(50, 10).0, [0, 0, 0, 255]);
}
