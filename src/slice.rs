//! Multi-planar reconstruction: one windowed, label-blended raster per plane.
//!
//! Display uses a fixed per-plane flip so that anterior is up in the axial
//! view and superior is up in the coronal and sagittal views:
//!
//! | plane    | raster (w × h) | pixel (c, r) → voxel [x, y, z] |
//! |----------|----------------|--------------------------------|
//! | axial    | sx × sy        | [c, sy-1-r, i]                 |
//! | coronal  | sx × sz        | [c, i, sz-1-r]                 |
//! | sagittal | sy × sz        | [i, c, sz-1-r]                 |

use crate::config::OverlayConfig;
use crate::enums::Orientation;
use crate::structures::LabelLookup;
use crate::volume::{LabelId, LabelVolume, VoxelVolume};
use crate::window::WindowLevel;

use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use tracing::debug;

const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

/// Label overlay inputs for one composite.
#[derive(Clone, Copy, Debug)]
pub struct Overlay<'a> {
    pub labels: &'a LabelVolume,
    pub lookup: &'a LabelLookup,
    pub config: &'a OverlayConfig,
}

/// Raster size `(width, height)` of a plane for a grid of `size = [x, y, z]`.
pub fn plane_dimensions(size: [usize; 3], orientation: Orientation) -> (usize, usize) {
    let [sx, sy, sz] = size;
    match orientation {
        Orientation::Axial => (sx, sy),
        Orientation::Coronal => (sx, sz),
        Orientation::Sagittal => (sy, sz),
    }
}

/// Voxel index shown at raster pixel `(col, row)`. `index` must already be
/// clamped.
#[inline]
pub fn plane_to_voxel(
    size: [usize; 3],
    orientation: Orientation,
    index: usize,
    col: usize,
    row: usize,
) -> [usize; 3] {
    let [_, sy, sz] = size;
    match orientation {
        Orientation::Axial => [col, sy - 1 - row, index],
        Orientation::Coronal => [col, index, sz - 1 - row],
        Orientation::Sagittal => [index, col, sz - 1 - row],
    }
}

/// Inverse of [`plane_to_voxel`], ignoring the slice axis. `None` when the
/// voxel lies outside `size`.
pub fn voxel_to_plane(
    size: [usize; 3],
    orientation: Orientation,
    voxel: [usize; 3],
) -> Option<(usize, usize)> {
    let [sx, sy, sz] = size;
    let [x, y, z] = voxel;
    if x >= sx || y >= sy || z >= sz {
        return None;
    }
    let flipped = |extent: usize, i: usize| extent.checked_sub(1)?.checked_sub(i);
    match orientation {
        Orientation::Axial => Some((x, flipped(sy, y)?)),
        Orientation::Coronal => Some((x, flipped(sz, z)?)),
        Orientation::Sagittal => Some((y, flipped(sz, z)?)),
    }
}

/// Composite one plane of `volume` at `index` (clamped to the plane extent).
///
/// An overlay whose label grid does not match the volume is ignored.
pub fn extract_slice(
    volume: &VoxelVolume,
    orientation: Orientation,
    index: i64,
    window: WindowLevel,
    overlay: Option<Overlay<'_>>,
) -> RgbaImage {
    let size = volume.size();
    let (width, height) = plane_dimensions(size, orientation);
    let mut image = RgbaImage::new(width as u32, height as u32);
    if width == 0 || height == 0 || volume.voxel_count() == 0 {
        return image;
    }
    let index = volume.clamp_index(orientation, index);

    let overlay = overlay.filter(|overlay| {
        let matches = overlay.labels.matches(volume);
        if !matches {
            debug!(
                labels = ?overlay.labels.size(),
                volume = ?size,
                "label grid does not match volume, overlay disabled"
            );
        }
        matches
    });

    image
        .par_chunks_mut(width * 4)
        .enumerate()
        .for_each(|(row, pixels)| {
            for (col, pixel) in pixels.chunks_exact_mut(4).enumerate() {
                let [x, y, z] = plane_to_voxel(size, orientation, index, col, row);
                let gray = window.eval(volume.value(x, y, z));
                let rgb = match overlay {
                    Some(overlay) => blend_label(gray, overlay.labels.label(x, y, z), &overlay),
                    None => [gray; 3],
                };
                pixel.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
            }
        });
    image
}

/// Blend a structure colour over a grey level.
#[inline]
fn blend_label(gray: u8, label: LabelId, overlay: &Overlay<'_>) -> [u8; 3] {
    if label == 0 {
        return [gray; 3];
    }
    let config = overlay.config;
    let (color, alpha) = match overlay.lookup.get(label) {
        Some(style) if !style.visible => return [gray; 3],
        Some(style) => {
            let fraction = (style.opacity as f32 / 100.0).max(config.min_alpha);
            (style.color, fraction * config.blend_factor)
        }
        None => (config.fallback_color, config.fallback_alpha),
    };
    let alpha = alpha.clamp(0.0, 1.0);
    let g = gray as f32;
    color.map(|c| g.mul_add(1.0 - alpha, c as f32 * alpha).round().clamp(0.0, 255.0) as u8)
}

/// Draw the positions of the two other planes as thin lines.
pub fn draw_crosshair(
    image: &mut RgbaImage,
    size: [usize; 3],
    orientation: Orientation,
    voxel: [usize; 3],
    color: [u8; 4],
) {
    let Some((col, row)) = voxel_to_plane(size, orientation, voxel) else {
        return;
    };
    let (width, height) = image.dimensions();
    if (col as u32) < width {
        for y in 0..height {
            image.put_pixel(col as u32, y, Rgba(color));
        }
    }
    if (row as u32) < height {
        for x in 0..width {
            image.put_pixel(x, row as u32, Rgba(color));
        }
    }
}

/// Aspect-preserving placement of a raster inside a container.
///
/// The fitted scale is `min(cw / w, ch / h)`, multiplied by `zoom`; the
/// raster is centred and then shifted by `pan` container pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub image: (u32, u32),
    pub container: (u32, u32),
    pub zoom: f32,
    pub pan: (f32, f32),
}

impl Viewport {
    pub fn fit(image: (u32, u32), container: (u32, u32)) -> Self {
        Self {
            image,
            container,
            zoom: 1.0,
            pan: (0.0, 0.0),
        }
    }

    pub fn with_zoom(mut self, zoom: f32) -> Self {
        self.zoom = if zoom.is_finite() && zoom > 0.0 { zoom } else { 1.0 };
        self
    }

    pub fn with_pan(mut self, pan: (f32, f32)) -> Self {
        if pan.0.is_finite() && pan.1.is_finite() {
            self.pan = pan;
        }
        self
    }

    /// Container pixels per raster pixel. Zero for empty rasters.
    pub fn scale(&self) -> f32 {
        let (w, h) = self.image;
        let (cw, ch) = self.container;
        if w == 0 || h == 0 {
            return 0.0;
        }
        (cw as f32 / w as f32).min(ch as f32 / h as f32) * self.zoom
    }

    /// Top-left corner of the drawn raster in container coordinates.
    pub fn offset(&self) -> (f32, f32) {
        let scale = self.scale();
        let (w, h) = self.image;
        let (cw, ch) = self.container;
        (
            (cw as f32 - w as f32 * scale) / 2.0 + self.pan.0,
            (ch as f32 - h as f32 * scale) / 2.0 + self.pan.1,
        )
    }

    /// Raster pixel under a container point, if any.
    pub fn container_to_image(&self, point: (f32, f32)) -> Option<(u32, u32)> {
        let scale = self.scale();
        if scale <= 0.0 || !point.0.is_finite() || !point.1.is_finite() {
            return None;
        }
        let (dx, dy) = self.offset();
        let ix = ((point.0 - dx) / scale).floor();
        let iy = ((point.1 - dy) / scale).floor();
        let (w, h) = self.image;
        if ix < 0.0 || iy < 0.0 || ix >= w as f32 || iy >= h as f32 {
            return None;
        }
        Some((ix as u32, iy as u32))
    }

    /// Nearest-neighbour resample of `raster` into a container-sized image
    /// on a black background.
    pub fn present(&self, raster: &RgbaImage) -> RgbaImage {
        let (cw, ch) = self.container;
        let mut out = RgbaImage::from_pixel(cw, ch, Rgba(BACKGROUND));
        if cw == 0 || ch == 0 {
            return out;
        }
        out.par_chunks_mut(cw as usize * 4)
            .enumerate()
            .for_each(|(y, pixels)| {
                for (x, pixel) in pixels.chunks_exact_mut(4).enumerate() {
                    let centre = (x as f32 + 0.5, y as f32 + 0.5);
                    if let Some((ix, iy)) = self.container_to_image(centre)
                        && let Some(src) = raster.get_pixel_checked(ix, iy)
                    {
                        pixel.copy_from_slice(&src.0);
                    }
                }
            });
        out
    }
}

/// Voxel under a container point of a plane view.
pub fn pick_voxel(
    volume: &VoxelVolume,
    orientation: Orientation,
    index: i64,
    viewport: &Viewport,
    point: (f32, f32),
) -> Option<[usize; 3]> {
    let size = volume.size();
    let (width, height) = plane_dimensions(size, orientation);
    if viewport.image != (width as u32, height as u32) {
        return None;
    }
    let (col, row) = viewport.container_to_image(point)?;
    let index = volume.clamp_index(orientation, index);
    Some(plane_to_voxel(size, orientation, index, col as usize, row as usize))
}

/// Non-background label under a container point.
pub fn pick_label(
    volume: &VoxelVolume,
    labels: &LabelVolume,
    orientation: Orientation,
    index: i64,
    viewport: &Viewport,
    point: (f32, f32),
) -> Option<LabelId> {
    if !labels.matches(volume) {
        return None;
    }
    let [x, y, z] = pick_voxel(volume, orientation, index, viewport, point)?;
    Some(labels.label(x, y, z)).filter(|&label| label != 0)
}
