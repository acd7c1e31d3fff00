//! Direct volume rendering by ray marching through the unit cube.
//!
//! The volume occupies `[-0.5, 0.5]^3` in object space. Rays are cast from
//! an orbit [`Camera`], clipped against a [`ClipBox`], and composited front
//! to back. [`CpuRaymarcher`] is the reference implementation; the WGSL
//! kernel in `shaders/raymarch.wgsl` follows the same steps.

use crate::config::RaymarchConfig;
use crate::interpolator::Interpolator;
use crate::presets::ShadingHints;
use crate::transfer_function::TransferFunction;
use crate::volume::VoxelVolume;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use image::RgbaImage;
use ndarray::Array3;
use rayon::prelude::*;
use tracing::trace;
use web_time::Instant;

/// Half extent of the object-space unit cube.
pub const HALF_EXTENT: f32 = 0.5;

/// Axis-aligned clip bounds in object space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl ClipBox {
    pub const FULL: ClipBox = ClipBox {
        min: Vec3::splat(-HALF_EXTENT),
        max: Vec3::splat(HALF_EXTENT),
    };

    /// Keep the lower `fraction` of each axis. `[1, 1, 1]` equals [`ClipBox::FULL`].
    pub fn from_fractions(fractions: [f32; 3]) -> Self {
        let keep = Vec3::from_array(fractions.map(|f| if f.is_finite() { f.clamp(0.0, 1.0) } else { 1.0 }));
        ClipBox {
            min: Vec3::splat(-HALF_EXTENT),
            max: Vec3::splat(-HALF_EXTENT) + keep,
        }
    }

    #[inline]
    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

impl Default for ClipBox {
    fn default() -> Self {
        Self::FULL
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Shading {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub shininess: f32,
}

impl From<ShadingHints> for Shading {
    fn from(hints: ShadingHints) -> Self {
        Self {
            ambient: hints.ambient,
            diffuse: hints.diffuse,
            specular: hints.specular,
            shininess: hints.specular_power,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RaymarchParams {
    /// Normalized intensities at or below this are skipped.
    pub threshold: f32,
    pub global_opacity: f32,
    pub clip: ClipBox,
    pub shading: Shading,
    pub light_dir: Vec3,
    pub max_steps: u32,
    pub alpha_cutoff: f32,
    pub early_exit_alpha: f32,
    /// Central difference offset in voxels.
    pub gradient_step: f32,
    pub jitter: bool,
}

impl Default for RaymarchParams {
    fn default() -> Self {
        Self::from_config(&RaymarchConfig::default())
    }
}

impl RaymarchParams {
    pub fn from_config(config: &RaymarchConfig) -> Self {
        Self {
            threshold: 0.0,
            global_opacity: 1.0,
            clip: ClipBox::FULL,
            shading: Shading {
                ambient: config.ambient,
                diffuse: config.diffuse,
                specular: config.specular,
                shininess: config.shininess,
            },
            light_dir: Vec3::from_array(config.light_dir),
            max_steps: config.max_steps,
            alpha_cutoff: config.alpha_cutoff,
            early_exit_alpha: config.early_exit_alpha,
            gradient_step: config.gradient_step,
            jitter: config.jitter,
        }
    }

    pub(crate) fn light(&self) -> Vec3 {
        self.light_dir.try_normalize().unwrap_or(Vec3::Z)
    }
}

/// Orbit camera looking at the unit cube.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    /// Anterior view, superior up.
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, -2.0, 0.0),
            target: Vec3::ZERO,
            up: Vec3::Z,
            fov_y: 45f32.to_radians(),
            near: 0.01,
            far: 10.0,
        }
    }
}

impl Camera {
    const MIN_DISTANCE: f32 = 0.1;

    pub fn view_proj(&self, aspect: f32) -> Mat4 {
        let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
            * Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn inverse_view_proj(&self, aspect: f32) -> Mat4 {
        self.view_proj(aspect).inverse()
    }

    /// Rotate the eye around the target: `yaw` about `up`, `pitch` about the
    /// camera's right axis. Pitch that would cross a pole is dropped.
    pub fn orbit(&mut self, yaw: f32, pitch: f32) {
        let up = self.up.try_normalize().unwrap_or(Vec3::Z);
        let offset = Quat::from_axis_angle(up, -yaw) * (self.eye - self.target);
        let pitched = match offset.cross(up).try_normalize() {
            Some(right) => Quat::from_axis_angle(right, pitch) * offset,
            None => offset,
        };
        let offset = match pitched.try_normalize() {
            Some(dir) if dir.dot(up).abs() < 0.999 => pitched,
            _ => offset,
        };
        self.eye = self.target + offset;
    }

    /// Scale the eye distance; factors below 1 move closer.
    pub fn zoom(&mut self, factor: f32) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let offset = self.eye - self.target;
        let distance = (offset.length() * factor).clamp(Self::MIN_DISTANCE, self.far * 0.5);
        self.eye = self.target + offset.normalize_or(Vec3::NEG_Y) * distance;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Object-space ray through the centre of pixel `(x, y)`.
#[inline]
pub(crate) fn pixel_ray(inv_view_proj: &Mat4, x: u32, y: u32, width: u32, height: u32) -> (Vec3, Vec3) {
    let ndc = Vec2::new(
        (x as f32 + 0.5) / width as f32 * 2.0 - 1.0,
        1.0 - (y as f32 + 0.5) / height as f32 * 2.0,
    );
    let near = inv_view_proj.project_point3(ndc.extend(0.0));
    let far = inv_view_proj.project_point3(ndc.extend(1.0));
    (near, (far - near).normalize_or_zero())
}

/// Slab test against the unit cube. Returns `(entry, exit)` distances.
#[inline]
pub(crate) fn intersect_unit_box(origin: Vec3, dir: Vec3) -> Option<(f32, f32)> {
    let inv = dir.recip();
    let t0 = (Vec3::splat(-HALF_EXTENT) - origin) * inv;
    let t1 = (Vec3::splat(HALF_EXTENT) - origin) * inv;
    let entry = t0.min(t1).max_element();
    let exit = t0.max(t1).min_element();
    (entry <= exit && exit >= 0.0).then_some((entry, exit))
}

/// Screen-space hash in `[0, 1)` used to jitter ray starts.
#[inline]
pub(crate) fn jitter_hash(x: u32, y: u32) -> f32 {
    let h = (Vec2::new(x as f32, y as f32).dot(Vec2::new(12.9898, 78.233))).sin() * 43758.5453;
    h - h.floor()
}

/// A rendered 3D view: premultiplied RGBA in `[0, 1]`, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<[f32; 4]>,
}

impl Frame {
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.rgba.get((y * self.width + x) as usize).copied()
    }

    pub fn max_alpha(&self) -> f32 {
        self.rgba.iter().map(|p| p[3]).fold(0.0, f32::max)
    }

    /// Straight-alpha 8-bit image.
    pub fn to_image(&self) -> RgbaImage {
        let mut image = RgbaImage::new(self.width, self.height);
        for (dst, src) in image.pixels_mut().zip(&self.rgba) {
            let alpha = src[3].clamp(0.0, 1.0);
            let unpremultiply = |c: f32| {
                if alpha > 0.0 {
                    (c / alpha).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            };
            let rgb = [src[0], src[1], src[2]].map(unpremultiply);
            dst.0 = [rgb[0], rgb[1], rgb[2], alpha].map(|c| (c * 255.0).round() as u8);
        }
        image
    }
}

/// Intensities normalized to `[0, 1]`, stored `[z, y, x]`.
#[derive(Clone, Debug, PartialEq)]
pub struct IntensityVolume {
    data: Array3<f32>,
}

impl IntensityVolume {
    pub fn from_volume(volume: &VoxelVolume) -> Self {
        Self {
            data: volume.normalized_intensities(),
        }
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// `(x, y, z)` voxel counts.
    pub fn dims(&self) -> [u32; 3] {
        let (z, y, x) = self.data.dim();
        [x as u32, y as u32, z as u32]
    }

    /// Ray step: half of the smallest voxel edge in object units.
    pub fn step_size(&self) -> f32 {
        let max_dim = self.dims().into_iter().max().unwrap_or(1).max(1);
        0.5 / max_dim as f32
    }
}

/// CPU reference raymarcher.
pub struct CpuRaymarcher {
    volume: IntensityVolume,
    transfer: TransferFunction,
}

impl CpuRaymarcher {
    pub fn new(volume: IntensityVolume, transfer: TransferFunction) -> Self {
        Self { volume, transfer }
    }

    pub fn set_transfer_function(&mut self, transfer: TransferFunction) {
        self.transfer = transfer;
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.transfer
    }

    pub fn render(&self, camera: &Camera, params: &RaymarchParams, width: u32, height: u32) -> Frame {
        if width == 0 || height == 0 || self.volume.data.is_empty() {
            return Frame::transparent(width, height);
        }
        let start = Instant::now();
        let inv_view_proj = camera.inverse_view_proj(width as f32 / height as f32);

        let rgba: Vec<[f32; 4]> = (0..height)
            .into_par_iter()
            .flat_map(|y| {
                (0..width)
                    .map(|x| self.march_pixel(&inv_view_proj, params, x, y, width, height))
                    .collect::<Vec<_>>()
            })
            .collect();

        trace!(width, height, elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "cpu raymarch");
        Frame { width, height, rgba }
    }

    fn march_pixel(
        &self,
        inv_view_proj: &Mat4,
        params: &RaymarchParams,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> [f32; 4] {
        let (origin, dir) = pixel_ray(inv_view_proj, x, y, width, height);
        let Some((entry, exit)) = intersect_unit_box(origin, dir) else {
            return [0.0; 4];
        };

        let grid = self.volume.data.view();
        let dims = Vec3::from_array(self.volume.dims().map(|d| d as f32));
        let to_voxel = |p: Vec3| (p + HALF_EXTENT) * dims - 0.5;

        let step = self.volume.step_size();
        let light = params.light();
        let half_vector = (light - dir).normalize_or(light);
        let mut t = entry.max(0.0);
        if params.jitter {
            t += jitter_hash(x, y) * step;
        }

        let mut acc = Vec4::ZERO;
        for _ in 0..params.max_steps {
            if t > exit {
                break;
            }
            let p = origin + dir * t;
            t += step;
            if !params.clip.contains(p) {
                continue;
            }
            let voxel = to_voxel(p);
            let intensity = Interpolator::trilinear(&grid, voxel);
            if intensity <= params.threshold {
                continue;
            }
            let [r, g, b, density] = self.transfer.sample(intensity);
            let alpha = 1.0 - (-density * params.global_opacity * 10.0 * step).exp();
            if alpha <= params.alpha_cutoff {
                continue;
            }

            // Gradient per object unit, so that it matches texture-space
            // differences on the GPU.
            let gradient = Interpolator::gradient(&grid, voxel, params.gradient_step) * dims;
            let normal = match gradient.try_normalize() {
                Some(n) if gradient.length() > 1e-6 => -n,
                _ => -dir,
            };
            let shading = &params.shading;
            let diffuse = normal.dot(light).max(0.0);
            let specular = normal.dot(half_vector).max(0.0).powf(shading.shininess);
            let color = Vec3::new(r, g, b) * (shading.ambient + shading.diffuse * diffuse)
                + Vec3::splat(shading.specular * specular);

            let weight = (1.0 - acc.w) * alpha;
            acc += (color * weight).extend(weight);
            if acc.w >= params.early_exit_alpha {
                break;
            }
        }
        acc.clamp(Vec4::ZERO, Vec4::ONE).to_array()
    }
}
