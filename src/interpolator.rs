use glam::Vec3;
use ndarray::ArrayView3;

/// Sampling helpers over a `[z, y, x]` intensity grid.
pub(crate) struct Interpolator;

impl Interpolator {
    /// Trilinear sample at continuous voxel coordinates, clamped to the
    /// grid. `pos` is `(x, y, z)` in voxel units.
    #[inline]
    pub(crate) fn trilinear(grid: &ArrayView3<f32>, pos: Vec3) -> f32 {
        let (depth, height, width) = grid.dim();
        if depth == 0 || height == 0 || width == 0 {
            return 0.0;
        }

        let x = pos.x.clamp(0.0, (width - 1) as f32);
        let y = pos.y.clamp(0.0, (height - 1) as f32);
        let z = pos.z.clamp(0.0, (depth - 1) as f32);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = x - x0 as f32;
        let dy = y - y0 as f32;
        let dz = z - z0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let lerp_x = |z: usize, y: usize| grid[[z, y, x0]].mul_add(one_minus_dx, grid[[z, y, x1]] * dx);

        let v0 = lerp_x(z0, y0).mul_add(one_minus_dy, lerp_x(z0, y1) * dy);
        let v1 = lerp_x(z1, y0).mul_add(one_minus_dy, lerp_x(z1, y1) * dy);

        v0.mul_add(one_minus_dz, v1 * dz)
    }

    /// Central-difference gradient at `pos` with an offset of `step` voxels.
    #[inline]
    pub(crate) fn gradient(grid: &ArrayView3<f32>, pos: Vec3, step: f32) -> Vec3 {
        let step = step.max(f32::EPSILON);
        let sample = |offset: Vec3| Self::trilinear(grid, pos + offset);
        Vec3::new(
            sample(Vec3::X * step) - sample(-Vec3::X * step),
            sample(Vec3::Y * step) - sample(-Vec3::Y * step),
            sample(Vec3::Z * step) - sample(-Vec3::Z * step),
        ) / (2.0 * step)
    }
}
