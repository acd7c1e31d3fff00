use serde::{Deserialize, Serialize};

/// Smallest width accepted before windowing degenerates into a threshold.
pub const MIN_WINDOW_WIDTH: f32 = 1e-6;

/// Linear contrast window: level (centre) and width.
///
/// The window is immutable; build a new one to change its parameters.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    level: f32,
    width: f32,
}

impl Default for WindowLevel {
    fn default() -> Self {
        Self {
            level: 40.0,
            width: 400.0,
        }
    }
}

impl WindowLevel {
    /// Build a window. Non-positive or non-finite widths are clamped to
    /// [`MIN_WINDOW_WIDTH`], a non-finite level falls back to 0.
    pub fn new(level: f32, width: f32) -> Self {
        let level = if level.is_finite() { level } else { 0.0 };
        let width = if width.is_finite() {
            width.max(MIN_WINDOW_WIDTH)
        } else {
            MIN_WINDOW_WIDTH
        };
        Self { level, width }
    }

    /// Window spanning a scalar range exactly.
    pub fn from_range(min: f32, max: f32) -> Self {
        Self::new((min + max) / 2.0, max - min)
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.width
    }

    #[inline]
    pub fn lower_bound(&self) -> f32 {
        self.level - self.width / 2.0
    }

    #[inline]
    pub fn upper_bound(&self) -> f32 {
        self.level + self.width / 2.0
    }

    /// Position of `value` inside the window, clamped to `[0, 1]`.
    /// Non-finite values map to 0.
    #[inline]
    pub fn eval_unit(&self, value: f32) -> f32 {
        if !value.is_finite() {
            return 0.0;
        }
        ((value - self.lower_bound()) / self.width).clamp(0.0, 1.0)
    }

    /// Grey level (0..=255) for `value`, rounded to nearest.
    #[inline]
    pub fn eval(&self, value: f32) -> u8 {
        (self.eval_unit(value) * 255.0).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_is_clamped_positive() {
        assert_eq!(WindowLevel::new(0.0, -1.0).width(), MIN_WINDOW_WIDTH);
        assert_eq!(WindowLevel::new(0.0, 0.0).width(), MIN_WINDOW_WIDTH);
        assert_eq!(WindowLevel::new(0.0, f32::NAN).width(), MIN_WINDOW_WIDTH);
    }

    #[test]
    fn window_endpoints_and_centre() {
        // [60, 100]
        let window = WindowLevel::new(80.0, 40.0);
        assert_eq!(window.eval(60.0), 0);
        assert_eq!(window.eval(50.0), 0);
        assert_eq!(window.eval(100.0), 255);
        assert_eq!(window.eval(f32::MAX), 255);
        assert!((127..=128).contains(&window.eval(80.0)));
        assert_eq!(window.eval(70.0), (255.0f32 * 0.25).round() as u8);
        assert_eq!(window.eval(f32::NAN), 0);
    }

    #[test]
    fn from_range_covers_range() {
        let window = WindowLevel::from_range(-1000.0, 3000.0);
        assert_eq!(window.level(), 1000.0);
        assert_eq!(window.width(), 4000.0);
        assert_eq!(window.lower_bound(), -1000.0);
        assert_eq!(window.upper_bound(), 3000.0);
    }
}
