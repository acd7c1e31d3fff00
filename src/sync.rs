//! Viewer state shared by the three plane views and the 3D view, and its
//! reconciliation with an external renderer.
//!
//! Renderers advertise what they can report through
//! [`RendererCapabilities`]. When a renderer emits change events its state
//! is pulled on each event; otherwise a single [`PollScheduler`] owned by the
//! [`ViewSynchronizer`] pulls at a fixed interval.

use crate::config::SyncConfig;
use crate::enums::Orientation;
use crate::presets::LINEAR_RAMP_PRESET;
use crate::window::WindowLevel;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;
use web_time::Instant;

pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 20.0;
/// Pan is limited to this many container pixels in either direction.
pub const MAX_PAN: f32 = 10_000.0;

/// Per-plane slice positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceIndices {
    pub axial: usize,
    pub coronal: usize,
    pub sagittal: usize,
}

impl SliceIndices {
    pub fn get(&self, orientation: Orientation) -> usize {
        match orientation {
            Orientation::Axial => self.axial,
            Orientation::Coronal => self.coronal,
            Orientation::Sagittal => self.sagittal,
        }
    }

    fn get_mut(&mut self, orientation: Orientation) -> &mut usize {
        match orientation {
            Orientation::Axial => &mut self.axial,
            Orientation::Coronal => &mut self.coronal,
            Orientation::Sagittal => &mut self.sagittal,
        }
    }

    /// Voxel at the intersection of the three planes, `[x, y, z]`.
    pub fn crosshair_voxel(&self) -> [usize; 3] {
        [self.sagittal, self.coronal, self.axial]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeRenderState {
    pub enabled: bool,
    /// Normalized intensity threshold, `[0, 1]`.
    pub threshold: f32,
    /// Global opacity multiplier, `[0, 1]`.
    pub opacity: f32,
    pub preset: String,
}

impl Default for VolumeRenderState {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.0,
            opacity: 1.0,
            preset: LINEAR_RAMP_PRESET.to_owned(),
        }
    }
}

/// User-facing view parameters. Every setter clamps its input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewerState {
    /// Grid size `[x, y, z]` the slice indices are clamped against.
    extents: [usize; 3],
    slices: SliceIndices,
    window: WindowLevel,
    crosshair: bool,
    pan: (f32, f32),
    scale: f32,
    clip: [f32; 3],
    clip_enabled: bool,
    volume: VolumeRenderState,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self {
            extents: [0; 3],
            slices: SliceIndices::default(),
            window: WindowLevel::default(),
            crosshair: true,
            pan: (0.0, 0.0),
            scale: 1.0,
            clip: [1.0; 3],
            clip_enabled: false,
            volume: VolumeRenderState::default(),
        }
    }
}

impl ViewerState {
    /// Reset for a newly loaded grid: centre every slice and fit the window
    /// to the scalar range. Display toggles are kept.
    pub fn reset_for_volume(&mut self, size: [usize; 3], scalar_range: (f32, f32)) {
        self.extents = size;
        self.slices = SliceIndices {
            axial: size[2] / 2,
            coronal: size[1] / 2,
            sagittal: size[0] / 2,
        };
        self.window = WindowLevel::from_range(scalar_range.0, scalar_range.1);
        self.pan = (0.0, 0.0);
        self.scale = 1.0;
    }

    pub fn extents(&self) -> [usize; 3] {
        self.extents
    }

    pub fn slices(&self) -> SliceIndices {
        self.slices
    }

    pub fn slice(&self, orientation: Orientation) -> usize {
        self.slices.get(orientation)
    }

    pub fn set_slice(&mut self, orientation: Orientation, index: i64) {
        let extent = self.extents[orientation.normal_axis()];
        let max = extent.saturating_sub(1) as i64;
        *self.slices.get_mut(orientation) = index.clamp(0, max) as usize;
    }

    pub fn step_slice(&mut self, orientation: Orientation, delta: i64) {
        let current = self.slice(orientation) as i64;
        self.set_slice(orientation, current.saturating_add(delta));
    }

    pub fn window(&self) -> WindowLevel {
        self.window
    }

    pub fn set_window(&mut self, level: f32, width: f32) {
        self.window = WindowLevel::new(level, width);
    }

    pub fn set_level(&mut self, level: f32) {
        self.window = WindowLevel::new(level, self.window.width());
    }

    pub fn set_width(&mut self, width: f32) {
        self.window = WindowLevel::new(self.window.level(), width);
    }

    pub fn crosshair(&self) -> bool {
        self.crosshair
    }

    pub fn set_crosshair(&mut self, enabled: bool) {
        self.crosshair = enabled;
    }

    pub fn toggle_crosshair(&mut self) {
        self.crosshair = !self.crosshair;
    }

    pub fn pan(&self) -> (f32, f32) {
        self.pan
    }

    pub fn set_pan(&mut self, x: f32, y: f32) {
        let clamp = |v: f32| if v.is_finite() { v.clamp(-MAX_PAN, MAX_PAN) } else { 0.0 };
        self.pan = (clamp(x), clamp(y));
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = if scale.is_finite() {
            scale.clamp(MIN_SCALE, MAX_SCALE)
        } else {
            1.0
        };
    }

    /// Per-axis clip fractions, `[0, 1]`.
    pub fn clip(&self) -> [f32; 3] {
        self.clip
    }

    pub fn set_clip(&mut self, axis: usize, fraction: f32) {
        if let Some(slot) = self.clip.get_mut(axis) {
            *slot = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 1.0 };
        }
    }

    pub fn clip_enabled(&self) -> bool {
        self.clip_enabled
    }

    pub fn set_clip_enabled(&mut self, enabled: bool) {
        self.clip_enabled = enabled;
    }

    /// Clip fractions in effect: all ones while clipping is off.
    pub fn effective_clip(&self) -> [f32; 3] {
        if self.clip_enabled { self.clip } else { [1.0; 3] }
    }

    pub fn volume(&self) -> &VolumeRenderState {
        &self.volume
    }

    pub fn set_volume_enabled(&mut self, enabled: bool) {
        self.volume.enabled = enabled;
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.volume.threshold = if threshold.is_finite() { threshold.clamp(0.0, 1.0) } else { 0.0 };
    }

    pub fn set_volume_opacity(&mut self, opacity: f32) {
        self.volume.opacity = if opacity.is_finite() { opacity.clamp(0.0, 1.0) } else { 1.0 };
    }

    pub fn set_preset(&mut self, name: &str) {
        self.volume.preset = name.to_owned();
    }
}

/// What an external renderer can report. Bump `version` when fields are
/// added so callers can tell old renderers apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RendererCapabilities {
    pub version: u32,
    pub slice_query: bool,
    pub color_range_query: bool,
    pub scale_query: bool,
    pub view_center_query: bool,
    pub change_events: bool,
}

impl RendererCapabilities {
    pub const VERSION: u32 = 1;

    pub fn can_report(&self) -> bool {
        self.slice_query || self.color_range_query || self.scale_query || self.view_center_query
    }

    /// Read-back needs the polling fallback.
    pub fn needs_polling(&self) -> bool {
        self.can_report() && !self.change_events
    }
}

/// A renderer the viewer state is mirrored into.
///
/// Queries are only made for capabilities the renderer advertises; the
/// defaults report nothing.
pub trait ExternalRenderer {
    fn capabilities(&self) -> RendererCapabilities;

    /// Apply the viewer state.
    fn apply(&mut self, state: &ViewerState);

    fn slice_index(&self, _orientation: Orientation) -> Option<i64> {
        None
    }

    /// Displayed intensity range `(min, max)`.
    fn color_range(&self) -> Option<(f32, f32)> {
        None
    }

    fn scale(&self) -> Option<f32> {
        None
    }

    fn view_center(&self) -> Option<(f32, f32)> {
        None
    }
}

/// Fixed-interval schedule driven by the caller's clock.
#[derive(Clone, Debug)]
pub struct PollScheduler {
    interval: Duration,
    next_due: Option<Instant>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a poll is due at `now`. The first call is always due; missed
    /// ticks are not replayed.
    pub fn is_due(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if now < due => false,
            _ => {
                self.next_due = Some(now + self.interval);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.next_due = None;
    }
}

/// Bidirectional sync between [`ViewerState`] and one external renderer.
#[derive(Debug)]
pub struct ViewSynchronizer {
    config: SyncConfig,
    scheduler: PollScheduler,
    last_pushed: Option<ViewerState>,
}

impl ViewSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            scheduler: PollScheduler::new(config.poll_interval()),
            config,
            last_pushed: None,
        }
    }

    /// Push `state` to the renderer if it differs from the last push.
    pub fn push(&mut self, state: &ViewerState, renderer: &mut dyn ExternalRenderer) -> bool {
        if self.last_pushed.as_ref() == Some(state) {
            return false;
        }
        renderer.apply(state);
        self.last_pushed = Some(state.clone());
        true
    }

    /// Read renderer state back into `state`. Returns whether anything
    /// changed. Pulled values are not pushed back.
    pub fn pull(&mut self, state: &mut ViewerState, renderer: &dyn ExternalRenderer) -> bool {
        let caps = renderer.capabilities();
        let before = state.clone();

        if caps.slice_query {
            for orientation in Orientation::ALL {
                if let Some(index) = renderer.slice_index(orientation)
                    && index != state.slice(orientation) as i64
                {
                    state.set_slice(orientation, index);
                }
            }
        }

        if caps.color_range_query
            && let Some((min, max)) = renderer.color_range()
            && min.is_finite()
            && max.is_finite()
        {
            let eps = self.config.window_epsilon;
            let level = (min + max) / 2.0;
            let width = max - min;
            if (level - state.window().level()).abs() > eps {
                state.set_level(level);
            }
            if (width - state.window().width()).abs() > eps {
                state.set_width(width);
            }
        }

        if caps.scale_query
            && let Some(scale) = renderer.scale()
            && scale.is_finite()
            && scale != state.scale()
        {
            state.set_scale(scale);
        }

        if caps.view_center_query
            && let Some((x, y)) = renderer.view_center()
        {
            let eps = self.config.pan_epsilon;
            let (px, py) = state.pan();
            if (x - px).abs() > eps || (y - py).abs() > eps {
                state.set_pan(x, y);
            }
        }

        let changed = *state != before;
        if changed {
            trace!("viewer state updated from renderer");
            self.last_pushed = Some(state.clone());
        }
        changed
    }

    /// Scheduled read-back for renderers without change events.
    pub fn tick(&mut self, now: Instant, state: &mut ViewerState, renderer: &dyn ExternalRenderer) -> bool {
        if !renderer.capabilities().needs_polling() || !self.scheduler.is_due(now) {
            return false;
        }
        self.pull(state, renderer)
    }

    /// Event-driven read-back.
    pub fn on_renderer_changed(&mut self, state: &mut ViewerState, renderer: &dyn ExternalRenderer) -> bool {
        self.pull(state, renderer)
    }

    /// Forget the last pushed state and the poll schedule, e.g. after a new
    /// study is loaded.
    pub fn reset(&mut self) {
        self.last_pushed = None;
        self.scheduler.reset();
    }
}
