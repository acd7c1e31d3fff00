//! The rendering core as seen by its container.
//!
//! A [`Viewer`] owns the active study (normalized volume, optional label
//! mask), the shared [`ViewerState`] and [`StructureRegistry`], the
//! transfer function and the volume render backend. It is driven from a
//! single interactive thread; only decoding leaves it, through the blocking
//! pool.
//!
//! Loading a study bumps a generation counter. Mask fetches are described by
//! a [`FetchTicket`] carrying that generation, so a fetch that resolves after
//! the study was replaced is recognised as stale and dropped.

use crate::asset_cache::{AssetCache, ResourceId};
use crate::config::CoreConfig;
use crate::decoder::{DecodeError, VolumeDecoder, decode_blocking};
use crate::enums::{FormatHint, Orientation, Processor};
use crate::gpu_raymarcher::{GpuRaymarcher, WGPU};
use crate::observable::{Observable, Subscription};
use crate::orientation::{AxisFlips, OrientationNormalizer};
use crate::presets::{Preset, PresetError, Ramp};
use crate::raymarch::{Camera, ClipBox, CpuRaymarcher, Frame, IntensityVolume, RaymarchParams, Shading};
use crate::slice::{Overlay, Viewport, draw_crosshair, extract_slice, pick_voxel, plane_dimensions};
use crate::structures::{RegistryReader, SegmentationMetadata, Structure, StructureRegistry};
use crate::sync::{ExternalRenderer, ViewSynchronizer, ViewerState};
use crate::transfer_function::TransferFunction;
use crate::volume::{LabelId, LabelVolume, VoxelVolume};

use bitflags::bitflags;
use image::RgbaImage;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

const CROSSHAIR_COLOR: [u8; 4] = [255, 255, 0, 255];

bitflags! {
    /// Views that need to be redrawn.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyViews: u8 {
        const AXIAL    = 0b0001;
        const CORONAL  = 0b0010;
        const SAGITTAL = 0b0100;
        const VOLUME   = 0b1000;
        const PLANES = Self::AXIAL.bits() | Self::CORONAL.bits() | Self::SAGITTAL.bits();
    }
}

impl DirtyViews {
    pub fn plane(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Axial => Self::AXIAL,
            Orientation::Coronal => Self::CORONAL,
            Orientation::Sagittal => Self::SAGITTAL,
        }
    }
}

/// Failure reported by an external mask or asset fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Fetch failed: {0}")]
    Failed(String),

    #[error("Fetched data could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

/// Identifies one in-flight mask fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    identity: ResourceId,
}

impl FetchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> &ResourceId {
        &self.identity
    }
}

/// Result of starting a mask fetch.
#[derive(Debug)]
pub enum MaskRequest {
    /// No study is loaded.
    NoStudy,
    /// The mask was cached and has been applied.
    Cached(MaskResolution),
    /// The container should fetch the mask and hand it back with the ticket.
    Fetch(FetchTicket),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskResolution {
    Applied,
    /// Grid size differs from the volume; the overlay stays disabled.
    Mismatched,
    /// The ticket belongs to a replaced study or a superseded fetch.
    Stale,
    Failed,
}

#[derive(Clone, Debug)]
enum MaskState {
    Absent,
    /// A fetch is in flight; the mask it replaces stays shown until then.
    Pending {
        ticket: FetchTicket,
        previous: Option<Arc<LabelVolume>>,
    },
    Ready(Arc<LabelVolume>),
    Mismatched,
}

impl MaskState {
    fn shown(&self) -> Option<&Arc<LabelVolume>> {
        match self {
            MaskState::Ready(labels) => Some(labels),
            MaskState::Pending { previous, .. } => previous.as_ref(),
            MaskState::Absent | MaskState::Mismatched => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeRenderMode {
    Cpu,
    Gpu,
    /// GPU resources could not be created; slice views are unaffected.
    Unavailable,
}

enum VolumeBackend {
    Cpu(CpuRaymarcher),
    Gpu(GpuRaymarcher),
    Unavailable,
}

impl VolumeBackend {
    fn mode(&self) -> VolumeRenderMode {
        match self {
            VolumeBackend::Cpu(_) => VolumeRenderMode::Cpu,
            VolumeBackend::Gpu(_) => VolumeRenderMode::Gpu,
            VolumeBackend::Unavailable => VolumeRenderMode::Unavailable,
        }
    }

    fn release(&mut self) {
        if let VolumeBackend::Gpu(renderer) = self {
            renderer.release();
        }
    }
}

struct ActiveStudy {
    generation: u64,
    identity: Option<ResourceId>,
    volume: Arc<VoxelVolume>,
    flips: AxisFlips,
    mask: MaskState,
    transfer: TransferFunction,
    backend: VolumeBackend,
}

/// What lies under a point of a plane view.
#[derive(Clone, Debug, PartialEq)]
pub struct Pick {
    pub voxel: [usize; 3],
    pub value: f32,
    pub label: Option<LabelId>,
    pub structure: Option<Structure>,
}

pub struct Viewer {
    config: CoreConfig,
    decoder: Arc<dyn VolumeDecoder>,
    gpu: Option<WGPU>,
    state: Observable<ViewerState>,
    registry: StructureRegistry,
    study: Option<ActiveStudy>,
    generation: u64,
    overlay_enabled: bool,
    preset: Preset,
    camera: Camera,
    interacting: bool,
    masks: AssetCache<LabelVolume>,
    sync: ViewSynchronizer,
    dirty: Rc<Cell<DirtyViews>>,
    _subscriptions: Vec<Subscription>,
}

impl Viewer {
    pub fn new(config: CoreConfig, decoder: Arc<dyn VolumeDecoder>) -> Self {
        let preset = Preset::builtin(&config.default_preset).unwrap_or_else(|err| {
            warn!(%err, "falling back to the linear ramp preset");
            Preset::linear_ramp()
        });
        let mut initial = ViewerState::default();
        initial.set_preset(&preset.name);
        let state = Observable::new(initial);
        let registry = StructureRegistry::new();
        let dirty = Rc::new(Cell::new(DirtyViews::empty()));

        let subscriptions = vec![
            {
                let dirty = Rc::clone(&dirty);
                state.subscribe(move |_: &ViewerState| dirty.set(dirty.get() | DirtyViews::all()))
            },
            {
                let dirty = Rc::clone(&dirty);
                registry.subscribe(move |_: &[Structure]| dirty.set(dirty.get() | DirtyViews::PLANES))
            },
        ];

        Self {
            sync: ViewSynchronizer::new(config.sync.clone()),
            config,
            decoder,
            gpu: None,
            state,
            registry,
            study: None,
            generation: 0,
            overlay_enabled: false,
            preset,
            camera: Camera::default(),
            interacting: false,
            masks: AssetCache::new(),
            dirty,
            _subscriptions: subscriptions,
        }
    }

    /// Use `wgpu` for the volume renderer of subsequent studies when the
    /// configured processor is [`Processor::GPU`].
    pub fn with_gpu(mut self, wgpu: WGPU) -> Self {
        self.gpu = Some(wgpu);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Shared viewer state. Mutations mark every view dirty.
    pub fn state(&self) -> &Observable<ViewerState> {
        &self.state
    }

    pub fn registry(&self) -> &StructureRegistry {
        &self.registry
    }

    pub fn structures(&self) -> RegistryReader {
        self.registry.reader()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn volume(&self) -> Option<&VoxelVolume> {
        self.study.as_ref().map(|study| study.volume.as_ref())
    }

    pub fn flips(&self) -> Option<AxisFlips> {
        self.study.as_ref().map(|study| study.flips)
    }

    pub fn transfer_function(&self) -> Option<&TransferFunction> {
        self.study.as_ref().map(|study| &study.transfer)
    }

    pub fn volume_render_mode(&self) -> Option<VolumeRenderMode> {
        self.study.as_ref().map(|study| study.backend.mode())
    }

    /// Decode `bytes` off the interaction path and make the result the
    /// active study. On failure the previous study stays in place.
    pub async fn load(
        &mut self,
        bytes: Vec<u8>,
        hint: FormatHint,
        identity: Option<&str>,
    ) -> Result<u64, DecodeError> {
        let start = Instant::now();
        let decoded = decode_blocking(Arc::clone(&self.decoder), bytes, hint)
            .await
            .and_then(VoxelVolume::try_from);
        match decoded {
            Ok(volume) => {
                debug!(elapsed = ?start.elapsed(), "volume decoded");
                Ok(self.replace_volume(volume, identity).await)
            }
            Err(err) => {
                warn!(%err, generation = self.generation, "decode failed, keeping current study");
                Err(err)
            }
        }
    }

    /// Make `volume` the active study and return its generation.
    ///
    /// Resources of the previous study are released first: GPU textures,
    /// cached masks, structures and pending fetches.
    pub async fn replace_volume(&mut self, volume: VoxelVolume, identity: Option<&str>) -> u64 {
        if let Some(mut previous) = self.study.take() {
            previous.backend.release();
        }
        self.generation += 1;
        self.masks.set_generation(self.generation);
        self.masks.evict_except(self.generation);
        self.registry.clear();
        self.overlay_enabled = false;

        let (volume, flips) = OrientationNormalizer::normalize(volume);
        let size = volume.size();
        let range = volume.scalar_range();
        info!(generation = self.generation, ?size, ?range, ?flips, "study replaced");

        let transfer = TransferFunction::build(&self.preset, range, self.config.raymarch.transfer_samples);
        let backend = self.create_backend(&volume, &transfer).await;

        self.study = Some(ActiveStudy {
            generation: self.generation,
            identity: identity.map(ResourceId::normalize),
            volume: Arc::new(volume),
            flips,
            mask: MaskState::Absent,
            transfer,
            backend,
        });
        self.camera.reset();
        self.sync.reset();
        self.state.update(|state| state.reset_for_volume(size, range));
        self.mark(DirtyViews::all());
        self.generation
    }

    async fn create_backend(&self, volume: &VoxelVolume, transfer: &TransferFunction) -> VolumeBackend {
        let intensities = IntensityVolume::from_volume(volume);
        match self.config.processor {
            Processor::CPU => VolumeBackend::Cpu(CpuRaymarcher::new(intensities, transfer.clone())),
            Processor::GPU => {
                let Some(wgpu) = self.gpu.clone() else {
                    warn!("no GPU device attached, volume rendering unavailable");
                    return VolumeBackend::Unavailable;
                };
                match GpuRaymarcher::new(&intensities, transfer, wgpu).await {
                    Ok(renderer) => VolumeBackend::Gpu(renderer),
                    Err(err) => {
                        warn!(%err, "GPU raymarcher unavailable, slice views unaffected");
                        VolumeBackend::Unavailable
                    }
                }
            }
        }
    }

    pub fn identity(&self) -> Option<&ResourceId> {
        self.study.as_ref().and_then(|study| study.identity.as_ref())
    }

    /// Replace the structure list from segmentation metadata.
    pub fn seed_structures(&self, metadata: &SegmentationMetadata) {
        self.registry.seed_from_metadata(metadata);
    }

    pub fn replace_structures(&self, structures: Vec<Structure>) {
        self.registry.replace_all(structures);
    }

    /// Start fetching the label mask at `identity` for the active study.
    pub fn begin_mask_fetch(&mut self, identity: &str) -> MaskRequest {
        let id = ResourceId::normalize(identity);
        let Some(generation) = self.study.as_ref().map(|study| study.generation) else {
            return MaskRequest::NoStudy;
        };
        if let Some(labels) = self.masks.get(&id) {
            debug!(%id, "label mask served from cache");
            return MaskRequest::Cached(self.apply_mask(labels));
        }
        let ticket = FetchTicket { generation, identity: id };
        if let Some(study) = self.study.as_mut() {
            let previous = study.mask.shown().cloned();
            study.mask = MaskState::Pending {
                ticket: ticket.clone(),
                previous,
            };
        }
        MaskRequest::Fetch(ticket)
    }

    /// Hand back the outcome of a mask fetch started with
    /// [`begin_mask_fetch`](Self::begin_mask_fetch).
    pub fn complete_mask_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<LabelVolume, FetchError>,
    ) -> MaskResolution {
        let current = match self.study.as_ref() {
            Some(study) => matches!(&study.mask, MaskState::Pending { ticket: pending, .. } if *pending == ticket),
            None => false,
        };
        if !current {
            debug!(
                identity = %ticket.identity,
                generation = ticket.generation,
                active = self.generation,
                "discarding stale mask fetch"
            );
            return MaskResolution::Stale;
        }

        match result {
            Ok(labels) => {
                let flips = self.study.as_ref().map_or(AxisFlips::NONE, |study| study.flips);
                let labels = OrientationNormalizer::apply_to_labels(labels, flips);
                let labels = self.masks.insert(ticket.identity.clone(), labels);
                self.apply_mask(labels)
            }
            Err(err) => {
                warn!(%err, identity = %ticket.identity, "mask fetch failed");
                if let Some(study) = self.study.as_mut() {
                    study.mask = match study.mask.shown().cloned() {
                        Some(previous) => MaskState::Ready(previous),
                        None => MaskState::Absent,
                    };
                }
                MaskResolution::Failed
            }
        }
    }

    /// Attach a label mask that is already in memory.
    pub fn set_labels(&mut self, labels: LabelVolume) -> MaskResolution {
        let Some(flips) = self.flips() else {
            return MaskResolution::Stale;
        };
        self.apply_mask(Arc::new(OrientationNormalizer::apply_to_labels(labels, flips)))
    }

    fn apply_mask(&mut self, labels: Arc<LabelVolume>) -> MaskResolution {
        let Some(study) = self.study.as_mut() else {
            return MaskResolution::Stale;
        };
        if !labels.matches(&study.volume) {
            debug!(
                labels = ?labels.size(),
                volume = ?study.volume.size(),
                "label mask does not match volume, overlay disabled"
            );
            study.mask = MaskState::Mismatched;
            self.overlay_enabled = false;
            return MaskResolution::Mismatched;
        }
        study.mask = MaskState::Ready(labels);
        self.overlay_enabled = true;
        self.mark(DirtyViews::PLANES);
        MaskResolution::Applied
    }

    /// The mask currently shown, including one kept while a replacement is
    /// being fetched.
    pub fn labels(&self) -> Option<&LabelVolume> {
        self.study.as_ref()?.mask.shown().map(Arc::as_ref)
    }

    pub fn mask_pending(&self) -> bool {
        matches!(
            self.study.as_ref().map(|study| &study.mask),
            Some(MaskState::Pending { .. })
        )
    }

    pub fn overlay_enabled(&self) -> bool {
        self.overlay_enabled && self.labels().is_some()
    }

    /// Toggle the label overlay. Ignored while no matching mask is loaded.
    pub fn set_overlay_enabled(&mut self, enabled: bool) -> bool {
        if self.labels().is_none() {
            debug!(enabled, "overlay toggle ignored, no label mask resolved");
            return false;
        }
        if self.overlay_enabled != enabled {
            self.overlay_enabled = enabled;
            self.mark(DirtyViews::PLANES);
        }
        true
    }

    /// Switch to a built-in preset and rebuild the transfer function.
    pub fn set_preset(&mut self, name: &str) -> Result<(), PresetError> {
        let preset = Preset::builtin(name)?;
        self.set_custom_preset(preset);
        Ok(())
    }

    pub fn set_custom_preset(&mut self, preset: Preset) {
        self.state.update(|state| state.set_preset(&preset.name));
        self.preset = preset;
        self.rebuild_transfer_function();
    }

    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    fn rebuild_transfer_function(&mut self) {
        let samples = self.config.raymarch.transfer_samples;
        let Some(study) = self.study.as_mut() else {
            return;
        };
        let transfer = TransferFunction::build(&self.preset, study.volume.scalar_range(), samples);
        match &mut study.backend {
            VolumeBackend::Cpu(renderer) => renderer.set_transfer_function(transfer.clone()),
            VolumeBackend::Gpu(renderer) => {
                if let Err(err) = renderer.set_transfer_function(&transfer) {
                    warn!(%err, "transfer function upload failed, volume rendering unavailable");
                    study.backend.release();
                    study.backend = VolumeBackend::Unavailable;
                }
            }
            VolumeBackend::Unavailable => {}
        }
        study.transfer = transfer;
        self.mark(DirtyViews::VOLUME);
    }

    /// Raymarch parameters for the current state.
    pub fn raymarch_params(&self) -> RaymarchParams {
        let state = self.state.get();
        let mut params = RaymarchParams::from_config(&self.config.raymarch);
        params.threshold = state.volume().threshold;
        params.global_opacity = state.volume().opacity;
        params.clip = if state.clip_enabled() {
            ClipBox::from_fractions(state.clip())
        } else {
            ClipBox::FULL
        };
        // The linear ramp keeps the configured shading.
        if !matches!(self.preset.ramp, Ramp::Linear) {
            params.shading = Shading::from(self.preset.shading);
        }
        params
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn orbit(&mut self, yaw: f32, pitch: f32) {
        self.camera.orbit(yaw, pitch);
        self.mark(DirtyViews::VOLUME);
    }

    pub fn zoom(&mut self, factor: f32) {
        self.camera.zoom(factor);
        self.mark(DirtyViews::VOLUME);
    }

    pub fn reset_camera(&mut self) {
        self.camera.reset();
        self.mark(DirtyViews::VOLUME);
    }

    /// While interacting the 3D view is redrawn every cycle.
    pub fn set_interacting(&mut self, interacting: bool) {
        self.interacting = interacting;
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    fn mark(&self, views: DirtyViews) {
        self.dirty.set(self.dirty.get() | views);
    }

    /// Views to redraw this cycle. Clears the set.
    pub fn take_dirty(&mut self) -> DirtyViews {
        let mut dirty = self.dirty.replace(DirtyViews::empty());
        if self.interacting {
            dirty |= DirtyViews::VOLUME;
        }
        dirty
    }

    /// Composite one plane at the current slice, with the crosshair drawn
    /// when enabled.
    pub fn render_slice(&self, orientation: Orientation) -> Option<RgbaImage> {
        let study = self.study.as_ref()?;
        let state = self.state.get();
        let lookup = self.registry.reader().label_lookup();
        let overlay = match (study.mask.shown(), self.overlay_enabled) {
            (Some(labels), true) => Some(Overlay {
                labels: labels.as_ref(),
                lookup: &lookup,
                config: &self.config.overlay,
            }),
            _ => None,
        };

        let index = state.slice(orientation) as i64;
        let mut image = extract_slice(&study.volume, orientation, index, state.window(), overlay);
        if state.crosshair() {
            let [x, y, z] = state.slices().crosshair_voxel();
            let volume = &study.volume;
            let voxel = [
                volume.clamp_index(Orientation::Sagittal, i64::try_from(x).unwrap_or(i64::MAX)),
                volume.clamp_index(Orientation::Coronal, i64::try_from(y).unwrap_or(i64::MAX)),
                volume.clamp_index(Orientation::Axial, i64::try_from(z).unwrap_or(i64::MAX)),
            ];
            draw_crosshair(&mut image, study.volume.size(), orientation, voxel, CROSSHAIR_COLOR);
        }
        Some(image)
    }

    /// [`render_slice`](Self::render_slice) letterboxed into a container,
    /// applying the state's scale and pan.
    pub fn present_slice(&self, orientation: Orientation, container: (u32, u32)) -> Option<RgbaImage> {
        let raster = self.render_slice(orientation)?;
        let viewport = self.viewport(orientation, container)?;
        Some(viewport.present(&raster))
    }

    pub fn viewport(&self, orientation: Orientation, container: (u32, u32)) -> Option<Viewport> {
        let volume = self.volume()?;
        let (width, height) = plane_dimensions(volume.size(), orientation);
        let state = self.state.get();
        Some(
            Viewport::fit((width as u32, height as u32), container)
                .with_zoom(state.scale())
                .with_pan(state.pan()),
        )
    }

    /// Voxel, value and structure under a container point of a plane view.
    pub fn pick(&self, orientation: Orientation, container: (u32, u32), point: (f32, f32)) -> Option<Pick> {
        let study = self.study.as_ref()?;
        let viewport = self.viewport(orientation, container)?;
        let index = self.state.with(|state| state.slice(orientation)) as i64;
        let voxel = pick_voxel(&study.volume, orientation, index, &viewport, point)?;
        let [x, y, z] = voxel;
        let label = self
            .labels()
            .map(|labels| labels.label(x, y, z))
            .filter(|&label| label != 0);
        let structure = label.and_then(|label| self.registry.reader().find_by_label(label));
        Some(Pick {
            voxel,
            value: study.volume.value(x, y, z),
            label,
            structure,
        })
    }

    /// Move all three planes through `voxel`.
    pub fn focus_voxel(&self, voxel: [usize; 3]) {
        self.state.update(|state| {
            state.set_slice(Orientation::Sagittal, voxel[0] as i64);
            state.set_slice(Orientation::Coronal, voxel[1] as i64);
            state.set_slice(Orientation::Axial, voxel[2] as i64);
        });
    }

    /// Raymarch the 3D view. `None` while no study is loaded, the volume
    /// view is switched off, or the render mode is unavailable.
    pub async fn render_volume(&mut self, width: u32, height: u32) -> Option<Frame> {
        if !self.state.with(|state| state.volume().enabled) {
            return None;
        }
        let params = self.raymarch_params();
        let camera = self.camera;
        let study = self.study.as_mut()?;
        match &study.backend {
            VolumeBackend::Cpu(renderer) => Some(renderer.render(&camera, &params, width, height)),
            VolumeBackend::Gpu(renderer) => {
                let result = renderer.render(&camera, &params, width, height).await;
                match result {
                    Ok(frame) => Some(frame),
                    Err(err) => {
                        warn!(%err, "GPU raymarch failed, volume rendering unavailable");
                        study.backend.release();
                        study.backend = VolumeBackend::Unavailable;
                        None
                    }
                }
            }
            VolumeBackend::Unavailable => None,
        }
    }

    /// Mirror the state into an external renderer if it changed.
    pub fn push_to(&mut self, renderer: &mut dyn ExternalRenderer) -> bool {
        let state = self.state.get();
        self.sync.push(&state, renderer)
    }

    /// Scheduled read-back from a renderer without change events.
    pub fn poll(&mut self, now: Instant, renderer: &dyn ExternalRenderer) -> bool {
        let mut state = self.state.get();
        let changed = self.sync.tick(now, &mut state, renderer);
        if changed {
            self.state.set(state);
        }
        changed
    }

    /// Read-back triggered by a renderer change event.
    pub fn on_renderer_changed(&mut self, renderer: &dyn ExternalRenderer) -> bool {
        let mut state = self.state.get();
        let changed = self.sync.on_renderer_changed(&mut state, renderer);
        if changed {
            self.state.set(state);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedImage, DicomSeriesDecoder};
    use crate::structures::Structure;
    use glam::DMat3;

    fn viewer() -> Viewer {
        Viewer::new(CoreConfig::default(), Arc::new(DicomSeriesDecoder::default()))
    }

    fn ramp(size: [usize; 3]) -> VoxelVolume {
        let n = size.iter().product::<usize>();
        VoxelVolume::from_flat(size, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        futures::executor::block_on(future)
    }

    #[test]
    fn load_centres_slices_and_window() {
        let mut viewer = viewer();
        let generation = block_on(viewer.replace_volume(ramp([4, 6, 8]), Some("study/1")));
        assert_eq!(generation, 1);
        let state = viewer.state().get();
        assert_eq!(state.slice(Orientation::Axial), 4);
        assert_eq!(state.slice(Orientation::Coronal), 3);
        assert_eq!(state.slice(Orientation::Sagittal), 2);
        assert_eq!(state.window().level(), (191.0) / 2.0);
        assert_eq!(state.window().width(), 191.0);
        assert_eq!(viewer.volume_render_mode(), Some(VolumeRenderMode::Cpu));
        assert_eq!(viewer.identity().map(ResourceId::as_str), Some("study/1"));
    }

    #[test]
    fn crosshair_from_larger_study_state_is_clamped() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([4, 4, 4]), None));
        let mut restored = ViewerState::default();
        restored.reset_for_volume([64, 64, 64], (0.0, 63.0));
        viewer.state().set(restored);

        for orientation in Orientation::ALL {
            let image = viewer.render_slice(orientation).unwrap();
            assert_eq!(image.dimensions(), (4, 4));
            // Crosshair sits on the last slice of each other axis.
            let on_line = image.pixels().filter(|p| p.0 == CROSSHAIR_COLOR).count();
            assert_eq!(on_line, 7);
        }
        let axial = viewer.render_slice(Orientation::Axial).unwrap();
        // Last x column, last y row shown at the top.
        assert_eq!(axial.get_pixel(3, 2).0, CROSSHAIR_COLOR);
        assert_eq!(axial.get_pixel(1, 0).0, CROSSHAIR_COLOR);
    }

    #[test]
    fn gpu_without_device_is_unavailable_but_slices_work() {
        let config = CoreConfig {
            processor: Processor::GPU,
            ..Default::default()
        };
        let mut viewer = Viewer::new(config, Arc::new(DicomSeriesDecoder::default()));
        block_on(viewer.replace_volume(ramp([3, 3, 3]), None));
        assert_eq!(viewer.volume_render_mode(), Some(VolumeRenderMode::Unavailable));
        assert!(block_on(viewer.render_volume(8, 8)).is_none());
        assert!(viewer.render_slice(Orientation::Axial).is_some());
    }

    #[test]
    fn overlay_toggle_waits_for_mask() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        assert!(!viewer.set_overlay_enabled(true));

        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("masks/seg.nii.gz") else {
            panic!("expected a fetch ticket");
        };
        assert!(viewer.mask_pending());
        assert!(!viewer.set_overlay_enabled(true));
        assert!(!viewer.overlay_enabled());

        let labels = LabelVolume::from_flat([2, 2, 2], vec![1; 8]).unwrap();
        assert_eq!(viewer.complete_mask_fetch(ticket, Ok(labels)), MaskResolution::Applied);
        assert!(viewer.overlay_enabled());
        assert!(viewer.set_overlay_enabled(false));
        assert!(!viewer.overlay_enabled());
    }

    #[test]
    fn mismatched_mask_keeps_overlay_disabled() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("mask") else {
            panic!("expected a fetch ticket");
        };
        let labels = LabelVolume::from_flat([2, 2, 1], vec![1; 4]).unwrap();
        assert_eq!(viewer.complete_mask_fetch(ticket, Ok(labels)), MaskResolution::Mismatched);
        assert!(!viewer.overlay_enabled());
        assert!(!viewer.set_overlay_enabled(true));
        let image = viewer.render_slice(Orientation::Axial).unwrap();
        assert!(image.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }

    #[test]
    fn fetch_for_replaced_study_is_stale() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), Some("a")));
        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("mask") else {
            panic!("expected a fetch ticket");
        };
        block_on(viewer.replace_volume(ramp([2, 2, 2]), Some("b")));
        let labels = LabelVolume::from_flat([2, 2, 2], vec![1; 8]).unwrap();
        assert_eq!(viewer.complete_mask_fetch(ticket, Ok(labels)), MaskResolution::Stale);
        assert!(viewer.labels().is_none());
    }

    #[test]
    fn superseded_fetch_is_stale() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        let MaskRequest::Fetch(first) = viewer.begin_mask_fetch("mask/v1") else {
            panic!("expected a fetch ticket");
        };
        let MaskRequest::Fetch(second) = viewer.begin_mask_fetch("mask/v2") else {
            panic!("expected a fetch ticket");
        };
        let labels = || LabelVolume::from_flat([2, 2, 2], vec![3; 8]).unwrap();
        assert_eq!(viewer.complete_mask_fetch(first, Ok(labels())), MaskResolution::Stale);
        assert_eq!(viewer.complete_mask_fetch(second, Ok(labels())), MaskResolution::Applied);
    }

    #[test]
    fn failed_fetch_leaves_overlay_off() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("mask") else {
            panic!("expected a fetch ticket");
        };
        let result = viewer.complete_mask_fetch(ticket, Err(FetchError::NotFound("mask".into())));
        assert_eq!(result, MaskResolution::Failed);
        assert!(!viewer.mask_pending());
        assert!(!viewer.overlay_enabled());
    }

    #[test]
    fn shown_mask_survives_replacement_fetch() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        viewer.set_labels(LabelVolume::from_flat([2, 2, 2], vec![4; 8]).unwrap());
        assert!(viewer.overlay_enabled());

        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("mask/v2") else {
            panic!("expected a fetch ticket");
        };
        assert!(viewer.mask_pending());
        assert!(viewer.overlay_enabled());
        assert_eq!(viewer.labels().map(|labels| labels.label(0, 0, 0)), Some(4));

        let result = viewer.complete_mask_fetch(ticket, Err(FetchError::NotFound("mask/v2".into())));
        assert_eq!(result, MaskResolution::Failed);
        assert!(!viewer.mask_pending());
        assert!(viewer.overlay_enabled());
        assert_eq!(viewer.labels().map(|labels| labels.label(1, 1, 1)), Some(4));

        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("mask/v3") else {
            panic!("expected a fetch ticket");
        };
        let labels = LabelVolume::from_flat([2, 2, 2], vec![6; 8]).unwrap();
        assert_eq!(viewer.complete_mask_fetch(ticket, Ok(labels)), MaskResolution::Applied);
        assert_eq!(viewer.labels().map(|labels| labels.label(0, 0, 0)), Some(6));
    }

    #[test]
    fn cached_mask_is_reused_within_study_only() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("https://Host/mask?sig=1") else {
            panic!("expected a fetch ticket");
        };
        let labels = LabelVolume::from_flat([2, 2, 2], vec![2; 8]).unwrap();
        viewer.complete_mask_fetch(ticket, Ok(labels));
        assert!(matches!(
            viewer.begin_mask_fetch("https://host/mask"),
            MaskRequest::Cached(MaskResolution::Applied)
        ));

        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        assert!(matches!(viewer.begin_mask_fetch("https://host/mask"), MaskRequest::Fetch(_)));
    }

    #[test]
    fn mask_follows_volume_flips() {
        let mut viewer = viewer();
        let volume = ramp([2, 1, 1]).with_direction(Some(DMat3::from_diagonal(glam::DVec3::new(-1.0, 1.0, 1.0))));
        block_on(viewer.replace_volume(volume, None));
        assert_eq!(viewer.flips(), Some(AxisFlips([true, false, false])));
        viewer.set_labels(LabelVolume::from_flat([2, 1, 1], vec![7, 0]).unwrap());
        let labels = viewer.labels().unwrap();
        assert_eq!(labels.label(0, 0, 0), 0);
        assert_eq!(labels.label(1, 0, 0), 7);
        // The value that was at x = 0 moved with its label.
        assert_eq!(viewer.volume().unwrap().value(1, 0, 0), 0.0);
    }

    #[test]
    fn replacing_study_clears_structures() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        viewer.replace_structures(vec![Structure::new("skeleton", "Femur").with_label(1)]);
        assert_eq!(viewer.structures().len(), 1);
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        assert!(viewer.structures().is_empty());
    }

    #[test]
    fn dirty_views_follow_state_and_registry() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        assert_eq!(viewer.take_dirty(), DirtyViews::all());
        assert!(viewer.take_dirty().is_empty());

        viewer.replace_structures(vec![Structure::new("organs", "Liver").with_label(1)]);
        assert_eq!(viewer.take_dirty(), DirtyViews::PLANES);

        viewer.state().update(|state| state.set_crosshair(false));
        assert_eq!(viewer.take_dirty(), DirtyViews::all());

        viewer.orbit(0.1, 0.0);
        assert_eq!(viewer.take_dirty(), DirtyViews::VOLUME);

        viewer.set_interacting(true);
        assert_eq!(viewer.take_dirty(), DirtyViews::VOLUME);
        assert_eq!(viewer.take_dirty(), DirtyViews::VOLUME);
        viewer.set_interacting(false);
        assert!(viewer.take_dirty().is_empty());
    }

    #[test]
    fn pick_reports_label_and_structure() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 1]), None));
        viewer.replace_structures(vec![Structure::new("organs", "Liver").with_label(5)]);
        viewer.set_labels(LabelVolume::from_flat([2, 2, 1], vec![0, 0, 5, 0]).unwrap());
        // Axial row 0 shows y = 1; column 0 is x = 0.
        let pick = viewer.pick(Orientation::Axial, (20, 20), (5.0, 5.0)).unwrap();
        assert_eq!(pick.voxel, [0, 1, 0]);
        assert_eq!(pick.value, 2.0);
        assert_eq!(pick.label, Some(5));
        assert_eq!(pick.structure.map(|s| s.name), Some("Liver".to_owned()));
        assert!(viewer.pick(Orientation::Axial, (20, 20), (15.0, 15.0)).unwrap().label.is_none());
    }

    #[test]
    fn preset_change_rebuilds_transfer_function() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        assert_eq!(viewer.transfer_function().unwrap().preset_name(), "CT-Bone");
        viewer.set_preset("natural").unwrap();
        assert_eq!(viewer.transfer_function().unwrap().preset_name(), "Natural");
        assert_eq!(viewer.state().get().volume().preset, "Natural");
        assert!(viewer.set_preset("No-Such-Preset").is_err());
        assert_eq!(viewer.preset().name, "Natural");
    }

    #[test]
    fn clip_toggle_restores_full_box() {
        let mut viewer = viewer();
        block_on(viewer.replace_volume(ramp([2, 2, 2]), None));
        viewer.state().update(|state| state.set_clip(0, 0.5));
        assert_eq!(viewer.raymarch_params().clip, ClipBox::FULL);
        viewer.state().update(|state| state.set_clip_enabled(true));
        assert_eq!(viewer.raymarch_params().clip, ClipBox::from_fractions([0.5, 1.0, 1.0]));
    }

    #[tokio::test]
    async fn decode_failure_keeps_previous_study() {
        let mut viewer = viewer();
        viewer.replace_volume(ramp([2, 2, 2]), Some("first")).await;
        let err = viewer.load(vec![0; 16], FormatHint::Dicom, Some("second")).await;
        assert!(err.is_err());
        assert_eq!(viewer.generation(), 1);
        assert_eq!(viewer.identity().map(ResourceId::as_str), Some("first"));
        assert!(viewer.render_slice(Orientation::Coronal).is_some());
    }

    struct FixedDecoder;

    impl VolumeDecoder for FixedDecoder {
        fn decode(&self, _bytes: &[u8], _hint: FormatHint) -> Result<DecodedImage, DecodeError> {
            Ok(DecodedImage {
                size: [2, 2, 2],
                spacing: None,
                origin: None,
                direction: None,
                data: (0..8).map(|v| v as f32).collect(),
                scalar_range: Some((0.0, 7.0)),
            })
        }
    }

    #[tokio::test]
    async fn load_decodes_on_blocking_pool() {
        let mut viewer = Viewer::new(CoreConfig::default(), Arc::new(FixedDecoder));
        let generation = viewer.load(Vec::new(), FormatHint::Unknown, None).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(viewer.volume().unwrap().size(), [2, 2, 2]);
        assert_eq!(viewer.state().get().window().level(), 3.5);
    }
}
