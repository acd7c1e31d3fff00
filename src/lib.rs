//! # voxel-view
//!
//! Rendering core for volumetric medical images. A decoded 3D scalar image
//! is canonicalised into a voxel grid and shown as three synchronized
//! orthogonal planes (multi-planar reconstruction) and a ray-marched 3D
//! view:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!  - Volume (CPU reference raymarcher or WGPU compute shader)
//!
//! Plane views apply a window/level and blend an optional segmentation
//! label overlay coloured by a shared [`StructureRegistry`]. The 3D view is
//! driven by a transfer function built from a named preset and by per-axis
//! clip planes. Slice composition and the CPU raymarcher run in parallel
//! using rayon.
//!
//! File decoding sits behind the [`VolumeDecoder`] trait. A DICOM series
//! decoder built on dicom-rs is included; other formats are recognised by
//! [`FormatHint`] and left to external decoders. The core keeps its state on
//! one interactive thread: [`Viewer`] is not `Send`, and only decoding is
//! moved to tokio's blocking pool.
//!
//! Volumes are assumed to be:
//!  - Single channel scalar grids
//!  - Regularly spaced (direction cosines per index axis, no shear)
//!  - Paired with label masks of exactly the same grid size
//!
//! # Examples
//!
//! ## Loading a series and rendering the centre slices
//!
//! Decode all DICOM files of the dicom/ directory sorted by
//! ImagePositionPatient, then composite the three planes and a 3D frame.
//!
//! ```no_run
//! # use voxel_view::{CoreConfig, DicomSeriesDecoder, Orientation, SortBy, Viewer, VoxelVolume};
//! # use std::sync::Arc;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let decoder = DicomSeriesDecoder::new(SortBy::ImagePositionPatient);
//! let volume = VoxelVolume::try_from(decoder.decode_directory("dicom")?)?;
//!
//! let mut viewer = Viewer::new(CoreConfig::default(), Arc::new(decoder));
//! viewer.replace_volume(volume, Some("dicom")).await;
//! for orientation in Orientation::ALL {
//!     if let Some(image) = viewer.render_slice(orientation) {
//!         image.save(format!("{orientation:?}.png"))?;
//!     }
//! }
//! if let Some(frame) = viewer.render_volume(512, 512).await {
//!     frame.to_image().save("volume.png")?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Overlaying a segmentation
//!
//! ```no_run
//! # use voxel_view::{LabelVolume, MaskRequest, SegmentationMetadata, Viewer};
//! # fn fetch(viewer: &mut Viewer, mask: LabelVolume, metadata: &str) -> Result<(), Box<dyn std::error::Error>> {
//! viewer.seed_structures(&SegmentationMetadata::from_json(metadata)?);
//! if let MaskRequest::Fetch(ticket) = viewer.begin_mask_fetch("https://example.org/seg.nii.gz") {
//!     // ... fetch asynchronously, then hand the result back.
//!     viewer.complete_mask_fetch(ticket, Ok(mask));
//! }
//! # Ok(())
//! # }
//! ```

pub mod asset_cache;
pub mod config;
pub mod decoder;
pub mod enums;
pub mod gpu_raymarcher;
mod interpolator;
pub mod label_match;
pub mod observable;
pub mod orientation;
pub mod presets;
pub mod raymarch;
pub mod slice;
pub mod structures;
pub mod sync;
pub mod transfer_function;
pub mod viewer;
pub mod volume;
pub mod window;

pub use asset_cache::{AssetCache, ResourceId};
pub use config::{ConfigError, CoreConfig, OverlayConfig, RaymarchConfig, SyncConfig};
pub use decoder::{DecodeError, DecodedImage, DicomSeriesDecoder, VolumeDecoder};
pub use enums::{FormatHint, Orientation, Processor, SortBy};
pub use gpu_raymarcher::{GpuError, GpuRaymarcher, WGPU};
pub use label_match::{LabelMatcher, MatchOutcome, MatchStrategy};
pub use observable::{Observable, Subscription};
pub use orientation::{AxisFlips, OrientationNormalizer};
pub use presets::{Preset, PresetError};
pub use raymarch::{Camera, ClipBox, CpuRaymarcher, Frame, IntensityVolume, RaymarchParams};
pub use slice::{Overlay, Viewport, extract_slice};
pub use structures::{
    LabelLookup, RegistryReader, SegmentationMetadata, Structure, StructureRegistry,
};
pub use sync::{
    ExternalRenderer, PollScheduler, RendererCapabilities, ViewSynchronizer, ViewerState,
};
pub use transfer_function::TransferFunction;
pub use viewer::{
    DirtyViews, FetchError, FetchTicket, MaskRequest, MaskResolution, Pick, Viewer,
    VolumeRenderMode,
};
pub use volume::{LabelId, LabelVolume, VoxelVolume};
pub use window::WindowLevel;
