//! Decoding of raw image bytes into a voxel grid.
//!
//! The core only depends on the [`VolumeDecoder`] trait; the DICOM adapter
//! here covers single files (including multi-frame objects) and series of
//! single-frame files. Single-file volume formats are recognised through
//! [`FormatHint`] but left to external decoders.

use crate::{
    enums::{FormatHint, SortBy},
    volume::VoxelVolume,
};

use dicom::{
    object::{DefaultDicomObject, from_reader, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use glam::{DMat3, DVec3};
use ndarray::{Array3, Axis, s};
use rayon::prelude::*;
use std::{fs, path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Missing or zero image dimensions")]
    MissingDimensions,

    #[error("Voxel buffer holds {actual} values, expected {expected}")]
    DataLength { expected: usize, actual: usize },

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Decode task aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Decoder output, before canonicalisation.
///
/// Optional geometry falls back to unit spacing and a zero origin when the
/// image is turned into a [`VoxelVolume`]; a missing direction stays
/// missing.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedImage {
    /// `[x, y, z]`.
    pub size: [usize; 3],
    pub spacing: Option<DVec3>,
    pub origin: Option<DVec3>,
    /// Columns are the physical directions of the index axes.
    pub direction: Option<DMat3>,
    /// x-fastest scalar buffer.
    pub data: Vec<f32>,
    pub scalar_range: Option<(f32, f32)>,
}

impl TryFrom<DecodedImage> for VoxelVolume {
    type Error = DecodeError;

    fn try_from(image: DecodedImage) -> Result<Self, Self::Error> {
        if image.size.contains(&0) {
            return Err(DecodeError::MissingDimensions);
        }
        let expected = image.size.iter().product::<usize>();
        if image.data.len() != expected {
            return Err(DecodeError::DataLength {
                expected,
                actual: image.data.len(),
            });
        }
        let volume = VoxelVolume::from_flat(image.size, image.data).map_err(|_| DecodeError::DataLength {
            expected,
            actual: expected,
        })?;
        let volume = volume
            .with_spacing(image.spacing.unwrap_or(DVec3::ONE))
            .with_origin(image.origin.unwrap_or(DVec3::ZERO))
            .with_direction(image.direction);
        Ok(match image.scalar_range {
            Some(range) => volume.with_scalar_range(range),
            None => volume,
        })
    }
}

/// Turns opaque file bytes into a voxel grid.
pub trait VolumeDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], hint: FormatHint) -> Result<DecodedImage, DecodeError>;
}

/// Run `decoder` on the blocking pool so the caller stays responsive.
pub async fn decode_blocking(
    decoder: Arc<dyn VolumeDecoder>,
    bytes: Vec<u8>,
    hint: FormatHint,
) -> Result<DecodedImage, DecodeError> {
    tokio::task::spawn_blocking(move || decoder.decode(&bytes, hint))
        .await
        .map_err(|err| DecodeError::Aborted(err.to_string()))?
}

/// One decoded slice with its position along the sort key.
struct SliceImage {
    order: Option<f64>,
    position: Option<DVec3>,
    pixels: ndarray::Array2<f32>,
}

/// DICOM adapter built on `dicom-rs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomSeriesDecoder {
    sort_by: SortBy,
}

impl DicomSeriesDecoder {
    pub fn new(sort_by: SortBy) -> Self {
        Self { sort_by }
    }

    /// Decode every `.dcm` file in a directory as one series.
    pub fn decode_directory(&self, path: impl AsRef<Path>) -> Result<DecodedImage, DecodeError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(DecodeError::NoValidImages);
        }

        let objects: Result<Vec<_>, _> = paths.par_iter().map(open_file).collect();
        self.decode_objects(&objects?)
    }

    /// Decode a series of single-frame objects. Objects that do not carry
    /// decodable pixel data are skipped.
    pub fn decode_objects(&self, objects: &[DefaultDicomObject]) -> Result<DecodedImage, DecodeError> {
        let normal = objects.iter().find_map(slice_normal);
        let mut slices: Vec<SliceImage> = objects
            .iter()
            .flat_map(|object| self.extract_slices(object, normal))
            .collect();

        if slices.is_empty() {
            return Err(DecodeError::NoValidImages);
        }

        if !matches!(self.sort_by, SortBy::None) {
            slices.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));
        }

        let (height, width) = slices[0].pixels.dim();
        if slices.iter().any(|slice| slice.pixels.dim() != (height, width)) {
            return Err(DecodeError::InconsistentDimensions);
        }

        let mut volume = Array3::<f32>::zeros((slices.len(), height, width));
        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        let first = objects
            .iter()
            .find(|object| pixel_spacing(object).is_some())
            .ok_or(DecodeError::MissingSpacing)?;
        let (dx, dy) = pixel_spacing(first).ok_or(DecodeError::MissingSpacing)?;
        let dz = slice_distance(&slices).or_else(|| slice_thickness(first)).unwrap_or(1.0);

        let direction = orientation_columns(first);
        let origin = slices[0].position;
        debug!(slices = slices.len(), width, height, "decoded DICOM series");

        Ok(DecodedImage {
            size: [width, height, slices.len()],
            spacing: Some(DVec3::new(dx, dy, dz)),
            origin,
            direction,
            data: volume.into_raw_vec_and_offset().0,
            scalar_range: None,
        })
    }

    fn extract_slices(&self, object: &DefaultDicomObject, normal: Option<DVec3>) -> Vec<SliceImage> {
        let Some(frames) = decode_frames(object) else {
            warn!("skipping DICOM object without decodable pixel data");
            return Vec::new();
        };
        let position = image_position(object);
        let base_order = self.sort_order(object, normal);
        let frame_step = slice_thickness(object).unwrap_or(1.0);

        frames
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(frame, pixels)| {
                let offset = frame as f64 * frame_step;
                SliceImage {
                    order: base_order.map(|order| order + offset),
                    position: position
                        .zip(normal)
                        .map(|(position, normal)| position + normal * offset),
                    pixels: pixels.to_owned(),
                }
            })
            .collect()
    }

    fn sort_order(&self, object: &DefaultDicomObject, normal: Option<DVec3>) -> Option<f64> {
        match self.sort_by {
            SortBy::ImagePositionPatient => {
                let position = image_position(object)?;
                Some(normal.map_or(position.z, |normal| position.dot(normal)))
            }
            SortBy::TablePosition => object.element(tags::TABLE_POSITION).ok()?.to_float64().ok(),
            SortBy::InstanceNumber => object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(f64::from),
            SortBy::None => Some(0.0),
        }
    }
}

impl VolumeDecoder for DicomSeriesDecoder {
    fn decode(&self, bytes: &[u8], hint: FormatHint) -> Result<DecodedImage, DecodeError> {
        if hint == FormatHint::VolumeFile {
            return Err(DecodeError::Unsupported(
                "single-file volume formats need an external decoder".to_owned(),
            ));
        }
        // Skip the 128 byte preamble when present.
        let body = match bytes.get(128..132) {
            Some(magic) if magic == b"DICM" => &bytes[128..],
            _ => bytes,
        };
        let object = from_reader(body)?;
        self.decode_objects(std::slice::from_ref(&object))
    }
}

/// All frames as `[frame, row, column]`, modality rescale applied.
fn decode_frames(object: &DefaultDicomObject) -> Option<Array3<f32>> {
    let pixel_data = object.decode_pixel_data().ok()?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
    pixel_data
        .to_ndarray_with_options::<f32>(&options)
        .ok()
        .map(|arr| arr.slice_move(s![.., .., .., 0]))
}

fn image_position(object: &DefaultDicomObject) -> Option<DVec3> {
    let pos = object
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()?
        .to_multi_float64()
        .ok()?;
    (pos.len() >= 3).then(|| DVec3::new(pos[0], pos[1], pos[2]))
}

/// Row and column direction cosines from ImageOrientationPatient.
fn image_orientation(object: &DefaultDicomObject) -> Option<(DVec3, DVec3)> {
    let iop = object
        .element(tags::IMAGE_ORIENTATION_PATIENT)
        .ok()?
        .to_multi_float64()
        .ok()?;
    if iop.len() < 6 {
        return None;
    }
    let row = DVec3::new(iop[0], iop[1], iop[2]).try_normalize()?;
    let col = DVec3::new(iop[3], iop[4], iop[5]).try_normalize()?;
    Some((row, col))
}

fn slice_normal(object: &DefaultDicomObject) -> Option<DVec3> {
    let (row, col) = image_orientation(object)?;
    row.cross(col).try_normalize()
}

fn orientation_columns(object: &DefaultDicomObject) -> Option<DMat3> {
    let (row, col) = image_orientation(object)?;
    let normal = row.cross(col).try_normalize()?;
    Some(DMat3::from_cols(row, col, normal))
}

/// `(x, y)` spacing. PixelSpacing is stored row spacing first.
fn pixel_spacing(object: &DefaultDicomObject) -> Option<(f64, f64)> {
    let spacing = object
        .element(tags::PIXEL_SPACING)
        .ok()?
        .to_multi_float64()
        .ok()?;
    match spacing.as_slice() {
        [row, col, ..] if *row > 0.0 && *col > 0.0 => Some((*col, *row)),
        _ => None,
    }
}

fn slice_thickness(object: &DefaultDicomObject) -> Option<f64> {
    object
        .element(tags::SLICE_THICKNESS)
        .ok()?
        .to_float64()
        .ok()
        .filter(|t| *t > 0.0)
}

fn slice_distance(slices: &[SliceImage]) -> Option<f64> {
    let first = slices.first()?.position?;
    let second = slices.get(1)?.position?;
    let distance = first.distance(second);
    (distance > 1e-6).then_some(distance)
}
