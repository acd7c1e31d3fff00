use serde::{Deserialize, Serialize};

/// The three orthogonal anatomical planes.
///
/// Each plane looks down one index axis of the voxel grid:
/// axial along z, coronal along y, sagittal along x.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    pub const ALL: [Orientation; 3] = [
        Orientation::Axial,
        Orientation::Coronal,
        Orientation::Sagittal,
    ];

    /// Index axis (0 = x, 1 = y, 2 = z) orthogonal to the plane.
    pub fn normal_axis(self) -> usize {
        match self {
            Orientation::Axial => 2,
            Orientation::Coronal => 1,
            Orientation::Sagittal => 0,
        }
    }
}

/// Where the volume renderer runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    #[default]
    CPU,
    GPU,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// Hint handed to a decoder together with the raw bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatHint {
    Dicom,
    /// Single-file volume formats (NIfTI, NRRD, MetaImage).
    VolumeFile,
    #[default]
    Unknown,
}

impl FormatHint {
    pub fn from_file_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let volume_exts = [".nii", ".nii.gz", ".nrrd", ".mha", ".mhd"];
        if volume_exts.iter().any(|ext| name.ends_with(ext)) {
            FormatHint::VolumeFile
        } else if name.ends_with(".dcm") || name.ends_with(".dicom") {
            FormatHint::Dicom
        } else {
            FormatHint::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_hint_from_names() {
        assert_eq!(FormatHint::from_file_name("ct.nii.gz"), FormatHint::VolumeFile);
        assert_eq!(FormatHint::from_file_name("CT.NII"), FormatHint::VolumeFile);
        assert_eq!(FormatHint::from_file_name("scan.mha"), FormatHint::VolumeFile);
        assert_eq!(FormatHint::from_file_name("IM0001.dcm"), FormatHint::Dicom);
        assert_eq!(FormatHint::from_file_name("IM0001"), FormatHint::Unknown);
    }

    #[test]
    fn normal_axes() {
        assert_eq!(Orientation::Axial.normal_axis(), 2);
        assert_eq!(Orientation::Coronal.normal_axis(), 1);
        assert_eq!(Orientation::Sagittal.normal_axis(), 0);
    }
}
