use std::{error::Error, path::PathBuf, sync::Arc};

use ndarray::ShapeError;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxel_view::{
    CoreConfig, DicomSeriesDecoder, DirtyViews, LabelVolume, MaskResolution, Orientation,
    Processor, SegmentationMetadata, SortBy, Viewer, VoxelVolume, WGPU,
};

/// Synthetic CT-like phantom: a bone shell around soft tissue in air.
fn phantom(n: usize) -> Result<(VoxelVolume, LabelVolume), ShapeError> {
    let centre = (n as f32 - 1.0) / 2.0;
    let radius = n as f32 * 0.4;
    let mut values = Vec::with_capacity(n * n * n);
    let mut labels = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let d = ((x as f32 - centre).powi(2)
                    + (y as f32 - centre).powi(2)
                    + (z as f32 - centre).powi(2))
                .sqrt();
                let (value, label) = if d > radius {
                    (-1000.0, 0)
                } else if d > radius * 0.85 {
                    (1200.0, 1)
                } else {
                    (40.0, 2)
                };
                values.push(value);
                labels.push(label);
            }
        }
    }
    let size = [n, n, n];
    let volume = VoxelVolume::from_flat(size, values)?.with_scalar_range((-1000.0, 1200.0));
    Ok((volume, LabelVolume::from_flat(size, labels)?))
}

const PHANTOM_METADATA: &str = r#"{
    "skeleton": [{ "object_name": "Shell", "label_id": 1, "color": [230, 220, 200] }],
    "organs": [{ "object_name": "Core", "label_id": 2, "color": [200, 60, 60] }]
}"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let mut args = std::env::args().skip(1);
    let mut series: Option<PathBuf> = None;
    let mut config = CoreConfig::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                config = CoreConfig::load(path)?;
            }
            "--gpu" => config.processor = Processor::GPU,
            _ => series = Some(PathBuf::from(arg)),
        }
    }

    let decoder = DicomSeriesDecoder::new(SortBy::ImagePositionPatient);
    let wants_gpu = config.processor == Processor::GPU;
    let mut viewer = Viewer::new(config, Arc::new(decoder));
    if wants_gpu {
        viewer = viewer.with_gpu(WGPU::request().await?);
    }

    match series {
        Some(path) => {
            let volume = VoxelVolume::try_from(decoder.decode_directory(&path)?)?;
            viewer.replace_volume(volume, path.to_str()).await;
        }
        None => {
            let (volume, labels) = phantom(96)?;
            viewer.replace_volume(volume, Some("phantom")).await;
            viewer.seed_structures(&SegmentationMetadata::from_json(PHANTOM_METADATA)?);
            if viewer.set_labels(labels) == MaskResolution::Applied {
                info!("phantom labels attached");
            }
        }
    }

    let dirty = viewer.take_dirty();
    for orientation in Orientation::ALL {
        if !dirty.contains(DirtyViews::plane(orientation)) {
            continue;
        }
        if let Some(image) = viewer.present_slice(orientation, (512, 512)) {
            let name = format!("{orientation:?}.png").to_lowercase();
            image.save(&name)?;
            info!(file = %name, "slice written");
        }
    }

    viewer.orbit(0.6, 0.3);
    if let Some(frame) = viewer.render_volume(512, 512).await {
        frame.to_image().save("volume.png")?;
        info!(max_alpha = frame.max_alpha(), "volume frame written");
    }
    Ok(())
}
