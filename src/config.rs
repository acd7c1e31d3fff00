//! Tunable defaults shared by the compositor, raymarcher and view sync.

use crate::enums::Processor;

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub overlay: OverlayConfig,
    pub raymarch: RaymarchConfig,
    pub sync: SyncConfig,
    pub processor: Processor,
    pub default_preset: String,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Label overlay blending in the MPR views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    /// Multiplier applied to the structure opacity.
    pub blend_factor: f32,
    /// Lower bound on the structure opacity fraction before blending.
    pub min_alpha: f32,
    /// Colour for labels with no registered structure.
    pub fallback_color: [u8; 3],
    pub fallback_alpha: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            blend_factor: 0.5,
            min_alpha: 0.1,
            fallback_color: [255, 0, 0],
            fallback_alpha: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RaymarchConfig {
    pub transfer_samples: usize,
    pub max_steps: u32,
    pub alpha_cutoff: f32,
    pub early_exit_alpha: f32,
    /// Central difference offset, in voxels.
    pub gradient_step: f32,
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub shininess: f32,
    /// Object-space light direction, normalized on use.
    pub light_dir: [f32; 3],
    pub jitter: bool,
}

impl Default for RaymarchConfig {
    fn default() -> Self {
        Self {
            transfer_samples: 1024,
            max_steps: 2000,
            alpha_cutoff: 0.01,
            early_exit_alpha: 0.99,
            gradient_step: 1.0,
            ambient: 0.3,
            diffuse: 0.7,
            specular: 0.2,
            shininess: 32.0,
            light_dir: [0.5, 1.0, 0.75],
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    /// Minimum level/width difference that counts as a renderer change.
    pub window_epsilon: f32,
    pub pan_epsilon: f32,
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            window_epsilon: 0.5,
            pan_epsilon: 0.25,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            overlay: OverlayConfig::default(),
            raymarch: RaymarchConfig::default(),
            sync: SyncConfig::default(),
            processor: Processor::CPU,
            default_preset: "CT-Bone".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{ "overlay": { "blend_factor": 0.7 }, "processor": "GPU" }"#,
        )
        .unwrap();
        assert_eq!(config.overlay.blend_factor, 0.7);
        assert_eq!(config.overlay.min_alpha, 0.1);
        assert_eq!(config.processor, Processor::GPU);
        assert_eq!(config.raymarch.max_steps, 2000);
        assert_eq!(config.default_preset, "CT-Bone");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = CoreConfig::from_json_str(r#"{ "overlay": { "blend": 1.0 } }"#);
        assert!(matches!(err, Err(ConfigError::Json(_))));
    }

    #[test]
    fn poll_interval_never_zero() {
        let sync = SyncConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(sync.poll_interval(), Duration::from_millis(1));
    }
}
