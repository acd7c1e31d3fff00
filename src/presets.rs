//! Named volume rendering presets.
//!
//! Control points are keyed by raw scalar value (e.g. Hounsfield units).
//! The VTK string form lists the number of values first, followed by the
//! flattened points: `"4 -1000 0 3000 1"` is two `{x, opacity}` points.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("Malformed control point list: {0}")]
    Malformed(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Invalid preset JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Name of the built-in linear-ramp preset.
pub const LINEAR_RAMP_PRESET: &str = "Natural";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpacityPoint {
    pub x: f32,
    pub opacity: f32,
}

/// Colour control point, channels in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorPoint {
    pub x: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ramp {
    /// Opacity and grey level rise linearly across the data range.
    Linear,
    ControlPoints {
        opacity: Vec<OpacityPoint>,
        color: Vec<ColorPoint>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShadingHints {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub specular_power: f32,
}

impl Default for ShadingHints {
    fn default() -> Self {
        Self {
            ambient: 0.2,
            diffuse: 1.0,
            specular: 0.0,
            specular_power: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub ramp: Ramp,
    #[serde(default)]
    pub shading: ShadingHints,
}

struct BuiltinPreset {
    name: &'static str,
    scalar_opacity: &'static str,
    color_transfer: &'static str,
    shading: ShadingHints,
}

const BUILTIN: &[BuiltinPreset] = &[
    BuiltinPreset {
        name: "CT-Bone",
        scalar_opacity: "8 -3024 0 -16.4458 0 641.385 0.715686 3071 0.705882",
        color_transfer: "16 -3024 0 0 0 -16.4458 0.729412 0.254902 0.301961 \
                         641.385 0.905882 0.815686 0.552941 3071 1 1 1",
        shading: ShadingHints {
            ambient: 0.1,
            diffuse: 0.9,
            specular: 0.2,
            specular_power: 10.0,
        },
    },
    BuiltinPreset {
        name: "CT-Soft-Tissue",
        scalar_opacity: "10 -2048 0 -167.01 0 -160 1 240 1 3661 1",
        color_transfer: "20 -2048 0 0 0 -167.01 0 0 0 -160 0.0556356 0.0556356 0.0556356 \
                         240 1 1 1 3661 1 1 1",
        shading: ShadingHints {
            ambient: 0.2,
            diffuse: 1.0,
            specular: 0.0,
            specular_power: 1.0,
        },
    },
    BuiltinPreset {
        name: "CT-Muscle",
        scalar_opacity: "10 -3024 0 -155.407 0 217.641 0.676471 419.736 0.833333 3071 0.803922",
        color_transfer: "20 -3024 0 0 0 -155.407 0.54902 0.25098 0.14902 \
                         217.641 0.882353 0.603922 0.290196 419.736 1 0.937033 0.954531 \
                         3071 0.827451 0.658824 1",
        shading: ShadingHints {
            ambient: 0.1,
            diffuse: 0.9,
            specular: 0.2,
            specular_power: 10.0,
        },
    },
    BuiltinPreset {
        name: "CT-Lung",
        scalar_opacity: "12 -1000 0 -600 0 -599 0.15 -400 0.15 -399 0 2952 0",
        color_transfer: "24 -1000 0.3 0.3 1 -600 0 0 1 -530 0.134704 0.781726 0.0724558 \
                         -460 0.929244 1 0.109473 -400 0.888889 0.254949 0.0240258 \
                         2952 1 0.3 0.3",
        shading: ShadingHints {
            ambient: 0.2,
            diffuse: 1.0,
            specular: 0.0,
            specular_power: 1.0,
        },
    },
    BuiltinPreset {
        name: "MR-Default",
        scalar_opacity: "12 0 0 20 0 40 0.15 120 0.3 220 0.375 1024 0.5",
        color_transfer: "24 0 0 0 0 20 0.168627 0 0 40 0.403922 0.145098 0.0784314 \
                         120 0.780392 0.607843 0.380392 220 0.847059 0.835294 0.788235 \
                         1024 1 1 1",
        shading: ShadingHints {
            ambient: 0.2,
            diffuse: 1.0,
            specular: 0.0,
            specular_power: 1.0,
        },
    },
];

impl Preset {
    pub fn linear_ramp() -> Self {
        Self {
            name: LINEAR_RAMP_PRESET.to_owned(),
            ramp: Ramp::Linear,
            shading: ShadingHints::default(),
        }
    }

    /// Look up a built-in preset by name (case-insensitive).
    pub fn builtin(name: &str) -> Result<Self, PresetError> {
        if name.eq_ignore_ascii_case(LINEAR_RAMP_PRESET) {
            return Ok(Self::linear_ramp());
        }
        let entry = BUILTIN
            .iter()
            .find(|preset| preset.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| PresetError::UnknownPreset(name.to_owned()))?;
        let mut preset = Self::from_vtk(entry.name, entry.scalar_opacity, entry.color_transfer)?;
        preset.shading = entry.shading;
        Ok(preset)
    }

    pub fn builtin_names() -> Vec<&'static str> {
        BUILTIN
            .iter()
            .map(|preset| preset.name)
            .chain(std::iter::once(LINEAR_RAMP_PRESET))
            .collect()
    }

    /// Parse a preset from VTK-style scalar opacity and colour strings.
    pub fn from_vtk(
        name: &str,
        scalar_opacity: &str,
        color_transfer: &str,
    ) -> Result<Self, PresetError> {
        let opacity = parse_control_points(scalar_opacity, 2)?
            .into_iter()
            .map(|p| OpacityPoint {
                x: p[0],
                opacity: p[1],
            })
            .collect();
        let color = parse_control_points(color_transfer, 4)?
            .into_iter()
            .map(|p| ColorPoint {
                x: p[0],
                r: p[1],
                g: p[2],
                b: p[3],
            })
            .collect();
        Ok(Self {
            name: name.to_owned(),
            ramp: Ramp::ControlPoints { opacity, color },
            shading: ShadingHints::default(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, PresetError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn parse_control_points(text: &str, stride: usize) -> Result<Vec<Vec<f32>>, PresetError> {
    let numbers = text
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f32>()
                .map_err(|_| PresetError::Malformed(format!("not a number: {token:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let Some((&count, values)) = numbers.split_first() else {
        return Err(PresetError::Malformed("empty list".to_owned()));
    };
    if count < 0.0 || count as usize != values.len() {
        return Err(PresetError::Malformed(format!(
            "declared {count} values, found {}",
            values.len()
        )));
    }
    if values.len() % stride != 0 {
        return Err(PresetError::Malformed(format!(
            "{} values do not form points of {stride}",
            values.len()
        )));
    }
    Ok(values.chunks_exact(stride).map(<[f32]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_parses() {
        for name in Preset::builtin_names() {
            let preset = Preset::builtin(name).unwrap();
            assert_eq!(preset.name, name);
        }
    }

    #[test]
    fn builtin_lookup_ignores_case() {
        assert!(Preset::builtin("ct-bone").is_ok());
        assert_eq!(Preset::builtin("natural").unwrap().ramp, Ramp::Linear);
        assert!(matches!(
            Preset::builtin("CT-Unicorn"),
            Err(PresetError::UnknownPreset(_))
        ));
    }

    #[test]
    fn vtk_strings_are_split_by_stride() {
        let preset = Preset::from_vtk("t", "4 -1000 0 3000 1", "8 -1000 0 0 0 3000 1 0.5 0").unwrap();
        let Ramp::ControlPoints { opacity, color } = preset.ramp else {
            panic!("expected control points");
        };
        assert_eq!(opacity.len(), 2);
        assert_eq!(opacity[1], OpacityPoint { x: 3000.0, opacity: 1.0 });
        assert_eq!(color[1].g, 0.5);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!(Preset::from_vtk("t", "", "0").is_err());
        assert!(Preset::from_vtk("t", "4 0 0 1", "0").is_err());
        assert!(Preset::from_vtk("t", "3 0 0 1", "0").is_err());
        assert!(Preset::from_vtk("t", "2 0 zero", "0").is_err());
    }

    #[test]
    fn json_round_trip_of_ramp_kind() {
        let json = r#"{
            "name": "custom",
            "ramp": { "kind": "control_points",
                      "opacity": [{ "x": 0, "opacity": 0 }, { "x": 10, "opacity": 1 }],
                      "color": [{ "x": 0, "r": 1, "g": 1, "b": 1 }] }
        }"#;
        let preset = Preset::from_json(json).unwrap();
        assert_eq!(preset.shading, ShadingHints::default());
        assert!(matches!(preset.ramp, Ramp::ControlPoints { .. }));
    }
}
