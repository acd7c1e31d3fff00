use crate::presets::{ColorPoint, OpacityPoint, Preset, Ramp};

/// Sampled colour and opacity lookup over a scalar range.
///
/// Sample `i` of `n` corresponds to the normalized position `i / (n - 1)`,
/// i.e. the raw value `min + t * (max - min)`. A transfer function is
/// immutable; rebuild it when the preset or the data range changes.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunction {
    samples: Vec<[f32; 4]>,
    range: (f32, f32),
    preset_name: String,
}

impl TransferFunction {
    pub fn build(preset: &Preset, range: (f32, f32), sample_count: usize) -> Self {
        let count = sample_count.max(2);
        let (min, max) = range;
        let span = max - min;

        let samples = match &preset.ramp {
            Ramp::Linear => (0..count)
                .map(|i| {
                    let t = i as f32 / (count - 1) as f32;
                    let value = min + t * span;
                    let level = if span > 0.0 {
                        ((value - min) / span).clamp(0.0, 1.0)
                    } else {
                        t
                    };
                    [level, level, level, level]
                })
                .collect(),
            Ramp::ControlPoints { opacity, color } => {
                let mut opacity = opacity.clone();
                let mut color = color.clone();
                opacity.sort_by(|a, b| a.x.total_cmp(&b.x));
                color.sort_by(|a, b| a.x.total_cmp(&b.x));
                (0..count)
                    .map(|i| {
                        let t = i as f32 / (count - 1) as f32;
                        let value = min + t * span;
                        [
                            interpolate(value, &color, |p: &ColorPoint| p.x, |p| p.r),
                            interpolate(value, &color, |p: &ColorPoint| p.x, |p| p.g),
                            interpolate(value, &color, |p: &ColorPoint| p.x, |p| p.b),
                            interpolate(value, &opacity, |p: &OpacityPoint| p.x, |p| p.opacity),
                        ]
                        .map(|c| c.clamp(0.0, 1.0))
                    })
                    .collect()
            }
        };

        Self {
            samples,
            range,
            preset_name: preset.name.clone(),
        }
    }

    pub fn samples(&self) -> &[[f32; 4]] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn range(&self) -> (f32, f32) {
        self.range
    }

    pub fn preset_name(&self) -> &str {
        &self.preset_name
    }

    /// Linearly interpolated RGBA at normalized position `t` (clamped).
    pub fn sample(&self, t: f32) -> [f32; 4] {
        let last = self.samples.len() - 1;
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let pos = t * last as f32;
        let i0 = (pos.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        let frac = pos - i0 as f32;
        let (a, b) = (self.samples[i0], self.samples[i1]);
        [0, 1, 2, 3].map(|c| a[c].mul_add(1.0 - frac, b[c] * frac))
    }

    /// Samples quantised to RGBA8 (`floor(v * 255)`), for texture upload.
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|sample| sample.map(|c| (c * 255.0).floor().clamp(0.0, 255.0) as u8))
            .collect()
    }
}

/// Piecewise linear interpolation over points sorted by key. Values outside
/// the key range clamp to the nearest endpoint.
fn interpolate<P>(x: f32, points: &[P], key: impl Fn(&P) -> f32, value: impl Fn(&P) -> f32) -> f32 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if x <= key(first) {
        return value(first);
    }
    if x >= key(last) {
        return value(last);
    }
    let upper = points.partition_point(|p| key(p) <= x).min(points.len() - 1);
    let (p1, p2) = (&points[upper - 1], &points[upper]);
    let (x1, x2) = (key(p1), key(p2));
    if x2 <= x1 {
        return value(p2);
    }
    let t = (x - x1) / (x2 - x1);
    value(p1) + t * (value(p2) - value(p1))
}
