//! Anatomical structure registry.
//!
//! The registry is the single source of truth for structure colour,
//! opacity and visibility. Views receive a [`RegistryReader`] and subscribe
//! to changes; only the owner of the [`StructureRegistry`] mutates it.

use crate::observable::{Observable, Subscription};
use crate::volume::LabelId;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

pub type Rgb = [u8; 3];

pub const DEFAULT_STRUCTURE_COLOR: Rgb = [200, 200, 200];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub id: String,
    pub name: String,
    pub system: String,
    pub label_id: Option<LabelId>,
    pub color: Rgb,
    pub visible: bool,
    /// 0..=100
    pub opacity: u8,
}

impl Structure {
    pub fn new(system: &str, name: &str) -> Self {
        Self {
            id: format!("{system}__{name}"),
            name: name.to_owned(),
            system: system.to_owned(),
            label_id: None,
            color: DEFAULT_STRUCTURE_COLOR,
            visible: true,
            opacity: 100,
        }
    }

    pub fn with_label(mut self, label_id: LabelId) -> Self {
        self.label_id = Some(label_id);
        self
    }

    pub fn with_color(mut self, color: Rgb) -> Self {
        self.color = color;
        self
    }
}

/// One object entry of the segmentation metadata.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SegmentEntry {
    pub object_name: String,
    #[serde(default)]
    pub label_id: Option<LabelId>,
    #[serde(default)]
    pub color: Option<Vec<f64>>,
}

/// Anatomical system name → objects belonging to it, in document order.
///
/// Order matters: it decides which structure keeps a duplicated label id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentationMetadata(pub Vec<(String, Vec<SegmentEntry>)>);

impl<'de> Deserialize<'de> for SegmentationMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SystemsVisitor;

        impl<'de> Visitor<'de> for SystemsVisitor {
            type Value = SegmentationMetadata;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of system names to segment lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut systems: Vec<(String, Vec<SegmentEntry>)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((system, entries)) = map.next_entry::<String, Vec<SegmentEntry>>()? {
                    match systems.iter_mut().find(|(name, _)| *name == system) {
                        Some((_, existing)) => existing.extend(entries),
                        None => systems.push((system, entries)),
                    }
                }
                Ok(SegmentationMetadata(systems))
            }
        }

        deserializer.deserialize_map(SystemsVisitor)
    }
}

impl SegmentationMetadata {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_structures(&self) -> Vec<Structure> {
        let mut structures = Vec::new();
        for (system, entries) in &self.0 {
            for entry in entries {
                let mut structure = Structure::new(system, &entry.object_name);
                structure.label_id = entry.label_id;
                if let Some(color) = entry.color.as_deref().and_then(parse_color) {
                    structure.color = color;
                }
                structures.push(structure);
            }
        }
        structures
    }
}

fn parse_color(values: &[f64]) -> Option<Rgb> {
    match values {
        [r, g, b] => Some([*r, *g, *b].map(|c| c.round().clamp(0.0, 255.0) as u8)),
        _ => None,
    }
}

/// Colour, visibility and opacity for one label id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelStyle {
    pub color: Rgb,
    pub visible: bool,
    pub opacity: u8,
}

/// Per-render lookup from label id to style, derived from a snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelLookup {
    styles: HashMap<LabelId, LabelStyle>,
}

impl LabelLookup {
    pub fn from_structures(structures: &[Structure]) -> Self {
        let styles = structures
            .iter()
            .filter_map(|s| {
                s.label_id.map(|label| {
                    (
                        label,
                        LabelStyle {
                            color: s.color,
                            visible: s.visible,
                            opacity: s.opacity,
                        },
                    )
                })
            })
            .collect();
        Self { styles }
    }

    #[inline]
    pub fn get(&self, label: LabelId) -> Option<&LabelStyle> {
        self.styles.get(&label)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

/// Writable registry handle. Cloning it hands out another writer; give
/// views a [`RegistryReader`] instead.
#[derive(Clone, Debug)]
pub struct StructureRegistry {
    state: Observable<Vec<Structure>>,
}

impl Default for StructureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureRegistry {
    pub fn new() -> Self {
        Self {
            state: Observable::new(Vec::new()),
        }
    }

    pub fn reader(&self) -> RegistryReader {
        RegistryReader {
            state: self.state.clone(),
        }
    }

    /// Replace the whole list. Duplicate ids and duplicate label ids keep
    /// their first occurrence.
    pub fn replace_all(&self, structures: Vec<Structure>) {
        let mut ids = HashSet::new();
        let mut labels = HashSet::new();
        let total = structures.len();
        let unique: Vec<Structure> = structures
            .into_iter()
            .filter(|s| ids.insert(s.id.clone()))
            .map(|mut s| {
                if let Some(label) = s.label_id
                    && !labels.insert(label)
                {
                    debug!(id = %s.id, label, "dropping duplicate label id");
                    s.label_id = None;
                }
                s
            })
            .collect();
        info!(count = unique.len(), dropped = total - unique.len(), "structure list replaced");
        self.state.set(unique);
    }

    pub fn seed_from_metadata(&self, metadata: &SegmentationMetadata) {
        self.replace_all(metadata.to_structures());
    }

    pub fn clear(&self) {
        self.state.set(Vec::new());
    }

    /// Returns `false` if no structure has this id.
    pub fn set_visible(&self, id: &str, visible: bool) -> bool {
        self.edit(id, |s| s.visible = visible)
    }

    /// Opacity is clamped to 0..=100.
    pub fn set_opacity(&self, id: &str, opacity: f32) -> bool {
        let opacity = if opacity.is_finite() {
            opacity.round().clamp(0.0, 100.0) as u8
        } else {
            0
        };
        self.edit(id, |s| s.opacity = opacity)
    }

    pub fn set_color(&self, id: &str, color: Rgb) -> bool {
        self.edit(id, |s| s.color = color)
    }

    /// Apply several edits with a single change notification.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        self.state.batch(|| f(self))
    }

    fn edit(&self, id: &str, f: impl FnOnce(&mut Structure)) -> bool {
        let exists = self.state.with(|list| list.iter().any(|s| s.id == id));
        if !exists {
            debug!(id, "edit for unknown structure ignored");
            return false;
        }
        self.state.update(|list| {
            if let Some(structure) = list.iter_mut().find(|s| s.id == id) {
                f(structure);
            }
        });
        true
    }

    pub fn snapshot(&self) -> Vec<Structure> {
        self.state.get()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn subscribe(&self, callback: impl Fn(&[Structure]) + 'static) -> Subscription {
        self.state.subscribe(move |list: &Vec<Structure>| callback(list))
    }
}

/// Read-only view of a [`StructureRegistry`].
#[derive(Clone, Debug)]
pub struct RegistryReader {
    state: Observable<Vec<Structure>>,
}

impl RegistryReader {
    pub fn snapshot(&self) -> Vec<Structure> {
        self.state.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[Structure]) -> R) -> R {
        self.state.with(|list| f(list))
    }

    pub fn get(&self, id: &str) -> Option<Structure> {
        self.with(|list| list.iter().find(|s| s.id == id).cloned())
    }

    pub fn find_by_label(&self, label: LabelId) -> Option<Structure> {
        self.with(|list| list.iter().find(|s| s.label_id == Some(label)).cloned())
    }

    pub fn label_lookup(&self) -> LabelLookup {
        self.with(LabelLookup::from_structures)
    }

    /// Structures grouped by system, systems in first-seen order.
    pub fn grouped_by_system(&self) -> Vec<(String, Vec<Structure>)> {
        self.with(|list| {
            let mut groups: Vec<(String, Vec<Structure>)> = Vec::new();
            for structure in list {
                match groups.iter_mut().find(|(system, _)| *system == structure.system) {
                    Some((_, members)) => members.push(structure.clone()),
                    None => groups.push((structure.system.clone(), vec![structure.clone()])),
                }
            }
            groups
        })
    }

    pub fn len(&self) -> usize {
        self.with(<[Structure]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn subscribe(&self, callback: impl Fn(&[Structure]) + 'static) -> Subscription {
        self.state.subscribe(move |list: &Vec<Structure>| callback(list))
    }
}
