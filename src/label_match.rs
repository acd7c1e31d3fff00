//! Correlating external item keys (e.g. surface mesh names) with registry
//! structures.
//!
//! A [`LabelMatcher`] tries its strategies in order and returns the first
//! hit. Items nothing matches stay visible with [`UNKNOWN_COLOR`].

use crate::structures::{Rgb, Structure};

/// Colour used to flag items without a matching structure.
pub const UNKNOWN_COLOR: Rgb = [255, 0, 255];

pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn find<'a>(&self, key: &str, structures: &'a [Structure]) -> Option<&'a Structure>;
}

pub struct ExactId;

impl MatchStrategy for ExactId {
    fn name(&self) -> &'static str {
        "exact_id"
    }

    fn find<'a>(&self, key: &str, structures: &'a [Structure]) -> Option<&'a Structure> {
        structures.iter().find(|s| s.id == key)
    }
}

pub struct ExactName;

impl MatchStrategy for ExactName {
    fn name(&self) -> &'static str {
        "exact_name"
    }

    fn find<'a>(&self, key: &str, structures: &'a [Structure]) -> Option<&'a Structure> {
        structures.iter().find(|s| s.name == key)
    }
}

pub struct CaseInsensitiveId;

impl MatchStrategy for CaseInsensitiveId {
    fn name(&self) -> &'static str {
        "case_insensitive_id"
    }

    fn find<'a>(&self, key: &str, structures: &'a [Structure]) -> Option<&'a Structure> {
        let key = key.to_lowercase();
        structures.iter().find(|s| s.id.to_lowercase() == key)
    }
}

pub struct CaseInsensitiveName;

impl MatchStrategy for CaseInsensitiveName {
    fn name(&self) -> &'static str {
        "case_insensitive_name"
    }

    fn find<'a>(&self, key: &str, structures: &'a [Structure]) -> Option<&'a Structure> {
        let key = key.to_lowercase();
        structures.iter().find(|s| s.name.to_lowercase() == key)
    }
}

#[derive(Debug, PartialEq)]
pub enum MatchOutcome<'a> {
    Matched {
        structure: &'a Structure,
        strategy: &'static str,
    },
    Unknown,
}

/// Display state for an externally keyed item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemMaterial {
    pub color: Rgb,
    pub visible: bool,
    pub opacity: u8,
    pub unknown: bool,
}

pub struct LabelMatcher {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Default for LabelMatcher {
    /// exact id → exact name → case-insensitive id → case-insensitive name
    fn default() -> Self {
        Self::new(vec![
            Box::new(ExactId),
            Box::new(ExactName),
            Box::new(CaseInsensitiveId),
            Box::new(CaseInsensitiveName),
        ])
    }
}

impl LabelMatcher {
    pub fn new(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn resolve<'a>(&self, key: &str, structures: &'a [Structure]) -> MatchOutcome<'a> {
        self.strategies
            .iter()
            .find_map(|strategy| {
                strategy
                    .find(key, structures)
                    .map(|structure| MatchOutcome::Matched {
                        structure,
                        strategy: strategy.name(),
                    })
            })
            .unwrap_or(MatchOutcome::Unknown)
    }

    pub fn material_for(&self, key: &str, structures: &[Structure]) -> ItemMaterial {
        match self.resolve(key, structures) {
            MatchOutcome::Matched { structure, .. } => ItemMaterial {
                color: structure.color,
                visible: structure.visible,
                opacity: structure.opacity,
                unknown: false,
            },
            MatchOutcome::Unknown => ItemMaterial {
                color: UNKNOWN_COLOR,
                visible: true,
                opacity: 100,
                unknown: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structures() -> Vec<Structure> {
        vec![
            Structure::new("skeleton", "Femur_Left").with_color([1, 1, 1]),
            Structure::new("skeleton", "skeleton__Femur_Left").with_color([2, 2, 2]),
            Structure::new("organs", "liver").with_color([3, 3, 3]),
        ]
    }

    fn strategy_of(outcome: MatchOutcome<'_>) -> Option<&'static str> {
        match outcome {
            MatchOutcome::Matched { strategy, .. } => Some(strategy),
            MatchOutcome::Unknown => None,
        }
    }

    #[test]
    fn chain_order_is_fixed() {
        assert_eq!(
            LabelMatcher::default().strategy_names(),
            ["exact_id", "exact_name", "case_insensitive_id", "case_insensitive_name"]
        );
    }

    #[test]
    fn exact_id_wins_over_name() {
        let list = structures();
        let matcher = LabelMatcher::default();
        // Equal to the second structure's name and the first structure's id.
        let MatchOutcome::Matched { structure, strategy } =
            matcher.resolve("skeleton__Femur_Left", &list)
        else {
            panic!("expected a match");
        };
        assert_eq!(strategy, "exact_id");
        assert_eq!(structure.color, [1, 1, 1]);
    }

    #[test]
    fn falls_back_through_chain() {
        let list = structures();
        let matcher = LabelMatcher::default();
        assert_eq!(strategy_of(matcher.resolve("liver", &list)), Some("exact_name"));
        assert_eq!(
            strategy_of(matcher.resolve("ORGANS__LIVER", &list)),
            Some("case_insensitive_id")
        );
        assert_eq!(
            strategy_of(matcher.resolve("FEMUR_LEFT", &list)),
            Some("case_insensitive_name")
        );
        assert_eq!(strategy_of(matcher.resolve("spleen", &list)), None);
    }

    #[test]
    fn unknown_items_stay_visible_and_flagged() {
        let material = LabelMatcher::default().material_for("spleen", &structures());
        assert!(material.visible);
        assert!(material.unknown);
        assert_eq!(material.color, UNKNOWN_COLOR);
    }

    #[test]
    fn strategies_are_usable_alone() {
        let list = structures();
        assert!(ExactName.find("LIVER", &list).is_none());
        assert!(CaseInsensitiveName.find("LIVER", &list).is_some());
    }
}
