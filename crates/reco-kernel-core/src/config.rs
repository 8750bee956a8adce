//! Hydrated recommendation configuration.
//!
//! These structs are handed in fully formed by whatever layer owns the
//! configuration entities. [`RecommendationConfig::validate`] runs once before
//! serving; nothing in the request path re-validates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::filter::{external_name, filter_strategy, FilterSource};
use crate::RecoError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecommendationConfig {
    #[serde(default)]
    pub item_types: Vec<ItemTypeConfig>,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub placements: Vec<PlacementConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemTypeConfig {
    pub name: String,
    pub id_fields: Vec<String>,
    #[serde(default)]
    pub facets: Vec<FacetConfig>,
}

impl ItemTypeConfig {
    #[must_use]
    pub fn facet(&self, name: &str) -> Option<&FacetConfig> {
        self.facets.iter().find(|facet| facet.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FacetConfig {
    pub name: String,
    pub shape: FacetShape,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FacetShape {
    Boolean,
    Scalar,
    Object { id_fields: Vec<String> },
    Array { items: Box<FacetShape> },
    /// Identities of other items of the same type, stored as index lists.
    IndexList,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    TopSeller,
}

impl EngineKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopSeller => "top_seller",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub id: String,
    pub kind: EngineKind,
    pub item_type: String,
    pub store_id: String,
}

impl EngineConfig {
    /// Key prefix shared by every structure aligned to this engine's catalog.
    #[must_use]
    pub fn catalog_key(&self) -> String {
        catalog_key(&self.item_type, &self.store_id)
    }

    /// Key of the persisted ranking vector.
    #[must_use]
    pub fn engine_key(&self) -> String {
        format!("{}_engine_{}", self.catalog_key(), self.id)
    }
}

/// `<item_type>_<store_id>`. Item type names carry no `_`, so the split is
/// unambiguous.
#[must_use]
pub fn catalog_key(item_type: &str, store_id: &str) -> String {
    format!("{item_type}_{store_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotConfig {
    pub id: String,
    pub engine: String,
    pub max_items: usize,
    #[serde(default)]
    pub filters: Vec<FilterBinding>,
    #[serde(default)]
    pub variables: Vec<VariableBinding>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterBinding {
    pub facet: String,
    #[serde(default)]
    pub source: FilterSource,
    #[serde(default = "default_inclusive")]
    pub inclusive: bool,
    /// Overrides the conventional query parameter name.
    #[serde(default)]
    pub external_name: Option<String>,
}

fn default_inclusive() -> bool {
    true
}

impl FilterBinding {
    #[must_use]
    pub fn external_name(&self) -> String {
        self.external_name
            .clone()
            .unwrap_or_else(|| external_name(&self.facet, self.source, self.inclusive))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableBinding {
    pub engine_variable: String,
    pub external_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementConfig {
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub distribute_items: bool,
    pub variations: Vec<VariationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariationConfig {
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub slots: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

impl RecommendationConfig {
    #[must_use]
    pub fn item_type(&self, name: &str) -> Option<&ItemTypeConfig> {
        self.item_types.iter().find(|item_type| item_type.name == name)
    }

    #[must_use]
    pub fn engine(&self, id: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|engine| engine.id == id)
    }

    #[must_use]
    pub fn slot(&self, id: &str) -> Option<&SlotConfig> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    #[must_use]
    pub fn placement(&self, hash: &str) -> Option<&PlacementConfig> {
        self.placements.iter().find(|placement| placement.hash == hash)
    }

    /// Item type served by a slot, through its engine.
    #[must_use]
    pub fn slot_item_type(&self, slot: &SlotConfig) -> Option<&str> {
        self.engine(&slot.engine).map(|engine| engine.item_type.as_str())
    }

    /// Check every cross-reference and structural rule.
    ///
    /// # Errors
    /// Returns [`RecoError::Config`] naming the first violation found.
    pub fn validate(&self) -> Result<(), RecoError> {
        unique(self.item_types.iter().map(|item_type| item_type.name.as_str()), "item type")?;
        unique(self.engines.iter().map(|engine| engine.id.as_str()), "engine")?;
        unique(self.slots.iter().map(|slot| slot.id.as_str()), "slot")?;
        unique(self.placements.iter().map(|placement| placement.hash.as_str()), "placement")?;

        for item_type in &self.item_types {
            validate_item_type(item_type)?;
        }
        for engine in &self.engines {
            if self.item_type(&engine.item_type).is_none() {
                return Err(config_error(format!(
                    "engine {} references unknown item type {}",
                    engine.id, engine.item_type
                )));
            }
        }
        for slot in &self.slots {
            self.validate_slot(slot)?;
        }
        self.validate_fallback_graph()?;
        for placement in &self.placements {
            self.validate_placement(placement)?;
        }
        Ok(())
    }

    fn validate_slot(&self, slot: &SlotConfig) -> Result<(), RecoError> {
        if slot.max_items == 0 {
            return Err(config_error(format!("slot {} MUST allow at least one item", slot.id)));
        }
        let Some(engine) = self.engine(&slot.engine) else {
            return Err(config_error(format!(
                "slot {} references unknown engine {}",
                slot.id, slot.engine
            )));
        };
        let Some(item_type) = self.item_type(&engine.item_type) else {
            return Err(config_error(format!(
                "engine {} references unknown item type {}",
                engine.id, engine.item_type
            )));
        };

        for binding in &slot.filters {
            // Undeclared facets are skipped when binding a request.
            let Some(facet) = item_type.facet(&binding.facet) else {
                continue;
            };
            if filter_strategy(binding.source, &facet.shape).is_none() {
                return Err(config_error(format!(
                    "slot {}: facet {} does not support the {} filter source",
                    slot.id,
                    binding.facet,
                    binding.source.as_str()
                )));
            }
        }
        unique(slot.filters.iter().map(FilterBinding::external_name), "filter parameter")?;

        for fallback in &slot.fallbacks {
            let Some(fallback_slot) = self.slot(fallback) else {
                return Err(config_error(format!(
                    "slot {} references unknown fallback {fallback}",
                    slot.id
                )));
            };
            if fallback == &slot.id {
                return Err(config_error(format!("slot {} lists itself as fallback", slot.id)));
            }
            let fallback_type = self.slot_item_type(fallback_slot);
            if fallback_type != Some(engine.item_type.as_str()) {
                return Err(config_error(format!(
                    "fallback {fallback} of slot {} serves {} instead of {}",
                    slot.id,
                    fallback_type.unwrap_or("an unknown item type"),
                    engine.item_type
                )));
            }
        }
        Ok(())
    }

    fn validate_fallback_graph(&self) -> Result<(), RecoError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            config: &'a RecommendationConfig,
            slot: &'a SlotConfig,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<(), RecoError> {
            match marks.get(slot.id.as_str()) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(config_error(format!(
                        "slot {} is part of a fallback cycle",
                        slot.id
                    )))
                }
                None => {}
            }
            marks.insert(slot.id.as_str(), Mark::Visiting);
            for fallback in &slot.fallbacks {
                if let Some(next) = config.slot(fallback) {
                    visit(config, next, marks)?;
                }
            }
            marks.insert(slot.id.as_str(), Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for slot in &self.slots {
            visit(self, slot, &mut marks)?;
        }
        Ok(())
    }

    fn validate_placement(&self, placement: &PlacementConfig) -> Result<(), RecoError> {
        if placement.variations.is_empty() {
            return Err(config_error(format!(
                "placement {} MUST define at least one variation",
                placement.hash
            )));
        }
        if placement.variations.iter().all(|variation| variation.weight == 0) {
            return Err(config_error(format!(
                "placement {} needs a variation with positive weight",
                placement.hash
            )));
        }
        for variation in &placement.variations {
            if variation.slots.is_empty() {
                return Err(config_error(format!(
                    "placement {} has a variation without slots",
                    placement.hash
                )));
            }
            for slot in &variation.slots {
                if self.slot(slot).is_none() {
                    return Err(config_error(format!(
                        "placement {} references unknown slot {slot}",
                        placement.hash
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_item_type(item_type: &ItemTypeConfig) -> Result<(), RecoError> {
    // The name leads every catalog key, joined to the store id by `_`.
    if item_type.name.is_empty() || item_type.name.contains('_') {
        return Err(config_error(format!(
            "item type name {:?} MUST be non-empty and MUST NOT contain '_'",
            item_type.name
        )));
    }
    if item_type.id_fields.is_empty() {
        return Err(config_error(format!(
            "item type {} MUST declare at least one id field",
            item_type.name
        )));
    }
    unique(item_type.facets.iter().map(|facet| facet.name.as_str()), "facet")?;
    for facet in &item_type.facets {
        if facet.shape.storage().is_none() {
            return Err(config_error(format!(
                "facet {} of item type {} has an unsupported shape",
                facet.name, item_type.name
            )));
        }
        if let FacetShape::Object { id_fields } = &facet.shape {
            if id_fields.is_empty() {
                return Err(config_error(format!(
                    "object facet {} MUST declare id fields",
                    facet.name
                )));
            }
        }
    }
    Ok(())
}

fn unique<I, S>(names: I, what: &str) -> Result<(), RecoError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_ref().to_string()) {
            return Err(config_error(format!("duplicate {what} {}", name.as_ref())));
        }
    }
    Ok(())
}

fn config_error(message: String) -> RecoError {
    RecoError::Config(message)
}
