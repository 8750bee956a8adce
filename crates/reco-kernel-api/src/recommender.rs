//! Placement and slot resolution.
//!
//! Per slot: bind request variables, fetch the primary list, top it up from
//! the fallbacks, then flatten. Across slots the flattened lists may be
//! interleaved. Redirects re-derive the same listing and pick one item.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::distributions::{Distribution as _, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use reco_kernel_core::{
    distribute, filter_strategy, Distribution, Item, ItemKey, PlacementConfig, RecoError,
    RecommendationConfig, SlotConfig,
};
use reco_kernel_store::{ItemCatalog, KvStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::CatalogIndexer;
use crate::engine::{EngineContext, EngineRegistry};
use crate::filters::FilterEngine;
use crate::vectors::VectorStore;
use crate::{join_error, store_error};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecommendationRequest {
    /// Caller-supplied values keyed by external name.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub show_details: bool,
    #[serde(default)]
    pub show_fallbacks: bool,
    /// Overrides the placement's `distribute_items`.
    #[serde(default)]
    pub distribute_items: Option<bool>,
    #[serde(default)]
    pub variation_idx: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackItems {
    pub slot: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotItems {
    pub slot: String,
    /// Flattened primary and fallback items, or only the primary items when
    /// fallbacks are shown separately.
    pub items: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<FallbackItems>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationResponse {
    pub placement: String,
    pub variation_idx: usize,
    pub seed: u64,
    pub slots: Vec<SlotItems>,
    /// Interleaved items across slots, when distribution ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Item>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RedirectTarget {
    pub item_idx: Option<usize>,
    pub slot_idx: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectItem {
    pub slot: String,
    pub key: String,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq)]
struct Recommended {
    key: ItemKey,
    item: Item,
}

struct SlotListing {
    slot: String,
    primary: Vec<Recommended>,
    fallbacks: Vec<(String, Vec<Recommended>)>,
}

impl SlotListing {
    fn flattened(&self) -> Vec<Recommended> {
        self.primary
            .iter()
            .chain(self.fallbacks.iter().flat_map(|(_, batch)| batch.iter()))
            .cloned()
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.fallbacks.iter().all(|(_, batch)| batch.is_empty())
    }
}

struct Listing {
    variation_idx: usize,
    seed: u64,
    slots: Vec<SlotListing>,
}

fn items_of(list: &[Recommended]) -> Vec<Item> {
    list.iter().map(|entry| entry.item.clone()).collect()
}

pub struct Recommender {
    store: Arc<dyn KvStore>,
    catalog: Arc<dyn ItemCatalog>,
    config: Arc<RecommendationConfig>,
    registry: Arc<EngineRegistry>,
    vectors: VectorStore,
}

impl Recommender {
    /// # Errors
    /// Returns [`RecoError::Config`] when the configuration is invalid or
    /// references an engine kind the registry cannot serve.
    pub fn new(
        store: Arc<dyn KvStore>,
        catalog: Arc<dyn ItemCatalog>,
        config: Arc<RecommendationConfig>,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self, RecoError> {
        config.validate()?;
        registry.validate(&config)?;
        let vectors = VectorStore::new(Arc::clone(&store));
        Ok(Self { store, catalog, config, registry, vectors })
    }

    #[must_use]
    pub fn config(&self) -> &RecommendationConfig {
        &self.config
    }

    /// Recommendations of every slot of one variation of placement `hash`.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown placements and when every
    /// list is empty, [`RecoError::InvalidRequest`] for an out-of-range
    /// `variation_idx`, and store errors.
    pub async fn get_items(
        &self,
        hash: &str,
        request: &RecommendationRequest,
    ) -> Result<RecommendationResponse, RecoError> {
        let placement = self.placement(hash)?;
        let seed = request.seed.unwrap_or_else(rand::random);
        let variation_idx = choose_variation(placement, request.variation_idx, Some(seed))?;
        let listing = self.listing(placement, variation_idx, seed, request).await?;

        let items = interleaves(placement, request).then(|| {
            let lists = listing.slots.iter().map(SlotListing::flattened).collect::<Vec<_>>();
            items_of(&distribute(&lists, Distribution::Random(seed)))
        });

        let slots = listing
            .slots
            .iter()
            .map(|slot| {
                if request.show_fallbacks {
                    SlotItems {
                        slot: slot.slot.clone(),
                        items: items_of(&slot.primary),
                        fallbacks: slot
                            .fallbacks
                            .iter()
                            .map(|(id, batch)| FallbackItems { slot: id.clone(), items: items_of(batch) })
                            .collect(),
                    }
                } else {
                    SlotItems {
                        slot: slot.slot.clone(),
                        items: items_of(&slot.flattened()),
                        fallbacks: Vec::new(),
                    }
                }
            })
            .collect();

        Ok(RecommendationResponse {
            placement: placement.hash.clone(),
            variation_idx: listing.variation_idx,
            seed: listing.seed,
            slots,
            items,
        })
    }

    /// Re-derive a listing and return the single item `target` points at.
    ///
    /// The listing is reproduced from `request.seed` when present. Without a
    /// seed the first weighted variation and the fixed interleaving are used,
    /// which only matches a listing that was itself served from a seed
    /// yielding the same choices. Callers pass back the `seed` echoed in
    /// [`RecommendationResponse`] together with the listing's flags.
    ///
    /// The target is read from the interleaved list when the listing was
    /// interleaved, and from the slot's flattened list otherwise.
    ///
    /// # Errors
    /// Returns [`RecoError::InvalidRequest`] when an index required by the
    /// distribution mode is missing and [`RecoError::NotFound`] when it is out
    /// of range.
    pub async fn redirect(
        &self,
        hash: &str,
        request: &RecommendationRequest,
        target: RedirectTarget,
    ) -> Result<RedirectItem, RecoError> {
        let placement = self.placement(hash)?;
        let variation_idx = choose_variation(placement, request.variation_idx, request.seed)?;
        let seed = request.seed.unwrap_or(0);
        let details = RecommendationRequest { show_details: true, ..request.clone() };
        let listing = self.listing(placement, variation_idx, seed, &details).await?;
        let (slot, entry) = if interleaves(placement, request) {
            let item_idx = target.item_idx.ok_or_else(|| {
                RecoError::InvalidRequest("item_idx is required for distributed placements".to_string())
            })?;
            let lists = listing
                .slots
                .iter()
                .map(|slot| {
                    slot.flattened().into_iter().map(|entry| (slot.slot.clone(), entry)).collect()
                })
                .collect::<Vec<Vec<_>>>();
            let mode = request.seed.map_or(Distribution::Fixed, Distribution::Random);
            distribute(&lists, mode).into_iter().nth(item_idx).ok_or_else(|| {
                RecoError::NotFound(format!("item_idx {item_idx} is out of range"))
            })?
        } else {
            let (Some(slot_idx), Some(item_idx)) = (target.slot_idx, target.item_idx) else {
                return Err(RecoError::InvalidRequest(
                    "slot_idx and item_idx are required".to_string(),
                ));
            };
            let slot = listing.slots.get(slot_idx).ok_or_else(|| {
                RecoError::NotFound(format!("slot_idx {slot_idx} is out of range"))
            })?;
            let entry = slot.flattened().into_iter().nth(item_idx).ok_or_else(|| {
                RecoError::NotFound(format!("item_idx {item_idx} is out of range"))
            })?;
            (slot.slot.clone(), entry)
        };

        Ok(RedirectItem { slot, key: entry.key.to_string(), item: entry.item })
    }

    fn placement(&self, hash: &str) -> Result<&PlacementConfig, RecoError> {
        self.config
            .placement(hash)
            .ok_or_else(|| RecoError::NotFound(format!("placement {hash}")))
    }

    fn slot(&self, id: &str) -> Result<&SlotConfig, RecoError> {
        self.config.slot(id).ok_or_else(|| RecoError::NotFound(format!("slot {id}")))
    }

    async fn listing(
        &self,
        placement: &PlacementConfig,
        variation_idx: usize,
        seed: u64,
        request: &RecommendationRequest,
    ) -> Result<Listing, RecoError> {
        let variation = placement.variations.get(variation_idx).ok_or_else(|| {
            RecoError::InvalidRequest(format!("variation {variation_idx} is out of range"))
        })?;

        let mut slots = Vec::with_capacity(variation.slots.len());
        for slot_id in &variation.slots {
            slots.push(self.slot_listing(self.slot(slot_id)?, request).await?);
        }

        if slots.iter().all(SlotListing::is_empty) {
            tracing::debug!(placement = %placement.hash, variation_idx, "no recommendations");
            return Err(RecoError::NotFound(format!(
                "placement {} has no recommendations",
                placement.hash
            )));
        }
        Ok(Listing { variation_idx, seed, slots })
    }

    async fn slot_listing(
        &self,
        slot: &SlotConfig,
        request: &RecommendationRequest,
    ) -> Result<SlotListing, RecoError> {
        let primary = self.fetch(slot, request, slot.max_items).await?;
        let mut seen = primary.iter().map(|entry| entry.key.clone()).collect::<BTreeSet<_>>();
        let mut collected = primary.len();

        let mut fallbacks = Vec::new();
        for fallback_id in &slot.fallbacks {
            let remaining = slot.max_items.saturating_sub(collected);
            if remaining == 0 {
                break;
            }
            let fallback = self.slot(fallback_id)?;
            // Over-fetch so duplicates cannot starve the batch.
            let candidates = self.fetch(fallback, request, remaining + seen.len()).await?;
            let batch = candidates
                .into_iter()
                .filter(|entry| !seen.contains(&entry.key))
                .take(remaining)
                .collect::<Vec<_>>();

            tracing::debug!(slot = %slot.id, fallback = %fallback_id, added = batch.len(), remaining, "fallback used");
            seen.extend(batch.iter().map(|entry| entry.key.clone()));
            collected += batch.len();
            fallbacks.push((fallback_id.clone(), batch));
        }

        Ok(SlotListing { slot: slot.id.clone(), primary, fallbacks })
    }

    async fn fetch(
        &self,
        slot: &SlotConfig,
        request: &RecommendationRequest,
        limit: usize,
    ) -> Result<Vec<Recommended>, RecoError> {
        let engine_config = self
            .config
            .engine(&slot.engine)
            .ok_or_else(|| RecoError::NotFound(format!("engine {}", slot.engine)))?;
        let item_type = self
            .config
            .item_type(&engine_config.item_type)
            .ok_or_else(|| RecoError::NotFound(format!("item type {}", engine_config.item_type)))?;
        let engine = self.registry.get(engine_config.kind)?;

        let indexer = CatalogIndexer::new(Arc::clone(&self.store), engine_config.catalog_key());
        let length = indexer.length().await?;

        let variables = slot
            .variables
            .iter()
            .filter_map(|binding| {
                request
                    .variables
                    .get(&binding.external_name)
                    .map(|value| (binding.engine_variable.clone(), value.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        let vector = engine
            .build_vector(&EngineContext {
                engine: engine_config,
                vectors: &self.vectors,
                length,
                variables: &variables,
            })
            .await?;

        let filters = FilterEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            item_type.clone(),
            engine_config.store_id.clone(),
        );
        let mut masks = Vec::new();
        for binding in &slot.filters {
            let Some(facet) = item_type.facet(&binding.facet) else {
                tracing::debug!(slot = %slot.id, facet = %binding.facet, "filter on undeclared facet skipped");
                continue;
            };
            let Some(values) = request.variables.get(&binding.external_name()) else {
                continue;
            };
            let Some(strategy) = filter_strategy(binding.source, &facet.shape) else {
                tracing::debug!(slot = %slot.id, facet = %binding.facet, "unsupported filter skipped");
                continue;
            };
            masks.push(filters.prepare(facet, strategy, binding.inclusive, values, vector.len()).await?);
        }

        let top = tokio::task::spawn_blocking(move || {
            let mut vector = vector;
            for mask in &masks {
                mask.apply(&mut vector);
            }
            vector.top_k(limit)
        })
        .await
        .map_err(join_error)?;

        let resolved = indexer.resolve(&top).await?;
        let keys = resolved.into_iter().map(|(_, key)| key).collect::<Vec<_>>();
        if !request.show_details {
            return keys
                .into_iter()
                .map(|key| Ok(Recommended { item: key.identity()?, key }))
                .collect();
        }

        let records = self
            .catalog
            .items(item_type, &engine_config.store_id, &keys)
            .await
            .map_err(store_error)?;
        keys.into_iter()
            .zip(records)
            .map(|(key, record)| {
                let item = match record {
                    Some(item) => item,
                    None => key.identity()?,
                };
                Ok(Recommended { key, item })
            })
            .collect()
    }
}

/// Whether a listing is served as one interleaved list. Interleaving needs
/// flattened slots, so showing fallbacks separately turns it off.
fn interleaves(placement: &PlacementConfig, request: &RecommendationRequest) -> bool {
    request.distribute_items.unwrap_or(placement.distribute_items) && !request.show_fallbacks
}

/// Pick a variation: the explicit index, a weighted draw from `seed`, or the
/// first variation with positive weight.
fn choose_variation(
    placement: &PlacementConfig,
    requested: Option<usize>,
    seed: Option<u64>,
) -> Result<usize, RecoError> {
    if let Some(index) = requested {
        if index >= placement.variations.len() {
            return Err(RecoError::InvalidRequest(format!(
                "placement {} has no variation {index}",
                placement.hash
            )));
        }
        return Ok(index);
    }

    let weights = placement.variations.iter().map(|variation| variation.weight);
    match seed {
        Some(seed) => {
            let weighted = WeightedIndex::new(weights).map_err(|err| {
                RecoError::Config(format!("placement {} variation weights: {err}", placement.hash))
            })?;
            Ok(weighted.sample(&mut StdRng::seed_from_u64(seed)))
        }
        None => placement
            .variations
            .iter()
            .position(|variation| variation.weight > 0)
            .ok_or_else(|| {
                RecoError::Config(format!("placement {} has no weighted variation", placement.hash))
            }),
    }
}
