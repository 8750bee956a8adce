//! Filter vector persistence and request-time preparation.
//!
//! Preparing a filter does the store I/O and yields a [`FilterMask`];
//! applying masks is pure and runs with the top-K selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use reco_kernel_core::codec::{pack_bools, pack_indices, unpack_bools, unpack_indices};
use reco_kernel_core::config::catalog_key;
use reco_kernel_core::filter::{
    boolean_mask, build_filter_vectors, facet_flags, facet_value_keys, facet_values_of,
    identity_keys, raw_indices, union_masks, CatalogEntry,
};
use reco_kernel_core::{
    CatalogIndex, FacetConfig, FacetShape, FilterSource, FilterStorage, FilterStrategy,
    FilterVectors, Item, ItemKey, ItemTypeConfig, RankingVector, RecoError,
};
use reco_kernel_store::{keys, ItemCatalog, KvStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store_error;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FacetUpdate {
    pub facet: String,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FilterUpdateSummary {
    pub length: CatalogIndex,
    pub facets: Vec<FacetUpdate>,
}

/// A filter resolved against the store, ready to mask a ranking vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMask {
    Mask { mask: Vec<bool>, inclusive: bool },
    Indices { indices: Vec<CatalogIndex>, inclusive: bool },
}

impl FilterMask {
    pub fn apply(&self, vector: &mut RankingVector) {
        match self {
            Self::Mask { mask, inclusive } => vector.apply_mask(mask, *inclusive),
            Self::Indices { indices, inclusive } => vector.apply_indices(indices, *inclusive),
        }
    }
}

/// Filter vectors of one catalog (item type + store).
#[derive(Clone)]
pub struct FilterEngine {
    store: Arc<dyn KvStore>,
    catalog: Arc<dyn ItemCatalog>,
    item_type: ItemTypeConfig,
    store_id: String,
    catalog_key: String,
}

impl FilterEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        catalog: Arc<dyn ItemCatalog>,
        item_type: ItemTypeConfig,
        store_id: impl Into<String>,
    ) -> Self {
        let store_id = store_id.into();
        let catalog_key = catalog_key(&item_type.name, &store_id);
        Self { store, catalog, item_type, store_id, catalog_key }
    }

    /// Rebuild every facet's vectors from `items`, replacing what was stored.
    ///
    /// Items without an allocated index are left out of the vectors.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] when a write fails.
    pub async fn update(
        &self,
        items: &[(ItemKey, Item)],
        positions: &BTreeMap<ItemKey, CatalogIndex>,
        length: CatalogIndex,
    ) -> Result<FilterUpdateSummary, RecoError> {
        let entries = items
            .iter()
            .filter_map(|(key, item)| {
                positions.get(key).map(|index| CatalogEntry { index: *index, key, item })
            })
            .collect::<Vec<_>>();
        let vector_length = usize::try_from(length)
            .map_err(|_| RecoError::Config(format!("catalog length {length} does not fit")))?;

        let mut facets = Vec::with_capacity(self.item_type.facets.len());
        for facet in &self.item_type.facets {
            let Some(vectors) = build_filter_vectors(
                facet,
                &entries,
                vector_length,
                &self.item_type.id_fields,
                positions,
            ) else {
                continue;
            };
            let stored = vectors.entries();
            self.persist(&facet.name, vectors).await?;
            tracing::debug!(catalog = %self.catalog_key, facet = %facet.name, entries = stored, "filter rebuilt");
            facets.push(FacetUpdate { facet: facet.name.clone(), entries: stored });
        }

        tracing::info!(
            catalog = %self.catalog_key,
            facets = facets.len(),
            items = entries.len(),
            length,
            "filters rebuilt"
        );
        Ok(FilterUpdateSummary { length, facets })
    }

    async fn persist(&self, facet: &str, vectors: FilterVectors) -> Result<(), RecoError> {
        let key = keys::filter(&self.catalog_key, facet);
        match vectors {
            FilterVectors::Dense(vector) => {
                self.store.delete(&key).await.map_err(store_error)?;
                self.store.set(&key, pack_bools(&vector)).await.map_err(store_error)
            }
            FilterVectors::Keyed(vectors) => {
                let entries =
                    vectors.into_iter().map(|(value, vector)| (value, pack_bools(&vector))).collect();
                self.store.replace_hash(&key, entries).await.map_err(store_error)
            }
            FilterVectors::IndexLists(lists) => {
                let entries =
                    lists.into_iter().map(|(owner, list)| (owner.0, pack_indices(&list))).collect();
                self.store.replace_hash(&key, entries).await.map_err(store_error)
            }
        }
    }

    /// Resolve query `values` for `facet` into a mask sized to `length`.
    ///
    /// Values that select nothing contribute nothing: an inclusive filter over
    /// an empty selection keeps no item, an exclusive one keeps every item.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] or [`RecoError::Malformed`].
    pub async fn prepare(
        &self,
        facet: &FacetConfig,
        strategy: FilterStrategy,
        inclusive: bool,
        values: &Value,
        length: usize,
    ) -> Result<FilterMask, RecoError> {
        let key = keys::filter(&self.catalog_key, &facet.name);

        if strategy.source == FilterSource::Index {
            let indices = self.index_selection(&key, values).await?;
            return Ok(FilterMask::Indices { indices, inclusive });
        }

        let values = match strategy.source {
            FilterSource::Of => self.facet_values_of_items(&facet.name, values).await?,
            _ => values.clone(),
        };

        let mask = match strategy.storage {
            FilterStorage::Dense => {
                let vector = self
                    .store
                    .get(&key)
                    .await
                    .map_err(store_error)?
                    .map(|bytes| unpack_bools(&bytes))
                    .unwrap_or_default();
                boolean_mask(&vector, &facet_flags(&values), length)
            }
            FilterStorage::Keyed => {
                self.keyed_mask(&key, &facet.shape, &values, length).await?
            }
            FilterStorage::IndexLists => {
                return Err(RecoError::Config(format!(
                    "facet {} only supports the index filter source",
                    facet.name
                )))
            }
        };
        Ok(FilterMask::Mask { mask, inclusive })
    }

    async fn keyed_mask(
        &self,
        key: &str,
        shape: &FacetShape,
        values: &Value,
        length: usize,
    ) -> Result<Vec<bool>, RecoError> {
        let fields = facet_value_keys(shape, values);
        if fields.is_empty() {
            return Ok(vec![false; length]);
        }
        let found = self.store.hmget(key, &fields).await.map_err(store_error)?;
        Ok(union_masks(found.into_iter().flatten().map(|bytes| unpack_bools(&bytes)), length))
    }

    async fn facet_values_of_items(&self, facet: &str, values: &Value) -> Result<Value, RecoError> {
        let referenced = identity_keys(values, &self.item_type.id_fields);
        if referenced.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let items = self
            .catalog
            .items(&self.item_type, &self.store_id, &referenced)
            .await
            .map_err(store_error)?;
        Ok(facet_values_of(items.iter().flatten(), facet))
    }

    async fn index_selection(&self, key: &str, values: &Value) -> Result<Vec<CatalogIndex>, RecoError> {
        let mut indices = raw_indices(values);

        let owners = identity_keys(values, &self.item_type.id_fields);
        if !owners.is_empty() {
            let fields = owners.into_iter().map(|owner| owner.0).collect::<Vec<_>>();
            for bytes in self.store.hmget(key, &fields).await.map_err(store_error)?.into_iter().flatten() {
                indices.extend(unpack_indices(&bytes)?);
            }
        }
        Ok(indices)
    }
}
