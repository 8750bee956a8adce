use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use reco_kernel_core::allocator::plan_reconcile;
use reco_kernel_core::codec::{format_decimal, parse_decimal};
use reco_kernel_core::{CatalogIndex, ItemKey, RecoError, ReconcileSummary};
use reco_kernel_store::{keys, KvStore};

use crate::store_error;

/// Persistent ItemKey <-> CatalogIndex mapping of one catalog.
#[derive(Clone)]
pub struct CatalogIndexer {
    store: Arc<dyn KvStore>,
    catalog_key: String,
}

impl CatalogIndexer {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, catalog_key: impl Into<String>) -> Self {
        Self { store, catalog_key: catalog_key.into() }
    }

    #[must_use]
    pub fn catalog_key(&self) -> &str {
        &self.catalog_key
    }

    /// Stored length counter; 0 when the catalog was never reconciled.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] or [`RecoError::Malformed`].
    pub async fn length(&self) -> Result<CatalogIndex, RecoError> {
        match self.store.get(&keys::indices_length(&self.catalog_key)).await.map_err(store_error)? {
            Some(bytes) => parse_decimal(&bytes),
            None => Ok(0),
        }
    }

    /// The whole forward map.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] or [`RecoError::Malformed`].
    pub async fn known(&self) -> Result<BTreeMap<ItemKey, CatalogIndex>, RecoError> {
        let forward =
            self.store.hgetall(&keys::indices_map(&self.catalog_key)).await.map_err(store_error)?;
        forward
            .into_iter()
            .map(|(key, index)| Ok((ItemKey(key), parse_decimal(&index)?)))
            .collect()
    }

    /// Bring the mapping in line with `current`.
    ///
    /// Not safe to run concurrently with itself for the same catalog.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] on store failure and [`RecoError::Malformed`]
    /// when the persisted maps are inconsistent.
    pub async fn reconcile(
        &self,
        current: &BTreeSet<ItemKey>,
    ) -> Result<ReconcileSummary, RecoError> {
        let known = self.known().await?;
        let previous_length = self.length().await?;
        let plan = plan_reconcile(&known, previous_length, current)?;

        let forward_key = keys::indices_map(&self.catalog_key);
        let reverse_key = keys::items_map(&self.catalog_key);

        if !plan.removed.is_empty() {
            let fields = plan.removed.iter().map(|(key, _)| key.0.clone()).collect::<Vec<_>>();
            self.store.hdel(&forward_key, &fields).await.map_err(store_error)?;
        }
        if !plan.freed.is_empty() {
            let fields = plan.freed.iter().map(|index| format_decimal(*index)).collect::<Vec<_>>();
            self.store.hdel(&reverse_key, &fields).await.map_err(store_error)?;
        }
        if !plan.assigned.is_empty() {
            let forward = plan
                .assigned
                .iter()
                .map(|(key, index)| (key.0.clone(), format_decimal(*index)))
                .collect();
            let reverse = plan
                .assigned
                .iter()
                .map(|(key, index)| (format_decimal(*index), key.0.clone()))
                .collect();
            self.store.hset(&forward_key, forward).await.map_err(store_error)?;
            self.store.hset(&reverse_key, reverse).await.map_err(store_error)?;
        }
        if plan.length != previous_length || !plan.is_noop() {
            self.store
                .set(&keys::indices_length(&self.catalog_key), format_decimal(plan.length))
                .await
                .map_err(store_error)?;
        }

        let summary = plan.summary();
        tracing::info!(
            catalog = %self.catalog_key,
            added = plan.assigned.len(),
            removed = plan.removed.len(),
            total_items = summary.total_items,
            length = plan.length,
            "catalog reconciled"
        );
        Ok(summary)
    }

    /// Indices of `keys`, in input order; unknown keys are skipped.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] or [`RecoError::Malformed`].
    pub async fn lookup(
        &self,
        keys: &[ItemKey],
    ) -> Result<Vec<(ItemKey, CatalogIndex)>, RecoError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let fields = keys.iter().map(|key| key.0.clone()).collect::<Vec<_>>();
        let found = self
            .store
            .hmget(&keys::indices_map(&self.catalog_key), &fields)
            .await
            .map_err(store_error)?;

        let mut resolved = Vec::with_capacity(keys.len());
        for (key, index) in keys.iter().zip(found) {
            if let Some(index) = index {
                resolved.push((key.clone(), parse_decimal(&index)?));
            }
        }
        Ok(resolved)
    }

    /// Keys held at `indices`, in input order; unassigned indices are skipped.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`].
    pub async fn resolve(
        &self,
        indices: &[CatalogIndex],
    ) -> Result<Vec<(CatalogIndex, ItemKey)>, RecoError> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let fields = indices.iter().map(|index| format_decimal(*index)).collect::<Vec<_>>();
        let found = self
            .store
            .hmget(&keys::items_map(&self.catalog_key), &fields)
            .await
            .map_err(store_error)?;

        Ok(indices
            .iter()
            .zip(found)
            .filter_map(|(index, key)| key.map(|key| (*index, ItemKey(key))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use reco_kernel_store::MemoryKvStore;

    use super::*;

    fn key(name: &str) -> ItemKey {
        ItemKey::from_bytes(format!(r#"{{"sku":"{name}"}}"#))
    }

    fn keys_of(names: &[&str]) -> BTreeSet<ItemKey> {
        names.iter().map(|name| key(name)).collect()
    }

    fn indexer() -> (Arc<dyn KvStore>, CatalogIndexer) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        (Arc::clone(&store), CatalogIndexer::new(store, "products_1"))
    }

    #[tokio::test]
    async fn reconcile_twice_leaves_maps_unchanged() -> Result<(), RecoError> {
        let (store, indexer) = indexer();
        let current = keys_of(&["k1", "k2", "k3"]);
        indexer.reconcile(&current).await?;

        let forward = store.hgetall("products_1_indices_map").await.map_err(store_error)?;
        let reverse = store.hgetall("products_1_items_map").await.map_err(store_error)?;

        let summary = indexer.reconcile(&current).await?;
        assert_eq!(summary, ReconcileSummary { total_items: 3, max_index: Some(2) });
        assert_eq!(store.hgetall("products_1_indices_map").await.map_err(store_error)?, forward);
        assert_eq!(store.hgetall("products_1_items_map").await.map_err(store_error)?, reverse);
        assert_eq!(indexer.length().await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn retired_index_is_reused_by_new_key() -> Result<(), RecoError> {
        let (_, indexer) = indexer();
        indexer.reconcile(&keys_of(&["k1", "k2", "k3", "k4"])).await?;
        assert_eq!(indexer.lookup(&[key("k1")]).await?, vec![(key("k1"), 0)]);

        indexer.reconcile(&keys_of(&["k2", "k3", "k4", "k5"])).await?;
        assert_eq!(indexer.lookup(&[key("k5")]).await?, vec![(key("k5"), 0)]);
        assert_eq!(indexer.resolve(&[0]).await?, vec![(0, key("k5"))]);
        assert!(indexer.lookup(&[key("k1")]).await?.is_empty());
        assert_eq!(indexer.length().await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn lookup_and_resolve_round_trip_skipping_unknowns() -> Result<(), RecoError> {
        let (_, indexer) = indexer();
        indexer.reconcile(&keys_of(&["a", "b", "c"])).await?;

        let requested = vec![key("c"), key("ghost"), key("a")];
        let found = indexer.lookup(&requested).await?;
        assert_eq!(found.len(), 2);

        let indices = found.iter().map(|(_, index)| *index).collect::<Vec<_>>();
        let resolved = indexer.resolve(&indices).await?;
        assert_eq!(
            resolved.into_iter().map(|(_, key)| key).collect::<Vec<_>>(),
            vec![key("c"), key("a")]
        );
        assert!(indexer.resolve(&[42]).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn freed_reverse_entries_are_deleted() -> Result<(), RecoError> {
        let (store, indexer) = indexer();
        indexer.reconcile(&keys_of(&["a", "b", "c"])).await?;
        indexer.reconcile(&keys_of(&["a"])).await?;

        let reverse = store.hgetall("products_1_items_map").await.map_err(store_error)?;
        assert_eq!(reverse.len(), 1);
        assert_eq!(indexer.length().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreconciled_catalog_is_empty() -> Result<(), RecoError> {
        let (_, indexer) = indexer();
        assert_eq!(indexer.length().await?, 0);
        assert!(indexer.known().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_length_counter_is_malformed() -> Result<(), RecoError> {
        let (store, indexer) = indexer();
        store.set("products_1_indices_length", b"many".to_vec()).await.map_err(store_error)?;
        assert!(matches!(indexer.length().await, Err(RecoError::Malformed(_))));
        Ok(())
    }
}
