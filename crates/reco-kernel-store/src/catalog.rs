//! Item records kept next to the catalog-aligned structures.
//!
//! The kernel never owns item storage; it needs two things from it: the set
//! of current identities (to reconcile indices) and full records for a set of
//! identities (to hydrate results and to build filters). [`ItemCatalog`] is
//! that seam; [`KvItemCatalog`] keeps the records in the same [`KvStore`].

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reco_kernel_core::config::catalog_key;
use reco_kernel_core::{Item, ItemKey, ItemTypeConfig};
use serde::{Deserialize, Serialize};

use crate::{keys, KvStore};

#[async_trait]
pub trait ItemCatalog: Send + Sync {
    /// Every identity currently in the catalog.
    async fn item_keys(&self, item_type: &ItemTypeConfig, store_id: &str)
        -> Result<BTreeSet<ItemKey>>;

    /// Full records for `keys`, aligned with the input; unknown keys yield `None`.
    async fn items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
        keys: &[ItemKey],
    ) -> Result<Vec<Option<Item>>>;

    /// Every record with its identity, in ascending key order.
    async fn all_items(&self, item_type: &ItemTypeConfig, store_id: &str)
        -> Result<Vec<(ItemKey, Item)>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoadSummary {
    pub stored: usize,
    /// Records without a complete identity.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct KvItemCatalog {
    store: Arc<dyn KvStore>,
}

impl KvItemCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Replace every stored record of the catalog with `items`.
    ///
    /// # Errors
    /// Returns an error when a record cannot be encoded or the store write fails.
    pub async fn replace_items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
        items: Vec<Item>,
    ) -> Result<LoadSummary> {
        let (entries, summary) = encode_records(item_type, items)?;
        let key = keys::records(&catalog_key(&item_type.name, store_id));
        self.store.replace_hash(&key, entries).await?;
        tracing::info!(
            catalog = %key,
            stored = summary.stored,
            skipped = summary.skipped,
            "replaced catalog records"
        );
        Ok(summary)
    }

    /// Insert or overwrite `items`, leaving other records untouched.
    ///
    /// # Errors
    /// Returns an error when a record cannot be encoded or the store write fails.
    pub async fn upsert_items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
        items: Vec<Item>,
    ) -> Result<LoadSummary> {
        let (entries, summary) = encode_records(item_type, items)?;
        if !entries.is_empty() {
            let key = keys::records(&catalog_key(&item_type.name, store_id));
            self.store.hset(&key, entries).await?;
        }
        Ok(summary)
    }

    /// Remove the records of `keys`.
    ///
    /// # Errors
    /// Returns an error when the store delete fails.
    pub async fn remove_items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
        keys: &[ItemKey],
    ) -> Result<()> {
        let fields = keys.iter().map(|key| key.as_bytes().to_vec()).collect::<Vec<_>>();
        let key = keys::records(&catalog_key(&item_type.name, store_id));
        self.store.hdel(&key, &fields).await
    }
}

fn encode_records(
    item_type: &ItemTypeConfig,
    items: Vec<Item>,
) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, LoadSummary)> {
    let mut entries = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        let Some(key) = ItemKey::from_fields(&item, &item_type.id_fields) else {
            skipped += 1;
            continue;
        };
        let body = serde_json::to_vec(&item)
            .with_context(|| format!("failed to encode catalog record {key}"))?;
        entries.push((key.0, body));
    }
    if skipped > 0 {
        tracing::warn!(item_type = %item_type.name, skipped, "records without complete identity skipped");
    }
    let summary = LoadSummary { stored: entries.len(), skipped };
    Ok((entries, summary))
}

fn decode_record(key: &[u8], body: &[u8]) -> Result<Item> {
    serde_json::from_slice(body).with_context(|| {
        format!("catalog record {} is not a JSON object", String::from_utf8_lossy(key))
    })
}

#[async_trait]
impl ItemCatalog for KvItemCatalog {
    async fn item_keys(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
    ) -> Result<BTreeSet<ItemKey>> {
        let key = keys::records(&catalog_key(&item_type.name, store_id));
        Ok(self.store.hgetall(&key).await?.into_keys().map(ItemKey).collect())
    }

    async fn items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
        keys: &[ItemKey],
    ) -> Result<Vec<Option<Item>>> {
        let key = keys::records(&catalog_key(&item_type.name, store_id));
        let fields = keys.iter().map(|key| key.as_bytes().to_vec()).collect::<Vec<_>>();
        let bodies = self.store.hmget(&key, &fields).await?;

        fields
            .iter()
            .zip(bodies)
            .map(|(field, body)| body.map(|body| decode_record(field, &body)).transpose())
            .collect()
    }

    async fn all_items(
        &self,
        item_type: &ItemTypeConfig,
        store_id: &str,
    ) -> Result<Vec<(ItemKey, Item)>> {
        let key = keys::records(&catalog_key(&item_type.name, store_id));
        self.store
            .hgetall(&key)
            .await?
            .into_iter()
            .map(|(field, body)| {
                let item = decode_record(&field, &body)?;
                Ok((ItemKey(field), item))
            })
            .collect()
    }
}
