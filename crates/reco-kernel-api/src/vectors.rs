//! Persisted ranking vectors: load, ingestion and export.

use std::collections::BTreeMap;
use std::sync::Arc;

use reco_kernel_core::codec::unpack_i32s;
use reco_kernel_core::vector::{accumulate_i32, pack_vector};
use reco_kernel_core::{
    CatalogIndex, EngineConfig, Item, ItemKey, ItemTypeConfig, RankingVector, RecoError,
    VectorSummary,
};
use reco_kernel_store::KvStore;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogIndexer;
use crate::store_error;

/// One external score record: an identity object and the value to add.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    pub item: Item,
    pub value: i64,
}

#[derive(Clone)]
pub struct VectorStore {
    store: Arc<dyn KvStore>,
}

impl VectorStore {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Stored vector of `engine`, fitted to `length`. Absent vectors are all zero.
    ///
    /// # Errors
    /// Returns [`RecoError::Store`] or [`RecoError::Malformed`].
    pub async fn load(
        &self,
        engine: &EngineConfig,
        length: CatalogIndex,
    ) -> Result<RankingVector, RecoError> {
        let length = usize::try_from(length)
            .map_err(|_| RecoError::Config(format!("catalog length {length} does not fit")))?;
        match self.store.get(&engine.engine_key()).await.map_err(store_error)? {
            Some(bytes) => RankingVector::from_packed_i32(&bytes, length),
            None => Ok(RankingVector::zeros(length)),
        }
    }

    async fn load_raw(&self, engine: &EngineConfig, length: usize) -> Result<Vec<i32>, RecoError> {
        let mut values = match self.store.get(&engine.engine_key()).await.map_err(store_error)? {
            Some(bytes) => unpack_i32s(&bytes)?,
            None => Vec::new(),
        };
        values.resize(length, 0);
        Ok(values)
    }

    /// Accumulate `records` into a fresh vector for `engine` and persist it.
    ///
    /// # Errors
    /// Returns [`RecoError::NoData`] when there are no records or none of them
    /// resolves to a catalog index; store errors otherwise.
    pub async fn ingest(
        &self,
        engine: &EngineConfig,
        item_type: &ItemTypeConfig,
        indexer: &CatalogIndexer,
        records: &[ScoreRecord],
    ) -> Result<VectorSummary, RecoError> {
        if records.is_empty() {
            return Err(RecoError::NoData(format!("no records found for engine {}", engine.id)));
        }

        let keyed = records
            .iter()
            .filter_map(|record| {
                ItemKey::from_fields(&record.item, &item_type.id_fields)
                    .map(|key| (key, record.value))
            })
            .collect::<Vec<_>>();
        let keys = keyed.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>();
        let positions = indexer.lookup(&keys).await?.into_iter().collect::<BTreeMap<_, _>>();

        let values = keyed
            .iter()
            .filter_map(|(key, value)| positions.get(key).map(|index| (*index, *value)))
            .collect::<Vec<_>>();
        if values.is_empty() {
            return Err(RecoError::NoData(format!(
                "none of the {} records for engine {} matched a catalog item",
                records.len(),
                engine.id
            )));
        }

        let length = usize::try_from(indexer.length().await?)
            .map_err(|_| RecoError::Config("catalog length does not fit".to_string()))?;
        let vector = accumulate_i32(length, &values);
        self.store
            .set(&engine.engine_key(), pack_vector(&vector))
            .await
            .map_err(store_error)?;

        let summary = VectorSummary {
            length,
            min: vector.iter().copied().min().unwrap_or(0),
            max: vector.iter().copied().max().unwrap_or(0),
            records: records.len(),
            resolved: values.len(),
        };
        tracing::info!(
            engine = %engine.id,
            length = summary.length,
            min = summary.min,
            max = summary.max,
            records = summary.records,
            resolved = summary.resolved,
            "ranking vector ingested"
        );
        Ok(summary)
    }

    /// Identity and value of every positively scored item of `engine`.
    ///
    /// # Errors
    /// Returns [`RecoError::NoData`] when the catalog is empty.
    pub async fn export(
        &self,
        engine: &EngineConfig,
        indexer: &CatalogIndexer,
    ) -> Result<Vec<ScoreRecord>, RecoError> {
        let length = indexer.length().await?;
        if length == 0 {
            return Err(RecoError::NoData(format!(
                "catalog {} is empty",
                indexer.catalog_key()
            )));
        }
        let length = usize::try_from(length)
            .map_err(|_| RecoError::Config("catalog length does not fit".to_string()))?;
        let values = self.load_raw(engine, length).await?;

        let scored = values
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > 0)
            .filter_map(|(position, value)| {
                CatalogIndex::try_from(position).ok().map(|index| (index, *value))
            })
            .collect::<Vec<_>>();
        let indices = scored.iter().map(|(index, _)| *index).collect::<Vec<_>>();
        let resolved = indexer
            .resolve(&indices)
            .await?
            .into_iter()
            .collect::<BTreeMap<_, _>>();

        let mut records = Vec::with_capacity(scored.len());
        for (index, value) in scored {
            if let Some(key) = resolved.get(&index) {
                records.push(ScoreRecord { item: key.identity()?, value: i64::from(value) });
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use reco_kernel_core::EngineKind;
    use reco_kernel_store::MemoryKvStore;
    use serde_json::{json, Value};

    use super::*;

    fn object(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    fn record(sku: &str, value: i64) -> ScoreRecord {
        ScoreRecord { item: object(json!({ "sku": sku })), value }
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            id: "best".to_string(),
            kind: EngineKind::TopSeller,
            item_type: "products".to_string(),
            store_id: "1".to_string(),
        }
    }

    fn products() -> ItemTypeConfig {
        ItemTypeConfig {
            name: "products".to_string(),
            id_fields: vec!["sku".to_string()],
            facets: Vec::new(),
        }
    }

    async fn setup(skus: &[&str]) -> Result<(VectorStore, CatalogIndexer), RecoError> {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let indexer = CatalogIndexer::new(Arc::clone(&store), engine().catalog_key());
        let keys = skus
            .iter()
            .map(|sku| ItemKey::from_bytes(format!(r#"{{"sku":"{sku}"}}"#)))
            .collect::<BTreeSet<_>>();
        indexer.reconcile(&keys).await?;
        Ok((VectorStore::new(store), indexer))
    }

    #[tokio::test]
    async fn ingest_accumulates_and_persists() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&["a", "b", "c"]).await?;
        let records = vec![record("a", 2), record("c", 5), record("a", 3), record("zz", 9)];

        let summary = vectors.ingest(&engine(), &products(), &indexer, &records).await?;
        assert_eq!(
            summary,
            VectorSummary { length: 3, min: 0, max: 5, records: 4, resolved: 3 }
        );

        let loaded = vectors.load(&engine(), 3).await?;
        assert_eq!(loaded.scores(), &[5.0, 0.0, 5.0]);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_without_records_is_no_data() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&["a"]).await?;
        let result = vectors.ingest(&engine(), &products(), &indexer, &[]).await;
        assert!(matches!(result, Err(RecoError::NoData(_))));
        Ok(())
    }

    #[tokio::test]
    async fn ingest_without_resolvable_records_is_no_data() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&["a"]).await?;
        let records = vec![record("ghost", 1), ScoreRecord { item: object(json!({"name": "x"})), value: 1 }];
        let result = vectors.ingest(&engine(), &products(), &indexer, &records).await;
        assert!(matches!(result, Err(RecoError::NoData(_))));
        assert_eq!(vectors.load(&engine(), 1).await?.scores(), &[0.0]);
        Ok(())
    }

    #[tokio::test]
    async fn load_fits_stale_vectors_to_current_length() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&["a", "b"]).await?;
        vectors.ingest(&engine(), &products(), &indexer, &[record("b", 7)]).await?;

        assert_eq!(vectors.load(&engine(), 4).await?.scores(), &[0.0, 7.0, 0.0, 0.0]);
        assert_eq!(vectors.load(&engine(), 1).await?.scores(), &[0.0]);
        Ok(())
    }

    #[tokio::test]
    async fn export_lists_positive_scores_with_identities() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&["a", "b", "c"]).await?;
        vectors
            .ingest(&engine(), &products(), &indexer, &[record("a", 4), record("b", -1), record("c", 1)])
            .await?;

        let exported = vectors.export(&engine(), &indexer).await?;
        assert_eq!(exported, vec![record("a", 4), record("c", 1)]);
        Ok(())
    }

    #[tokio::test]
    async fn export_of_empty_catalog_is_no_data() -> Result<(), RecoError> {
        let (vectors, indexer) = setup(&[]).await?;
        assert!(matches!(vectors.export(&engine(), &indexer).await, Err(RecoError::NoData(_))));
        Ok(())
    }
}
