use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reco_kernel_core::{
    EngineConfig, Item, ItemKey, ItemTypeConfig, RecoError, RecommendationConfig, ReconcileSummary,
    VectorSummary,
};
use reco_kernel_store::{ItemCatalog, KvItemCatalog, KvStore, LoadSummary};

pub mod catalog;
pub mod engine;
pub mod filters;
pub mod recommender;
pub mod vectors;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::CatalogIndexer;
pub use engine::{EngineContext, EngineRegistry, RankingEngine, TopSellerEngine};
pub use filters::{FilterEngine, FilterMask, FilterUpdateSummary};
pub use recommender::{
    RecommendationRequest, RecommendationResponse, Recommender, RedirectItem, RedirectTarget,
};
pub use vectors::{ScoreRecord, VectorStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Wrap a storage failure with its full context chain.
#[must_use]
pub fn store_error(err: anyhow::Error) -> RecoError {
    RecoError::Store(format!("{err:#}"))
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> RecoError {
    if err.is_cancelled() {
        RecoError::Cancelled("ranking worker was cancelled".to_string())
    } else {
        RecoError::Store(format!("ranking worker failed: {err}"))
    }
}

/// Read a [`RecommendationConfig`] from YAML (`.yaml`/`.yml`) or JSON and validate it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> Result<RecommendationConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: RecommendationConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?,
        Some("json") => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?,
        _ => return Err(anyhow!("unsupported config format: {}", path.display())),
    };
    config.validate().map_err(|err| anyhow!("invalid config {}: {err}", path.display()))?;
    Ok(config)
}

/// Serving and maintenance entry points over one store.
pub struct RecoKernelApi {
    store: Arc<dyn KvStore>,
    catalog: Arc<KvItemCatalog>,
    vectors: VectorStore,
    recommender: Recommender,
}

impl RecoKernelApi {
    /// # Errors
    /// Returns [`RecoError::Config`] when `config` is invalid for `registry`.
    pub fn new(
        store: Arc<dyn KvStore>,
        config: RecommendationConfig,
        registry: EngineRegistry,
    ) -> Result<Self, RecoError> {
        let catalog = Arc::new(KvItemCatalog::new(Arc::clone(&store)));
        let recommender = Recommender::new(
            Arc::clone(&store),
            Arc::clone(&catalog) as Arc<dyn ItemCatalog>,
            Arc::new(config),
            Arc::new(registry),
        )?;
        let vectors = VectorStore::new(Arc::clone(&store));
        Ok(Self { store, catalog, vectors, recommender })
    }

    #[must_use]
    pub fn config(&self) -> &RecommendationConfig {
        self.recommender.config()
    }

    #[must_use]
    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    fn item_type(&self, name: &str) -> Result<&ItemTypeConfig, RecoError> {
        self.config()
            .item_type(name)
            .ok_or_else(|| RecoError::NotFound(format!("item type {name}")))
    }

    fn engine(&self, id: &str) -> Result<&EngineConfig, RecoError> {
        self.config().engine(id).ok_or_else(|| RecoError::NotFound(format!("engine {id}")))
    }

    fn indexer(&self, item_type: &str, store_id: &str) -> CatalogIndexer {
        CatalogIndexer::new(
            Arc::clone(&self.store),
            reco_kernel_core::config::catalog_key(item_type, store_id),
        )
    }

    /// Replace the stored catalog records of one item type and store.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown item types and store errors.
    pub async fn load_items(
        &self,
        item_type: &str,
        store_id: &str,
        items: Vec<Item>,
    ) -> Result<LoadSummary, RecoError> {
        let item_type = self.item_type(item_type)?;
        self.catalog.replace_items(item_type, store_id, items).await.map_err(store_error)
    }

    /// Insert or overwrite `items`, keeping the other stored records.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown item types and store errors.
    pub async fn upsert_items(
        &self,
        item_type: &str,
        store_id: &str,
        items: Vec<Item>,
    ) -> Result<LoadSummary, RecoError> {
        let item_type = self.item_type(item_type)?;
        let summary =
            self.catalog.upsert_items(item_type, store_id, items).await.map_err(store_error)?;
        tracing::info!(
            item_type = %item_type.name,
            store_id,
            stored = summary.stored,
            skipped = summary.skipped,
            "catalog records upserted"
        );
        Ok(summary)
    }

    /// Drop the stored records whose identity fields match `identities`.
    /// Identities missing an id field are counted as skipped.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown item types and store errors.
    pub async fn remove_items(
        &self,
        item_type: &str,
        store_id: &str,
        identities: &[Item],
    ) -> Result<LoadSummary, RecoError> {
        let item_type = self.item_type(item_type)?;
        let keys = identities
            .iter()
            .filter_map(|identity| ItemKey::from_fields(identity, &item_type.id_fields))
            .collect::<Vec<_>>();
        let summary = LoadSummary { stored: keys.len(), skipped: identities.len() - keys.len() };
        if !keys.is_empty() {
            self.catalog.remove_items(item_type, store_id, &keys).await.map_err(store_error)?;
        }
        tracing::info!(
            item_type = %item_type.name,
            store_id,
            removed = summary.stored,
            skipped = summary.skipped,
            "catalog records removed"
        );
        Ok(summary)
    }

    /// Allocate indices for the catalog's current identities.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown item types and store errors.
    pub async fn reconcile(
        &self,
        item_type: &str,
        store_id: &str,
    ) -> Result<ReconcileSummary, RecoError> {
        let config = self.item_type(item_type)?;
        let current = self.catalog.item_keys(config, store_id).await.map_err(store_error)?;
        self.indexer(item_type, store_id).reconcile(&current).await
    }

    /// Rebuild every facet's filter vectors against the current allocation.
    ///
    /// # Errors
    /// Returns [`RecoError::NotFound`] for unknown item types and store errors.
    pub async fn rebuild_filters(
        &self,
        item_type: &str,
        store_id: &str,
    ) -> Result<FilterUpdateSummary, RecoError> {
        let config = self.item_type(item_type)?;
        let items = self.catalog.all_items(config, store_id).await.map_err(store_error)?;
        let indexer = self.indexer(item_type, store_id);
        let positions = indexer.known().await?;
        let length = indexer.length().await?;

        let filters = FilterEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.catalog) as Arc<dyn ItemCatalog>,
            config.clone(),
            store_id,
        );
        filters.update(&items, &positions, length).await
    }

    /// Replace the ranking vector of `engine_id` with the accumulated `records`.
    ///
    /// # Errors
    /// Returns [`RecoError::NoData`] when nothing resolves, [`RecoError::NotFound`]
    /// for unknown engines and store errors.
    pub async fn ingest(
        &self,
        engine_id: &str,
        records: &[ScoreRecord],
    ) -> Result<VectorSummary, RecoError> {
        let engine = self.engine(engine_id)?;
        let item_type = self.item_type(&engine.item_type)?;
        let indexer = self.indexer(&engine.item_type, &engine.store_id);
        self.vectors.ingest(engine, item_type, &indexer, records).await
    }

    /// # Errors
    /// Returns [`RecoError::NoData`] for an empty catalog, [`RecoError::NotFound`]
    /// for unknown engines and store errors.
    pub async fn export(&self, engine_id: &str) -> Result<Vec<ScoreRecord>, RecoError> {
        let engine = self.engine(engine_id)?;
        let indexer = self.indexer(&engine.item_type, &engine.store_id);
        self.vectors.export(engine, &indexer).await
    }

    /// # Errors
    /// See [`Recommender::get_items`].
    pub async fn recommend(
        &self,
        hash: &str,
        request: &RecommendationRequest,
    ) -> Result<RecommendationResponse, RecoError> {
        self.recommender.get_items(hash, request).await
    }

    /// # Errors
    /// See [`Recommender::redirect`].
    pub async fn redirect(
        &self,
        hash: &str,
        request: &RecommendationRequest,
        target: RedirectTarget,
    ) -> Result<RedirectItem, RecoError> {
        self.recommender.redirect(hash, request, target).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use reco_kernel_store::MemoryKvStore;

    use super::*;
    use crate::testing::{fixture_config, harness, sku, FIXTURE_CONFIG};

    fn temp_file(name: &str, contents: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("reco-kernel-api-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    #[test]
    fn load_config_reads_yaml_and_json() -> Result<()> {
        let yaml = temp_file("config.yaml", FIXTURE_CONFIG)?;
        assert_eq!(load_config(&yaml)?, fixture_config());

        let json = temp_file("config.json", &serde_json::to_string(&fixture_config())?)?;
        assert_eq!(load_config(&json)?, fixture_config());

        let toml = temp_file("config.toml", "")?;
        assert!(load_config(&toml).is_err());
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = fixture_config();
        config.slots[1].fallbacks = vec!["alt1".to_string()];
        let result = RecoKernelApi::new(
            Arc::new(MemoryKvStore::new()),
            config,
            EngineRegistry::with_defaults(),
        );
        assert!(matches!(result, Err(RecoError::Config(_))));
    }

    #[tokio::test]
    async fn export_returns_ingested_scores() -> Result<(), RecoError> {
        let harness = harness().await?;
        let exported = harness.api.export("side").await?;
        assert_eq!(
            exported,
            vec![ScoreRecord { item: sku("E"), value: 7 }, ScoreRecord { item: sku("F"), value: 6 }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn removed_items_leave_recommendations_after_reconcile() -> Result<(), RecoError> {
        let harness = harness().await?;
        let keep = ["B", "C", "D", "E", "F"]
            .into_iter()
            .map(|name| {
                let mut item = sku(name);
                item.insert("color".to_string(), serde_json::json!("blue"));
                item
            })
            .collect();
        harness.api.load_items("products", "1", keep).await?;
        let summary = harness.api.reconcile("products", "1").await?;
        assert_eq!(summary.total_items, 5);

        let request = RecommendationRequest { seed: Some(1), ..RecommendationRequest::default() };
        let response = harness.api.recommend("home", &request).await?;
        let skus = crate::testing::skus(&response.slots[0].items);
        assert!(!skus.contains(&"A".to_string()), "{skus:?}");

        let length = harness
            .store
            .get("products_1_indices_length")
            .await
            .map_err(store_error)?;
        assert_eq!(length, Some(b"6".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn incremental_catalog_changes_flow_through_reconcile() -> Result<(), RecoError> {
        let harness = harness().await?;

        let mut added = sku("G");
        added.insert("color".to_string(), serde_json::json!("red"));
        let upserted = harness.api.upsert_items("products", "1", vec![added]).await?;
        assert_eq!(upserted, LoadSummary { stored: 1, skipped: 0 });

        let nameless = serde_json::Map::new();
        let removed = harness.api.remove_items("products", "1", &[sku("A"), nameless]).await?;
        assert_eq!(removed, LoadSummary { stored: 1, skipped: 1 });

        let summary = harness.api.reconcile("products", "1").await?;
        assert_eq!(summary.total_items, 6);

        let indexer = harness.api.indexer("products", "1");
        let known = indexer.known().await?;
        assert!(!known.contains_key(&ItemKey::from_bytes(r#"{"sku":"A"}"#)));
        // G takes the slot A released.
        assert_eq!(known.get(&ItemKey::from_bytes(r#"{"sku":"G"}"#)), Some(&0));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_engine_is_not_found() -> Result<(), RecoError> {
        let harness = harness().await?;
        assert!(matches!(harness.api.export("ghost").await, Err(RecoError::NotFound(_))));
        assert!(matches!(
            harness.api.ingest("ghost", &[]).await,
            Err(RecoError::NotFound(_))
        ));
        Ok(())
    }
}
