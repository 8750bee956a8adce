//! Ranking engines and the registry that maps configured kinds to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reco_kernel_core::{
    CatalogIndex, EngineConfig, EngineKind, RankingVector, RecoError, RecommendationConfig,
};
use serde_json::Value;

use crate::vectors::VectorStore;

/// Everything an engine may read while building a vector for one request.
pub struct EngineContext<'a> {
    pub engine: &'a EngineConfig,
    pub vectors: &'a VectorStore,
    /// Current catalog length counter; the vector must have this length.
    pub length: CatalogIndex,
    /// Engine variables bound from the request, by engine variable name.
    pub variables: &'a BTreeMap<String, Value>,
}

#[async_trait]
pub trait RankingEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Names of the variables slots may bind for this engine.
    fn variables(&self) -> &'static [&'static str] {
        &[]
    }

    async fn build_vector(&self, context: &EngineContext<'_>) -> Result<RankingVector, RecoError>;
}

/// Serves the vector persisted by the last ingestion pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopSellerEngine;

#[async_trait]
impl RankingEngine for TopSellerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::TopSeller
    }

    async fn build_vector(&self, context: &EngineContext<'_>) -> Result<RankingVector, RecoError> {
        context.vectors.load(context.engine, context.length).await
    }
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<EngineKind, Arc<dyn RankingEngine>>,
}

impl EngineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in engine.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TopSellerEngine));
        registry
    }

    /// Register `engine` under its kind, replacing any previous one.
    pub fn register(&mut self, engine: Arc<dyn RankingEngine>) {
        self.engines.insert(engine.kind(), engine);
    }

    /// # Errors
    /// Returns [`RecoError::Config`] when no engine is registered for `kind`.
    pub fn get(&self, kind: EngineKind) -> Result<Arc<dyn RankingEngine>, RecoError> {
        self.engines
            .get(&kind)
            .cloned()
            .ok_or_else(|| RecoError::Config(format!("no engine registered for {}", kind.as_str())))
    }

    /// Check that every configured engine has an implementation and that slot
    /// variable bindings name variables the engine declares.
    ///
    /// # Errors
    /// Returns [`RecoError::Config`] naming the first violation.
    pub fn validate(&self, config: &RecommendationConfig) -> Result<(), RecoError> {
        for engine in &config.engines {
            self.get(engine.kind)?;
        }
        for slot in &config.slots {
            let Some(engine) = config.engine(&slot.engine) else {
                continue;
            };
            let declared = self.get(engine.kind)?.variables();
            for binding in &slot.variables {
                if !declared.contains(&binding.engine_variable.as_str()) {
                    return Err(RecoError::Config(format!(
                        "slot {} binds unknown variable {} of engine {}",
                        slot.id, binding.engine_variable, engine.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use reco_kernel_core::{SlotConfig, VariableBinding};

    use super::*;

    struct Boosted;

    #[async_trait]
    impl RankingEngine for Boosted {
        fn kind(&self) -> EngineKind {
            EngineKind::TopSeller
        }

        fn variables(&self) -> &'static [&'static str] {
            &["boost"]
        }

        async fn build_vector(
            &self,
            context: &EngineContext<'_>,
        ) -> Result<RankingVector, RecoError> {
            let length = usize::try_from(context.length).unwrap_or(0);
            Ok(RankingVector::zeros(length))
        }
    }

    fn config(variable: &str) -> RecommendationConfig {
        RecommendationConfig {
            engines: vec![EngineConfig {
                id: "best".to_string(),
                kind: EngineKind::TopSeller,
                item_type: "products".to_string(),
                store_id: "1".to_string(),
            }],
            slots: vec![SlotConfig {
                id: "main".to_string(),
                engine: "best".to_string(),
                max_items: 3,
                filters: Vec::new(),
                variables: vec![VariableBinding {
                    engine_variable: variable.to_string(),
                    external_name: "b".to_string(),
                }],
                fallbacks: Vec::new(),
            }],
            ..RecommendationConfig::default()
        }
    }

    #[test]
    fn empty_registry_rejects_configured_engines() {
        let result = EngineRegistry::new().validate(&config("boost"));
        assert!(matches!(result, Err(RecoError::Config(_))));
    }

    #[test]
    fn variable_bindings_must_be_declared_by_the_engine() {
        let defaults = EngineRegistry::with_defaults();
        assert!(matches!(defaults.validate(&config("boost")), Err(RecoError::Config(_))));

        let mut registry = EngineRegistry::with_defaults();
        registry.register(Arc::new(Boosted));
        assert_eq!(registry.validate(&config("boost")), Ok(()));
        assert!(matches!(registry.validate(&config("other")), Err(RecoError::Config(_))));
    }
}
