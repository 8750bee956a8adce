//! Shared catalog fixture for the api tests.

use std::sync::Arc;

use reco_kernel_core::{Item, RecoError, RecommendationConfig};
use reco_kernel_store::{KvStore, MemoryKvStore};
use serde_json::{json, Value};

use crate::engine::EngineRegistry;
use crate::vectors::ScoreRecord;
use crate::RecoKernelApi;

pub const FIXTURE_CONFIG: &str = r"
item_types:
  - name: products
    id_fields: [sku]
    facets:
      - name: color
        shape: { type: scalar }
      - name: on_sale
        shape: { type: boolean }
engines:
  - { id: primary, kind: top_seller, item_type: products, store_id: '1' }
  - { id: first_fallback, kind: top_seller, item_type: products, store_id: '1' }
  - { id: second_fallback, kind: top_seller, item_type: products, store_id: '1' }
  - { id: solo, kind: top_seller, item_type: products, store_id: '1' }
  - { id: side, kind: top_seller, item_type: products, store_id: '1' }
slots:
  - { id: main, engine: primary, max_items: 4, fallbacks: [alt1, alt2] }
  - { id: alt1, engine: first_fallback, max_items: 4 }
  - { id: alt2, engine: second_fallback, max_items: 4 }
  - id: solo
    engine: solo
    max_items: 3
    filters:
      - { facet: color }
      - { facet: color, inclusive: false }
      - { facet: size }
  - { id: side, engine: side, max_items: 2 }
  - { id: full, engine: solo, max_items: 2, fallbacks: [alt2] }
placements:
  - hash: home
    name: Home
    variations:
      - slots: [main]
  - hash: solo
    name: Solo
    variations:
      - slots: [solo]
  - hash: mixed
    name: Mixed
    distribute_items: true
    variations:
      - slots: [main, side]
  - hash: split
    name: Split
    variations:
      - { weight: 1, slots: [main] }
      - { weight: 3, slots: [side] }
  - hash: full
    name: Full
    variations:
      - slots: [full]
";

pub fn fixture_config() -> RecommendationConfig {
    match serde_yaml::from_str(FIXTURE_CONFIG) {
        Ok(config) => config,
        Err(err) => panic!("fixture config did not parse: {err}"),
    }
}

pub fn sku(value: &str) -> Item {
    match json!({ "sku": value }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub fn skus(items: &[Item]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.get("sku").and_then(Value::as_str).unwrap_or_default().to_string())
        .collect()
}

fn record(value: Value) -> Item {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture is not an object: {other}"),
    }
}

fn scores(pairs: &[(&str, i64)]) -> Vec<ScoreRecord> {
    pairs.iter().map(|(name, value)| ScoreRecord { item: sku(name), value: *value }).collect()
}

pub struct Harness {
    pub store: Arc<dyn KvStore>,
    pub api: RecoKernelApi,
}

/// Six products, reconciled and filtered, with one ingested vector per engine.
pub async fn harness() -> Result<Harness, RecoError> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let api = RecoKernelApi::new(
        Arc::clone(&store),
        fixture_config(),
        EngineRegistry::with_defaults(),
    )?;

    let items = vec![
        record(json!({"sku": "A", "color": "red", "on_sale": true})),
        record(json!({"sku": "B", "color": "blue", "on_sale": false})),
        record(json!({"sku": "C", "color": "red", "on_sale": true})),
        record(json!({"sku": "D", "color": "green", "on_sale": false})),
        record(json!({"sku": "E", "color": "blue", "on_sale": true})),
        record(json!({"sku": "F", "color": "green", "on_sale": false})),
    ];
    api.load_items("products", "1", items).await?;
    api.reconcile("products", "1").await?;
    api.rebuild_filters("products", "1").await?;

    api.ingest("primary", &scores(&[("A", 10), ("B", 9)])).await?;
    api.ingest("first_fallback", &scores(&[("B", 10), ("C", 9)])).await?;
    api.ingest("second_fallback", &scores(&[("C", 10), ("D", 9)])).await?;
    api.ingest("solo", &scores(&[("A", 5), ("B", 6), ("C", 8), ("D", 3)])).await?;
    api.ingest("side", &scores(&[("E", 7), ("F", 6)])).await?;

    Ok(Harness { store, api })
}
