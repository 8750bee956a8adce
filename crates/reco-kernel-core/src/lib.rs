use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod allocator;
pub mod codec;
pub mod config;
pub mod filter;
pub mod interleave;
pub mod vector;

pub use allocator::{plan_reconcile, ReconcilePlan, ReconcileSummary};
pub use config::{
    EngineConfig, EngineKind, FacetConfig, FacetShape, FilterBinding, ItemTypeConfig,
    PlacementConfig, RecommendationConfig, SlotConfig, VariableBinding, VariationConfig,
};
pub use filter::{filter_strategy, FilterSource, FilterStorage, FilterStrategy, FilterVectors};
pub use interleave::{distribute, Distribution};
pub use vector::{select_top_k, RankingVector, VectorSummary};

/// Position of an item inside every catalog-aligned vector.
pub type CatalogIndex = u32;

/// A catalog record as stored by the item-storage collaborator.
pub type Item = serde_json::Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecoError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no usable data: {0}")]
    NoData(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed persisted data: {0}")]
    Malformed(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl RecoError {
    /// Stable machine-readable kind, used by the service error envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NoData(_) => "no_data",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Malformed(_) => "malformed",
            Self::Store(_) => "store",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Opaque, stable identity of one catalog item.
///
/// The canonical byte form is the compact JSON object of the identity fields
/// with keys in ascending name order, so the same business identifier always
/// produces the same key and the key can be turned back into an identity object.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemKey(pub Vec<u8>);

impl ItemKey {
    /// Build the key from the given identity fields of `item`.
    ///
    /// Returns `None` when a field is missing or null.
    #[must_use]
    pub fn from_fields(item: &Item, id_fields: &[String]) -> Option<Self> {
        canonical_object_key(item, id_fields).map(Self)
    }

    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the minimal identity object this key was built from.
    ///
    /// # Errors
    /// Returns [`RecoError::Malformed`] when the key is not a canonical JSON object.
    pub fn identity(&self) -> Result<Item, RecoError> {
        match serde_json::from_slice::<Value>(&self.0) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(RecoError::Malformed(format!("item key {self} is not an object"))),
            Err(err) => Err(RecoError::Malformed(format!("item key {self} is not JSON: {err}"))),
        }
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Compact JSON of `object` restricted to `fields`, keys sorted by name.
///
/// Field names are part of the output: two composite values with equal
/// field values but different field names never share a key.
#[must_use]
pub fn canonical_object_key(object: &Item, fields: &[String]) -> Option<Vec<u8>> {
    let mut selected = BTreeMap::new();
    for field in fields {
        match object.get(field) {
            None | Some(Value::Null) => return None,
            Some(value) => {
                selected.insert(field.as_str(), value);
            }
        }
    }
    serde_json::to_vec(&selected).ok()
}
