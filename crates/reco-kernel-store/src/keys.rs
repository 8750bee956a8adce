//! Persisted key layout.
//!
//! Every catalog-aligned structure is keyed under the catalog key
//! `<item_type>_<store_id>`; ranking vectors are keyed by engine key.

/// Hash of ItemKey to catalog index (decimal text).
#[must_use]
pub fn indices_map(catalog_key: &str) -> String {
    format!("{catalog_key}_indices_map")
}

/// Hash of catalog index (decimal text) to ItemKey.
#[must_use]
pub fn items_map(catalog_key: &str) -> String {
    format!("{catalog_key}_items_map")
}

/// Length counter, stored as decimal text.
#[must_use]
pub fn indices_length(catalog_key: &str) -> String {
    format!("{catalog_key}_indices_length")
}

/// Filter vectors of one facet: a plain value for boolean facets, a hash for
/// the others.
#[must_use]
pub fn filter(catalog_key: &str, facet: &str) -> String {
    format!("{catalog_key}_{facet}_filter")
}

/// Hash of ItemKey to the item record as JSON.
#[must_use]
pub fn records(catalog_key: &str) -> String {
    format!("{catalog_key}_records")
}
