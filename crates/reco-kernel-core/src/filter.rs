//! Facet filter semantics.
//!
//! A filter is the pair (source, storage): the source says where the tested
//! facet values come from (the caller directly, other items, or index sets),
//! the storage says how the facet is persisted (one dense vector, one dense
//! vector per value, or index lists). [`filter_strategy`] is the dispatch
//! table over those two axes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{FacetConfig, FacetShape};
use crate::{canonical_object_key, CatalogIndex, Item, ItemKey};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    /// Facet values are supplied by the caller.
    #[default]
    By,
    /// Facet values are read from the items the caller references.
    Of,
    /// The caller supplies catalog indices, or items whose facet holds them.
    Index,
}

impl FilterSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::By => "by",
            Self::Of => "of",
            Self::Index => "index",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterStorage {
    /// One boolean vector for the whole facet.
    Dense,
    /// One boolean vector per distinct facet value.
    Keyed,
    /// One index list per owning item.
    IndexLists,
}

impl FacetShape {
    /// How a facet of this shape is persisted, or `None` for unsupported
    /// nestings such as arrays of booleans.
    #[must_use]
    pub fn storage(&self) -> Option<FilterStorage> {
        match self {
            Self::Boolean => Some(FilterStorage::Dense),
            Self::Scalar | Self::Object { .. } => Some(FilterStorage::Keyed),
            Self::Array { items } => match items.as_ref() {
                Self::Scalar | Self::Object { .. } => Some(FilterStorage::Keyed),
                _ => None,
            },
            Self::IndexList => Some(FilterStorage::IndexLists),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FilterStrategy {
    pub source: FilterSource,
    pub storage: FilterStorage,
}

/// Select the filter implementation for a source and facet shape.
///
/// Unknown combinations yield `None`, which callers treat as "no filter".
#[must_use]
pub fn filter_strategy(source: FilterSource, shape: &FacetShape) -> Option<FilterStrategy> {
    let storage = shape.storage()?;
    match (source, storage) {
        (FilterSource::By | FilterSource::Of, FilterStorage::Dense | FilterStorage::Keyed)
        | (FilterSource::Index, FilterStorage::IndexLists) => {
            Some(FilterStrategy { source, storage })
        }
        _ => None,
    }
}

/// Caller-facing parameter name for a facet filter.
#[must_use]
pub fn external_name(facet: &str, source: FilterSource, inclusive: bool) -> String {
    match (source, inclusive) {
        (FilterSource::By, true) => facet.to_string(),
        (FilterSource::By, false) => format!("{facet}_exclusive"),
        (FilterSource::Of, true) => format!("{facet}_inclusive_of"),
        (FilterSource::Of, false) => format!("{facet}_exclusive_of"),
        (FilterSource::Index, true) => "index_inclusive_of".to_string(),
        (FilterSource::Index, false) => "index_exclusive_of".to_string(),
    }
}

/// Persistable vectors of one facet, rebuilt wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVectors {
    Dense(Vec<bool>),
    Keyed(BTreeMap<Vec<u8>, Vec<bool>>),
    IndexLists(BTreeMap<ItemKey, Vec<CatalogIndex>>),
}

impl FilterVectors {
    /// Number of persisted entries (1 for dense facets).
    #[must_use]
    pub fn entries(&self) -> usize {
        match self {
            Self::Dense(_) => 1,
            Self::Keyed(vectors) => vectors.len(),
            Self::IndexLists(lists) => lists.len(),
        }
    }
}

/// One catalog item with its allocated position.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry<'a> {
    pub index: CatalogIndex,
    pub key: &'a ItemKey,
    pub item: &'a Item,
}

/// Build the filter vectors of `facet` for the given catalog snapshot.
///
/// `positions` is the allocator's forward map and resolves the identities an
/// index-list facet refers to; `id_fields` are the item type's identity fields.
/// Returns `None` for facets whose shape has no storage.
#[must_use]
pub fn build_filter_vectors(
    facet: &FacetConfig,
    entries: &[CatalogEntry<'_>],
    length: usize,
    id_fields: &[String],
    positions: &BTreeMap<ItemKey, CatalogIndex>,
) -> Option<FilterVectors> {
    let position_of =
        |index: CatalogIndex| usize::try_from(index).ok().filter(|position| *position < length);

    match facet.shape.storage()? {
        FilterStorage::Dense => {
            let mut vector = vec![false; length];
            for entry in entries {
                let flag = entry.item.get(&facet.name).and_then(facet_flag).unwrap_or(false);
                if let (true, Some(position)) = (flag, position_of(entry.index)) {
                    vector[position] = true;
                }
            }
            Some(FilterVectors::Dense(vector))
        }
        FilterStorage::Keyed => {
            let mut vectors: BTreeMap<Vec<u8>, Vec<bool>> = BTreeMap::new();
            for entry in entries {
                let Some(position) = position_of(entry.index) else {
                    continue;
                };
                let Some(value) = entry.item.get(&facet.name) else {
                    continue;
                };
                for key in facet_value_keys(&facet.shape, value) {
                    vectors.entry(key).or_insert_with(|| vec![false; length])[position] = true;
                }
            }
            Some(FilterVectors::Keyed(vectors))
        }
        FilterStorage::IndexLists => {
            let mut lists = BTreeMap::new();
            for entry in entries {
                let Some(value) = entry.item.get(&facet.name) else {
                    continue;
                };
                let referenced = identity_keys(value, id_fields)
                    .iter()
                    .filter_map(|key| positions.get(key).copied())
                    .collect::<BTreeSet<_>>();
                lists.insert(entry.key.clone(), referenced.into_iter().collect());
            }
            Some(FilterVectors::IndexLists(lists))
        }
    }
}

/// Keys of the per-value vectors a facet value (or a query value) selects.
///
/// Arrays are flattened, so a list of values selects the union of their vectors.
#[must_use]
pub fn facet_value_keys(shape: &FacetShape, value: &Value) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    collect_value_keys(shape, value, &mut keys);
    keys
}

fn collect_value_keys(shape: &FacetShape, value: &Value, keys: &mut Vec<Vec<u8>>) {
    match (shape, value) {
        (FacetShape::Array { items }, _) => collect_value_keys(items, value, keys),
        (_, Value::Array(values)) => {
            for value in values {
                collect_value_keys(shape, value, keys);
            }
        }
        (FacetShape::Scalar, value) => keys.extend(scalar_key(value)),
        (FacetShape::Object { id_fields }, Value::Object(object)) => {
            keys.extend(canonical_object_key(object, id_fields));
        }
        _ => {}
    }
}

fn scalar_key(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(text) => Some(text.as_bytes().to_vec()),
        Value::Number(number) => Some(number.to_string().into_bytes()),
        Value::Bool(flag) => Some(flag.to_string().into_bytes()),
        _ => None,
    }
}

/// Interpret a boolean facet or query value.
#[must_use]
pub fn facet_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|number| number != 0),
        Value::String(text) => match text.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Every boolean the value carries; arrays contribute each element.
#[must_use]
pub fn facet_flags(value: &Value) -> BTreeSet<bool> {
    match value {
        Value::Array(values) => values.iter().filter_map(facet_flag).collect(),
        value => facet_flag(value).into_iter().collect(),
    }
}

/// Item keys of the identity objects in `value` (an object or a list of them).
#[must_use]
pub fn identity_keys(value: &Value, id_fields: &[String]) -> Vec<ItemKey> {
    match value {
        Value::Object(object) => ItemKey::from_fields(object, id_fields).into_iter().collect(),
        Value::Array(values) => values.iter().flat_map(|value| identity_keys(value, id_fields)).collect(),
        _ => Vec::new(),
    }
}

/// Raw catalog indices in `value`: integers, or integer strings.
#[must_use]
pub fn raw_indices(value: &Value) -> Vec<CatalogIndex> {
    match value {
        Value::Number(number) => {
            number.as_u64().and_then(|n| CatalogIndex::try_from(n).ok()).into_iter().collect()
        }
        Value::String(text) => text.trim().parse::<CatalogIndex>().ok().into_iter().collect(),
        Value::Array(values) => values.iter().flat_map(raw_indices).collect(),
        _ => Vec::new(),
    }
}

/// OR the given vectors into one mask of `length`.
///
/// Vectors of another length are zero-filled or truncated first.
#[must_use]
pub fn union_masks<I>(masks: I, length: usize) -> Vec<bool>
where
    I: IntoIterator<Item = Vec<bool>>,
{
    let mut union = vec![false; length];
    for mask in masks {
        for (slot, selected) in union.iter_mut().zip(mask) {
            *slot |= selected;
        }
    }
    union
}

/// Mask for a dense boolean facet queried with `flags`: `true` selects the
/// items with the facet set, `false` selects the others.
#[must_use]
pub fn boolean_mask(vector: &[bool], flags: &BTreeSet<bool>, length: usize) -> Vec<bool> {
    let mut fitted = vector.to_vec();
    fitted.resize(length, false);
    let masks = flags.iter().map(|flag| {
        if *flag {
            fitted.clone()
        } else {
            fitted.iter().map(|selected| !selected).collect()
        }
    });
    union_masks(masks, length)
}

/// Values read from `items` for the facet, as query values for a `By` filter.
#[must_use]
pub fn facet_values_of<'a, I>(items: I, facet: &str) -> Value
where
    I: IntoIterator<Item = &'a Item>,
{
    Value::Array(items.into_iter().filter_map(|item| item.get(facet).cloned()).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    fn facet(name: &str, shape: FacetShape) -> FacetConfig {
        FacetConfig { name: name.to_string(), shape }
    }

    fn sku_key(sku: &str) -> ItemKey {
        match ItemKey::from_fields(&object(json!({ "sku": sku })), &["sku".to_string()]) {
            Some(key) => key,
            None => panic!("fixture key for {sku}"),
        }
    }

    fn catalog() -> (Vec<(ItemKey, Item)>, BTreeMap<ItemKey, CatalogIndex>) {
        let items = vec![
            json!({"sku": "a", "on_sale": true, "color": "red", "tags": ["x", "y"],
                   "brand": {"id": 1, "country": "br"}, "related": [{"sku": "c"}]}),
            json!({"sku": "b", "on_sale": false, "color": "blue", "tags": ["y"],
                   "brand": {"id": 2, "country": "br"}, "related": [{"sku": "a"}, {"sku": "zz"}]}),
            json!({"sku": "c", "on_sale": true, "color": "red", "tags": [],
                   "brand": {"id": 1, "country": "br"}}),
        ];
        let entries = items
            .into_iter()
            .map(|item| {
                let item = object(item);
                let sku = item.get("sku").and_then(Value::as_str).unwrap_or_default().to_string();
                (sku_key(&sku), item)
            })
            .collect::<Vec<_>>();
        let positions = entries
            .iter()
            .enumerate()
            .map(|(index, (key, _))| (key.clone(), CatalogIndex::try_from(index).unwrap_or(0)))
            .collect();
        (entries, positions)
    }

    fn build(shape: FacetShape, name: &str) -> FilterVectors {
        let (items, positions) = catalog();
        let entries = items
            .iter()
            .map(|(key, item)| CatalogEntry {
                index: positions.get(key).copied().unwrap_or(0),
                key,
                item,
            })
            .collect::<Vec<_>>();
        match build_filter_vectors(&facet(name, shape), &entries, 3, &["sku".to_string()], &positions)
        {
            Some(vectors) => vectors,
            None => panic!("facet {name} has no storage"),
        }
    }

    #[test]
    fn dispatch_table_covers_supported_pairs_only() {
        let scalar = FacetShape::Scalar;
        let bools = FacetShape::Array { items: Box::new(FacetShape::Boolean) };

        assert!(filter_strategy(FilterSource::By, &FacetShape::Boolean).is_some());
        assert!(filter_strategy(FilterSource::Of, &scalar).is_some());
        assert!(filter_strategy(FilterSource::Index, &FacetShape::IndexList).is_some());
        assert!(filter_strategy(FilterSource::Index, &scalar).is_none());
        assert!(filter_strategy(FilterSource::By, &FacetShape::IndexList).is_none());
        assert!(filter_strategy(FilterSource::By, &bools).is_none());
    }

    #[test]
    fn external_names_follow_query_convention() {
        assert_eq!(external_name("color", FilterSource::By, true), "color");
        assert_eq!(external_name("color", FilterSource::By, false), "color_exclusive");
        assert_eq!(external_name("color", FilterSource::Of, true), "color_inclusive_of");
        assert_eq!(external_name("color", FilterSource::Of, false), "color_exclusive_of");
        assert_eq!(external_name("related", FilterSource::Index, true), "index_inclusive_of");
        assert_eq!(external_name("related", FilterSource::Index, false), "index_exclusive_of");
    }

    #[test]
    fn boolean_facet_builds_one_dense_vector() {
        assert_eq!(build(FacetShape::Boolean, "on_sale"), FilterVectors::Dense(vec![true, false, true]));
    }

    #[test]
    fn scalar_facet_builds_one_vector_per_value() {
        let FilterVectors::Keyed(vectors) = build(FacetShape::Scalar, "color") else {
            panic!("expected keyed vectors");
        };
        assert_eq!(vectors.get(b"red".as_slice()), Some(&vec![true, false, true]));
        assert_eq!(vectors.get(b"blue".as_slice()), Some(&vec![false, true, false]));
    }

    #[test]
    fn array_facet_marks_membership_per_element() {
        let shape = FacetShape::Array { items: Box::new(FacetShape::Scalar) };
        let FilterVectors::Keyed(vectors) = build(shape, "tags") else {
            panic!("expected keyed vectors");
        };
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors.get(b"y".as_slice()), Some(&vec![true, true, false]));
    }

    #[test]
    fn object_facet_groups_by_canonical_id_key() {
        let shape = FacetShape::Object { id_fields: vec!["id".to_string()] };
        let FilterVectors::Keyed(vectors) = build(shape, "brand") else {
            panic!("expected keyed vectors");
        };
        assert_eq!(vectors.get(br#"{"id":1}"#.as_slice()), Some(&vec![true, false, true]));
    }

    #[test]
    fn index_list_facet_resolves_known_references_only() {
        let FilterVectors::IndexLists(lists) = build(FacetShape::IndexList, "related") else {
            panic!("expected index lists");
        };
        assert_eq!(lists.get(&sku_key("a")), Some(&vec![2]));
        assert_eq!(lists.get(&sku_key("b")), Some(&vec![0]));
        assert_eq!(lists.get(&sku_key("c")), None);
    }

    #[test]
    fn query_values_flatten_into_keys() {
        let keys = facet_value_keys(&FacetShape::Scalar, &json!(["red", 5, null]));
        assert_eq!(keys, vec![b"red".to_vec(), b"5".to_vec()]);
    }

    #[test]
    fn boolean_mask_supports_negative_queries() {
        let vector = [true, false, true];
        let only_false = BTreeSet::from([false]);
        assert_eq!(boolean_mask(&vector, &only_false, 4), vec![false, true, false, true]);

        let both = BTreeSet::from([true, false]);
        assert_eq!(boolean_mask(&vector, &both, 3), vec![true, true, true]);
    }

    #[test]
    fn union_fits_masks_to_length() {
        let union = union_masks(vec![vec![true], vec![false, false, true, true]], 3);
        assert_eq!(union, vec![true, false, true]);
    }

    #[test]
    fn raw_indices_accept_numbers_and_numeric_strings() {
        assert_eq!(raw_indices(&json!([1, "2", -3, "x", [4]])), vec![1, 2, 4]);
    }

    #[test]
    fn facet_values_of_reads_from_referenced_items() {
        let (items, _) = catalog();
        let values = facet_values_of(items.iter().map(|(_, item)| item), "color");
        assert_eq!(values, json!(["red", "blue", "red"]));
    }
}
