//! Stable catalog index allocation.
//!
//! Planning is pure: given the stored forward map, the stored length counter
//! and the current catalog key set, [`plan_reconcile`] decides which keys are
//! retired, which indices they free, and which index every new key receives.
//! Persisting the plan is the caller's job.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{CatalogIndex, ItemKey, RecoError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub total_items: usize,
    pub max_index: Option<CatalogIndex>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReconcilePlan {
    /// New keys with the index each one receives, in ascending key order.
    pub assigned: Vec<(ItemKey, CatalogIndex)>,
    /// Retired keys with the index they held.
    pub removed: Vec<(ItemKey, CatalogIndex)>,
    /// Indices freed by retired keys that no new key took over.
    pub freed: Vec<CatalogIndex>,
    /// `max(live index) + 1`, or 0 for an empty catalog.
    pub length: CatalogIndex,
    pub total_items: usize,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.assigned.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> ReconcileSummary {
        ReconcileSummary { total_items: self.total_items, max_index: self.length.checked_sub(1) }
    }
}

/// Compute the allocation changes that bring `known` in line with `current`.
///
/// Reuse pool: every index below the previous length that is not held by a
/// remaining key, in ascending order. Freshly retired indices are part of it.
/// Once the pool is drained, new indices continue upward from the previous
/// length. Running the plan twice against the same key set is a no-op.
///
/// # Errors
/// Returns [`RecoError::Malformed`] when two stored keys share one index, and
/// [`RecoError::Config`] when the index space would overflow.
pub fn plan_reconcile(
    known: &BTreeMap<ItemKey, CatalogIndex>,
    previous_length: CatalogIndex,
    current: &BTreeSet<ItemKey>,
) -> Result<ReconcilePlan, RecoError> {
    let mut held: BTreeMap<CatalogIndex, &ItemKey> = BTreeMap::new();
    for (key, index) in known {
        if let Some(other) = held.insert(*index, key) {
            return Err(RecoError::Malformed(format!(
                "catalog index {index} is assigned to both {other} and {key}"
            )));
        }
    }

    let removed = known
        .iter()
        .filter(|(key, _)| !current.contains(*key))
        .map(|(key, index)| (key.clone(), *index))
        .collect::<Vec<_>>();
    let removed_indices = removed.iter().map(|(_, index)| *index).collect::<BTreeSet<_>>();

    let scan_end = held
        .keys()
        .next_back()
        .map_or(previous_length, |max| previous_length.max(max.saturating_add(1)));
    let mut pool = (0..scan_end)
        .filter(|index| match held.get(index) {
            None => true,
            Some(_) => removed_indices.contains(index),
        })
        .collect::<Vec<_>>()
        .into_iter();

    let mut counter = scan_end;
    let mut assigned = Vec::new();
    for key in current.iter().filter(|key| !known.contains_key(*key)) {
        let index = if let Some(index) = pool.next() {
            index
        } else {
            let index = counter;
            counter = counter.checked_add(1).ok_or_else(|| {
                RecoError::Config("catalog index space exhausted".to_string())
            })?;
            index
        };
        assigned.push((key.clone(), index));
    }

    let reused = assigned.iter().map(|(_, index)| *index).collect::<BTreeSet<_>>();
    let freed = removed_indices.iter().copied().filter(|index| !reused.contains(index)).collect();

    let max_live = held
        .keys()
        .copied()
        .filter(|index| !removed_indices.contains(index))
        .chain(reused.iter().copied())
        .max();
    let length = match max_live {
        Some(max) => max
            .checked_add(1)
            .ok_or_else(|| RecoError::Config("catalog index space exhausted".to_string()))?,
        None => 0,
    };

    Ok(ReconcilePlan {
        assigned,
        removed,
        freed,
        length,
        total_items: current.len(),
    })
}
