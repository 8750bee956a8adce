use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec::{pack_i32s, unpack_i32s};
use crate::{CatalogIndex, RecoError};

/// Dense scores aligned to the catalog index space. Scores `<= 0` are never
/// recommended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankingVector {
    scores: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VectorSummary {
    pub length: usize,
    pub min: i32,
    pub max: i32,
    pub records: usize,
    pub resolved: usize,
}

impl RankingVector {
    #[must_use]
    pub fn zeros(length: usize) -> Self {
        Self { scores: vec![0.0; length] }
    }

    #[must_use]
    pub fn from_scores(scores: Vec<f64>) -> Self {
        Self { scores }
    }

    /// Decode a packed `i32` vector and fit it to `length`.
    ///
    /// # Errors
    /// Returns [`RecoError::Malformed`] when the packed bytes are not whole words.
    pub fn from_packed_i32(bytes: &[u8], length: usize) -> Result<Self, RecoError> {
        let mut vector = Self {
            scores: unpack_i32s(bytes)?.into_iter().map(f64::from).collect(),
        };
        vector.resize(length);
        Ok(vector)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    #[must_use]
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Zero-fill or truncate to `length`.
    pub fn resize(&mut self, length: usize) {
        self.scores.resize(length, 0.0);
    }

    /// Keep (inclusive) or drop (exclusive) the positions set in `mask`.
    ///
    /// A mask shorter than the vector counts as `false` past its end.
    pub fn apply_mask(&mut self, mask: &[bool], inclusive: bool) {
        for (position, score) in self.scores.iter_mut().enumerate() {
            let selected = mask.get(position).copied().unwrap_or(false);
            if selected != inclusive {
                *score = 0.0;
            }
        }
    }

    /// Keep (inclusive) or drop (exclusive) the listed positions.
    /// Positions past the end of the vector are ignored.
    pub fn apply_indices(&mut self, indices: &[CatalogIndex], inclusive: bool) {
        let length = self.scores.len();
        let positions = indices
            .iter()
            .filter_map(|index| usize::try_from(*index).ok())
            .filter(|position| *position < length);

        if inclusive {
            let mut mask = vec![false; length];
            for position in positions {
                mask[position] = true;
            }
            self.apply_mask(&mask, true);
        } else {
            for position in positions {
                self.scores[position] = 0.0;
            }
        }
    }

    #[must_use]
    pub fn top_k(&self, k: usize) -> Vec<CatalogIndex> {
        select_top_k(&self.scores, k)
    }
}

/// Positions of the `k` largest positive scores, best first.
///
/// Uses a partial selection over all positions and only sorts the `k`
/// candidates. Ties may come out in either index order.
#[must_use]
pub fn select_top_k(scores: &[f64], k: usize) -> Vec<CatalogIndex> {
    let k = k.min(scores.len());
    if k == 0 {
        return Vec::new();
    }

    let descending = |lhs: &usize, rhs: &usize| {
        scores[*rhs].partial_cmp(&scores[*lhs]).unwrap_or(Ordering::Equal)
    };

    let mut positions = (0..scores.len()).collect::<Vec<_>>();
    if k < positions.len() {
        positions.select_nth_unstable_by(k - 1, descending);
        positions.truncate(k);
    }
    positions.sort_by(descending);

    positions
        .into_iter()
        .filter(|position| scores[*position] > 0.0)
        .filter_map(|position| CatalogIndex::try_from(position).ok())
        .collect()
}

/// Accumulate `(index, value)` pairs into an `i32` vector of `length`.
#[must_use]
pub fn accumulate_i32(length: usize, values: &[(CatalogIndex, i64)]) -> Vec<i32> {
    let mut vector = vec![0_i32; length];
    for (index, value) in values {
        let Ok(position) = usize::try_from(*index) else {
            continue;
        };
        if let Some(slot) = vector.get_mut(position) {
            let sum = i64::from(*slot).saturating_add(*value);
            *slot = i32::try_from(sum).unwrap_or(if sum < 0 { i32::MIN } else { i32::MAX });
        }
    }
    vector
}

/// Pack an accumulated vector for storage.
#[must_use]
pub fn pack_vector(values: &[i32]) -> Vec<u8> {
    pack_i32s(values)
}
