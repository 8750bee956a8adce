//! Proportional cross-slot interleaving.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "mode", content = "seed")]
pub enum Distribution {
    /// Random start offsets and collision order, reproducible from the seed.
    Random(u64),
    /// Offset 0 for every list and slot order at shared positions.
    Fixed,
}

/// Spread every list across the combined length in proportion to its size.
///
/// With `T` the total number of items, a list of length `L` is placed at
/// positions `o, o + step, o + 2*step, ...` where `step = T / L` and
/// `0 <= o < step`. Items sharing a position are emitted in random order
/// (or list order under [`Distribution::Fixed`]). Each list keeps its own
/// relative order.
#[must_use]
pub fn distribute<T: Clone>(lists: &[Vec<T>], mode: Distribution) -> Vec<T> {
    let total = lists.iter().map(Vec::len).sum::<usize>();
    if total == 0 {
        return Vec::new();
    }

    let mut rng = match mode {
        Distribution::Random(seed) => Some(StdRng::seed_from_u64(seed)),
        Distribution::Fixed => None,
    };

    let mut placed: Vec<(usize, &T)> = Vec::with_capacity(total);
    for list in lists.iter().filter(|list| !list.is_empty()) {
        let step = total / list.len();
        let offset = match rng.as_mut() {
            Some(rng) => rng.gen_range(0..step),
            None => 0,
        };
        placed.extend(list.iter().enumerate().map(|(i, item)| (offset + i * step, item)));
    }

    if let Some(rng) = rng.as_mut() {
        placed.shuffle(rng);
    }
    placed.sort_by_key(|(position, _)| *position);

    placed.into_iter().map(|(_, item)| item.clone()).collect()
}
