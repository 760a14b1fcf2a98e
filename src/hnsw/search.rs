//! Beam search and fallback scanning over the HNSW graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use ordered_float::OrderedFloat;
use rayon::prelude::*;

use super::HnswState;

/// A node scored against a query.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scored {
    pub(crate) slot: u32,
    pub(crate) id: u64,
    pub(crate) distance: f32,
}

/// Min-heap entry: pops the smallest distance first, ties by smallest id.
struct MinEntry(Scored);

impl PartialEq for MinEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for MinEntry {}
impl Ord for MinEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .distance
            .total_cmp(&self.0.distance)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}
impl PartialOrd for MinEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry: pops the largest distance first, ties by largest id.
struct MaxEntry(Scored);

impl PartialEq for MaxEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for MaxEntry {}
impl Ord for MaxEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}
impl PartialOrd for MaxEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort ascending by distance, ties by ascending id.
pub(crate) fn sort_scored(scored: &mut [Scored]) {
    scored.sort_unstable_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Greedy descent from `current` through `top..=bottom`, moving to the
/// closest strictly improving neighbor at each level. No edges are touched.
pub(crate) fn greedy_descend(
    state: &HnswState,
    query: &[f32],
    mut current: u32,
    top: usize,
    bottom: usize,
) -> u32 {
    if top < bottom {
        return current;
    }
    let metric = state.config.metric;
    let mut cur_dist = metric.eval(query, &state.node(current).vector);
    for level in (bottom..=top).rev() {
        loop {
            let mut best = (current, cur_dist);
            let neighbors = state
                .node(current)
                .links
                .get(level)
                .map(|l| l.as_slice())
                .unwrap_or(&[]);
            for &nb in neighbors {
                let d = metric.eval(query, &state.node(nb).vector);
                if d < best.1 {
                    best = (nb, d);
                }
            }
            if best.0 == current {
                break;
            }
            current = best.0;
            cur_dist = best.1;
        }
    }
    current
}

/// Bounded best-first beam over one layer.
///
/// Maintains a min-heap of candidates to expand and a max-heap of the `ef`
/// best results so far; stops when the best unexpanded candidate cannot
/// improve a full result set (unless `exhaustive` disables the early exit).
/// Results come back sorted ascending with id tie-breaks.
pub(crate) fn search_layer(
    state: &HnswState,
    query: &[f32],
    entry: u32,
    level: usize,
    ef: usize,
    exhaustive: bool,
) -> Vec<Scored> {
    let metric = state.config.metric;
    let entry_node = state.node(entry);
    let first = Scored {
        slot: entry,
        id: entry_node.id,
        distance: metric.eval(query, &entry_node.vector),
    };

    let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 2);
    visited.insert(entry);
    let mut candidates: BinaryHeap<MinEntry> = BinaryHeap::with_capacity(ef * 2);
    candidates.push(MinEntry(first));
    let mut results: BinaryHeap<MaxEntry> = BinaryHeap::with_capacity(ef + 1);
    results.push(MaxEntry(first));

    while let Some(MinEntry(current)) = candidates.pop() {
        let worst = results
            .peek()
            .map(|e| e.0.distance)
            .unwrap_or(f32::INFINITY);
        if current.distance > worst && results.len() >= ef && !exhaustive {
            break;
        }

        let neighbors = state
            .node(current.slot)
            .links
            .get(level)
            .map(|l| l.as_slice())
            .unwrap_or(&[]);
        for &nb in neighbors {
            if !visited.insert(nb) {
                continue;
            }
            let node = state.node(nb);
            let d = metric.eval(query, &node.vector);
            let worst = results
                .peek()
                .map(|e| e.0.distance)
                .unwrap_or(f32::INFINITY);
            if results.len() < ef || d < worst {
                let scored = Scored {
                    slot: nb,
                    id: node.id,
                    distance: d,
                };
                candidates.push(MinEntry(scored));
                results.push(MaxEntry(scored));
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut out: Vec<Scored> = results.into_iter().map(|e| e.0).collect();
    sort_scored(&mut out);
    out
}

/// Score every live node outside `pool` against the query and return the
/// `need` closest. Work is chunked `ceil(N / workers)` across the rayon
/// pool; each worker keeps a bounded max-heap that is merged at the end.
pub(crate) fn fallback_scan(
    state: &HnswState,
    query: &[f32],
    pool: &[Scored],
    need: usize,
) -> Vec<Scored> {
    if need == 0 {
        return Vec::new();
    }
    let seen: HashSet<u32> = pool.iter().map(|c| c.slot).collect();
    let mut rest: Vec<u32> = (0..state.slots.len() as u32)
        .filter(|&slot| state.slots[slot as usize].is_some() && !seen.contains(&slot))
        .collect();
    if rest.is_empty() {
        return Vec::new();
    }
    rest.sort_unstable_by_key(|&slot| state.node(slot).id);

    let metric = state.config.metric;
    let chunk = rest.len().div_ceil(rayon::current_num_threads()).max(1);
    let merged = rest
        .par_chunks(chunk)
        .map(|chunk| {
            let mut heap: BinaryHeap<(OrderedFloat<f32>, u64, u32)> =
                BinaryHeap::with_capacity(need + 1);
            for &slot in chunk {
                let node = state.node(slot);
                let d = metric.eval(query, &node.vector);
                heap.push((OrderedFloat(d), node.id, slot));
                if heap.len() > need {
                    heap.pop();
                }
            }
            heap
        })
        .reduce(BinaryHeap::new, |mut merged, partial| {
            for entry in partial {
                merged.push(entry);
                if merged.len() > need {
                    merged.pop();
                }
            }
            merged
        });

    merged
        .into_iter()
        .map(|(d, id, slot)| Scored {
            slot,
            id,
            distance: d.into_inner(),
        })
        .collect()
}
