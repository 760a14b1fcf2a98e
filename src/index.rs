//! The index contract shared by every engine.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::Result;

/// A search hit: the stored id and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f32,
}

/// Metadata about an index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Number of live vectors.
    pub count: usize,
    /// Dimensionality of the vectors.
    pub dimension: usize,
    /// Name of the distance metric in use.
    pub distance: String,
}

/// Unified interface implemented by all index engines.
///
/// Mutators take `&self`: every engine guards its state with a
/// reader-writer lock, so one shared index can serve concurrent readers and
/// writers. Search results are sorted by ascending distance with ties broken
/// by ascending id, and contain at most `min(k, count)` neighbors.
///
/// Bulk operations are prefix-committed: on the first per-item error the
/// engine may stop, but items already processed remain in the index and all
/// internal invariants hold.
pub trait VectorIndex: Send + Sync {
    /// Insert a vector under a caller-chosen id.
    fn add(&self, id: u64, vector: Vec<f32>) -> Result<()>;

    /// Insert many vectors. Entries are processed in ascending id order.
    fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()>;

    /// Remove a stored vector.
    fn delete(&self, id: u64) -> Result<()>;

    /// Remove many vectors; ids that are not present are skipped silently.
    fn bulk_delete(&self, ids: &[u64]) -> Result<()>;

    /// Replace the vector stored under an existing id.
    fn update(&self, id: u64, vector: Vec<f32>) -> Result<()>;

    /// Replace many stored vectors. Entries are processed in ascending id
    /// order.
    fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()>;

    /// Return the `k` nearest stored neighbors of `query`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Cheap statistics snapshot.
    fn stats(&self) -> IndexStats;

    /// Serialize the full index state to a byte stream.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Replace this index's state with one previously written by
    /// [`VectorIndex::save`].
    fn load(&self, reader: &mut dyn Read) -> Result<()>;
}

/// Sort ascending by distance, ties broken by ascending id.
pub(crate) fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_unstable_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Map keys in ascending order, for deterministic bulk processing.
pub(crate) fn sorted_ids<V>(map: &HashMap<u64, V>) -> Vec<u64> {
    let mut ids: Vec<u64> = map.keys().copied().collect();
    ids.sort_unstable();
    ids
}

impl VectorIndex for crate::hnsw::HnswIndex {
    fn add(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.add(id, vector)
    }

    fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_add(vectors)
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.delete(id)
    }

    fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        self.bulk_delete(ids)
    }

    fn update(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.update(id, vector)
    }

    fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_update(updates)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search(query, k)
    }

    fn stats(&self) -> IndexStats {
        self.stats()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.load(reader)
    }
}

impl VectorIndex for crate::pqivf::PqIvfIndex {
    fn add(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.add(id, vector)
    }

    fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_add(vectors)
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.delete(id)
    }

    fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        self.bulk_delete(ids)
    }

    fn update(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.update(id, vector)
    }

    fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_update(updates)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search(query, k)
    }

    fn stats(&self) -> IndexStats {
        self.stats()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.load(reader)
    }
}

impl VectorIndex for crate::rpt::RptIndex {
    fn add(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.add(id, vector)
    }

    fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_add(vectors)
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.delete(id)
    }

    fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        self.bulk_delete(ids)
    }

    fn update(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.update(id, vector)
    }

    fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        self.bulk_update(updates)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search(query, k)
    }

    fn stats(&self) -> IndexStats {
        self.stats()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.load(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_breaks_distance_ties_by_id() {
        let mut neighbors = vec![
            Neighbor {
                id: 9,
                distance: 0.5,
            },
            Neighbor {
                id: 2,
                distance: 0.5,
            },
            Neighbor {
                id: 7,
                distance: 0.1,
            },
        ];
        sort_neighbors(&mut neighbors);
        let ids: Vec<u64> = neighbors.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![7, 2, 9]);
    }
}
