//! Random projection tree (RPT) index.
//!
//! The point store (id to vector) is authoritative; the tree over it is
//! derived and rebuilt lazily. Every mutator just touches the store and
//! marks the tree dirty; the next search rebuilds it under the write lock
//! and downgrades back to shared access before scoring. Search multi-probes
//! both children of a split whenever the query's projection lands within
//! the configured margin of the threshold, widening the margin once when
//! the candidate pool is thin and falling back to an exhaustive scan on
//! starvation.

mod tree;

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::distance::Metric;
use crate::index::{sort_neighbors, sorted_ids, IndexStats, Neighbor};
use crate::runtime::RuntimeConfig;
use crate::vector::{normalize, normalize_batch};
use crate::{persist, IndexError, Result};

/// Construction-time parameters for [`RptIndex`].
#[derive(Debug, Clone)]
pub struct RptConfig {
    /// Vector dimensionality.
    pub dimension: usize,
    /// Maximum number of ids held by a leaf.
    pub leaf_capacity: usize,
    /// Candidate projections tried per split; the least imbalanced wins.
    pub candidate_projections: usize,
    /// Subtree size above which children build on separate workers.
    pub parallel_threshold: usize,
    /// Projection margin within which both children are probed.
    pub probe_margin: f32,
    /// Distance metric.
    pub metric: Metric,
}

impl RptConfig {
    /// Config with the default tree knobs (leaves of 10, 3 candidate
    /// projections, parallel builds above 100 points, margin 0.15).
    #[must_use]
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            leaf_capacity: 10,
            candidate_projections: 3,
            parallel_threshold: 100,
            probe_margin: 0.15,
            metric,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(IndexError::InvalidConfiguration(
                "dimension must be greater than 0".into(),
            ));
        }
        if self.leaf_capacity == 0 {
            return Err(IndexError::InvalidConfiguration(
                "leaf_capacity must be greater than 0".into(),
            ));
        }
        if self.candidate_projections == 0 {
            return Err(IndexError::InvalidConfiguration(
                "candidate_projections must be greater than 0".into(),
            ));
        }
        if !self.probe_margin.is_finite() || self.probe_margin < 0.0 {
            return Err(IndexError::InvalidConfiguration(
                "probe_margin must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

struct RptState {
    config: RptConfig,
    points: HashMap<u64, Vec<f32>>,
    tree: Option<tree::TreeNode>,
    dirty: bool,
}

impl RptState {
    fn rebuild(&mut self, rng: &mut StdRng) {
        debug!(count = self.points.len(), "rebuilding projection tree");
        let mut ids: Vec<u64> = self.points.keys().copied().collect();
        ids.sort_unstable();
        ids.shuffle(rng);
        self.tree = if ids.is_empty() {
            None
        } else {
            let ctx = tree::BuildContext {
                points: &self.points,
                dimension: self.config.dimension,
                leaf_capacity: self.config.leaf_capacity,
                candidate_projections: self.config.candidate_projections,
                parallel_threshold: self.config.parallel_threshold,
            };
            Some(tree::build_tree(ids, &ctx, rng))
        };
        self.dirty = false;
    }
}

/// Score `ids` against the query, chunked `ceil(N / workers)` across the
/// rayon pool.
fn score_candidates(state: &RptState, query: &[f32], ids: &[u64]) -> Vec<Neighbor> {
    if ids.is_empty() {
        return Vec::new();
    }
    let metric = state.config.metric;
    let chunk = ids.len().div_ceil(rayon::current_num_threads()).max(1);
    ids.par_chunks(chunk)
        .flat_map_iter(|chunk| {
            chunk.iter().map(|&id| Neighbor {
                id,
                distance: metric.eval(query, &state.points[&id]),
            })
        })
        .collect()
}

const RPT_MAGIC: [u8; 4] = *b"VCNR";

#[derive(Serialize, Deserialize)]
struct SerializedRpt {
    dimension: usize,
    distance_name: String,
    leaf_capacity: usize,
    candidate_projections: usize,
    parallel_threshold: usize,
    probe_margin: f32,
    /// Only the points persist; the tree is rebuilt after load.
    points: Vec<(u64, Vec<f32>)>,
}

/// Thread-safe random projection tree index.
pub struct RptIndex {
    state: RwLock<RptState>,
    rng: Mutex<StdRng>,
}

impl RptIndex {
    /// Create an empty index.
    pub fn new(config: RptConfig, runtime: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        info!(
            dimension = config.dimension,
            leaf_capacity = config.leaf_capacity,
            probe_margin = config.probe_margin,
            metric = config.metric.name(),
            "creating rpt index"
        );
        let seed = runtime.resolve_seed();
        Ok(Self {
            state: RwLock::new(RptState {
                config,
                points: HashMap::new(),
                tree: None,
                dirty: true,
            }),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Insert a vector under a new id.
    pub fn add(&self, id: u64, mut vector: Vec<f32>) -> Result<()> {
        let mut state = self.state.write();
        if vector.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, vector.len()));
        }
        if state.points.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        state.points.insert(id, vector);
        state.dirty = true;
        Ok(())
    }

    /// Insert many vectors at once.
    pub fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(vectors);
        for &id in &ids {
            let vector = &vectors[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
            if state.points.contains_key(&id) {
                return Err(IndexError::DuplicateId(id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| vectors[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }
        for (id, row) in ids.into_iter().zip(rows) {
            state.points.insert(id, row);
        }
        state.dirty = true;
        Ok(())
    }

    /// Remove a stored vector.
    pub fn delete(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        if state.points.remove(&id).is_none() {
            return Err(IndexError::MissingId(id));
        }
        state.dirty = true;
        Ok(())
    }

    /// Remove many vectors; missing ids are skipped silently.
    pub fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        let mut state = self.state.write();
        for id in ids {
            state.points.remove(id);
        }
        state.dirty = true;
        Ok(())
    }

    /// Replace the vector stored under an existing id.
    pub fn update(&self, id: u64, mut vector: Vec<f32>) -> Result<()> {
        let mut state = self.state.write();
        if vector.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, vector.len()));
        }
        if !state.points.contains_key(&id) {
            return Err(IndexError::MissingId(id));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        state.points.insert(id, vector);
        state.dirty = true;
        Ok(())
    }

    /// Replace many stored vectors.
    pub fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(updates);
        for &id in &ids {
            let vector = &updates[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
            if !state.points.contains_key(&id) {
                return Err(IndexError::MissingId(id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| updates[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }
        for (id, row) in ids.into_iter().zip(rows) {
            state.points.insert(id, row);
        }
        state.dirty = true;
        Ok(())
    }

    /// Find the `k` nearest neighbors of `query`, rebuilding the tree
    /// first if any mutation happened since the last build.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let mut guard = self.state.read();
        if query.len() != guard.config.dimension {
            return Err(IndexError::dimension(guard.config.dimension, query.len()));
        }
        if guard.points.is_empty() {
            return Err(IndexError::EmptyIndex);
        }

        let mut query = query.to_vec();
        if guard.config.metric.normalizes_ingress() {
            normalize(&mut query);
        }

        if guard.dirty {
            drop(guard);
            let mut writer = self.state.write();
            if writer.dirty {
                let mut rng = self.rng.lock();
                writer.rebuild(&mut rng);
            }
            guard = RwLockWriteGuard::downgrade(writer);
            // The store may have drained while the lock was released.
            if guard.points.is_empty() {
                return Err(IndexError::EmptyIndex);
            }
        }
        let state = &*guard;
        let Some(tree) = state.tree.as_ref() else {
            return Err(IndexError::EmptyIndex);
        };

        let margin = state.config.probe_margin;
        let mut candidates: Vec<u64> = Vec::new();
        tree::probe(tree, &query, margin, &mut candidates);
        if candidates.len() < 2 * k {
            let mut wider = Vec::new();
            tree::probe(tree, &query, margin * 2.0, &mut wider);
            let mut seen: HashSet<u64> = candidates.iter().copied().collect();
            for id in wider {
                if seen.insert(id) {
                    candidates.push(id);
                }
            }
        }

        let mut neighbors = score_candidates(state, &query, &candidates);
        if neighbors.len() < k {
            let considered: HashSet<u64> = candidates.iter().copied().collect();
            let mut missing: Vec<u64> = state
                .points
                .keys()
                .filter(|id| !considered.contains(id))
                .copied()
                .collect();
            missing.sort_unstable();
            neighbors.extend(score_candidates(state, &query, &missing));
        }
        sort_neighbors(&mut neighbors);
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Cheap statistics snapshot.
    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            count: state.points.len(),
            dimension: state.config.dimension,
            distance: state.config.metric.name().to_string(),
        }
    }

    /// Serialize the point store and configuration to a byte stream. The
    /// tree itself is derived state and is not persisted.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let state = self.state.read();
        let mut points: Vec<(u64, Vec<f32>)> = state
            .points
            .iter()
            .map(|(&id, v)| (id, v.clone()))
            .collect();
        points.sort_unstable_by_key(|(id, _)| *id);

        let serialized = SerializedRpt {
            dimension: state.config.dimension,
            distance_name: state.config.metric.name().to_string(),
            leaf_capacity: state.config.leaf_capacity,
            candidate_projections: state.config.candidate_projections,
            parallel_threshold: state.config.parallel_threshold,
            probe_margin: state.config.probe_margin,
            points,
        };
        persist::write_header(writer, &RPT_MAGIC)?;
        persist::encode(writer, &serialized)?;
        info!(count = serialized.points.len(), "rpt index saved");
        Ok(())
    }

    /// Replace this index's state with one previously written by
    /// [`RptIndex::save`]. The tree is rebuilt lazily on the next search.
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        persist::read_header(reader, &RPT_MAGIC)?;
        let serialized: SerializedRpt = persist::decode(reader)?;
        let metric = persist::metric_from_name(&serialized.distance_name)?;

        let config = RptConfig {
            dimension: serialized.dimension,
            leaf_capacity: serialized.leaf_capacity,
            candidate_projections: serialized.candidate_projections,
            parallel_threshold: serialized.parallel_threshold,
            probe_margin: serialized.probe_margin,
            metric,
        };
        config.validate()?;

        let state = RptState {
            config,
            points: serialized.points.into_iter().collect(),
            tree: None,
            dirty: true,
        };
        let count = state.points.len();
        *self.state.write() = state;
        info!(count, "rpt index loaded");
        Ok(())
    }

    /// Save to a file, layered over [`RptIndex::save`].
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    /// Load from a file, layered over [`RptIndex::load`].
    pub fn load_from_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        self.load(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(dimension: usize) -> RptIndex {
        RptIndex::new(
            RptConfig::new(dimension, Metric::Euclidean),
            RuntimeConfig::with_seed(17),
        )
        .unwrap()
    }

    fn scatter(n: usize, dimension: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                (0..dimension)
                    .map(|d| ((i * 11 + d * 3) as f32 * 0.47).sin() * 2.0)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn search_finds_exact_match() {
        let index = index(6);
        for (i, v) in scatter(40, 6).into_iter().enumerate() {
            index.add(i as u64, v).unwrap();
        }
        index.add(99, vec![5.0, 5.0, 5.0, 5.0, 5.0, 5.0]).unwrap();

        let hits = index.search(&[5.0, 5.0, 5.0, 5.0, 5.0, 5.0], 3).unwrap();
        assert_eq!(hits[0].id, 99);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn rebuild_partitions_every_point_once() {
        let index = index(6);
        for (i, v) in scatter(64, 6).into_iter().enumerate() {
            index.add(i as u64, v).unwrap();
        }
        // Force a rebuild through search, then inspect leaves.
        index.search(&[0.0; 6], 1).unwrap();

        let state = index.state.read();
        assert!(!state.dirty);
        let mut leaves = Vec::new();
        tree::collect_leaves(state.tree.as_ref().unwrap(), &mut leaves);
        let mut seen: Vec<u64> = leaves.iter().flat_map(|l| l.iter().copied()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<u64>>());
        for leaf in leaves {
            assert!(leaf.len() <= state.config.leaf_capacity);
        }
    }

    #[test]
    fn mutators_mark_dirty_and_search_rebuilds() {
        let index = index(3);
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert!(!index.state.read().dirty);

        index.add(2, vec![0.0, 1.0, 0.0]).unwrap();
        assert!(index.state.read().dirty);

        let hits = index.search(&[0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 2);
        assert!(!index.state.read().dirty);
    }

    #[test]
    fn starving_probe_falls_back_to_full_scan() {
        // One far outlier: probing near the cluster must still surface it
        // when k exceeds the candidate pool.
        let index = index(2);
        for i in 0..12u64 {
            index.add(i, vec![i as f32 * 0.01, 0.0]).unwrap();
        }
        index.add(100, vec![50.0, 50.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 13).unwrap();
        assert_eq!(hits.len(), 13);
        assert_eq!(hits.last().unwrap().id, 100);
    }

    #[test]
    fn missing_and_duplicate_ids_are_rejected() {
        let index = index(2);
        index.add(1, vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            index.add(1, vec![0.0, 1.0]),
            Err(IndexError::DuplicateId(1))
        ));
        assert!(matches!(
            index.update(5, vec![0.0, 1.0]),
            Err(IndexError::MissingId(5))
        ));
        assert!(matches!(index.delete(5), Err(IndexError::MissingId(5))));
    }

    #[test]
    fn cosine_ingress_normalizes_points() {
        let index = RptIndex::new(
            RptConfig::new(3, Metric::Cosine),
            RuntimeConfig::with_seed(17),
        )
        .unwrap();
        index.add(1, vec![0.0, 3.0, 4.0]).unwrap();
        let state = index.state.read();
        let stored = &state.points[&1];
        let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
