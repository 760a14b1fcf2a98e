//! Product Quantization Inverted File (PQ-IVF) index.
//!
//! Two-stage quantization: an online coarse clustering routes each vector
//! to one of up to `coarse_k` centroids (created lazily, then maintained by
//! running mean), and an explicit training pass product-quantizes the
//! residuals into per-subspace codebooks. Search probes the inverted lists
//! of the nearest coarse cells and scores candidates against vectors
//! reconstructed from their codes; entries without codes (pre-training)
//! fall back to their original vectors, so an untrained index degrades
//! gracefully instead of failing.

mod kmeans;

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::distance::Metric;
use crate::index::{sort_neighbors, sorted_ids, IndexStats, Neighbor};
use crate::runtime::RuntimeConfig;
use crate::vector::{normalize, normalize_batch};
use crate::{persist, IndexError, Result};

/// Construction-time parameters for [`PqIvfIndex`].
#[derive(Debug, Clone)]
pub struct PqIvfConfig {
    /// Vector dimensionality. Must be divisible by `num_subquantizers`.
    pub dimension: usize,
    /// Maximum number of coarse clusters.
    pub coarse_k: usize,
    /// Number of disjoint subspaces for product quantization.
    pub num_subquantizers: usize,
    /// Codewords per subspace, typically 256. Capped at 65 536 because
    /// codes are stored as `u16`.
    pub pq_k: usize,
    /// Lloyd iterations per subspace during training.
    pub kmeans_iters: usize,
    /// Inverted lists probed per query before widening.
    pub num_candidate_clusters: usize,
    /// Distance metric.
    pub metric: Metric,
}

impl PqIvfConfig {
    /// Config with the given knobs and the default probe width of 3.
    #[must_use]
    pub fn new(
        dimension: usize,
        coarse_k: usize,
        num_subquantizers: usize,
        pq_k: usize,
        kmeans_iters: usize,
        metric: Metric,
    ) -> Self {
        Self {
            dimension,
            coarse_k,
            num_subquantizers,
            pq_k,
            kmeans_iters,
            num_candidate_clusters: 3,
            metric,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(IndexError::InvalidConfiguration(
                "dimension must be greater than 0".into(),
            ));
        }
        if self.coarse_k == 0 {
            return Err(IndexError::InvalidConfiguration(
                "coarse_k must be greater than 0".into(),
            ));
        }
        if self.num_subquantizers == 0 {
            return Err(IndexError::InvalidConfiguration(
                "num_subquantizers must be greater than 0".into(),
            ));
        }
        if self.dimension % self.num_subquantizers != 0 {
            return Err(IndexError::InvalidConfiguration(format!(
                "dimension {} is not divisible by num_subquantizers {}",
                self.dimension, self.num_subquantizers
            )));
        }
        if self.pq_k == 0 || self.pq_k > usize::from(u16::MAX) + 1 {
            return Err(IndexError::InvalidConfiguration(
                "pq_k must be in 1..=65536".into(),
            ));
        }
        if self.num_candidate_clusters == 0 {
            return Err(IndexError::InvalidConfiguration(
                "num_candidate_clusters must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// One stored vector in an inverted list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PqEntry {
    id: u64,
    vector: Vec<f32>,
    /// One codebook index per subquantizer; `None` before training.
    codes: Option<Vec<u16>>,
    cluster: usize,
}

/// Residual of `vector` against `centroid`, split implicitly into
/// subspaces by the encoder.
fn residual(vector: &[f32], centroid: &[f32]) -> Vec<f32> {
    vector.iter().zip(centroid).map(|(v, c)| v - c).collect()
}

/// Quantize a vector's residual into one codeword index per subspace.
fn encode_codes(vector: &[f32], centroid: &[f32], codebooks: &[Vec<Vec<f32>>]) -> Vec<u16> {
    let m = codebooks.len();
    let sub_dim = vector.len() / m;
    let residual = residual(vector, centroid);
    (0..m)
        .map(|i| {
            let sub = &residual[i * sub_dim..(i + 1) * sub_dim];
            kmeans::nearest_codeword(sub, &codebooks[i]) as u16
        })
        .collect()
}

/// Rebuild the approximate vector `centroid + (codeword_0 || codeword_1 ||
/// ...)`. Returns `None` when a code is out of range for its codebook.
fn reconstruct(centroid: &[f32], codes: &[u16], codebooks: &[Vec<Vec<f32>>]) -> Option<Vec<f32>> {
    if codes.len() != codebooks.len() {
        return None;
    }
    let mut approx: Vec<f32> = Vec::with_capacity(centroid.len());
    for (codebook, &code) in codebooks.iter().zip(codes) {
        approx.extend_from_slice(codebook.get(code as usize)?);
    }
    if approx.len() != centroid.len() {
        return None;
    }
    for (a, c) in approx.iter_mut().zip(centroid) {
        *a += c;
    }
    Some(approx)
}

#[derive(Debug)]
struct PqIvfState {
    config: PqIvfConfig,
    coarse_centroids: Vec<Vec<f32>>,
    cluster_counts: Vec<usize>,
    inverted_lists: Vec<Vec<PqEntry>>,
    /// One codebook per subspace once `train` has run.
    codebooks: Option<Vec<Vec<Vec<f32>>>>,
    id_to_cluster: HashMap<u64, usize>,
}

impl PqIvfState {
    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        let metric = self.config.metric;
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (i, centroid) in self.coarse_centroids.iter().enumerate() {
            let d = metric.eval(vector, centroid);
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    /// Route a validated, ingress-normalized vector to a coarse cluster,
    /// maintaining the centroid by running mean. Returns the cluster index.
    fn insert_entry(&mut self, id: u64, vector: Vec<f32>) -> usize {
        let cluster = if self.coarse_centroids.len() < self.config.coarse_k {
            let cluster = self.coarse_centroids.len();
            self.coarse_centroids.push(vector.clone());
            self.cluster_counts.push(0);
            self.inverted_lists.push(Vec::new());
            cluster
        } else {
            let cluster = self.nearest_centroid(&vector);
            let n = self.cluster_counts[cluster] as f32;
            for (c, v) in self.coarse_centroids[cluster].iter_mut().zip(&vector) {
                *c = (*c * n + v) / (n + 1.0);
            }
            cluster
        };
        self.cluster_counts[cluster] += 1;

        let codes = self
            .codebooks
            .as_ref()
            .map(|cb| encode_codes(&vector, &self.coarse_centroids[cluster], cb));
        self.inverted_lists[cluster].push(PqEntry {
            id,
            vector,
            codes,
            cluster,
        });
        self.id_to_cluster.insert(id, cluster);
        cluster
    }

    /// Remove the entry for `id` from its inverted list. Returns the
    /// cluster it lived in.
    fn remove_entry(&mut self, id: u64) -> Result<usize> {
        let cluster = self
            .id_to_cluster
            .remove(&id)
            .ok_or(IndexError::MissingId(id))?;
        let list = &mut self.inverted_lists[cluster];
        if let Some(pos) = list.iter().position(|e| e.id == id) {
            list.remove(pos);
            self.cluster_counts[cluster] -= 1;
        }
        Ok(cluster)
    }

    /// Replace each affected cluster's centroid with the true arithmetic
    /// mean of its current members. Tighter than the online running mean;
    /// run after every bulk operation. Empty clusters keep their centroid.
    fn recompute_centroids(&mut self, affected: &BTreeSet<usize>) {
        for &cluster in affected {
            let list = &self.inverted_lists[cluster];
            if list.is_empty() {
                continue;
            }
            let mut mean = vec![0.0f32; self.config.dimension];
            for entry in list {
                for (m, v) in mean.iter_mut().zip(&entry.vector) {
                    *m += v;
                }
            }
            let count = list.len() as f32;
            for m in &mut mean {
                *m /= count;
            }
            self.coarse_centroids[cluster] = mean;
        }
    }

    fn count(&self) -> usize {
        self.id_to_cluster.len()
    }
}

const PQIVF_MAGIC: [u8; 4] = *b"VCNP";

#[derive(Serialize, Deserialize)]
struct SerializedPqIvf {
    dimension: usize,
    coarse_k: usize,
    num_subquantizers: usize,
    pq_k: usize,
    kmeans_iters: usize,
    num_candidate_clusters: usize,
    distance_name: String,
    coarse_centroids: Vec<Vec<f32>>,
    cluster_counts: Vec<usize>,
    inverted_lists: Vec<Vec<PqEntry>>,
    codebooks: Option<Vec<Vec<Vec<f32>>>>,
}

/// Thread-safe PQ-IVF index. Readers run in parallel; mutators and
/// training are exclusive.
#[derive(Debug)]
pub struct PqIvfIndex {
    state: RwLock<PqIvfState>,
    rng: Mutex<StdRng>,
}

impl PqIvfIndex {
    /// Create an empty index.
    pub fn new(config: PqIvfConfig, runtime: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        info!(
            dimension = config.dimension,
            coarse_k = config.coarse_k,
            num_subquantizers = config.num_subquantizers,
            pq_k = config.pq_k,
            metric = config.metric.name(),
            "creating pqivf index"
        );
        let seed = runtime.resolve_seed();
        Ok(Self {
            state: RwLock::new(PqIvfState {
                config,
                coarse_centroids: Vec::new(),
                cluster_counts: Vec::new(),
                inverted_lists: Vec::new(),
                codebooks: None,
                id_to_cluster: HashMap::new(),
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
        if state.id_to_cluster.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        state.insert_entry(id, vector);
        Ok(())
    }

    /// Insert many vectors, then recompute the affected centroids as true
    /// means of their members.
    pub fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(vectors);
        for &id in &ids {
            let vector = &vectors[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
            if state.id_to_cluster.contains_key(&id) {
                return Err(IndexError::DuplicateId(id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| vectors[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }

        let mut affected = BTreeSet::new();
        for (id, row) in ids.into_iter().zip(rows) {
            affected.insert(state.insert_entry(id, row));
        }
        state.recompute_centroids(&affected);
        Ok(())
    }

    /// Remove a stored vector.
    pub fn delete(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        state.remove_entry(id)?;
        Ok(())
    }

    /// Remove many vectors; missing ids are skipped silently. Affected
    /// centroids are recomputed afterwards.
    pub fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        let mut state = self.state.write();
        let mut affected = BTreeSet::new();
        for &id in ids {
            if let Ok(cluster) = state.remove_entry(id) {
                affected.insert(cluster);
            }
        }
        state.recompute_centroids(&affected);
        Ok(())
    }

    /// Replace the vector stored under `id`. The replacement may route to a
    /// different coarse cluster.
    pub fn update(&self, id: u64, mut vector: Vec<f32>) -> Result<()> {
        let mut state = self.state.write();
        if !state.id_to_cluster.contains_key(&id) {
            return Err(IndexError::MissingId(id));
        }
        if vector.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, vector.len()));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        state.remove_entry(id)?;
        state.insert_entry(id, vector);
        Ok(())
    }

    /// Replace many stored vectors, then recompute the affected centroids.
    pub fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(updates);
        for &id in &ids {
            if !state.id_to_cluster.contains_key(&id) {
                return Err(IndexError::MissingId(id));
            }
            let vector = &updates[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| updates[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }

        let mut affected = BTreeSet::new();
        for (id, row) in ids.into_iter().zip(rows) {
            affected.insert(state.remove_entry(id)?);
            affected.insert(state.insert_entry(id, row));
        }
        state.recompute_centroids(&affected);
        Ok(())
    }

    /// Train the per-subspace codebooks on the residuals of every stored
    /// vector, then (re-)encode all entries. Newly added vectors are
    /// encoded against these codebooks from then on.
    pub fn train(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.id_to_cluster.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        let m = state.config.num_subquantizers;
        let sub_dim = state.config.dimension / m;

        let mut data_per_sub: Vec<Vec<Vec<f32>>> = vec![Vec::new(); m];
        for (cluster, entries) in state.inverted_lists.iter().enumerate() {
            let centroid = &state.coarse_centroids[cluster];
            for entry in entries {
                let residual = residual(&entry.vector, centroid);
                for (i, chunk) in residual.chunks_exact(sub_dim).enumerate() {
                    data_per_sub[i].push(chunk.to_vec());
                }
            }
        }

        let pq_k = state.config.pq_k;
        let iterations = state.config.kmeans_iters;
        let codebooks: Vec<Vec<Vec<f32>>> = {
            let mut rng = self.rng.lock();
            data_per_sub
                .iter()
                .map(|data| kmeans::train_subquantizer(data, pq_k, iterations, &mut rng))
                .collect()
        };

        for cluster in 0..state.inverted_lists.len() {
            let centroid = state.coarse_centroids[cluster].clone();
            for entry in &mut state.inverted_lists[cluster] {
                entry.codes = Some(encode_codes(&entry.vector, &centroid, &codebooks));
            }
        }
        state.codebooks = Some(codebooks);
        info!(
            subquantizers = m,
            codewords = pq_k,
            "product quantization codebooks trained"
        );
        Ok(())
    }

    /// Find the `k` nearest neighbors of `query`.
    ///
    /// Probes the inverted lists of the closest coarse cells, widening
    /// cluster by cluster while the candidate pool holds fewer than `k`
    /// entries.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let state = self.state.read();
        if query.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, query.len()));
        }
        if state.id_to_cluster.is_empty() {
            return Err(IndexError::EmptyIndex);
        }

        let mut query = query.to_vec();
        if state.config.metric.normalizes_ingress() {
            normalize(&mut query);
        }
        let metric = state.config.metric;

        let mut ranked: Vec<(usize, f32)> = state
            .coarse_centroids
            .iter()
            .enumerate()
            .map(|(i, centroid)| (i, metric.eval(&query, centroid)))
            .collect();
        ranked.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut probe = state.config.num_candidate_clusters.min(ranked.len());
        let mut pooled: usize = ranked[..probe]
            .iter()
            .map(|&(c, _)| state.inverted_lists[c].len())
            .sum();
        while pooled < k && probe < ranked.len() {
            pooled += state.inverted_lists[ranked[probe].0].len();
            probe += 1;
        }

        let mut results: Vec<Neighbor> = Vec::with_capacity(pooled);
        for &(cluster, _) in &ranked[..probe] {
            let centroid = &state.coarse_centroids[cluster];
            for entry in &state.inverted_lists[cluster] {
                let distance = match (&state.codebooks, &entry.codes) {
                    (Some(codebooks), Some(codes)) => {
                        match reconstruct(centroid, codes, codebooks) {
                            Some(approx) => metric.eval(&query, &approx),
                            None => metric.eval(&query, &entry.vector),
                        }
                    }
                    _ => metric.eval(&query, &entry.vector),
                };
                results.push(Neighbor {
                    id: entry.id,
                    distance,
                });
            }
        }
        sort_neighbors(&mut results);
        results.truncate(k);
        Ok(results)
    }

    /// Cheap statistics snapshot.
    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            count: state.count(),
            dimension: state.config.dimension,
            distance: state.config.metric.name().to_string(),
        }
    }

    /// Serialize the full index state to a byte stream.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let state = self.state.read();
        let serialized = SerializedPqIvf {
            dimension: state.config.dimension,
            coarse_k: state.config.coarse_k,
            num_subquantizers: state.config.num_subquantizers,
            pq_k: state.config.pq_k,
            kmeans_iters: state.config.kmeans_iters,
            num_candidate_clusters: state.config.num_candidate_clusters,
            distance_name: state.config.metric.name().to_string(),
            coarse_centroids: state.coarse_centroids.clone(),
            cluster_counts: state.cluster_counts.clone(),
            inverted_lists: state.inverted_lists.clone(),
            codebooks: state.codebooks.clone(),
        };
        persist::write_header(writer, &PQIVF_MAGIC)?;
        persist::encode(writer, &serialized)?;
        info!(count = state.count(), "pqivf index saved");
        Ok(())
    }

    /// Replace this index's state with one previously written by
    /// [`PqIvfIndex::save`]. The id-to-cluster map is reconstructed.
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        persist::read_header(reader, &PQIVF_MAGIC)?;
        let serialized: SerializedPqIvf = persist::decode(reader)?;
        let metric = persist::metric_from_name(&serialized.distance_name)?;

        let config = PqIvfConfig {
            dimension: serialized.dimension,
            coarse_k: serialized.coarse_k,
            num_subquantizers: serialized.num_subquantizers,
            pq_k: serialized.pq_k,
            kmeans_iters: serialized.kmeans_iters,
            num_candidate_clusters: serialized.num_candidate_clusters,
            metric,
        };
        config.validate()?;

        let mut id_to_cluster = HashMap::new();
        for (cluster, entries) in serialized.inverted_lists.iter().enumerate() {
            for entry in entries {
                id_to_cluster.insert(entry.id, cluster);
            }
        }

        let state = PqIvfState {
            config,
            coarse_centroids: serialized.coarse_centroids,
            cluster_counts: serialized.cluster_counts,
            inverted_lists: serialized.inverted_lists,
            codebooks: serialized.codebooks,
            id_to_cluster,
        };
        let count = state.count();
        *self.state.write() = state;
        info!(count, "pqivf index loaded");
        Ok(())
    }

    /// Save to a file, layered over [`PqIvfIndex::save`].
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    /// Load from a file, layered over [`PqIvfIndex::load`].
    pub fn load_from_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        self.load(&mut reader)
    }
}
