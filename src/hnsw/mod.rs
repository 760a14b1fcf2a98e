//! Hierarchical Navigable Small World (HNSW) index.
//!
//! A multi-layer proximity graph: level 0 holds every node, higher levels
//! hold an exponentially thinning subset, and search greedily descends from
//! the single entry point before running a bounded best-first beam on the
//! base layer. Insertion wires bidirectional links and trims any neighbor
//! list that grows past the degree cap `M`.
//!
//! Nodes live in an arena of tombstoned slots keyed by a monotone handle,
//! so deletion never invalidates handles held elsewhere in the graph; the
//! reverse adjacency kept per level makes unlinking a deleted node cheap.

mod search;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::info;

use crate::distance::Metric;
use crate::index::{sort_neighbors, sorted_ids, IndexStats, Neighbor};
use crate::runtime::RuntimeConfig;
use crate::vector::{normalize, normalize_batch};
use crate::{persist, IndexError, Result};

/// Upper bound for a node's level.
const MAX_LEVEL_CAP: usize = 32;

/// Construction-time parameters for [`HnswIndex`].
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Vector dimensionality.
    pub dimension: usize,
    /// Degree cap per level; also the base of the level distribution.
    /// Typical values are 5..=48.
    pub m: usize,
    /// Beam width for insertion and search. Typical values are 10..=200.
    pub ef: usize,
    /// Distance metric.
    pub metric: Metric,
    /// Disable the beam's early exit, trading latency for recall.
    pub exhaustive_search: bool,
}

impl HnswConfig {
    /// Config with the given knobs and the early exit enabled.
    #[must_use]
    pub fn new(dimension: usize, m: usize, ef: usize, metric: Metric) -> Self {
        Self {
            dimension,
            m,
            ef,
            metric,
            exhaustive_search: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(IndexError::InvalidConfiguration(
                "dimension must be greater than 0".into(),
            ));
        }
        if self.m < 2 {
            return Err(IndexError::InvalidConfiguration(
                "M must be at least 2".into(),
            ));
        }
        if self.ef < 1 {
            return Err(IndexError::InvalidConfiguration(
                "ef must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A graph node: vector, level, and per-level forward/reverse adjacency.
pub(crate) struct Node {
    pub(crate) id: u64,
    pub(crate) vector: Vec<f32>,
    pub(crate) level: usize,
    /// `links[l]` holds neighbor handles at level `l`, for `l <= level`.
    pub(crate) links: Vec<SmallVec<[u32; 16]>>,
    /// `reverse[l]` holds the handles of nodes whose `links[l]` contain us.
    pub(crate) reverse: Vec<SmallVec<[u32; 16]>>,
}

impl Node {
    fn new(id: u64, vector: Vec<f32>, level: usize) -> Self {
        Self {
            id,
            vector,
            level,
            links: vec![SmallVec::new(); level + 1],
            reverse: vec![SmallVec::new(); level + 1],
        }
    }
}

pub(crate) struct HnswState {
    pub(crate) config: HnswConfig,
    /// Node arena; deleted slots are tombstoned, handles are never reused.
    pub(crate) slots: Vec<Option<Node>>,
    pub(crate) id_to_slot: HashMap<u64, u32>,
    pub(crate) entry: Option<u32>,
    pub(crate) max_level: usize,
}

impl HnswState {
    pub(crate) fn node(&self, slot: u32) -> &Node {
        match &self.slots[slot as usize] {
            Some(node) => node,
            None => unreachable!("dangling node handle {slot}"),
        }
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node {
        match &mut self.slots[slot as usize] {
            Some(node) => node,
            None => unreachable!("dangling node handle {slot}"),
        }
    }

    fn alloc(&mut self, node: Node) -> u32 {
        self.slots.push(Some(node));
        (self.slots.len() - 1) as u32
    }

    /// Add the edge `from -> to` at `level`, recording the reverse entry at
    /// the target. Duplicate and self edges are ignored.
    fn add_edge(&mut self, from: u32, to: u32, level: usize) {
        if from == to || self.node(from).links[level].contains(&to) {
            return;
        }
        self.node_mut(from).links[level].push(to);
        self.node_mut(to).reverse[level].push(from);
    }

    /// Trim `slot`'s neighbor list at `level` back to the `M` closest,
    /// unhooking the discarded edges' reverse entries.
    fn trim_links(&mut self, slot: u32, level: usize) {
        let m = self.config.m;
        if self.node(slot).links[level].len() <= m {
            return;
        }
        let vector = self.node(slot).vector.clone();
        let mut scored: Vec<(u32, u64, f32)> = self.node(slot).links[level]
            .iter()
            .map(|&nb| {
                let node = self.node(nb);
                (nb, node.id, self.config.metric.eval(&vector, &node.vector))
            })
            .collect();
        scored.sort_unstable_by(|a, b| a.2.total_cmp(&b.2).then_with(|| a.1.cmp(&b.1)));

        let kept: SmallVec<[u32; 16]> = scored.iter().take(m).map(|&(nb, _, _)| nb).collect();
        let removed: Vec<u32> = scored.iter().skip(m).map(|&(nb, _, _)| nb).collect();
        self.node_mut(slot).links[level] = kept;
        for nb in removed {
            self.node_mut(nb).reverse[level].retain(|x| *x != slot);
        }
    }

    /// Remove every edge incident to `slot`, in both directions.
    fn remove_node_links(&mut self, slot: u32) {
        let levels = self.node(slot).links.len();
        for level in 0..levels {
            let outgoing = std::mem::take(&mut self.node_mut(slot).links[level]);
            for nb in outgoing {
                self.node_mut(nb).reverse[level].retain(|x| *x != slot);
            }
            let incoming = std::mem::take(&mut self.node_mut(slot).reverse[level]);
            for nb in incoming {
                self.node_mut(nb).links[level].retain(|x| *x != slot);
            }
        }
    }

    /// Insert an already-allocated node into the graph, wiring links at
    /// every level it participates in.
    fn insert_node(&mut self, slot: u32, ef: usize) {
        let (level, vector) = {
            let node = self.node(slot);
            (node.level, node.vector.clone())
        };

        let Some(old_entry) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return;
        };
        let old_max = self.max_level;
        if level > old_max {
            self.entry = Some(slot);
            self.max_level = level;
        }

        // Refine the entry point down to the first level we will link at.
        let mut current = old_entry;
        if old_max > level {
            current = search::greedy_descend(self, &vector, current, old_max, level + 1);
        }

        let m = self.config.m;
        let exhaustive = self.config.exhaustive_search;
        for l in (0..=level.min(old_max)).rev() {
            let candidates = search::search_layer(self, &vector, current, l, ef, exhaustive);
            let selected: Vec<u32> = candidates
                .iter()
                .filter(|c| c.slot != slot)
                .take(m)
                .map(|c| c.slot)
                .collect();
            // The best candidate seeds the next lower level.
            if let Some(best) = candidates.iter().find(|c| c.slot != slot) {
                current = best.slot;
            }

            for &nb in &selected {
                self.add_edge(slot, nb, l);
                self.add_edge(nb, slot, l);
                self.trim_links(nb, l);
            }
        }
    }

    /// Pick a new entry point: the live node with the highest level,
    /// smallest id on ties.
    fn promote_entry(&mut self) {
        let mut best: Option<(u32, usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(node) = slot {
                let replace = match best {
                    None => true,
                    Some((_, level, id)) => {
                        node.level > level || (node.level == level && node.id < id)
                    }
                };
                if replace {
                    best = Some((i as u32, node.level, node.id));
                }
            }
        }
        match best {
            Some((slot, level, _)) => {
                self.entry = Some(slot);
                self.max_level = level;
            }
            None => {
                self.entry = None;
                self.max_level = 0;
            }
        }
    }
}

/// Sample a level from the truncated geometric distribution
/// `floor(-ln u / ln M)`.
fn sample_level(rng: &mut StdRng, m: usize) -> usize {
    if m <= 1 {
        return 0;
    }
    let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let level = (-u.ln() / (m as f64).ln()).floor() as usize;
    level.min(MAX_LEVEL_CAP)
}

const HNSW_MAGIC: [u8; 4] = *b"VCNH";

#[derive(Serialize, Deserialize)]
struct SerializedNode {
    id: u64,
    vector: Vec<f32>,
    level: usize,
    /// Per-level neighbor ids; reverse links are rebuilt on load.
    links: Vec<Vec<u64>>,
}

#[derive(Serialize, Deserialize)]
struct SerializedHnsw {
    dimension: usize,
    m: usize,
    ef: usize,
    exhaustive_search: bool,
    distance_name: String,
    max_level: usize,
    entry_point: Option<u64>,
    nodes: Vec<SerializedNode>,
}

/// Thread-safe HNSW index. Readers run in parallel; mutators are exclusive.
pub struct HnswIndex {
    state: RwLock<HnswState>,
    rng: Mutex<StdRng>,
}

impl HnswIndex {
    /// Create an empty index.
    pub fn new(config: HnswConfig, runtime: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        info!(
            dimension = config.dimension,
            m = config.m,
            ef = config.ef,
            metric = config.metric.name(),
            "creating hnsw index"
        );
        let seed = runtime.resolve_seed();
        Ok(Self {
            state: RwLock::new(HnswState {
                config,
                slots: Vec::new(),
                id_to_slot: HashMap::new(),
                entry: None,
                max_level: 0,
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
        if state.id_to_slot.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        let level = sample_level(&mut self.rng.lock(), state.config.m);
        let slot = state.alloc(Node::new(id, vector, level));
        state.id_to_slot.insert(id, slot);
        let ef = state.config.ef;
        state.insert_node(slot, ef);
        Ok(())
    }

    /// Insert many vectors at once. Nodes are linked in descending level
    /// order so the upper scaffold forms before the dense base layer.
    pub fn bulk_add(&self, vectors: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(vectors);
        for &id in &ids {
            let vector = &vectors[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
            if state.id_to_slot.contains_key(&id) {
                return Err(IndexError::DuplicateId(id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| vectors[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }

        let m = state.config.m;
        let mut staged: Vec<(u64, Vec<f32>, usize)> = {
            let mut rng = self.rng.lock();
            ids.into_iter()
                .zip(rows)
                .map(|(id, row)| (id, row, sample_level(&mut rng, m)))
                .collect()
        };
        staged.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

        let ef = state.config.ef;
        for (id, vector, level) in staged {
            let slot = state.alloc(Node::new(id, vector, level));
            state.id_to_slot.insert(id, slot);
            state.insert_node(slot, ef);
        }
        Ok(())
    }

    /// Remove a vector, pruning all incident edges. If the entry point is
    /// removed, the remaining node with the highest level is promoted.
    pub fn delete(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .id_to_slot
            .remove(&id)
            .ok_or(IndexError::MissingId(id))?;
        state.remove_node_links(slot);
        state.slots[slot as usize] = None;
        if state.entry == Some(slot) {
            state.promote_entry();
        }
        Ok(())
    }

    /// Remove many vectors; missing ids are skipped silently.
    pub fn bulk_delete(&self, ids: &[u64]) -> Result<()> {
        let mut state = self.state.write();
        let mut removed_any = false;
        for &id in ids {
            if let Some(slot) = state.id_to_slot.remove(&id) {
                state.remove_node_links(slot);
                state.slots[slot as usize] = None;
                removed_any = true;
            }
        }
        if removed_any {
            state.promote_entry();
        }
        Ok(())
    }

    /// Replace the vector stored under `id` and re-link the node. The node
    /// keeps the level it was originally assigned.
    pub fn update(&self, id: u64, mut vector: Vec<f32>) -> Result<()> {
        let mut state = self.state.write();
        let slot = *state.id_to_slot.get(&id).ok_or(IndexError::MissingId(id))?;
        if vector.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, vector.len()));
        }
        if state.config.metric.normalizes_ingress() {
            normalize(&mut vector);
        }
        state.remove_node_links(slot);
        state.node_mut(slot).vector = vector;
        let ef = state.config.ef;
        state.insert_node(slot, ef);
        Ok(())
    }

    /// Replace many stored vectors, then rebuild all links from scratch in
    /// descending level order. Missing ids are skipped silently.
    pub fn bulk_update(&self, updates: &HashMap<u64, Vec<f32>>) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state.config.dimension;
        let ids = sorted_ids(updates);
        for &id in &ids {
            let vector = &updates[&id];
            if vector.len() != dimension {
                return Err(IndexError::dimension_for(dimension, vector.len(), id));
            }
        }

        let mut rows: Vec<Vec<f32>> = ids.iter().map(|id| updates[id].clone()).collect();
        if state.config.metric.normalizes_ingress() {
            normalize_batch(&mut rows);
        }

        let mut touched = false;
        for (id, row) in ids.into_iter().zip(rows) {
            let Some(&slot) = state.id_to_slot.get(&id) else {
                continue;
            };
            state.remove_node_links(slot);
            state.node_mut(slot).vector = row;
            touched = true;
        }
        if !touched {
            return Ok(());
        }

        // Full relink: every adjacency list is rebuilt from an empty entry.
        let mut live: Vec<(u32, usize, u64)> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|n| (i as u32, n.level, n.id)))
            .collect();
        for &(slot, _, _) in &live {
            let node = state.node_mut(slot);
            for level in 0..node.links.len() {
                node.links[level].clear();
                node.reverse[level].clear();
            }
        }
        live.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
        state.entry = None;
        state.max_level = 0;
        let ef = state.config.ef;
        for (slot, _, _) in live {
            state.insert_node(slot, ef);
        }
        Ok(())
    }

    /// Find the `k` nearest neighbors of `query`.
    ///
    /// If the base-layer beam yields fewer than `k` candidates, the
    /// remaining nodes are scored by a parallel exhaustive scan so small or
    /// poorly connected graphs still return `min(k, count)` results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let state = self.state.read();
        if query.len() != state.config.dimension {
            return Err(IndexError::dimension(state.config.dimension, query.len()));
        }
        let Some(entry) = state.entry else {
            return Err(IndexError::EmptyIndex);
        };

        let mut query = query.to_vec();
        if state.config.metric.normalizes_ingress() {
            normalize(&mut query);
        }

        let mut current = entry;
        if state.max_level >= 1 {
            current = search::greedy_descend(&state, &query, current, state.max_level, 1);
        }
        let mut candidates = search::search_layer(
            &state,
            &query,
            current,
            0,
            state.config.ef,
            state.config.exhaustive_search,
        );
        if candidates.len() < k {
            let extra =
                search::fallback_scan(&state, &query, &candidates, k - candidates.len());
            candidates.extend(extra);
            search::sort_scored(&mut candidates);
        }
        candidates.truncate(k);

        let mut neighbors: Vec<Neighbor> = candidates
            .into_iter()
            .map(|c| Neighbor {
                id: c.id,
                distance: c.distance,
            })
            .collect();
        sort_neighbors(&mut neighbors);
        Ok(neighbors)
    }

    /// Cheap statistics snapshot.
    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            count: state.id_to_slot.len(),
            dimension: state.config.dimension,
            distance: state.config.metric.name().to_string(),
        }
    }

    /// Serialize the full graph to a byte stream.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let state = self.state.read();
        let mut nodes: Vec<SerializedNode> = state
            .slots
            .iter()
            .flatten()
            .map(|node| SerializedNode {
                id: node.id,
                vector: node.vector.clone(),
                level: node.level,
                links: node
                    .links
                    .iter()
                    .map(|l| l.iter().map(|&nb| state.node(nb).id).collect())
                    .collect(),
            })
            .collect();
        nodes.sort_unstable_by_key(|n| n.id);

        let serialized = SerializedHnsw {
            dimension: state.config.dimension,
            m: state.config.m,
            ef: state.config.ef,
            exhaustive_search: state.config.exhaustive_search,
            distance_name: state.config.metric.name().to_string(),
            max_level: state.max_level,
            entry_point: state.entry.map(|slot| state.node(slot).id),
            nodes,
        };
        persist::write_header(writer, &HNSW_MAGIC)?;
        persist::encode(writer, &serialized)?;
        info!(count = serialized.nodes.len(), "hnsw index saved");
        Ok(())
    }

    /// Replace this index's state with one previously written by
    /// [`HnswIndex::save`]. Reverse links are reconstructed.
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        persist::read_header(reader, &HNSW_MAGIC)?;
        let serialized: SerializedHnsw = persist::decode(reader)?;
        let metric = persist::metric_from_name(&serialized.distance_name)?;

        let config = HnswConfig {
            dimension: serialized.dimension,
            m: serialized.m,
            ef: serialized.ef,
            metric,
            exhaustive_search: serialized.exhaustive_search,
        };
        config.validate()?;

        let mut state = HnswState {
            config,
            slots: Vec::with_capacity(serialized.nodes.len()),
            id_to_slot: HashMap::with_capacity(serialized.nodes.len()),
            entry: None,
            max_level: serialized.max_level,
        };
        for node in &serialized.nodes {
            let slot = state.alloc(Node::new(node.id, node.vector.clone(), node.level));
            state.id_to_slot.insert(node.id, slot);
        }
        for node in &serialized.nodes {
            let slot = state.id_to_slot[&node.id];
            for (level, neighbor_ids) in node.links.iter().enumerate() {
                if level > node.level {
                    continue;
                }
                for nb_id in neighbor_ids {
                    if let Some(&nb) = state.id_to_slot.get(nb_id) {
                        if state.node(nb).level >= level {
                            state.add_edge(slot, nb, level);
                        }
                    }
                }
            }
        }
        state.entry = match serialized.entry_point {
            Some(id) => Some(*state.id_to_slot.get(&id).ok_or_else(|| {
                IndexError::Serialization(format!("entry point {id} is not among the nodes"))
            })?),
            None => None,
        };
        if state.entry.is_none() {
            state.max_level = 0;
        }

        let count = state.id_to_slot.len();
        *self.state.write() = state;
        info!(count, "hnsw index loaded");
        Ok(())
    }

    /// Save to a file, layered over [`HnswIndex::save`].
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    /// Load from a file, layered over [`HnswIndex::load`].
    pub fn load_from_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        self.load(&mut reader)
    }
}
