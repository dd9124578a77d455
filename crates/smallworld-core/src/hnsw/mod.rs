//! Hierarchical Navigable Small World graph engine.
//!
//! Implements the multi-layer proximity graph of Malkov & Yashunin:
//! level density decays geometrically, upper levels provide long-range
//! hops and level 0 holds every node. Insertion is incremental and safe
//! under concurrent writers; the resulting graph depends on thread
//! interleaving but always preserves the row-capacity and entry-point
//! invariants.
//!
//! # Module Organization
//!
//! - `insert`: level draw, greedy descent and link construction
//! - `search`: k-NN, range and base-level-only searches

mod insert;
mod search;

pub use search::IdSelector;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeId};

/// Hard cap on the level drawn for a node.
const MAX_LEVEL: usize = 15;

const DEFAULT_RNG_STATE: u64 = 0x5DEE_CE66_D1A4_B5B5;

/// How a full level-0 row absorbs one more edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgePolicy {
    /// Re-run the occlusion heuristic and drop redundant edges.
    #[default]
    PruneHeuristic,
    /// Run the heuristic, then backfill pruned edges until the row holds
    /// exactly its capacity. Used when a dense base layer is exported to
    /// an external graph consumer.
    FillToCap,
}

/// HNSW build and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Bi-directional links per node on levels above 0.
    pub m: usize,
    /// Links per node on level 0 (defaults to `2 * m`).
    pub m0: usize,
    /// Dynamic candidate list size during construction.
    pub ef_construction: usize,
    /// Default dynamic candidate list size during search.
    pub ef_search: usize,
    /// Seed for the level-assignment generator.
    pub seed: u64,
    /// Edge selection on level-0 overflow.
    pub level0_policy: EdgePolicy,
}

impl HnswParams {
    /// Parameters with fanout `m` and the conventional defaults.
    #[must_use]
    pub fn new(m: usize) -> Self {
        Self {
            m,
            m0: 2 * m,
            ef_construction: 40,
            ef_search: 16,
            seed: DEFAULT_RNG_STATE,
            level0_policy: EdgePolicy::PruneHeuristic,
        }
    }

    /// Replaces the level-draw seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces the construction-time candidate list size.
    #[must_use]
    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Replaces the search-time candidate list size.
    #[must_use]
    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Shared top-level entry point: the node every search starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub node: NodeId,
    pub level: usize,
}

/// The multi-level link structure. Vector content lives in the storage;
/// this type only sees node ids and a distance computer.
pub struct HnswGraph {
    params: HnswParams,
    /// `1 / ln(m)`: multiplier of the geometric level distribution.
    level_mult: f64,
    /// One adjacency graph per level; `layers[0]` is the base layer.
    layers: RwLock<Vec<Graph>>,
    /// Level assignment per node.
    levels: RwLock<Vec<u8>>,
    entry: RwLock<Option<EntryPoint>>,
    rng_state: AtomicU64,
    /// When false, insertion skips level-0 linking; the base layer is
    /// supplied externally via [`HnswGraph::init_level0_from_knngraph`].
    init_level0: bool,
}

/// Serializable snapshot of the link structure: adjacency tables, entry
/// point, level assignments and build parameters.
#[derive(Serialize, Deserialize)]
pub struct HnswState {
    /// Build parameters.
    pub params: HnswParams,
    /// Level assignment per node.
    pub levels: Vec<u8>,
    /// Rows per level per node.
    pub layers: Vec<Vec<Vec<NodeId>>>,
    /// Entry node and its level.
    pub entry: Option<(NodeId, u8)>,
    /// Whether level 0 is engine-built.
    pub init_level0: bool,
}

impl HnswGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(params: HnswParams) -> Self {
        let level_mult = 1.0 / (params.m.max(2) as f64).ln();
        let seed = if params.seed == 0 {
            DEFAULT_RNG_STATE
        } else {
            params.seed
        };
        Self {
            params,
            level_mult,
            layers: RwLock::new(vec![Graph::new(0, params.m0)]),
            levels: RwLock::new(Vec::new()),
            entry: RwLock::new(None),
            rng_state: AtomicU64::new(seed),
            init_level0: true,
        }
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.read().len()
    }

    /// True when no node was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build parameters.
    #[must_use]
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Level assigned to `id`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn level_of(&self, id: NodeId) -> usize {
        usize::from(self.levels.read()[id as usize])
    }

    /// Entry node and top level, when any node exists.
    #[must_use]
    pub fn entry_point(&self) -> Option<(NodeId, usize)> {
        self.entry.read().map(|e| (e.node, e.level))
    }

    /// Disables or re-enables engine construction of level 0.
    pub fn set_init_level0(&mut self, init: bool) {
        self.init_level0 = init;
    }

    /// Row capacity at `level`.
    #[must_use]
    pub fn cap(&self, level: usize) -> usize {
        if level == 0 {
            self.params.m0
        } else {
            self.params.m
        }
    }

    /// Snapshot of node `i`'s row at `level`.
    #[must_use]
    pub fn neighbors(&self, level: usize, i: usize) -> Vec<NodeId> {
        self.layers.read()[level].neighbors(i)
    }

    /// Installs an externally built base layer from a rectangular
    /// `n × k` id table (`-1` terminates a row). Self-edges are dropped
    /// and rows are truncated at the level-0 capacity. The entry point
    /// is bootstrapped to node 0 when unset.
    #[allow(clippy::cast_sign_loss)]
    pub fn init_level0_from_knngraph(&self, k: usize, rows: &[NodeId]) {
        let n = if k == 0 { 0 } else { rows.len() / k };
        if n == 0 {
            return;
        }

        {
            let mut layers = self.layers.write();
            layers[0].ensure_capacity(n - 1);
        }
        {
            let mut levels = self.levels.write();
            if levels.len() < n {
                levels.resize(n, 0);
            }
        }

        let layers = self.layers.read();
        for i in 0..n {
            let mut row = Vec::new();
            for &id in &rows[i * k..(i + 1) * k] {
                if id < 0 {
                    break;
                }
                if id as usize == i || row.contains(&id) {
                    continue;
                }
                row.push(id);
            }
            layers[0].set_neighbors(i, row);
        }
        drop(layers);

        let mut entry = self.entry.write();
        if entry.is_none() {
            *entry = Some(EntryPoint { node: 0, level: 0 });
        }
    }

    /// Serializable snapshot for persistence.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_state(&self) -> HnswState {
        let layers = self.layers.read();
        let rows = layers
            .iter()
            .map(|layer| (0..layer.len()).map(|i| layer.neighbors(i)).collect())
            .collect();
        let entry = self.entry.read().map(|e| (e.node, e.level as u8));
        HnswState {
            params: self.params,
            levels: self.levels.read().clone(),
            layers: rows,
            entry,
            init_level0: self.init_level0,
        }
    }

    /// Rebuilds a graph from a persisted snapshot.
    #[must_use]
    pub fn from_state(state: HnswState) -> Self {
        let mut graph = Self::new(state.params);
        graph.init_level0 = state.init_level0;
        {
            let mut layers = graph.layers.write();
            layers.clear();
            for (l, rows) in state.layers.iter().enumerate() {
                let layer = Graph::new(rows.len(), graph.cap(l));
                for (i, row) in rows.iter().enumerate() {
                    layer.set_neighbors(i, row.clone());
                }
                layers.push(layer);
            }
            if layers.is_empty() {
                layers.push(Graph::new(0, state.params.m0));
            }
        }
        *graph.levels.write() = state.levels;
        *graph.entry.write() = state.entry.map(|(node, level)| EntryPoint {
            node,
            level: usize::from(level),
        });
        graph
    }

    /// Clears the graph, keeping the parameters.
    pub fn reset(&mut self) {
        let mut layers = self.layers.write();
        layers.clear();
        layers.push(Graph::new(0, self.params.m0));
        drop(layers);
        self.levels.write().clear();
        *self.entry.write() = None;
        let seed = if self.params.seed == 0 {
            DEFAULT_RNG_STATE
        } else {
            self.params.seed
        };
        self.rng_state.store(seed, Ordering::Relaxed);
    }

    /// Advances the shared xorshift state and returns the new value.
    pub(crate) fn next_rand(&self) -> u64 {
        let mut next = 0u64;
        let _ = self
            .rng_state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |state| {
                let mut x = if state == 0 { DEFAULT_RNG_STATE } else { state };
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                next = x;
                Some(x)
            });
        next
    }

    /// Draws a level from the geometric distribution
    /// `⌊−ln(U) · 1/ln(m)⌋`.
    // SAFETY of the casts: -ln(uniform) is non-negative since uniform is
    // in (0, 1], and the floored product is capped at MAX_LEVEL.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub(crate) fn random_level(&self) -> usize {
        let uniform = (self.next_rand() as f64 / u64::MAX as f64).max(f64::MIN_POSITIVE);
        let level = (-uniform.ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }
}
