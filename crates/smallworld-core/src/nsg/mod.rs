//! Navigating Spreading-out Graph engine.
//!
//! A single-level directed graph refined from a KNN seed graph (Fu et
//! al., VLDB 2019): searches start at the medoid enterpoint, edges are
//! pruned by the occlusion rule, and a DFS pass reattaches stray
//! components so the built graph is always connected. The build is one
//! shot; incremental addition after a build is a usage error.
//!
//! # Module Organization
//!
//! - `build`: medoid selection, link/prune, reverse edges, connectivity
//!   repair
//! - this module: parameters, the seed graph type and search paths

mod build;
#[cfg(test)]
mod tests;

use std::io::Write as _;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::distance::{DistanceComputer, SearchStats};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, EMPTY_ID};
use crate::pool::SearchPool;
use crate::visited::VisitedTable;

/// Seed used by the per-search random initialization of the candidate
/// pool, fixed for reproducible traversals.
const SEARCH_INIT_SEED: u64 = 0x1234;

/// NSG build and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NsgParams {
    /// Fanout bound of the built graph.
    pub r: usize,
    /// Candidate list length during construction (at least `r`).
    pub l: usize,
    /// Pruning pool size: how many candidates the occlusion rule
    /// examines per node.
    pub c: usize,
    /// Default candidate list length during search.
    pub search_l: usize,
    /// Fanout of the seed KNN graph.
    pub gk: usize,
    /// Fraction of invalid seed entries tolerated before the build is
    /// rejected.
    pub max_invalid_fraction: f32,
    /// Seed for medoid bootstrap and attachment fallbacks.
    pub seed: u64,
}

impl NsgParams {
    /// Parameters with fanout `r` and the conventional derived sizes.
    #[must_use]
    pub fn new(r: usize) -> Self {
        Self {
            r,
            l: r + 32,
            c: r + 100,
            search_l: 16,
            gk: 64,
            max_invalid_fraction: 0.1,
            seed: 0x0903,
        }
    }

    /// Replaces the search-time candidate list length.
    #[must_use]
    pub fn with_search_l(mut self, search_l: usize) -> Self {
        self.search_l = search_l;
        self
    }

    /// Replaces the seed KNN graph fanout.
    #[must_use]
    pub fn with_gk(mut self, gk: usize) -> Self {
        self.gk = gk;
        self
    }

    /// Replaces the PRNG seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for NsgParams {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Rectangular `n × k` seed KNN graph. `-1` marks an empty slot; rows
/// may also carry self-loops or stale ids, which the builder tolerates
/// up to [`NsgParams::max_invalid_fraction`].
pub struct KnnGraph {
    data: Vec<NodeId>,
    n: usize,
    k: usize,
}

impl KnnGraph {
    /// Wraps a row-major id table.
    pub fn new(n: usize, k: usize, data: Vec<NodeId>) -> Result<Self> {
        if data.len() != n * k {
            return Err(Error::InvalidInput(format!(
                "seed graph table holds {} ids, expected {n} x {k}",
                data.len()
            )));
        }
        Ok(Self { data, n, k })
    }

    /// Number of nodes.
    #[must_use]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Row fanout.
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Full row `i`, including invalid slots.
    #[must_use]
    pub fn row(&self, i: usize) -> &[NodeId] {
        &self.data[i * self.k..(i + 1) * self.k]
    }
}

/// Neighbor enumeration shared by the seed graph and the built graph so
/// one traversal serves both build and search.
pub(crate) trait NeighborSource: Sync {
    fn neighbors_into(&self, i: usize, out: &mut Vec<NodeId>);
}

impl NeighborSource for KnnGraph {
    fn neighbors_into(&self, i: usize, out: &mut Vec<NodeId>) {
        out.clear();
        for &id in self.row(i) {
            if id < 0 {
                break;
            }
            out.push(id);
        }
    }
}

impl NeighborSource for Graph {
    fn neighbors_into(&self, i: usize, out: &mut Vec<NodeId>) {
        out.clear();
        out.extend(self.neighbors(i));
    }
}

/// A directed edge kept with its length during construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub id: NodeId,
    pub dist: f32,
}

/// Serializable snapshot of a built NSG.
#[derive(Serialize, Deserialize)]
pub struct NsgState {
    /// Build parameters.
    pub params: NsgParams,
    /// Medoid enterpoint.
    pub enterpoint: NodeId,
    /// Adjacency rows.
    pub rows: Vec<Vec<NodeId>>,
    /// Whether the graph finished building.
    pub is_built: bool,
}

/// The single-level link structure. Vector content lives in the
/// storage; this type only sees node ids and a distance computer.
pub struct NsgGraph {
    params: NsgParams,
    ntotal: usize,
    enterpoint: NodeId,
    graph: Option<Graph>,
    is_built: bool,
}

impl NsgGraph {
    /// Creates an empty, unbuilt graph.
    #[must_use]
    pub fn new(params: NsgParams) -> Self {
        Self {
            params,
            ntotal: 0,
            enterpoint: EMPTY_ID,
            graph: None,
            is_built: false,
        }
    }

    /// Build parameters.
    #[must_use]
    pub fn params(&self) -> &NsgParams {
        &self.params
    }

    /// Number of nodes covered by the built graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ntotal
    }

    /// True before the first build.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ntotal == 0
    }

    /// Whether [`NsgGraph::build`] completed.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.is_built
    }

    /// The medoid every search starts from.
    #[must_use]
    pub fn enterpoint(&self) -> NodeId {
        self.enterpoint
    }

    /// Out-neighbors of node `i` in the built graph.
    #[must_use]
    pub fn neighbors(&self, i: usize) -> Vec<NodeId> {
        self.graph.as_ref().map_or_else(Vec::new, |g| g.neighbors(i))
    }

    /// Drops the built graph.
    pub fn reset(&mut self) {
        self.graph = None;
        self.ntotal = 0;
        self.enterpoint = EMPTY_ID;
        self.is_built = false;
    }

    /// Top-k search from the enterpoint with a candidate list of
    /// `max(search_l, k)`.
    pub fn search(
        &self,
        dis: &dyn DistanceComputer,
        k: usize,
        search_l: usize,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
    ) -> Result<Vec<(NodeId, f32)>> {
        let graph = match (&self.graph, self.is_built) {
            (Some(graph), true) => graph,
            _ => return Err(Error::Usage("search on an unbuilt NSG".into())),
        };

        let pool_size = search_l.max(k).max(1);
        let pool = self.search_on_graph(
            graph,
            dis,
            vt,
            self.enterpoint,
            pool_size,
            None,
            stats,
        );
        vt.advance();

        Ok(pool
            .entries()
            .iter()
            .take(k)
            .map(|c| (c.id, c.dist))
            .collect())
    }

    /// Connected-component size reachable from `root` in the built
    /// graph; exposed for connectivity verification.
    #[must_use]
    pub fn reachable_from(&self, root: NodeId) -> usize {
        match &self.graph {
            Some(graph) => {
                let mut vt = VisitedTable::new(self.ntotal);
                self.dfs(graph, &mut vt, root, 0)
            }
            None => 0,
        }
    }

    /// Writes the per-node unique-degree distribution, one line per
    /// node, to `path`.
    pub fn save_degree_distribution(&self, path: &std::path::Path) -> Result<()> {
        let graph = match (&self.graph, self.is_built) {
            (Some(graph), true) => graph,
            _ => return Err(Error::Usage("degree dump on an unbuilt NSG".into())),
        };

        let file = std::fs::File::create(path)?;
        let mut out = std::io::BufWriter::new(file);
        let mut seen = FxHashSet::default();
        for i in 0..self.ntotal {
            seen.clear();
            #[allow(clippy::cast_possible_wrap)]
            for id in graph.neighbors(i) {
                if id != i as NodeId {
                    seen.insert(id);
                }
            }
            writeln!(out, "{}", seen.len())?;
        }
        tracing::info!(nodes = self.ntotal, path = %path.display(), "saved degree distribution");
        Ok(())
    }

    /// Bounded best-first traversal over `source` from `ep`.
    ///
    /// The candidate pool is seeded with the enterpoint's neighbors and
    /// topped up with random unvisited nodes. Every evaluated node is
    /// appended to `fullset` when provided (the construction path needs
    /// the whole visited set, not just the survivors). The visited
    /// table is left as-is so callers can reuse the marks; they advance
    /// it when done.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn search_on_graph(
        &self,
        source: &dyn NeighborSource,
        dis: &dyn DistanceComputer,
        vt: &mut VisitedTable,
        ep: NodeId,
        pool_size: usize,
        mut fullset: Option<&mut Vec<Edge>>,
        stats: &mut SearchStats,
    ) -> SearchPool {
        let n = self.ntotal;
        let mut pool = SearchPool::new(pool_size);
        vt.ensure_capacity(n);

        let mut neigh = Vec::new();
        let mut init: Vec<NodeId> = Vec::with_capacity(pool_size);
        let mut marked = 0usize;

        if ep >= 0 {
            #[allow(clippy::cast_sign_loss)]
            source.neighbors_into(ep as usize, &mut neigh);
            for &id in neigh.iter().take(pool_size) {
                #[allow(clippy::cast_sign_loss)]
                let idx = id as usize;
                if id < 0 || idx >= n || vt.get(idx) {
                    continue;
                }
                vt.set(idx);
                marked += 1;
                init.push(id);
            }
        }

        // Top up with random unvisited nodes so the traversal never
        // starts from a single degenerate row.
        let mut rng = StdRng::seed_from_u64(SEARCH_INIT_SEED);
        while init.len() < pool_size && marked < n {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let id = rng.gen_range(0..n) as NodeId;
            #[allow(clippy::cast_sign_loss)]
            let idx = id as usize;
            if vt.get(idx) {
                continue;
            }
            vt.set(idx);
            marked += 1;
            init.push(id);
        }

        for id in init {
            #[allow(clippy::cast_sign_loss)]
            let idx = id as usize;
            stats.ndis += 1;
            let dist = dis.dist_to_query(idx);
            pool.insert(id, dist);
            if let Some(fs) = fullset.as_deref_mut() {
                fs.push(Edge { id, dist });
            }
        }

        while let Some(pos) = pool.first_unexpanded() {
            pool.mark_expanded(pos);
            #[allow(clippy::cast_sign_loss)]
            let node = pool.get(pos).id as usize;
            source.neighbors_into(node, &mut neigh);
            for &nb in &neigh {
                #[allow(clippy::cast_sign_loss)]
                let idx = nb as usize;
                if nb < 0 || idx >= n || vt.get(idx) {
                    continue;
                }
                vt.set(idx);
                stats.ndis += 1;
                let dist = dis.dist_to_query(idx);
                pool.insert(nb, dist);
                if let Some(fs) = fullset.as_deref_mut() {
                    fs.push(Edge { id: nb, dist });
                }
            }
        }

        pool
    }

    /// Serializable snapshot for persistence.
    #[must_use]
    pub fn to_state(&self) -> NsgState {
        let rows = self.graph.as_ref().map_or_else(Vec::new, |g| {
            (0..self.ntotal).map(|i| g.neighbors(i)).collect()
        });
        NsgState {
            params: self.params,
            enterpoint: self.enterpoint,
            rows,
            is_built: self.is_built,
        }
    }

    /// Rebuilds a graph from a persisted snapshot.
    #[must_use]
    pub fn from_state(state: NsgState) -> Self {
        let n = state.rows.len();
        let graph = if n == 0 {
            None
        } else {
            let g = Graph::new(n, state.params.r);
            for (i, row) in state.rows.iter().enumerate() {
                // Rows are written through the lock rather than
                // `set_neighbors`: connectivity repair may have grown a
                // row past the nominal fanout, and that edge must
                // survive the round-trip.
                *g.lock_row(i) = row.clone();
            }
            Some(g)
        };
        Self {
            params: state.params,
            ntotal: n,
            enterpoint: state.enterpoint,
            graph,
            is_built: state.is_built,
        }
    }
}
