//! HNSW index façade over a pluggable storage.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use tracing::info;

use crate::distance::{Metric, SearchStats};
use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::hnsw::{HnswGraph, HnswParams};
use crate::index::persistence::{load_bincode, save_bincode, HNSW_GRAPH_FILE};
use crate::index::{
    build_thread_pool, check_query_dim, run_in_pool, SearchParams, SearchResults,
};
use crate::interrupt;
use crate::storage::{
    check_row_major, engine_distance_computer, FlatStorage, PqStorage, SqStorage, VectorStorage,
};
use crate::visited::VisitedTable;

/// Vector index combining a [`VectorStorage`] with an [`HnswGraph`].
///
/// Vectors flow through [`HnswIndex::add`], which delegates raw storage
/// and then inserts nodes into the graph in parallel. Searches are
/// batched across queries, chunked for cooperative interruption.
pub struct HnswIndex {
    storage: Box<dyn VectorStorage>,
    graph: HnswGraph,
    thread_pool: Option<rayon::ThreadPool>,
    fetch_count: Option<Arc<AtomicU64>>,
    base_level_only: bool,
    num_base_level_search_entrypoints: usize,
}

impl HnswIndex {
    /// Creates an index over an existing storage, taking ownership.
    /// `max_threads` of `0` uses the global thread pool.
    pub fn new(
        storage: Box<dyn VectorStorage>,
        params: HnswParams,
        max_threads: usize,
    ) -> Result<Self> {
        Ok(Self {
            storage,
            graph: HnswGraph::new(params),
            thread_pool: build_thread_pool(max_threads)?,
            fetch_count: None,
            base_level_only: false,
            num_base_level_search_entrypoints: 32,
        })
    }

    /// Index over uncompressed f32 storage.
    pub fn flat(d: usize, params: HnswParams, metric: Metric) -> Result<Self> {
        Self::new(Box::new(FlatStorage::new(d, metric)), params, 0)
    }

    /// Index over 8-bit scalar-quantized storage.
    pub fn sq(d: usize, params: HnswParams, metric: Metric) -> Result<Self> {
        Self::new(Box::new(SqStorage::new(d, metric)), params, 0)
    }

    /// Index over product-quantized storage (`pq_m` subspaces, L2).
    /// Requires [`HnswIndex::train`] before vectors are added.
    pub fn pq(d: usize, pq_m: usize, params: HnswParams) -> Result<Self> {
        let storage = PqStorage::new(d, pq_m, params.seed)?;
        Self::new(Box::new(storage), params, 0)
    }

    /// Vector dimensionality.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.storage.dim()
    }

    /// Number of indexed vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True when no vector was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Index metric.
    #[must_use]
    pub fn metric(&self) -> Metric {
        self.storage.metric()
    }

    /// Graph build parameters.
    #[must_use]
    pub fn params(&self) -> &HnswParams {
        self.graph.params()
    }

    /// Borrow of the underlying link structure.
    #[must_use]
    pub fn graph(&self) -> &HnswGraph {
        &self.graph
    }

    /// Restricts searches to the base layer, entered through the best
    /// of `num_base_level_search_entrypoints` random nodes. Pair with
    /// [`HnswIndex::init_level_0_from_knngraph`] for imported graphs.
    pub fn set_base_level_only(&mut self, base_level_only: bool) {
        self.base_level_only = base_level_only;
    }

    /// Number of random entry candidates scored by base-level search.
    pub fn set_num_base_level_search_entrypoints(&mut self, n: usize) {
        self.num_base_level_search_entrypoints = n.max(1);
    }

    /// Disables engine construction of level 0 during `add`; the base
    /// layer is installed separately.
    pub fn set_init_level0(&mut self, init: bool) {
        self.graph.set_init_level0(init);
    }

    /// Installs an externally built base layer from a rectangular
    /// `n × k` id table (`-1` terminates a row).
    pub fn init_level_0_from_knngraph(&mut self, k: usize, rows: &[NodeId]) {
        self.graph.init_level0_from_knngraph(k, rows);
    }

    /// Installs (or resets) the fetch counter: every distance
    /// evaluation performed by subsequent searches is accumulated.
    pub fn init_fetch_counter(&mut self) {
        self.fetch_count = Some(Arc::new(AtomicU64::new(0)));
    }

    /// Removes the fetch counter.
    pub fn drop_fetch_counter(&mut self) {
        self.fetch_count = None;
    }

    /// Distance evaluations accumulated since the counter was
    /// installed; `None` when disabled.
    #[must_use]
    pub fn last_fetch_count(&self) -> Option<u64> {
        self.fetch_count
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Trains the storage encoding if it needs it.
    pub fn train(&mut self, x: &[f32]) -> Result<()> {
        self.storage.train(x)
    }

    /// Appends vectors and links them into the graph. Insertions run in
    /// parallel; the resulting graph depends on thread interleaving but
    /// preserves the engine invariants.
    pub fn add(&mut self, x: &[f32]) -> Result<()> {
        if !self.storage.is_trained() {
            return Err(Error::Usage("add called before train".into()));
        }
        let d = self.storage.dim();
        let n = check_row_major(x, d)?;
        if n == 0 {
            return Ok(());
        }
        let n0 = self.storage.len();
        #[allow(clippy::cast_sign_loss)]
        if n0 + n > NodeId::MAX as usize {
            return Err(Error::InvalidInput(
                "graph domain is limited to 2^31 - 1 nodes".into(),
            ));
        }

        self.storage.add(x)?;

        let storage = self.storage.as_ref();
        let graph = &self.graph;
        let ntotal = n0 + n;
        let period = interrupt::period_hint(d * graph.params().ef_construction);

        run_in_pool(self.thread_pool.as_ref(), || -> Result<()> {
            let mut start = 0usize;
            while start < n {
                let end = start.saturating_add(period).min(n);
                (start..end).into_par_iter().for_each_init(
                    || (engine_distance_computer(storage), VisitedTable::new(ntotal)),
                    |(dis, vt), i| {
                        dis.set_query(&x[i * d..(i + 1) * d]);
                        let mut stats = SearchStats::default();
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        graph.insert((n0 + i) as NodeId, dis.as_ref(), vt, &mut stats);
                    },
                );
                interrupt::check()?;
                start = end;
            }
            Ok(())
        })?;

        info!(added = n, total = ntotal, "hnsw add done");
        Ok(())
    }

    /// Batched top-k search. Unfilled slots carry `(-1, worst)`; an
    /// empty index returns all-sentinel rows.
    pub fn search(
        &self,
        queries: &[f32],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> Result<SearchResults> {
        if k == 0 {
            return Err(Error::InvalidInput("k must be positive".into()));
        }
        let d = self.storage.dim();
        let nq = check_row_major(queries, d)?;
        let mut results = SearchResults::sentinel(nq, k);
        if self.is_empty() || nq == 0 {
            return Ok(results);
        }

        let ef = params
            .and_then(|p| p.ef_search)
            .unwrap_or(self.graph.params().ef_search)
            .max(k);
        let selector = params.and_then(|p| p.selector);
        let storage = self.storage.as_ref();
        let graph = &self.graph;
        let ntotal = self.storage.len();
        let fetch = self.fetch_count.as_ref();
        let base_level_only = self.base_level_only;
        let nprobe = self.num_base_level_search_entrypoints;
        let period = interrupt::period_hint(d * ef);

        let labels = &mut results.labels;
        let distances = &mut results.distances;
        run_in_pool(self.thread_pool.as_ref(), || -> Result<()> {
            let mut start = 0usize;
            while start < nq {
                let end = start.saturating_add(period).min(nq);
                labels[start * k..end * k]
                    .par_chunks_mut(k)
                    .zip(distances[start * k..end * k].par_chunks_mut(k))
                    .enumerate()
                    .for_each_init(
                        || (engine_distance_computer(storage), VisitedTable::new(ntotal)),
                        |(dis, vt), (local, (label_row, dist_row))| {
                            let qi = start + local;
                            dis.set_query(&queries[qi * d..(qi + 1) * d]);
                            let mut stats = SearchStats::default();

                            let found = if base_level_only {
                                #[allow(
                                    clippy::cast_possible_truncation,
                                    clippy::cast_possible_wrap
                                )]
                                let entries: Vec<NodeId> = (0..nprobe)
                                    .map(|_| (graph.next_rand() % ntotal as u64) as NodeId)
                                    .collect();
                                graph.search_base_level(
                                    &entries,
                                    dis.as_ref(),
                                    k,
                                    ef,
                                    vt,
                                    &mut stats,
                                    selector,
                                )
                            } else {
                                graph.search(dis.as_ref(), k, ef, vt, &mut stats, selector)
                            };

                            for (j, &(id, dist)) in found.iter().enumerate() {
                                label_row[j] = i64::from(id);
                                dist_row[j] = dist;
                            }
                            if let Some(counter) = fetch {
                                counter.fetch_add(stats.ndis as u64, Ordering::Relaxed);
                            }
                        },
                    );
                interrupt::check()?;
                start = end;
            }
            Ok(())
        })?;

        if self.storage.metric().is_similarity() {
            for dist in &mut results.distances {
                *dist = -*dist;
            }
        }
        Ok(results)
    }

    /// Radius search around a single query. For L2 the radius bounds
    /// the squared distance; for inner product it is the minimum
    /// similarity. Results are ordered best-first with no `k` cap.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        params: Option<&SearchParams<'_>>,
    ) -> Result<Vec<(i64, f32)>> {
        let d = self.storage.dim();
        check_query_dim(query, d)?;
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let similarity = self.storage.metric().is_similarity();
        let engine_radius = if similarity { -radius } else { radius };
        let ef = params
            .and_then(|p| p.ef_search)
            .unwrap_or(self.graph.params().ef_search);

        let storage = self.storage.as_ref();
        let graph = &self.graph;
        let found = run_in_pool(self.thread_pool.as_ref(), || {
            let mut dis = engine_distance_computer(storage);
            dis.set_query(query);
            let mut vt = VisitedTable::new(storage.len());
            let mut stats = SearchStats::default();
            let found = graph.range_search(dis.as_ref(), engine_radius, ef, &mut vt, &mut stats);
            if let Some(counter) = self.fetch_count.as_ref() {
                counter.fetch_add(stats.ndis as u64, Ordering::Relaxed);
            }
            found
        });

        Ok(found
            .into_iter()
            .map(|(id, dist)| {
                (
                    i64::from(id),
                    if similarity { -dist } else { dist },
                )
            })
            .collect())
    }

    /// Decodes vector `id` back out of the storage.
    pub fn reconstruct(&self, id: usize) -> Result<Vec<f32>> {
        if id >= self.storage.len() {
            return Err(Error::InvalidInput(format!(
                "vector {id} out of range (ntotal {})",
                self.storage.len()
            )));
        }
        let mut out = vec![0.0f32; self.storage.dim()];
        self.storage.reconstruct(id, &mut out);
        Ok(out)
    }

    /// Clears the graph and the storage.
    pub fn reset(&mut self) {
        self.graph.reset();
        self.storage.reset();
    }

    /// Persists the link structure (adjacency tables, entry point,
    /// level assignments, build parameters) under `dir`. The storage
    /// is not persisted.
    pub fn save(&self, dir: &Path) -> Result<()> {
        save_bincode(&dir.join(HNSW_GRAPH_FILE), &self.graph.to_state())
    }

    /// Restores an index persisted by [`HnswIndex::save`] over a
    /// freshly supplied storage holding the same vectors.
    pub fn load(dir: &Path, storage: Box<dyn VectorStorage>, max_threads: usize) -> Result<Self> {
        let graph = HnswGraph::from_state(load_bincode(&dir.join(HNSW_GRAPH_FILE))?);
        if graph.len() != storage.len() {
            return Err(Error::InvalidInput(format!(
                "persisted graph covers {} nodes, storage holds {}",
                graph.len(),
                storage.len()
            )));
        }
        Ok(Self {
            storage,
            graph,
            thread_pool: build_thread_pool(max_threads)?,
            fetch_count: None,
            base_level_only: false,
            num_base_level_search_entrypoints: 32,
        })
    }

    /// Dumps per-level edge statistics (node counts, edge counts, mean
    /// degree, reciprocal edges on the base layer) to `path`.
    pub fn save_edge_stats(&self, path: &Path) -> Result<()> {
        use std::io::Write as _;

        let file = std::fs::File::create(path)?;
        let mut out = std::io::BufWriter::new(file);
        let ntotal = self.graph.len();

        let top = self.graph.entry_point().map_or(0, |(_, level)| level);
        for level in 0..=top {
            let mut nodes = 0usize;
            let mut edges = 0usize;
            for i in 0..ntotal {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                if self.graph.level_of(i as NodeId) < level {
                    continue;
                }
                nodes += 1;
                edges += self.graph.neighbors(level, i).len();
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = if nodes == 0 {
                0.0
            } else {
                edges as f64 / nodes as f64
            };
            writeln!(out, "level {level}: nodes {nodes} edges {edges} mean_degree {mean:.2}")?;
        }

        // Reciprocal edges on the base layer.
        let mut reciprocal = 0usize;
        let mut total = 0usize;
        for i in 0..ntotal {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let row: FxHashSet<NodeId> = self.graph.neighbors(0, i).into_iter().collect();
            total += row.len();
            for &nb in &row {
                #[allow(clippy::cast_sign_loss)]
                if self
                    .graph
                    .neighbors(0, nb as usize)
                    .contains(&(i as NodeId))
                {
                    reciprocal += 1;
                }
            }
        }
        writeln!(out, "level 0 reciprocal edges: {reciprocal} of {total}")?;
        info!(path = %path.display(), "saved hnsw edge stats");
        Ok(())
    }
}
