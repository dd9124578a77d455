//! NSG index façade over a pluggable storage.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::distance::{Metric, SearchStats};
use crate::error::{Error, Result};
use crate::graph::{NodeId, EMPTY_ID};
use crate::index::persistence::{load_bincode, save_bincode, NSG_GRAPH_FILE};
use crate::index::{
    build_thread_pool, run_in_pool, SearchParams, SearchResults,
};
use crate::interrupt;
use crate::nndescent::{self, NnDescentParams};
use crate::nsg::{KnnGraph, NsgGraph, NsgParams};
use crate::storage::{
    check_row_major, engine_distance_computer, FlatStorage, PqStorage, SqStorage, VectorStorage,
};
use crate::visited::VisitedTable;

/// How the seed KNN graph is produced during [`NsgIndex::add`].
#[derive(Debug, Clone, Copy)]
pub enum SeedBuilder {
    /// Exhaustive top-`gk` assignment through the storage.
    BruteForce,
    /// Iterative NNDescent refinement; the fanout is overridden with
    /// the index's `gk`.
    NnDescent(NnDescentParams),
}

/// Vector index combining a [`VectorStorage`] with an [`NsgGraph`].
///
/// The whole vector set must arrive in a single [`NsgIndex::add`] call,
/// which builds the seed KNN graph and refines it in one shot. Further
/// addition is a usage error.
pub struct NsgIndex {
    storage: Box<dyn VectorStorage>,
    nsg: NsgGraph,
    seed_builder: SeedBuilder,
    thread_pool: Option<rayon::ThreadPool>,
    fetch_count: Option<Arc<AtomicU64>>,
}

impl NsgIndex {
    /// Creates an index over an existing storage, taking ownership.
    /// `max_threads` of `0` uses the global thread pool.
    pub fn new(
        storage: Box<dyn VectorStorage>,
        params: NsgParams,
        max_threads: usize,
    ) -> Result<Self> {
        Ok(Self {
            storage,
            nsg: NsgGraph::new(params),
            seed_builder: SeedBuilder::BruteForce,
            thread_pool: build_thread_pool(max_threads)?,
            fetch_count: None,
        })
    }

    /// Index over uncompressed f32 storage.
    pub fn flat(d: usize, params: NsgParams, metric: Metric) -> Result<Self> {
        Self::new(Box::new(FlatStorage::new(d, metric)), params, 0)
    }

    /// Index over 8-bit scalar-quantized storage.
    pub fn sq(d: usize, params: NsgParams, metric: Metric) -> Result<Self> {
        Self::new(Box::new(SqStorage::new(d, metric)), params, 0)
    }

    /// Index over product-quantized storage (`pq_m` subspaces, L2).
    /// Requires [`NsgIndex::train`] before vectors are added.
    pub fn pq(d: usize, pq_m: usize, params: NsgParams) -> Result<Self> {
        let storage = PqStorage::new(d, pq_m, params.seed)?;
        Self::new(Box::new(storage), params, 0)
    }

    /// Selects how the seed KNN graph is produced.
    pub fn set_seed_builder(&mut self, builder: SeedBuilder) {
        self.seed_builder = builder;
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
    pub fn params(&self) -> &NsgParams {
        self.nsg.params()
    }

    /// Borrow of the underlying link structure.
    #[must_use]
    pub fn graph(&self) -> &NsgGraph {
        &self.nsg
    }

    /// Installs (or resets) the fetch counter.
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

    /// One-shot: stores all vectors, builds the seed KNN graph and
    /// refines it into the navigating graph. A second call is a usage
    /// error; use [`NsgIndex::reset`] first.
    pub fn add(&mut self, x: &[f32]) -> Result<()> {
        if !self.storage.is_trained() {
            return Err(Error::Usage("add called before train".into()));
        }
        if self.nsg.is_built() || !self.storage.is_empty() {
            return Err(Error::Usage(
                "NSG does not support incremental addition".into(),
            ));
        }
        let d = self.storage.dim();
        let n = check_row_major(x, d)?;
        if n == 0 {
            return Ok(());
        }
        #[allow(clippy::cast_sign_loss)]
        if n > NodeId::MAX as usize {
            return Err(Error::InvalidInput(
                "graph domain is limited to 2^31 - 1 nodes".into(),
            ));
        }

        self.storage.add(x)?;
        info!(n, "nsg add: building seed knn graph");

        let storage = self.storage.as_ref();
        let gk = self.nsg.params().gk;
        let seed = match self.seed_builder {
            SeedBuilder::BruteForce => {
                run_in_pool(self.thread_pool.as_ref(), || brute_force_seed(storage, x, gk))?
            }
            SeedBuilder::NnDescent(nnd) => {
                let mut nnd = nnd;
                nnd.k = gk;
                run_in_pool(self.thread_pool.as_ref(), || {
                    nndescent::build_knn_graph(storage, &nnd)
                })?
            }
        };

        let pool = self.thread_pool.as_ref();
        let nsg = &mut self.nsg;
        run_in_pool(pool, || nsg.build(storage, &seed))
    }

    /// Builds from a caller-supplied seed KNN graph instead of
    /// computing one; the vectors still flow through this call.
    pub fn build_from_knn_graph(&mut self, x: &[f32], seed: &KnnGraph) -> Result<()> {
        if self.nsg.is_built() || !self.storage.is_empty() {
            return Err(Error::Usage("NSG is already built".into()));
        }
        check_row_major(x, self.storage.dim())?;
        self.storage.add(x)?;

        let storage = self.storage.as_ref();
        let pool = self.thread_pool.as_ref();
        let nsg = &mut self.nsg;
        run_in_pool(pool, || nsg.build(storage, seed))
    }

    /// Batched top-k search. Unfilled slots carry `(-1, worst)`; an
    /// empty index returns all-sentinel rows. Inner-product results
    /// come back as positive similarities in descending order.
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

        let search_l = params
            .and_then(|p| p.search_l)
            .unwrap_or(self.nsg.params().search_l)
            .max(k);
        let selector = params.and_then(|p| p.selector);
        let storage = self.storage.as_ref();
        let nsg = &self.nsg;
        let ntotal = self.storage.len();
        let fetch = self.fetch_count.as_ref();
        let period = interrupt::period_hint(d * search_l);

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
                            let found = nsg
                                .search(dis.as_ref(), k, search_l, vt, &mut stats)
                                .unwrap_or_default();

                            let mut slot = 0usize;
                            for &(id, dist) in &found {
                                if let Some(accept) = selector {
                                    if !accept(id) {
                                        continue;
                                    }
                                }
                                label_row[slot] = i64::from(id);
                                dist_row[slot] = dist;
                                slot += 1;
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

    /// Clears the graph and the storage, allowing a fresh build.
    pub fn reset(&mut self) {
        self.nsg.reset();
        self.storage.reset();
    }

    /// Persists the link structure under `dir`. The storage is not
    /// persisted.
    pub fn save(&self, dir: &Path) -> Result<()> {
        save_bincode(&dir.join(NSG_GRAPH_FILE), &self.nsg.to_state())
    }

    /// Restores an index persisted by [`NsgIndex::save`] over a freshly
    /// supplied storage holding the same vectors.
    pub fn load(dir: &Path, storage: Box<dyn VectorStorage>, max_threads: usize) -> Result<Self> {
        let nsg = NsgGraph::from_state(load_bincode(&dir.join(NSG_GRAPH_FILE))?);
        if nsg.len() != storage.len() {
            return Err(Error::InvalidInput(format!(
                "persisted graph covers {} nodes, storage holds {}",
                nsg.len(),
                storage.len()
            )));
        }
        Ok(Self {
            storage,
            nsg,
            seed_builder: SeedBuilder::BruteForce,
            thread_pool: build_thread_pool(max_threads)?,
            fetch_count: None,
        })
    }

    /// Writes the per-node degree distribution of the built graph to
    /// `path`.
    pub fn save_degree_distribution(&self, path: &Path) -> Result<()> {
        self.nsg.save_degree_distribution(path)
    }
}

/// Brute-force seed: top-`gk + 1` assignment per vector with the query
/// vector itself removed by id, which stays correct for inner-product
/// ties where the self-match is not necessarily ranked first.
fn brute_force_seed(storage: &dyn VectorStorage, x: &[f32], gk: usize) -> Result<KnnGraph> {
    let n = storage.len();
    let mut data: Vec<NodeId> = Vec::new();
    data.try_reserve_exact(n * gk).map_err(|_| Error::Allocation {
        what: "seed knn graph",
        requested: n * gk * std::mem::size_of::<NodeId>(),
    })?;

    let assigned = storage.assign(x, gk + 1);
    for i in 0..n {
        let mut count = 0usize;
        for &id in &assigned[i * (gk + 1)..(i + 1) * (gk + 1)] {
            #[allow(clippy::cast_possible_wrap)]
            if id < 0 || id == i as i64 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            data.push(id as NodeId);
            count += 1;
            if count == gk {
                break;
            }
        }
        while count < gk {
            data.push(EMPTY_ID);
            count += 1;
        }
    }
    KnnGraph::new(n, gk, data)
}
