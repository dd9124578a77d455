//! NSG construction: medoid selection, occlusion-pruned linking,
//! reverse edges and connectivity repair.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::distance::{DistanceComputer, SearchStats};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, EMPTY_ID};
use crate::nsg::{Edge, KnnGraph, NsgGraph};
use crate::select::occlusion_prune;
use crate::storage::{engine_distance_computer, VectorStorage};
use crate::visited::VisitedTable;

/// Scratch graph carrying edge lengths while rows are still being
/// pruned and reverse-linked. One lock per row.
struct BuildGraph {
    rows: Vec<RwLock<Vec<Edge>>>,
}

impl BuildGraph {
    fn new(n: usize) -> Self {
        Self {
            rows: (0..n).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }
}

impl NsgGraph {
    /// One-shot build over the vectors already present in `storage`,
    /// refining the `knn` seed graph. Fails when the graph was already
    /// built or the seed graph is malformed.
    pub fn build(&mut self, storage: &dyn VectorStorage, knn: &KnnGraph) -> Result<()> {
        if self.is_built || self.ntotal != 0 {
            return Err(Error::Usage("NSG is already built".into()));
        }
        let n = storage.len();
        if n == 0 {
            return Err(Error::Usage("NSG build on an empty storage".into()));
        }
        if knn.n() != n {
            return Err(Error::InvalidInput(format!(
                "seed graph covers {} nodes, storage holds {n}",
                knn.n()
            )));
        }
        self.check_knn_graph(knn)?;

        let params = self.params;
        info!(
            r = params.r,
            l = params.l,
            c = params.c,
            n,
            "building nsg graph"
        );

        self.ntotal = n;
        self.init_enterpoint(storage, knn);
        debug!(enterpoint = self.enterpoint, "medoid selected");

        let build = BuildGraph::new(n);
        self.link(storage, knn, &build);
        self.add_reverse_links_all(storage, &build);

        let graph = Graph::try_new(n, params.r)?;
        let mut degrees = vec![0usize; n];
        for (i, degree) in degrees.iter_mut().enumerate() {
            let row: Vec<NodeId> = build.rows[i].read().iter().map(|e| e.id).collect();
            *degree = row.len();
            graph.set_neighbors(i, row);
        }
        drop(build);

        let attached = self.tree_grow(&graph, storage, &mut degrees)?;
        Self::check_graph(&graph, n)?;
        self.graph = Some(graph);
        self.is_built = true;

        let max = degrees.iter().copied().max().unwrap_or(0);
        let min = degrees.iter().copied().min().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let avg = degrees.iter().sum::<usize>() as f64 / n as f64;
        info!(max, min, avg, attached, "nsg build done");
        Ok(())
    }

    /// Rejects seed graphs whose invalid-entry count (self-loops,
    /// out-of-range ids, empty slots) exceeds the configured fraction
    /// of the node count.
    #[allow(clippy::cast_possible_wrap)]
    fn check_knn_graph(&self, knn: &KnnGraph) -> Result<()> {
        let n = knn.n();
        let invalid: usize = (0..n)
            .into_par_iter()
            .map(|i| {
                knn.row(i)
                    .iter()
                    .filter(|&&id| id < 0 || id >= n as NodeId || id == i as NodeId)
                    .count()
            })
            .sum();

        #[allow(clippy::cast_precision_loss)]
        let limit = (n as f64 * f64::from(self.params.max_invalid_fraction)) as usize;
        if invalid >= limit.max(1) {
            tracing::warn!(invalid, total = n, "seed knn graph rejected");
            return Err(Error::InvalidKnnGraph { invalid, total: n });
        }
        Ok(())
    }

    /// Picks the medoid: the node nearest to the dataset centroid,
    /// located by a graph search over the seed from a random start.
    fn init_enterpoint(&mut self, storage: &dyn VectorStorage, knn: &KnnGraph) {
        let n = self.ntotal;
        let d = storage.dim();

        let mut center = vec![0.0f64; d];
        let mut buf = vec![0.0f32; d];
        for i in 0..n {
            storage.reconstruct(i, &mut buf);
            for (c, &v) in center.iter_mut().zip(&buf) {
                *c += f64::from(v);
            }
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let center: Vec<f32> = center.iter().map(|&c| (c / n as f64) as f32).collect();

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let start = rng.gen_range(0..n) as NodeId;

        let mut dis = engine_distance_computer(storage);
        dis.set_query(&center);
        let mut vt = VisitedTable::new(n);
        let mut stats = SearchStats::default();
        let pool = self.search_on_graph(
            knn,
            dis.as_ref(),
            &mut vt,
            start,
            self.params.l,
            None,
            &mut stats,
        );

        self.enterpoint = if pool.is_empty() { start } else { pool.get(0).id };
    }

    /// Parallel link pass: for every node, search the seed graph from
    /// the enterpoint collecting the full visited set, then prune it
    /// into the node's row. Each worker owns its visited table and
    /// distance computer.
    fn link(&self, storage: &dyn VectorStorage, knn: &KnnGraph, build: &BuildGraph) {
        let n = self.ntotal;
        let d = storage.dim();

        (0..n).into_par_iter().for_each_init(
            || {
                (
                    engine_distance_computer(storage),
                    VisitedTable::new(n),
                    vec![0.0f32; d],
                )
            },
            |(dis, vt, buf), i| {
                storage.reconstruct(i, buf);
                dis.set_query(buf);

                let mut stats = SearchStats::default();
                let mut fullset = Vec::new();
                let _ = self.search_on_graph(
                    knn,
                    dis.as_ref(),
                    vt,
                    self.enterpoint,
                    self.params.l,
                    Some(&mut fullset),
                    &mut stats,
                );

                self.sync_prune(i, &mut fullset, dis.as_ref(), vt, knn, build);
                vt.advance();
            },
        );
    }

    /// Occlusion-rule pruning of one node's candidate pool into its
    /// row. The pool is the search's visited set, topped up with seed
    /// neighbors the search never reached; the query node itself is
    /// dropped by id so inner-product ties cannot smuggle it back in.
    fn sync_prune(
        &self,
        q: usize,
        pool: &mut Vec<Edge>,
        dis: &dyn DistanceComputer,
        vt: &VisitedTable,
        knn: &KnnGraph,
        build: &BuildGraph,
    ) {
        let n = self.ntotal;
        for &id in knn.row(q) {
            #[allow(clippy::cast_sign_loss)]
            let idx = id as usize;
            if id < 0 || idx >= n || vt.get(idx) {
                continue;
            }
            pool.push(Edge {
                id,
                dist: dis.symmetric_dis(q, idx),
            });
        }

        #[allow(clippy::cast_possible_wrap)]
        pool.retain(|e| e.id != q as NodeId);
        pool.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.id.cmp(&b.id)));
        if pool.is_empty() {
            return;
        }

        let candidates: Vec<(NodeId, f32)> = pool.iter().map(|e| (e.id, e.dist)).collect();
        #[allow(clippy::cast_sign_loss)]
        let mut sym = |a: NodeId, b: NodeId| dis.symmetric_dis(a as usize, b as usize);
        let (kept, _) = occlusion_prune(&candidates, self.params.r, self.params.c, &mut sym);

        *build.rows[q].write() = kept
            .iter()
            .map(|&(id, dist)| Edge { id, dist })
            .collect();
    }

    /// Parallel reverse pass: every accepted edge `q -> c` also inserts
    /// `c -> q` under `c`'s row lock, re-pruning rows that overflow.
    fn add_reverse_links_all(&self, storage: &dyn VectorStorage, build: &BuildGraph) {
        let n = self.ntotal;
        (0..n).into_par_iter().for_each_init(
            || engine_distance_computer(storage),
            |dis, q| self.add_reverse_links(q, dis.as_ref(), build),
        );
    }

    fn add_reverse_links(&self, q: usize, dis: &dyn DistanceComputer, build: &BuildGraph) {
        let r = self.params.r;
        let own: Vec<Edge> = build.rows[q].read().clone();

        for edge in own {
            #[allow(clippy::cast_sign_loss)]
            let des = edge.id as usize;
            #[allow(clippy::cast_possible_wrap)]
            let reverse = Edge {
                id: q as NodeId,
                dist: edge.dist,
            };

            let mut row = build.rows[des].write();
            if row.iter().any(|e| e.id == reverse.id) {
                continue;
            }
            if row.len() < r {
                row.push(reverse);
                continue;
            }

            let mut union: Vec<Edge> = row.clone();
            union.push(reverse);
            union.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.id.cmp(&b.id)));
            let candidates: Vec<(NodeId, f32)> =
                union.iter().map(|e| (e.id, e.dist)).collect();
            #[allow(clippy::cast_sign_loss)]
            let mut sym = |a: NodeId, b: NodeId| dis.symmetric_dis(a as usize, b as usize);
            let (kept, _) = occlusion_prune(&candidates, r, candidates.len(), &mut sym);
            *row = kept
                .iter()
                .map(|&(id, dist)| Edge { id, dist })
                .collect();
        }
    }

    /// Repairs connectivity: DFS from the enterpoint, attach the first
    /// unreached node to a reached one with spare capacity, repeat
    /// until one component remains. Returns the number of attachments.
    fn tree_grow(
        &self,
        graph: &Graph,
        storage: &dyn VectorStorage,
        degrees: &mut [usize],
    ) -> Result<usize> {
        let n = self.ntotal;
        let mut vt = VisitedTable::new(n);
        let mut vt2 = VisitedTable::new(n);
        let mut rng = StdRng::seed_from_u64(self.params.seed ^ 0x9E37_79B9);

        let mut root = self.enterpoint;
        let mut reached = 0usize;
        let mut attached = 0usize;
        loop {
            reached = self.dfs(graph, &mut vt, root, reached);
            if reached >= n {
                break;
            }
            root = self.attach_unlinked(graph, storage, &mut vt, &mut vt2, degrees, &mut rng)?;
            if root == EMPTY_ID {
                break;
            }
            vt2.advance();
            attached += 1;
        }
        debug!(attached, "connectivity repair finished");
        Ok(attached)
    }

    /// Iterative DFS accumulating the count of newly reached nodes.
    pub(crate) fn dfs(
        &self,
        graph: &Graph,
        vt: &mut VisitedTable,
        root: NodeId,
        mut count: usize,
    ) -> usize {
        if root < 0 {
            return count;
        }
        #[allow(clippy::cast_sign_loss)]
        let mut node = root as usize;
        let mut stack = vec![node];
        if !vt.get(node) {
            count += 1;
        }
        vt.set(node);

        while !stack.is_empty() {
            let mut next = None;
            #[allow(clippy::cast_sign_loss)]
            for id in graph.neighbors(node) {
                if !vt.get(id as usize) {
                    next = Some(id as usize);
                    break;
                }
            }

            match next {
                None => {
                    stack.pop();
                    match stack.last() {
                        Some(&top) => node = top,
                        None => break,
                    }
                }
                Some(next) => {
                    node = next;
                    vt.set(node);
                    stack.push(node);
                    count += 1;
                }
            }
        }
        count
    }

    /// Attaches one unreached node: find it, search the built graph for
    /// its neighborhood, link it from the nearest reached node whose
    /// row has room. Falls back to a random reached node, and past that
    /// grows the nearest row beyond its nominal bound.
    fn attach_unlinked(
        &self,
        graph: &Graph,
        storage: &dyn VectorStorage,
        vt: &mut VisitedTable,
        vt2: &mut VisitedTable,
        degrees: &mut [usize],
        rng: &mut StdRng,
    ) -> Result<NodeId> {
        let n = self.ntotal;
        let r = self.params.r;

        let Some(id) = (0..n).find(|&i| !vt.get(i)) else {
            return Ok(EMPTY_ID);
        };

        let mut buf = vec![0.0f32; storage.dim()];
        storage.reconstruct(id, &mut buf);
        let mut dis = engine_distance_computer(storage);
        dis.set_query(&buf);

        let mut stats = SearchStats::default();
        let mut fullset = Vec::new();
        let _ = self.search_on_graph(
            graph,
            dis.as_ref(),
            vt2,
            self.enterpoint,
            self.params.search_l,
            Some(&mut fullset),
            &mut stats,
        );
        fullset.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.id.cmp(&b.id)));

        // Nearest reached node with spare capacity.
        #[allow(clippy::cast_sign_loss)]
        let mut target = fullset
            .iter()
            .map(|e| e.id as usize)
            .find(|&c| vt.get(c) && degrees[c] < r && c != id);

        if target.is_none() {
            for _ in 0..n.saturating_mul(10) {
                let candidate = rng.gen_range(0..n);
                if vt.get(candidate) && degrees[candidate] < r && candidate != id {
                    target = Some(candidate);
                    break;
                }
            }
        }

        // Every reached row is full: grow the nearest reached one past
        // its nominal bound rather than losing the component.
        let target = match target {
            Some(t) => t,
            None => {
                #[allow(clippy::cast_sign_loss)]
                let nearest = fullset
                    .iter()
                    .map(|e| e.id as usize)
                    .find(|&c| vt.get(c) && c != id)
                    .or_else(|| (0..n).find(|&c| vt.get(c) && c != id));
                nearest.ok_or_else(|| {
                    Error::InvalidInput("connectivity repair found no reached node".into())
                })?
            }
        };

        {
            #[allow(clippy::cast_possible_wrap)]
            graph.lock_row(target).push(id as NodeId);
        }
        degrees[target] += 1;

        #[allow(clippy::cast_possible_wrap)]
        let attached_to = target as NodeId;
        Ok(attached_to)
    }

    /// Validates every edge of the built graph before publishing it.
    fn check_graph(graph: &Graph, n: usize) -> Result<()> {
        for i in 0..n {
            for id in graph.neighbors(i) {
                #[allow(clippy::cast_possible_wrap)]
                if id < 0 || id >= n as NodeId {
                    return Err(Error::InvalidInput(format!(
                        "built graph carries edge {i} -> {id} outside [0, {n})"
                    )));
                }
            }
        }
        Ok(())
    }
}
