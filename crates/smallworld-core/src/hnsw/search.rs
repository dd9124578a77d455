//! HNSW search: greedy descent, bounded best-first traversal, k-NN,
//! range and base-level-only entry paths.

use crate::distance::{DistanceComputer, SearchStats};
use crate::graph::NodeId;
use crate::hnsw::HnswGraph;
use crate::pool::SearchPool;
use crate::visited::VisitedTable;

/// Optional filter over node ids applied to search results.
pub type IdSelector<'a> = &'a (dyn Fn(NodeId) -> bool + Sync);

// SAFETY of the casts in this module: ids stored in adjacency rows are
// non-negative by construction.
#[allow(clippy::cast_sign_loss)]
impl HnswGraph {
    /// Top-k search for the query installed on `dis`, using a dynamic
    /// candidate list of `max(ef, k)`. An empty graph returns no
    /// results (not an error).
    #[must_use]
    pub fn search(
        &self,
        dis: &dyn DistanceComputer,
        k: usize,
        ef: usize,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
        selector: Option<IdSelector<'_>>,
    ) -> Vec<(NodeId, f32)> {
        let Some(ep) = *self.entry.read() else {
            return Vec::new();
        };

        let mut cur = ep.node;
        for level in (1..=ep.level).rev() {
            cur = self.greedy_descent(level, cur, dis, stats);
        }

        let pool = self.search_layer(0, &[cur], ef.max(k), dis, vt, stats);
        top_k(&pool, k, selector)
    }

    /// Base-level-only search: the best of `entries` becomes the entry
    /// point and only level 0 is traversed. Used when upper levels were
    /// never built (externally imported base graphs).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn search_base_level(
        &self,
        entries: &[NodeId],
        dis: &dyn DistanceComputer,
        k: usize,
        ef: usize,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
        selector: Option<IdSelector<'_>>,
    ) -> Vec<(NodeId, f32)> {
        if self.is_empty() || entries.is_empty() {
            return Vec::new();
        }

        let mut best = entries[0];
        stats.ndis += 1;
        let mut best_d = dis.dist_to_query(best as usize);
        for &e in &entries[1..] {
            stats.ndis += 1;
            let d = dis.dist_to_query(e as usize);
            if d < best_d {
                best = e;
                best_d = d;
            }
        }

        let pool = self.search_layer(0, &[best], ef.max(k), dis, vt, stats);
        top_k(&pool, k, selector)
    }

    /// Radius search at level 0. Every evaluated node within `radius`
    /// (engine domain) is accumulated; the result set has no `k` cap.
    #[must_use]
    pub fn range_search(
        &self,
        dis: &dyn DistanceComputer,
        radius: f32,
        ef: usize,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
    ) -> Vec<(NodeId, f32)> {
        let Some(ep) = *self.entry.read() else {
            return Vec::new();
        };

        let mut cur = ep.node;
        for level in (1..=ep.level).rev() {
            cur = self.greedy_descent(level, cur, dis, stats);
        }

        let mut results = Vec::new();
        let mut pool = SearchPool::new(ef.max(16));
        vt.ensure_capacity(self.len());

        let start = cur as usize;
        vt.set(start);
        stats.ndis += 1;
        let d = dis.dist_to_query(start);
        pool.insert(cur, d);
        if d <= radius {
            results.push((cur, d));
        }

        let layers = self.layers.read();
        let base = &layers[0];
        while let Some(pos) = pool.first_unexpanded() {
            pool.mark_expanded(pos);
            let node = pool.get(pos).id as usize;
            for nb in base.neighbors(node) {
                let ni = nb as usize;
                if vt.get(ni) {
                    continue;
                }
                vt.set(ni);
                stats.ndis += 1;
                let d = dis.dist_to_query(ni);
                if d <= radius {
                    results.push((nb, d));
                }
                pool.insert(nb, d);
            }
        }
        drop(layers);
        vt.advance();

        results.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        results
    }

    /// Greedy walk on one level: repeatedly moves to the neighbor
    /// nearest to the query until no neighbor improves.
    pub(crate) fn greedy_descent(
        &self,
        level: usize,
        start: NodeId,
        dis: &dyn DistanceComputer,
        stats: &mut SearchStats,
    ) -> NodeId {
        let layers = self.layers.read();
        let layer = &layers[level];

        let mut best = start;
        stats.ndis += 1;
        let mut best_d = dis.dist_to_query(start as usize);

        loop {
            let mut improved = false;
            for nb in layer.neighbors(best as usize) {
                stats.ndis += 1;
                let d = dis.dist_to_query(nb as usize);
                if d < best_d {
                    best = nb;
                    best_d = d;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
        best
    }

    /// Bounded best-first traversal of one level with candidate list
    /// capacity `ef`. Terminates when no unexpanded candidate remains.
    pub(crate) fn search_layer(
        &self,
        level: usize,
        entries: &[NodeId],
        ef: usize,
        dis: &dyn DistanceComputer,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
    ) -> SearchPool {
        let mut pool = SearchPool::new(ef.max(1));
        vt.ensure_capacity(self.len());

        for &e in entries {
            if e < 0 {
                continue;
            }
            let ei = e as usize;
            if vt.get(ei) {
                continue;
            }
            vt.set(ei);
            stats.ndis += 1;
            pool.insert(e, dis.dist_to_query(ei));
        }

        let layers = self.layers.read();
        let layer = &layers[level];
        while let Some(pos) = pool.first_unexpanded() {
            pool.mark_expanded(pos);
            let node = pool.get(pos).id as usize;
            for nb in layer.neighbors(node) {
                let ni = nb as usize;
                if vt.get(ni) {
                    continue;
                }
                vt.set(ni);
                stats.ndis += 1;
                pool.insert(nb, dis.dist_to_query(ni));
            }
        }
        drop(layers);

        vt.advance();
        pool
    }
}

fn top_k(
    pool: &SearchPool,
    k: usize,
    selector: Option<IdSelector<'_>>,
) -> Vec<(NodeId, f32)> {
    pool.entries()
        .iter()
        .filter(|c| selector.map_or(true, |accept| accept(c.id)))
        .take(k)
        .map(|c| (c.id, c.dist))
        .collect()
}
