//! HNSW insertion: level draw, greedy descent and link construction.

use crate::distance::{DistanceComputer, SearchStats};
use crate::graph::{Graph, NodeId};
use crate::hnsw::{EdgePolicy, EntryPoint, HnswGraph};
use crate::select::occlusion_prune;
use crate::visited::VisitedTable;

// SAFETY of the casts in this module: node ids are non-negative by
// construction (the façade allocates them sequentially below i32::MAX).
#[allow(clippy::cast_sign_loss)]
impl HnswGraph {
    /// Inserts node `id` whose vector is the query installed on `dis`.
    ///
    /// Safe to call from multiple threads with distinct ids; each worker
    /// brings its own computer and visited table. The entry point is
    /// promoted last so a concurrent search never observes an entry
    /// whose rows are still empty.
    pub fn insert(
        &self,
        id: NodeId,
        dis: &dyn DistanceComputer,
        vt: &mut VisitedTable,
        stats: &mut SearchStats,
    ) {
        let level = self.random_level();
        self.prepare_node(id, level);

        let ep = {
            let mut entry = self.entry.write();
            match *entry {
                None => {
                    *entry = Some(EntryPoint { node: id, level });
                    return;
                }
                Some(ep) => ep,
            }
        };

        let mut cur = ep.node;
        for l in (level + 1..=ep.level).rev() {
            cur = self.greedy_descent(l, cur, dis, stats);
        }

        for l in (0..=level.min(ep.level)).rev() {
            if l == 0 && !self.init_level0 {
                break;
            }

            let pool = self.search_layer(l, &[cur], self.params.ef_construction, dis, vt, stats);
            let candidates: Vec<(NodeId, f32)> = pool
                .entries()
                .iter()
                .filter(|c| c.id != id)
                .map(|c| (c.id, c.dist))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let cap = self.cap(l);
            let (kept, pruned) = occlusion_prune(&candidates, cap, candidates.len(), &mut |a, b| {
                stats.ndis += 1;
                dis.symmetric_dis(a as usize, b as usize)
            });

            let mut row: Vec<NodeId> = kept.iter().map(|c| c.0).collect();
            if l == 0 && self.params.level0_policy == EdgePolicy::FillToCap {
                backfill(&mut row, &pruned, cap);
            }
            {
                let layers = self.layers.read();
                let mut own = layers[l].lock_row(id as usize);
                *own = row;
            }

            for &(neighbor, dist) in &kept {
                self.link_back(l, neighbor, id, dist, dis, stats);
            }

            cur = candidates[0].0;
        }

        if level > ep.level {
            let mut entry = self.entry.write();
            // Re-check: a concurrent inserter may have promoted further.
            if entry.map_or(true, |e| level > e.level) {
                *entry = Some(EntryPoint { node: id, level });
            }
        }
    }

    /// Allocates adjacency rows for levels `0..=level` and records the
    /// level assignment.
    #[allow(clippy::cast_possible_truncation)]
    fn prepare_node(&self, id: NodeId, level: usize) {
        let idx = id as usize;
        {
            let mut layers = self.layers.write();
            while layers.len() <= level {
                let l = layers.len();
                layers.push(Graph::new(0, self.cap(l)));
            }
            for layer in layers.iter_mut() {
                layer.ensure_capacity(idx);
            }
        }
        {
            let mut levels = self.levels.write();
            if levels.len() <= idx {
                levels.resize(idx + 1, 0);
            }
            levels[idx] = level as u8;
        }
    }

    /// Adds the reverse edge `neighbor -> new_id` under `neighbor`'s row
    /// lock, re-selecting when the row overflows its capacity.
    fn link_back(
        &self,
        level: usize,
        neighbor: NodeId,
        new_id: NodeId,
        dist: f32,
        dis: &dyn DistanceComputer,
        stats: &mut SearchStats,
    ) {
        let cap = self.cap(level);
        let layers = self.layers.read();
        let mut row = layers[level].lock_row(neighbor as usize);

        if row.contains(&new_id) {
            return;
        }
        if row.len() < cap {
            row.push(new_id);
            return;
        }

        let mut candidates: Vec<(NodeId, f32)> = row
            .iter()
            .map(|&j| {
                stats.ndis += 1;
                (j, dis.symmetric_dis(neighbor as usize, j as usize))
            })
            .collect();
        candidates.push((new_id, dist));
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let (kept, pruned) = occlusion_prune(&candidates, cap, candidates.len(), &mut |a, b| {
            stats.ndis += 1;
            dis.symmetric_dis(a as usize, b as usize)
        });

        let mut new_row: Vec<NodeId> = kept.iter().map(|c| c.0).collect();
        if level == 0 && self.params.level0_policy == EdgePolicy::FillToCap {
            backfill(&mut new_row, &pruned, cap);
        }
        *row = new_row;
    }
}

/// Pads `row` with pruned candidates, nearest first, up to `cap`.
fn backfill(row: &mut Vec<NodeId>, pruned: &[(NodeId, f32)], cap: usize) {
    for &(id, _) in pruned {
        if row.len() >= cap {
            break;
        }
        if !row.contains(&id) {
            row.push(id);
        }
    }
}
