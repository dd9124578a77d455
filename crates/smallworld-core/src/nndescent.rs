//! NNDescent companion builder for NSG seed graphs.
//!
//! Iterative neighbor-of-neighbor refinement: every node keeps a
//! bounded pool of nearest candidates, and each round joins newly
//! discovered candidates against each other so good neighbors propagate
//! through the graph. Converges to an approximate KNN graph without any
//! exhaustive scan.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{NodeId, EMPTY_ID};
use crate::nsg::KnnGraph;
use crate::storage::{engine_distance_computer, VectorStorage};

/// NNDescent tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct NnDescentParams {
    /// Fanout of the produced seed graph.
    pub k: usize,
    /// Sample size per round: how many new candidates each node joins.
    pub s: usize,
    /// Cap on old candidates joined against the new sample.
    pub r: usize,
    /// Candidate pool length per node (at least `k`).
    pub l: usize,
    /// Refinement rounds.
    pub iters: usize,
    /// PRNG seed for pool initialization.
    pub seed: u64,
}

impl NnDescentParams {
    /// Conventional defaults for a seed graph of fanout `k`.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            s: 10,
            r: 100,
            l: k + 50,
            iters: 10,
            seed: 0x1998,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    id: NodeId,
    dist: f32,
    is_new: bool,
}

/// Sorted bounded insertion; returns false for duplicates and
/// candidates worse than a full pool's tail.
fn insert_bounded(row: &mut Vec<PoolEntry>, candidate: PoolEntry, cap: usize) -> bool {
    if row.iter().any(|e| e.id == candidate.id) {
        return false;
    }
    if row.len() >= cap {
        if let Some(last) = row.last() {
            if (candidate.dist, candidate.id) >= (last.dist, last.id) {
                return false;
            }
        }
    }
    let pos = row.partition_point(|e| (e.dist, e.id) < (candidate.dist, candidate.id));
    row.insert(pos, candidate);
    if row.len() > cap {
        row.pop();
    }
    true
}

/// Builds an `n × k` seed KNN graph over the storage.
pub fn build_knn_graph(
    storage: &dyn VectorStorage,
    params: &NnDescentParams,
) -> Result<KnnGraph> {
    let n = storage.len();
    if n == 0 {
        return Err(Error::Usage("nndescent over an empty storage".into()));
    }
    let k = params.k;
    let cap = params.l.max(k);

    let mut data: Vec<NodeId> = Vec::new();
    data.try_reserve_exact(n * k).map_err(|_| Error::Allocation {
        what: "seed knn graph",
        requested: n * k * std::mem::size_of::<NodeId>(),
    })?;

    let pools: Vec<RwLock<Vec<PoolEntry>>> =
        (0..n).map(|_| RwLock::new(Vec::with_capacity(cap + 1))).collect();

    // Random bootstrap: each node starts with `s` arbitrary candidates.
    (0..n).into_par_iter().for_each_init(
        || engine_distance_computer(storage),
        |dis, i| {
            let mut rng =
                StdRng::seed_from_u64(
                    params.seed.wrapping_add((i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
                );
            let mut row = pools[i].write();
            let want = params.s.min(n - 1);
            let mut attempts = 0;
            while row.len() < want && attempts < want * 8 {
                attempts += 1;
                let j = rng.gen_range(0..n);
                if j == i {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let entry = PoolEntry {
                    id: j as NodeId,
                    dist: dis.symmetric_dis(i, j),
                    is_new: true,
                };
                insert_bounded(&mut row, entry, cap);
            }
        },
    );

    for iter in 0..params.iters {
        let updates = AtomicUsize::new(0);

        (0..n).into_par_iter().for_each_init(
            || engine_distance_computer(storage),
            |dis, i| {
                // Split the pool into a fresh sample and settled
                // candidates; sampled entries stop counting as new.
                let (new_ids, old_ids) = {
                    let mut row = pools[i].write();
                    let mut new_ids = Vec::with_capacity(params.s);
                    let mut old_ids = Vec::with_capacity(params.r.min(row.len()));
                    for entry in row.iter_mut() {
                        if entry.is_new && new_ids.len() < params.s {
                            entry.is_new = false;
                            new_ids.push(entry.id);
                        } else if !entry.is_new && old_ids.len() < params.r {
                            old_ids.push(entry.id);
                        }
                    }
                    (new_ids, old_ids)
                };

                let mut local_updates = 0usize;
                #[allow(clippy::cast_sign_loss)]
                let mut join = |a: NodeId, b: NodeId| {
                    let dist = dis.symmetric_dis(a as usize, b as usize);
                    let inserted_a = insert_bounded(
                        &mut pools[a as usize].write(),
                        PoolEntry {
                            id: b,
                            dist,
                            is_new: true,
                        },
                        cap,
                    );
                    let inserted_b = insert_bounded(
                        &mut pools[b as usize].write(),
                        PoolEntry {
                            id: a,
                            dist,
                            is_new: true,
                        },
                        cap,
                    );
                    local_updates += usize::from(inserted_a) + usize::from(inserted_b);
                };

                for (ai, &a) in new_ids.iter().enumerate() {
                    for &b in &new_ids[ai + 1..] {
                        join(a, b);
                    }
                    for &b in &old_ids {
                        if a != b {
                            join(a, b);
                        }
                    }
                }
                updates.fetch_add(local_updates, Ordering::Relaxed);
            },
        );

        let total = updates.load(Ordering::Relaxed);
        debug!(iter, updates = total, "nndescent round");
        #[allow(clippy::cast_precision_loss)]
        if (total as f64) <= 0.001 * (n * k) as f64 {
            break;
        }
    }

    for pool in &pools {
        let row = pool.read();
        for slot in 0..k {
            data.push(row.get(slot).map_or(EMPTY_ID, |e| e.id));
        }
    }
    KnnGraph::new(n, k, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FlatStorage;
    use crate::Metric;

    fn clustered_storage(n: usize, d: usize) -> FlatStorage {
        let mut storage = FlatStorage::new(d, Metric::L2);
        for i in 0..n {
            let v: Vec<f32> = (0..d)
                .map(|j| ((i * d + j) as f32 * 0.43).sin() * 2.0)
                .collect();
            storage.add(&v).unwrap();
        }
        storage
    }

    #[test]
    fn test_seed_graph_shape_and_validity() {
        let storage = clustered_storage(120, 6);
        let params = NnDescentParams::new(12);
        let seed = build_knn_graph(&storage, &params).unwrap();

        assert_eq!(seed.n(), 120);
        assert_eq!(seed.k(), 12);

        // The refined graph must be overwhelmingly valid: in-range ids,
        // no self-loops, few empty slots.
        let mut invalid = 0;
        for i in 0..120 {
            for &id in seed.row(i) {
                if id < 0 || id >= 120 || id as usize == i {
                    invalid += 1;
                }
            }
        }
        assert!(invalid < 12, "too many invalid seed entries: {invalid}");
    }

    #[test]
    fn test_refinement_approaches_brute_force() {
        let storage = clustered_storage(100, 4);
        let params = NnDescentParams::new(8);
        let seed = build_knn_graph(&storage, &params).unwrap();

        // Compare node 0's refined neighbors against the brute-force
        // top-8; NNDescent should recover most of them.
        let mut q = vec![0.0f32; 4];
        storage.reconstruct(0, &mut q);
        let truth = storage.assign(&q, 9);
        let truth: Vec<i32> = truth
            .iter()
            .filter(|&&id| id != 0)
            .map(|&id| id as i32)
            .take(8)
            .collect();

        let found = seed.row(0);
        let hits = truth.iter().filter(|id| found.contains(id)).count();
        assert!(hits >= 5, "recall too low: {hits}/8");
    }

    #[test]
    fn test_empty_storage_is_usage_error() {
        let storage = FlatStorage::new(4, Metric::L2);
        let params = NnDescentParams::new(8);
        assert!(matches!(
            build_knn_graph(&storage, &params),
            Err(Error::Usage(_))
        ));
    }
}
