//! Vector storage contract consumed by the graph engines.
//!
//! A storage owns the vector set, addressed by contiguous ids in
//! `[0, len)`, and hands out per-query [`DistanceComputer`]s. The graph
//! machinery never touches raw vectors except through this contract, so
//! the encoding (flat f32, scalar-quantized, product-quantized) is
//! swappable under both engines.

mod flat;
mod pq;
mod sq;

pub use flat::FlatStorage;
pub use pq::PqStorage;
pub use sq::SqStorage;

use rayon::prelude::*;

use crate::distance::{DistanceComputer, Metric, NegatedDistanceComputer};
use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::pool::SearchPool;

/// Materializes vectors and answers pairwise distance queries.
///
/// Vectors are immutable once added; the storage is read-only while any
/// search or build is in flight.
pub trait VectorStorage: Send + Sync {
    /// Vector dimensionality.
    fn dim(&self) -> usize;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    /// True when no vectors are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metric this storage computes distances under.
    fn metric(&self) -> Metric;

    /// Whether the storage is ready to accept vectors.
    fn is_trained(&self) -> bool {
        true
    }

    /// Trains the encoding on sample vectors. A no-op for encodings
    /// without a codebook.
    fn train(&mut self, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    /// Appends vectors given as a row-major f32 buffer.
    fn add(&mut self, x: &[f32]) -> Result<()>;

    /// Removes all vectors, keeping the training state of the encoding.
    fn reset(&mut self);

    /// Decodes vector `id` into `out` (exact for flat storage, within the
    /// encoding's documented error otherwise).
    fn reconstruct(&self, id: usize, out: &mut [f32]);

    /// Brute-force top-`k` assignment of each query to stored vectors,
    /// row-major `queries.len() / dim` by `k`, padded with `-1`.
    fn assign(&self, queries: &[f32], k: usize) -> Vec<i64>;

    /// A fresh per-query computer. Each worker obtains its own; computers
    /// are never shared between threads.
    fn distance_computer(&self) -> Box<dyn DistanceComputer + Send + '_>;
}

/// Engine-facing computer: negates similarity metrics so the graph
/// engines always minimize a scalar.
pub fn engine_distance_computer<'a>(
    storage: &'a (dyn VectorStorage + 'a),
) -> Box<dyn DistanceComputer + Send + 'a> {
    let computer = storage.distance_computer();
    if storage.metric().is_similarity() {
        Box::new(NegatedDistanceComputer::new(computer))
    } else {
        computer
    }
}

/// Exhaustive top-`k` scan shared by the storage backends' `assign`
/// implementations. Parallel over queries; ordering is engine-domain
/// (nearest under L2, most similar under inner product).
pub fn brute_force_assign(storage: &dyn VectorStorage, queries: &[f32], k: usize) -> Vec<i64> {
    let d = storage.dim();
    let ntotal = storage.len();
    let nq = if d == 0 { 0 } else { queries.len() / d };
    let mut out = vec![-1i64; nq * k];

    out.par_chunks_mut(k)
        .enumerate()
        .for_each_init(
            || engine_distance_computer(storage),
            |dis, (qi, row)| {
                dis.set_query(&queries[qi * d..(qi + 1) * d]);
                let mut pool = SearchPool::new(k);
                for i in 0..ntotal {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    pool.insert(i as NodeId, dis.dist_to_query(i));
                }
                for (slot, candidate) in row.iter_mut().zip(pool.entries()) {
                    *slot = i64::from(candidate.id);
                }
            },
        );

    out
}

/// Validates that a row-major buffer holds whole vectors of dimension `d`.
pub(crate) fn check_row_major(x: &[f32], d: usize) -> Result<usize> {
    if d == 0 || x.len() % d != 0 {
        return Err(Error::InvalidInput(format!(
            "buffer length {} is not a multiple of dimension {d}",
            x.len()
        )));
    }
    Ok(x.len() / d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brute_force_assign_l2() {
        let mut storage = FlatStorage::new(2, Metric::L2);
        storage
            .add(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 2.0, 2.0])
            .unwrap();

        let out = storage.assign(&[0.1, 0.0], 2);
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn test_brute_force_assign_pads_with_sentinel() {
        let mut storage = FlatStorage::new(2, Metric::L2);
        storage.add(&[0.0, 0.0]).unwrap();

        let out = storage.assign(&[0.0, 0.0], 3);
        assert_eq!(out, vec![0, -1, -1]);
    }

    #[test]
    fn test_assign_inner_product_prefers_similarity() {
        let mut storage = FlatStorage::new(2, Metric::InnerProduct);
        storage.add(&[1.0, 0.0, 10.0, 0.0, -1.0, 0.0]).unwrap();

        // Highest inner product with (1, 0) is vector 1.
        let out = storage.assign(&[1.0, 0.0], 1);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn test_check_row_major() {
        assert_eq!(check_row_major(&[0.0; 8], 4).unwrap(), 2);
        assert!(check_row_major(&[0.0; 7], 4).is_err());
        assert!(check_row_major(&[], 0).is_err());
    }
}
