//! Index façades: train/add/search surfaces over a storage plus a graph
//! engine.
//!
//! The façades own their storage (ownership transfer at construction,
//! no ownership flag), batch queries through a shared rayon pool sized
//! by the `max_threads` knob fixed at construction, poll the global
//! interrupt callback between query chunks, and translate the engines'
//! minimize-only distances back to the caller's metric on output.

mod hnsw_index;
mod nsg_index;
mod persistence;

pub use hnsw_index::HnswIndex;
pub use nsg_index::{NsgIndex, SeedBuilder};

use crate::error::{Error, Result};
use crate::hnsw::IdSelector;

/// Per-call search options. Anything left unset falls back to the
/// index's construction-time defaults.
#[derive(Default)]
pub struct SearchParams<'a> {
    /// Dynamic candidate list size for HNSW searches.
    pub ef_search: Option<usize>,
    /// Candidate list length for NSG searches.
    pub search_l: Option<usize>,
    /// Optional filter over node ids; rejected ids are dropped from the
    /// result set (traversal is unrestricted).
    pub selector: Option<IdSelector<'a>>,
}

/// Row-major `n × k` search output. Unfilled slots carry the sentinel
/// id `-1` and the metric's worst distance (`+∞` for L2, `-∞` for
/// inner product).
pub struct SearchResults {
    /// Requested result count per query.
    pub k: usize,
    /// Result ids, `-1` for unfilled slots.
    pub labels: Vec<i64>,
    /// Result distances (L2) or similarities (inner product).
    pub distances: Vec<f32>,
}

impl SearchResults {
    pub(crate) fn sentinel(nq: usize, k: usize) -> Self {
        Self {
            k,
            labels: vec![-1i64; nq * k],
            distances: vec![f32::INFINITY; nq * k],
        }
    }

    /// Labels and distances of query `i`.
    #[must_use]
    pub fn row(&self, i: usize) -> (&[i64], &[f32]) {
        (
            &self.labels[i * self.k..(i + 1) * self.k],
            &self.distances[i * self.k..(i + 1) * self.k],
        )
    }
}

/// Builds the dedicated rayon pool for a `max_threads` knob; `0` means
/// the global pool.
pub(crate) fn build_thread_pool(max_threads: usize) -> Result<Option<rayon::ThreadPool>> {
    if max_threads == 0 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("thread pool construction failed: {e}")))
}

/// Runs `f` inside the dedicated pool when one exists.
pub(crate) fn run_in_pool<R: Send>(
    pool: Option<&rayon::ThreadPool>,
    f: impl FnOnce() -> R + Send,
) -> R {
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

/// Validates a single query vector against the index dimensionality.
pub(crate) fn check_query_dim(query: &[f32], expected: usize) -> Result<()> {
    if query.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            got: query.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_results_shape() {
        let results = SearchResults::sentinel(3, 2);
        assert_eq!(results.labels, vec![-1i64; 6]);
        assert!(results.distances.iter().all(|d| d.is_infinite()));
        let (labels, distances) = results.row(1);
        assert_eq!(labels.len(), 2);
        assert_eq!(distances.len(), 2);
    }

    #[test]
    fn test_thread_pool_knob() {
        assert!(build_thread_pool(0).unwrap().is_none());
        let pool = build_thread_pool(2).unwrap().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }

    #[test]
    fn test_query_dim_check() {
        assert!(check_query_dim(&[0.0; 4], 4).is_ok());
        assert!(matches!(
            check_query_dim(&[0.0; 3], 4),
            Err(Error::DimensionMismatch {
                expected: 4,
                got: 3
            })
        ));
    }
}
