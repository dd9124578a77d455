//! Distance metrics and the per-query distance computer contract.
//!
//! Inside the graph engines every comparison is a minimization: for the
//! inner-product metric the engine-facing computer negates similarities so
//! that smaller is always better, and the façade re-negates on output.

use serde::{Deserialize, Serialize};

/// Distance metric used for vector similarity computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Squared Euclidean distance. Lower is better.
    L2,
    /// Inner product. Higher is better; engines negate internally.
    InnerProduct,
}

impl Metric {
    /// Returns true when larger raw values mean more similar vectors.
    #[must_use]
    pub fn is_similarity(self) -> bool {
        matches!(self, Metric::InnerProduct)
    }
}

/// Squared Euclidean distance between two equal-length slices.
#[must_use]
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dimension mismatch in l2_sq");

    let chunks = a.len() / 4;
    let mut acc = [0.0f32; 4];
    for i in 0..chunks {
        let base = i * 4;
        for j in 0..4 {
            let d = a[base + j] - b[base + j];
            acc[j] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Inner product of two equal-length slices.
#[must_use]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dimension mismatch in inner_product");

    let chunks = a.len() / 4;
    let mut acc = [0.0f32; 4];
    for i in 0..chunks {
        let base = i * 4;
        for j in 0..4 {
            acc[j] += a[base + j] * b[base + j];
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Per-query, per-thread adapter over a storage that answers
/// query-to-vector and vector-to-vector distances.
///
/// A computer is bound to one storage and one worker; it is never shared
/// between threads. `set_query` is cheap to call repeatedly.
pub trait DistanceComputer: Send {
    /// Installs the query vector for subsequent [`dist_to_query`] calls.
    ///
    /// [`dist_to_query`]: DistanceComputer::dist_to_query
    fn set_query(&mut self, query: &[f32]);

    /// Distance (or raw similarity for IP) from the current query to
    /// stored vector `i`.
    fn dist_to_query(&self, i: usize) -> f32;

    /// Distance between two stored vectors; used during graph
    /// construction and pruning. Independent of the installed query.
    fn symmetric_dis(&self, a: usize, b: usize) -> f32;
}

/// Wrapper that negates every distance so similarity metrics become
/// minimization problems inside the engines.
pub struct NegatedDistanceComputer<'a> {
    inner: Box<dyn DistanceComputer + Send + 'a>,
}

impl<'a> NegatedDistanceComputer<'a> {
    /// Wraps a raw storage computer.
    #[must_use]
    pub fn new(inner: Box<dyn DistanceComputer + Send + 'a>) -> Self {
        Self { inner }
    }
}

impl DistanceComputer for NegatedDistanceComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.inner.set_query(query);
    }

    fn dist_to_query(&self, i: usize) -> f32 {
        -self.inner.dist_to_query(i)
    }

    fn symmetric_dis(&self, a: usize, b: usize) -> f32 {
        -self.inner.symmetric_dis(a, b)
    }
}

/// Work performed by a single search or insertion, returned to the caller
/// instead of being accumulated in process-wide statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchStats {
    /// Number of distance evaluations performed.
    pub ndis: usize,
}

impl SearchStats {
    /// Merges another stats record into this one.
    pub fn merge(&mut self, other: SearchStats) {
        self.ndis += other.ndis;
    }
}
