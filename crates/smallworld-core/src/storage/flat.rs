//! Uncompressed f32 vector storage with exact distances.

use crate::distance::{inner_product, l2_sq, DistanceComputer, Metric};
use crate::error::Result;
use crate::storage::{brute_force_assign, check_row_major, VectorStorage};

/// Contiguous row-major f32 storage. Always trained.
pub struct FlatStorage {
    dim: usize,
    metric: Metric,
    data: Vec<f32>,
}

impl FlatStorage {
    /// Creates an empty flat storage.
    #[must_use]
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            data: Vec::new(),
        }
    }

    /// Borrow of stored vector `i`.
    #[must_use]
    pub fn vector(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

impl VectorStorage for FlatStorage {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        check_row_major(x, self.dim)?;
        self.data.extend_from_slice(x);
        Ok(())
    }

    fn reset(&mut self) {
        self.data.clear();
    }

    fn reconstruct(&self, id: usize, out: &mut [f32]) {
        out.copy_from_slice(self.vector(id));
    }

    fn assign(&self, queries: &[f32], k: usize) -> Vec<i64> {
        brute_force_assign(self, queries, k)
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + Send + '_> {
        Box::new(FlatDistanceComputer {
            storage: self,
            query: vec![0.0; self.dim],
        })
    }
}

struct FlatDistanceComputer<'a> {
    storage: &'a FlatStorage,
    query: Vec<f32>,
}

impl DistanceComputer for FlatDistanceComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
    }

    fn dist_to_query(&self, i: usize) -> f32 {
        let v = self.storage.vector(i);
        match self.storage.metric {
            Metric::L2 => l2_sq(&self.query, v),
            Metric::InnerProduct => inner_product(&self.query, v),
        }
    }

    fn symmetric_dis(&self, a: usize, b: usize) -> f32 {
        let va = self.storage.vector(a);
        let vb = self.storage.vector(b);
        match self.storage.metric {
            Metric::L2 => l2_sq(va, vb),
            Metric::InnerProduct => inner_product(va, vb),
        }
    }
}
