//! 8-bit scalar-quantized vector storage.
//!
//! Each vector is quantized independently with min/max scaling: one byte
//! per component plus two f32 bounds per vector, a 4x memory reduction.
//! Reconstruction is lossy; the per-component error is bounded by half a
//! quantization step, `(max - min) / 255 / 2`.

use crate::distance::{DistanceComputer, Metric};
use crate::error::Result;
use crate::storage::{brute_force_assign, check_row_major, VectorStorage};

/// Scalar-quantized storage. Per-vector codebooks, so always trained.
pub struct SqStorage {
    dim: usize,
    metric: Metric,
    codes: Vec<u8>,
    bounds: Vec<(f32, f32)>,
}

impl SqStorage {
    /// Creates an empty scalar-quantized storage.
    #[must_use]
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            codes: Vec::new(),
            bounds: Vec::new(),
        }
    }

    fn quantize(&mut self, vector: &[f32]) {
        let min = vector.iter().copied().fold(f32::INFINITY, f32::min);
        let max = vector.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;

        if range < f32::EPSILON {
            // Degenerate vector: every component identical.
            self.codes.extend(std::iter::repeat(128u8).take(self.dim));
        } else {
            let scale = 255.0 / range;
            // SAFETY: the value is clamped to [0, 255] before the cast.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            self.codes.extend(
                vector
                    .iter()
                    .map(|&v| ((v - min) * scale).round().clamp(0.0, 255.0) as u8),
            );
        }
        self.bounds.push((min, max));
    }

    #[inline]
    fn decoded(&self, i: usize, j: usize) -> f32 {
        let (min, max) = self.bounds[i];
        let range = max - min;
        if range < f32::EPSILON {
            min
        } else {
            f32::from(self.codes[i * self.dim + j]) * (range / 255.0) + min
        }
    }
}

impl VectorStorage for SqStorage {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.bounds.len()
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        let n = check_row_major(x, self.dim)?;
        for i in 0..n {
            self.quantize(&x[i * self.dim..(i + 1) * self.dim]);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.codes.clear();
        self.bounds.clear();
    }

    fn reconstruct(&self, id: usize, out: &mut [f32]) {
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = self.decoded(id, j);
        }
    }

    fn assign(&self, queries: &[f32], k: usize) -> Vec<i64> {
        brute_force_assign(self, queries, k)
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + Send + '_> {
        Box::new(SqDistanceComputer {
            storage: self,
            query: vec![0.0; self.dim],
        })
    }
}

/// Asymmetric computer: the query keeps full f32 precision, stored
/// vectors are dequantized on the fly.
struct SqDistanceComputer<'a> {
    storage: &'a SqStorage,
    query: Vec<f32>,
}

impl DistanceComputer for SqDistanceComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
    }

    fn dist_to_query(&self, i: usize) -> f32 {
        let mut sum = 0.0f32;
        match self.storage.metric {
            Metric::L2 => {
                for (j, &q) in self.query.iter().enumerate() {
                    let d = q - self.storage.decoded(i, j);
                    sum += d * d;
                }
            }
            Metric::InnerProduct => {
                for (j, &q) in self.query.iter().enumerate() {
                    sum += q * self.storage.decoded(i, j);
                }
            }
        }
        sum
    }

    fn symmetric_dis(&self, a: usize, b: usize) -> f32 {
        let mut sum = 0.0f32;
        match self.storage.metric {
            Metric::L2 => {
                for j in 0..self.storage.dim {
                    let d = self.storage.decoded(a, j) - self.storage.decoded(b, j);
                    sum += d * d;
                }
            }
            Metric::InnerProduct => {
                for j in 0..self.storage.dim {
                    sum += self.storage.decoded(a, j) * self.storage.decoded(b, j);
                }
            }
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruct_within_quantization_error() {
        let mut storage = SqStorage::new(4, Metric::L2);
        let v = [0.0, 0.25, -1.5, 3.0];
        storage.add(&v).unwrap();

        let mut out = [0.0f32; 4];
        storage.reconstruct(0, &mut out);

        // Half a quantization step per component.
        let eps = (3.0 - (-1.5)) / 255.0 / 2.0 + 1e-6;
        for (orig, rec) in v.iter().zip(out.iter()) {
            assert!(
                (orig - rec).abs() <= eps,
                "component error {} exceeds {eps}",
                (orig - rec).abs()
            );
        }
    }

    #[test]
    fn test_constant_vector_roundtrip() {
        let mut storage = SqStorage::new(3, Metric::L2);
        storage.add(&[2.5, 2.5, 2.5]).unwrap();

        let mut out = [0.0f32; 3];
        storage.reconstruct(0, &mut out);
        assert_eq!(out, [2.5, 2.5, 2.5]);
    }

    #[test]
    fn test_asymmetric_distance_close_to_exact() {
        let mut storage = SqStorage::new(2, Metric::L2);
        storage.add(&[0.0, 0.0, 3.0, 4.0]).unwrap();

        let mut dis = storage.distance_computer();
        dis.set_query(&[0.0, 0.0]);
        assert!((dis.dist_to_query(1) - 25.0).abs() < 0.1);
    }
}
