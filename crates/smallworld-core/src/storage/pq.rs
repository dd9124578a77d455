//! Product-quantized vector storage.
//!
//! The vector space is split into `m` subspaces; each subspace is coded
//! by one byte addressing a 256-entry codebook trained with k-means.
//! Query-to-vector distances use a per-query lookup table (asymmetric);
//! vector-to-vector distances use a symmetric codebook-to-codebook table
//! computed once after training, which the graph builders rely on for
//! pruning. L2 only.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::{l2_sq, DistanceComputer, Metric};
use crate::error::{Error, Result};
use crate::storage::{brute_force_assign, check_row_major, VectorStorage};

const KSUB: usize = 256;
const KMEANS_ITERS: usize = 25;

/// Product-quantized storage. Requires [`VectorStorage::train`] before
/// vectors can be added.
pub struct PqStorage {
    dim: usize,
    m: usize,
    dsub: usize,
    /// Codebooks, `m * KSUB * dsub`.
    centroids: Vec<f32>,
    /// Symmetric distance table, `m * KSUB * KSUB`.
    sdc: Vec<f32>,
    codes: Vec<u8>,
    trained: bool,
    seed: u64,
}

impl PqStorage {
    /// Creates an untrained product quantizer splitting `dim` into `m`
    /// subspaces. `dim` must be a multiple of `m`.
    pub fn new(dim: usize, m: usize, seed: u64) -> Result<Self> {
        if m == 0 || dim % m != 0 {
            return Err(Error::InvalidInput(format!(
                "dimension {dim} is not divisible into {m} subspaces"
            )));
        }
        Ok(Self {
            dim,
            m,
            dsub: dim / m,
            centroids: Vec::new(),
            sdc: Vec::new(),
            codes: Vec::new(),
            trained: false,
            seed,
        })
    }

    #[inline]
    fn centroid(&self, sub: usize, j: usize) -> &[f32] {
        let base = (sub * KSUB + j) * self.dsub;
        &self.centroids[base..base + self.dsub]
    }

    fn nearest_centroid(&self, sub: usize, x: &[f32]) -> usize {
        let mut best = 0;
        let mut best_d = f32::INFINITY;
        for j in 0..KSUB {
            let d = l2_sq(x, self.centroid(sub, j));
            if d < best_d {
                best_d = d;
                best = j;
            }
        }
        best
    }

    /// Lloyd iterations for one subspace over `n` training subvectors.
    fn train_subspace(&mut self, sub: usize, x: &[f32], n: usize, rng: &mut StdRng) {
        let dsub = self.dsub;
        let dim = self.dim;
        let subvec = move |i: usize| &x[i * dim + sub * dsub..i * dim + (sub + 1) * dsub];

        for j in 0..KSUB {
            let pick = rng.gen_range(0..n);
            let base = (sub * KSUB + j) * dsub;
            self.centroids[base..base + dsub].copy_from_slice(subvec(pick));
        }

        let mut assignments = vec![0usize; n];
        for _ in 0..KMEANS_ITERS {
            for (i, slot) in assignments.iter_mut().enumerate() {
                *slot = self.nearest_centroid(sub, subvec(i));
            }

            let mut sums = vec![0.0f64; KSUB * dsub];
            let mut counts = vec![0usize; KSUB];
            for (i, &a) in assignments.iter().enumerate() {
                counts[a] += 1;
                for (s, &v) in sums[a * dsub..(a + 1) * dsub].iter_mut().zip(subvec(i)) {
                    *s += f64::from(v);
                }
            }

            for j in 0..KSUB {
                let base = (sub * KSUB + j) * dsub;
                if counts[j] == 0 {
                    // Empty cluster: re-seed from a random training point.
                    let pick = rng.gen_range(0..n);
                    self.centroids[base..base + dsub].copy_from_slice(subvec(pick));
                } else {
                    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                    for (c, &s) in self.centroids[base..base + dsub]
                        .iter_mut()
                        .zip(&sums[j * dsub..(j + 1) * dsub])
                    {
                        *c = (s / counts[j] as f64) as f32;
                    }
                }
            }
        }
    }

    /// Pairwise codebook distances per subspace, used by
    /// [`DistanceComputer::symmetric_dis`] during graph construction.
    fn compute_sdc_table(&mut self) {
        self.sdc = vec![0.0f32; self.m * KSUB * KSUB];
        for sub in 0..self.m {
            for a in 0..KSUB {
                for b in a + 1..KSUB {
                    let d = l2_sq(self.centroid(sub, a), self.centroid(sub, b));
                    self.sdc[(sub * KSUB + a) * KSUB + b] = d;
                    self.sdc[(sub * KSUB + b) * KSUB + a] = d;
                }
            }
        }
    }
}

impl VectorStorage for PqStorage {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.codes.len() / self.m
    }

    fn metric(&self) -> Metric {
        Metric::L2
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn train(&mut self, x: &[f32]) -> Result<()> {
        let n = check_row_major(x, self.dim)?;
        if n == 0 {
            return Err(Error::InvalidInput(
                "product quantizer needs at least one training vector".into(),
            ));
        }

        self.centroids = vec![0.0f32; self.m * KSUB * self.dsub];
        let mut rng = StdRng::seed_from_u64(self.seed);
        for sub in 0..self.m {
            self.train_subspace(sub, x, n, &mut rng);
        }
        self.trained = true;
        self.compute_sdc_table();
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        if !self.trained {
            return Err(Error::Usage("add called before train".into()));
        }
        let n = check_row_major(x, self.dim)?;
        for i in 0..n {
            for sub in 0..self.m {
                let slice =
                    &x[i * self.dim + sub * self.dsub..i * self.dim + (sub + 1) * self.dsub];
                #[allow(clippy::cast_possible_truncation)]
                self.codes.push(self.nearest_centroid(sub, slice) as u8);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.codes.clear();
    }

    fn reconstruct(&self, id: usize, out: &mut [f32]) {
        for sub in 0..self.m {
            let code = self.codes[id * self.m + sub] as usize;
            out[sub * self.dsub..(sub + 1) * self.dsub].copy_from_slice(self.centroid(sub, code));
        }
    }

    fn assign(&self, queries: &[f32], k: usize) -> Vec<i64> {
        brute_force_assign(self, queries, k)
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + Send + '_> {
        Box::new(PqDistanceComputer {
            storage: self,
            lut: vec![0.0; self.m * KSUB],
        })
    }
}

/// Asymmetric computer: `set_query` precomputes query-to-codebook
/// distances, `dist_to_query` is `m` table lookups per vector.
struct PqDistanceComputer<'a> {
    storage: &'a PqStorage,
    lut: Vec<f32>,
}

impl DistanceComputer for PqDistanceComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        let dsub = self.storage.dsub;
        for sub in 0..self.storage.m {
            let q = &query[sub * dsub..(sub + 1) * dsub];
            for j in 0..KSUB {
                self.lut[sub * KSUB + j] = l2_sq(q, self.storage.centroid(sub, j));
            }
        }
    }

    fn dist_to_query(&self, i: usize) -> f32 {
        let mut sum = 0.0f32;
        for sub in 0..self.storage.m {
            let code = self.storage.codes[i * self.storage.m + sub] as usize;
            sum += self.lut[sub * KSUB + code];
        }
        sum
    }

    fn symmetric_dis(&self, a: usize, b: usize) -> f32 {
        let mut sum = 0.0f32;
        for sub in 0..self.storage.m {
            let ca = self.storage.codes[a * self.storage.m + sub] as usize;
            let cb = self.storage.codes[b * self.storage.m + sub] as usize;
            sum += self.storage.sdc[(sub * KSUB + ca) * KSUB + cb];
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_set(n: usize, d: usize) -> Vec<f32> {
        (0..n * d).map(|i| ((i * 37 % 101) as f32) * 0.1).collect()
    }

    #[test]
    fn test_add_before_train_is_usage_error() {
        let mut storage = PqStorage::new(8, 2, 42).unwrap();
        assert!(matches!(
            storage.add(&[0.0; 8]),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_indivisible_dimension_rejected() {
        assert!(PqStorage::new(10, 3, 42).is_err());
    }

    #[test]
    fn test_train_add_reconstruct() {
        let mut storage = PqStorage::new(8, 2, 42).unwrap();
        let x = training_set(400, 8);
        storage.train(&x).unwrap();
        storage.add(&x[..80]).unwrap();
        assert_eq!(storage.len(), 10);

        // Reconstruction lands near the original (codebook resolution).
        let mut out = [0.0f32; 8];
        storage.reconstruct(3, &mut out);
        let err = l2_sq(&out, &x[3 * 8..4 * 8]);
        assert!(err < 1.0, "reconstruction error too large: {err}");
    }

    #[test]
    fn test_symmetric_table_tracks_asymmetric() {
        let mut storage = PqStorage::new(4, 2, 7).unwrap();
        let x = training_set(300, 4);
        storage.train(&x).unwrap();
        storage.add(&x[..40]).unwrap();

        let mut dis = storage.distance_computer();
        // Query with the reconstruction of vector 2: the asymmetric
        // distance to codes then matches the symmetric table.
        let mut q = [0.0f32; 4];
        storage.reconstruct(2, &mut q);
        dis.set_query(&q);

        for i in 0..10 {
            let asym = dis.dist_to_query(i);
            let sym = dis.symmetric_dis(2, i);
            assert!(
                (asym - sym).abs() < 1e-3,
                "sdc {sym} diverges from adc {asym} for vector {i}"
            );
        }
    }
}
