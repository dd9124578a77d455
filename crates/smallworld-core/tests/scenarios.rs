//! End-to-end scenarios over the public index API.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use smallworld_core::{
    Error, FlatStorage, HnswIndex, HnswParams, Metric, NsgIndex, NsgParams, SearchParams,
    VectorStorage,
};

fn gaussian_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * d).map(|_| rng.sample(StandardNormal)).collect()
}

fn uniform_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * d).map(|_| rng.gen_range(0.0..1.0)).collect()
}

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[test]
fn hnsw_unit_axes_top1() {
    let mut index = HnswIndex::flat(4, HnswParams::new(8).with_seed(42), Metric::L2).unwrap();

    // The eight signed unit axes, +e_i before -e_i.
    let mut data = Vec::new();
    for i in 0..4 {
        for sign in [1.0f32, -1.0] {
            let mut v = [0.0f32; 4];
            v[i] = sign;
            data.extend_from_slice(&v);
        }
    }
    index.add(&data).unwrap();

    let results = index.search(&[1.0, 0.0, 0.0, 0.0], 1, None).unwrap();
    assert_eq!(results.labels[0], 0);
    assert!(results.distances[0].abs() < 1e-6);
}

#[test]
fn hnsw_grid_top4_with_tie_break() {
    let mut index = HnswIndex::flat(2, HnswParams::new(4).with_seed(42), Metric::L2).unwrap();

    let mut data = Vec::new();
    for x in 0..10 {
        for y in 0..10 {
            data.push(x as f32);
            data.push(y as f32);
        }
    }
    index.add(&data).unwrap();

    let params = SearchParams {
        ef_search: Some(64),
        ..SearchParams::default()
    };
    let results = index.search(&[4.3, 4.3], 4, Some(&params)).unwrap();

    // (4,4) first; the (4,5)/(5,4) tie resolves by ascending id; (5,5)
    // last. Grid id is x * 10 + y.
    assert_eq!(results.labels, vec![44, 45, 54, 55]);
    for pair in results.distances.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
}

#[test]
fn nsg_build_is_fully_connected() {
    let n = 1024;
    let data = gaussian_vectors(n, 8, 42);

    let params = NsgParams::new(16).with_gk(32).with_seed(42);
    let mut index = NsgIndex::flat(8, params, Metric::L2).unwrap();
    index.add(&data).unwrap();

    let graph = index.graph();
    assert!(graph.is_built());
    assert_eq!(
        graph.reachable_from(graph.enterpoint()),
        n,
        "DFS from the enterpoint must visit every node"
    );
}

#[test]
fn hnsw_range_search_recall_on_unit_cube() {
    let n = 1000;
    let data = uniform_vectors(n, 3, 42);
    let query = [0.5f32, 0.5, 0.5];
    let radius = 0.3f32;
    let radius_sq = radius * radius;

    let mut index =
        HnswIndex::flat(3, HnswParams::new(16).with_seed(42).with_ef_construction(80), Metric::L2)
            .unwrap();
    index.add(&data).unwrap();

    let truth: Vec<i64> = (0..n)
        .filter(|&i| l2_sq(&data[i * 3..(i + 1) * 3], &query) <= radius_sq)
        .map(|i| i as i64)
        .collect();
    assert!(!truth.is_empty(), "radius must capture some points");

    let params = SearchParams {
        ef_search: Some(400),
        ..SearchParams::default()
    };
    let found = index.range_search(&query, radius_sq, Some(&params)).unwrap();

    // Exact distances: no false positives possible.
    for &(id, dist) in &found {
        assert!(dist <= radius_sq + 1e-6, "id {id} outside the radius");
    }

    let hits = truth
        .iter()
        .filter(|t| found.iter().any(|(id, _)| id == *t))
        .count();
    let recall = hits as f64 / truth.len() as f64;
    assert!(recall >= 0.95, "range recall {recall:.3} below 0.95");
}

#[test]
fn nsg_inner_product_descending_similarities() {
    let n = 500;
    let d = 8;
    let data = uniform_vectors(n, d, 42);

    let params = NsgParams::new(16).with_gk(32).with_search_l(64).with_seed(42);
    let mut index = NsgIndex::flat(d, params, Metric::InnerProduct).unwrap();
    index.add(&data).unwrap();

    let query: Vec<f32> = uniform_vectors(1, d, 7);
    let results = index.search(&query, 5, None).unwrap();

    // Positive similarities, descending.
    for &sim in &results.distances {
        assert!(sim > 0.0, "uniform positive data must give positive ip");
    }
    for pair in results.distances.windows(2) {
        assert!(pair[0] >= pair[1], "similarities must descend");
    }

    // Top-1 agrees with the brute-force argmax.
    let best = (0..n)
        .max_by(|&a, &b| {
            let ip_a: f32 = data[a * d..(a + 1) * d].iter().zip(&query).map(|(x, y)| x * y).sum();
            let ip_b: f32 = data[b * d..(b + 1) * d].iter().zip(&query).map(|(x, y)| x * y).sum();
            ip_a.total_cmp(&ip_b)
        })
        .unwrap();
    assert_eq!(results.labels[0], best as i64);
}

#[test]
fn hnsw_concurrent_build_matches_single_threaded_recall() {
    let n = 10_000;
    let d = 8;
    let nq = 1000;
    let data = gaussian_vectors(n, d, 42);
    let queries = gaussian_vectors(nq, d, 1042);

    let params = HnswParams::new(16)
        .with_seed(42)
        .with_ef_construction(60)
        .with_ef_search(128);

    let mut single = HnswIndex::new(
        Box::new(FlatStorage::new(d, Metric::L2)),
        params,
        1,
    )
    .unwrap();
    single.add(&data).unwrap();

    let mut concurrent = HnswIndex::new(
        Box::new(FlatStorage::new(d, Metric::L2)),
        params,
        8,
    )
    .unwrap();
    concurrent.add(&data).unwrap();

    // Brute-force ground truth per query.
    let truth: Vec<i64> = (0..nq)
        .map(|qi| {
            let q = &queries[qi * d..(qi + 1) * d];
            (0..n)
                .min_by(|&a, &b| {
                    l2_sq(&data[a * d..(a + 1) * d], q)
                        .total_cmp(&l2_sq(&data[b * d..(b + 1) * d], q))
                })
                .unwrap() as i64
        })
        .collect();

    let recall = |index: &HnswIndex| -> f64 {
        let results = index.search(&queries, 1, None).unwrap();
        let hits = (0..nq).filter(|&qi| results.labels[qi] == truth[qi]).count();
        hits as f64 / nq as f64
    };

    let recall_single = recall(&single);
    let recall_concurrent = recall(&concurrent);
    assert!(recall_single >= 0.9, "single recall {recall_single:.3}");
    assert!(
        (recall_single - recall_concurrent).abs() <= 0.02,
        "recall gap too wide: single {recall_single:.3}, concurrent {recall_concurrent:.3}"
    );
}

#[test]
fn hnsw_k_beyond_ntotal_pads_with_sentinels() {
    let mut index = HnswIndex::flat(2, HnswParams::new(4), Metric::L2).unwrap();
    index.add(&[0.0, 0.0, 1.0, 1.0]).unwrap();

    let results = index.search(&[0.1, 0.1], 5, None).unwrap();
    assert_eq!(results.labels[0], 0);
    assert_eq!(results.labels[1], 1);
    for j in 2..5 {
        assert_eq!(results.labels[j], -1);
        assert!(results.distances[j].is_infinite());
    }
}

#[test]
fn hnsw_empty_index_returns_sentinels() {
    let index = HnswIndex::flat(4, HnswParams::new(8), Metric::L2).unwrap();
    let results = index.search(&[0.0; 4], 3, None).unwrap();
    assert!(results.labels.iter().all(|&l| l == -1));
    assert!(results.distances.iter().all(|d| d.is_infinite()));
}

#[test]
fn hnsw_persistence_roundtrip() {
    let n = 400;
    let d = 8;
    let data = gaussian_vectors(n, d, 9);
    let mut index = HnswIndex::flat(d, HnswParams::new(8).with_seed(9), Metric::L2).unwrap();
    index.add(&data).unwrap();

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();

    let mut storage = FlatStorage::new(d, Metric::L2);
    storage.add(&data).unwrap();
    let restored = HnswIndex::load(dir.path(), Box::new(storage), 0).unwrap();

    let queries = gaussian_vectors(20, d, 11);
    let before = index.search(&queries, 5, None).unwrap();
    let after = restored.search(&queries, 5, None).unwrap();
    assert_eq!(before.labels, after.labels);

    // Reconstruct round-trips exactly on flat storage.
    let v = restored.reconstruct(123).unwrap();
    assert_eq!(v.as_slice(), &data[123 * d..124 * d]);
}

#[test]
fn nsg_persistence_roundtrip() {
    let n = 300;
    let d = 6;
    let data = gaussian_vectors(n, d, 5);
    let params = NsgParams::new(12).with_gk(24).with_seed(5);
    let mut index = NsgIndex::flat(d, params, Metric::L2).unwrap();
    index.add(&data).unwrap();

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();

    let mut storage = FlatStorage::new(d, Metric::L2);
    storage.add(&data).unwrap();
    let restored = NsgIndex::load(dir.path(), Box::new(storage), 0).unwrap();

    let queries = gaussian_vectors(10, d, 13);
    let before = index.search(&queries, 4, None).unwrap();
    let after = restored.search(&queries, 4, None).unwrap();
    assert_eq!(before.labels, after.labels);
}

#[test]
#[serial_test::serial(interrupt)]
fn interrupted_search_fails_cleanly() {
    let n = 500;
    let d = 8;
    let data = gaussian_vectors(n, d, 3);
    let mut index = HnswIndex::flat(d, HnswParams::new(8).with_seed(3), Metric::L2).unwrap();
    index.add(&data).unwrap();

    // Scope the interrupt to this test's thread: the chunk-boundary
    // check runs on the calling thread, and concurrently running tests
    // must not observe it.
    let me = std::thread::current().id();
    smallworld_core::interrupt::set_callback(move || std::thread::current().id() == me);
    let queries = gaussian_vectors(64, d, 21);
    let outcome = index.search(&queries, 5, None);
    smallworld_core::interrupt::clear_callback();

    assert!(matches!(outcome, Err(Error::Interrupted)));
}

#[test]
fn fetch_counter_reports_search_work() {
    let n = 300;
    let d = 4;
    let data = gaussian_vectors(n, d, 17);
    let mut index = HnswIndex::flat(d, HnswParams::new(8), Metric::L2).unwrap();
    index.add(&data).unwrap();

    assert_eq!(index.last_fetch_count(), None, "off by default");

    index.init_fetch_counter();
    assert_eq!(index.last_fetch_count(), Some(0));

    let queries = gaussian_vectors(10, d, 19);
    index.search(&queries, 3, None).unwrap();
    assert!(index.last_fetch_count().unwrap() > 0);

    index.drop_fetch_counter();
    assert_eq!(index.last_fetch_count(), None);
}

#[test]
fn hnsw_quantized_storages_stay_searchable() {
    let n = 400;
    let d = 8;
    let data = gaussian_vectors(n, d, 23);

    // SQ storage needs no training.
    let mut sq = HnswIndex::sq(d, HnswParams::new(8).with_seed(23), Metric::L2).unwrap();
    sq.add(&data).unwrap();
    let results = sq.search(&data[..d], 1, None).unwrap();
    assert_eq!(results.labels[0], 0, "sq top-1 must find the query itself");

    // PQ storage trains codebooks first; add before train must fail.
    let mut pq = HnswIndex::pq(d, 2, HnswParams::new(8).with_seed(23)).unwrap();
    assert!(matches!(pq.add(&data), Err(Error::Usage(_))));
    pq.train(&data).unwrap();
    pq.add(&data).unwrap();

    let results = pq.search(&data[..d], 4, None).unwrap();
    assert!(
        results.labels[..2].contains(&0),
        "pq search must rank the query vector near the top"
    );
}

#[test]
fn nsg_add_twice_is_rejected() {
    let data = gaussian_vectors(100, 4, 31);
    let params = NsgParams::new(8).with_gk(16);
    let mut index = NsgIndex::flat(4, params, Metric::L2).unwrap();
    index.add(&data).unwrap();
    assert!(matches!(index.add(&data), Err(Error::Usage(_))));

    // After a reset a fresh build is allowed again.
    index.reset();
    index.add(&data).unwrap();
    assert!(index.graph().is_built());
}

#[test]
fn nsg_nndescent_seed_build() {
    let data = gaussian_vectors(400, 8, 37);
    let params = NsgParams::new(12).with_gk(24).with_seed(37);
    let mut index = NsgIndex::flat(8, params, Metric::L2).unwrap();
    index.set_seed_builder(smallworld_core::index::SeedBuilder::NnDescent(
        smallworld_core::nndescent::NnDescentParams::new(24),
    ));
    index.add(&data).unwrap();

    let graph = index.graph();
    assert!(graph.is_built());
    assert_eq!(graph.reachable_from(graph.enterpoint()), 400);

    let results = index.search(&data[..8], 3, None).unwrap();
    assert_eq!(results.labels[0], 0);
}
