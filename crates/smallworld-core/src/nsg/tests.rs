//! Tests for the NSG graph engine.

use super::{KnnGraph, NsgGraph, NsgParams};
use crate::distance::SearchStats;
use crate::error::Error;
use crate::graph::EMPTY_ID;
use crate::storage::{engine_distance_computer, FlatStorage, VectorStorage};
use crate::visited::VisitedTable;
use crate::Metric;

fn pseudo_random_vectors(n: usize, d: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..d)
                .map(|j| ((i * d + j) as f32 * 0.61).sin() * 3.0)
                .collect()
        })
        .collect()
}

fn flat_storage(vectors: &[Vec<f32>]) -> FlatStorage {
    let mut storage = FlatStorage::new(vectors[0].len(), Metric::L2);
    for v in vectors {
        storage.add(v).unwrap();
    }
    storage
}

/// Brute-force seed graph: top-gk neighbors per node, self dropped by id.
fn brute_knn_seed(storage: &FlatStorage, gk: usize) -> KnnGraph {
    let n = storage.len();
    let d = storage.dim();
    let mut queries = vec![0.0f32; n * d];
    for i in 0..n {
        storage.reconstruct(i, &mut queries[i * d..(i + 1) * d]);
    }
    let assigned = storage.assign(&queries, gk + 1);

    let mut data = vec![EMPTY_ID; n * gk];
    for i in 0..n {
        let mut count = 0;
        for &id in &assigned[i * (gk + 1)..(i + 1) * (gk + 1)] {
            if id < 0 || id as usize == i {
                continue;
            }
            data[i * gk + count] = id as i32;
            count += 1;
            if count == gk {
                break;
            }
        }
    }
    KnnGraph::new(n, gk, data).unwrap()
}

fn built_graph(vectors: &[Vec<f32>], params: NsgParams) -> (FlatStorage, NsgGraph) {
    let storage = flat_storage(vectors);
    let seed = brute_knn_seed(&storage, params.gk);
    let mut nsg = NsgGraph::new(params);
    nsg.build(&storage, &seed).unwrap();
    (storage, nsg)
}

#[test]
fn test_build_produces_connected_graph() {
    let vectors = pseudo_random_vectors(300, 8);
    let params = NsgParams::new(16).with_gk(32).with_seed(42);
    let (_, nsg) = built_graph(&vectors, params);

    assert!(nsg.is_built());
    let reached = nsg.reachable_from(nsg.enterpoint());
    assert_eq!(reached, 300, "DFS from the enterpoint must reach all nodes");
}

#[test]
fn test_degrees_bounded_by_fanout() {
    let vectors = pseudo_random_vectors(250, 6);
    let params = NsgParams::new(12).with_gk(24).with_seed(7);
    let (_, nsg) = built_graph(&vectors, params);

    for i in 0..250 {
        let row = nsg.neighbors(i);
        assert!(
            row.len() <= params.r,
            "node {i} has degree {} over fanout {}",
            row.len(),
            params.r
        );
        assert!(!row.contains(&(i as i32)), "node {i} links to itself");
    }
}

#[test]
fn test_search_finds_exact_match() {
    let vectors = pseudo_random_vectors(200, 8);
    let params = NsgParams::new(16).with_gk(24).with_seed(3);
    let (storage, nsg) = built_graph(&vectors, params);

    let mut dis = engine_distance_computer(&storage);
    let mut vt = VisitedTable::new(200);
    let mut stats = SearchStats::default();

    for &probe in &[0usize, 57, 123, 199] {
        dis.set_query(&vectors[probe]);
        let results = nsg
            .search(dis.as_ref(), 5, 32, &mut vt, &mut stats)
            .unwrap();
        assert_eq!(results[0].0 as usize, probe, "top-1 must be the vector itself");
        assert!(results[0].1.abs() < 1e-6);
        for window in results.windows(2) {
            assert!(window[0].1 <= window[1].1, "results must be sorted");
        }
    }
    assert!(stats.ndis > 0, "search work must be reported");
}

#[test]
fn test_build_twice_is_usage_error() {
    let vectors = pseudo_random_vectors(60, 4);
    let params = NsgParams::new(8).with_gk(12);
    let (storage, mut nsg) = built_graph(&vectors, params);

    let seed = brute_knn_seed(&storage, params.gk);
    assert!(matches!(
        nsg.build(&storage, &seed),
        Err(Error::Usage(_))
    ));
}

#[test]
fn test_search_before_build_is_usage_error() {
    let storage = flat_storage(&pseudo_random_vectors(10, 4));
    let nsg = NsgGraph::new(NsgParams::new(8));

    let mut dis = engine_distance_computer(&storage);
    dis.set_query(&[0.0; 4]);
    let mut vt = VisitedTable::new(10);
    let mut stats = SearchStats::default();
    assert!(matches!(
        nsg.search(dis.as_ref(), 3, 16, &mut vt, &mut stats),
        Err(Error::Usage(_))
    ));
}

#[test]
fn test_invalid_seed_graph_rejected() {
    let vectors = pseudo_random_vectors(50, 4);
    let storage = flat_storage(&vectors);

    // Entirely empty rows: every slot counts as invalid.
    let seed = KnnGraph::new(50, 8, vec![EMPTY_ID; 50 * 8]).unwrap();
    let mut nsg = NsgGraph::new(NsgParams::new(8));
    match nsg.build(&storage, &seed) {
        Err(Error::InvalidKnnGraph { invalid, total }) => {
            assert_eq!(total, 50);
            assert_eq!(invalid, 50 * 8);
        }
        other => panic!("expected InvalidKnnGraph, got {other:?}"),
    }
    assert!(!nsg.is_built(), "failed build must leave the engine unbuilt");
}

#[test]
fn test_build_on_empty_storage_is_usage_error() {
    let storage = FlatStorage::new(4, Metric::L2);
    let seed = KnnGraph::new(0, 8, Vec::new()).unwrap();
    let mut nsg = NsgGraph::new(NsgParams::new(8));
    assert!(matches!(nsg.build(&storage, &seed), Err(Error::Usage(_))));
}

#[test]
fn test_state_roundtrip_preserves_search() {
    let vectors = pseudo_random_vectors(150, 6);
    let params = NsgParams::new(10).with_gk(20).with_seed(11);
    let (storage, nsg) = built_graph(&vectors, params);

    let restored = NsgGraph::from_state(nsg.to_state());
    assert_eq!(restored.enterpoint(), nsg.enterpoint());
    assert_eq!(restored.len(), nsg.len());

    let mut dis = engine_distance_computer(&storage);
    dis.set_query(&vectors[42]);
    let mut vt = VisitedTable::new(150);
    let mut stats = SearchStats::default();
    let before = nsg
        .search(dis.as_ref(), 8, 32, &mut vt, &mut stats)
        .unwrap();
    let after = restored
        .search(dis.as_ref(), 8, 32, &mut vt, &mut stats)
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_degree_distribution_dump() {
    let vectors = pseudo_random_vectors(80, 4);
    let params = NsgParams::new(8).with_gk(16);
    let (_, nsg) = built_graph(&vectors, params);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("degrees.txt");
    nsg.save_degree_distribution(&path).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 80, "one degree line per node");
    for line in lines {
        let degree: usize = line.parse().unwrap();
        assert!(degree <= params.r);
    }
}
