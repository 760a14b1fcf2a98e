//! End-to-end tests for the random projection tree engine.

use std::collections::HashMap;

use vecino::{IndexError, Metric, RptConfig, RptIndex, RuntimeConfig};

fn seeded_index(dimension: usize) -> RptIndex {
    RptIndex::new(
        RptConfig::new(dimension, Metric::Euclidean),
        RuntimeConfig::with_seed(42),
    )
    .expect("valid config")
}

#[test]
fn five_vector_search_includes_exact_match() {
    let index = seeded_index(6);
    index.add(1, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    index.add(2, vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]).unwrap();
    index.add(3, vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
    index.add(4, vec![2.0, 2.0, 2.0, 2.0, 2.0, 2.0]).unwrap();
    index.add(5, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap();

    let hits = index.search(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3).unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].id, 1);
    assert!(hits[0].distance.abs() < 1e-5);
}

#[test]
fn custom_tree_knobs_are_honored() {
    let mut config = RptConfig::new(6, Metric::Euclidean);
    config.leaf_capacity = 10;
    config.candidate_projections = 3;
    config.parallel_threshold = 100;
    config.probe_margin = 0.15;
    let index = RptIndex::new(config, RuntimeConfig::with_seed(42)).unwrap();

    for i in 0..40u64 {
        let v: Vec<f32> = (0..6)
            .map(|d| ((i as usize * 5 + d) as f32 * 0.33).cos())
            .collect();
        index.add(i, v).unwrap();
    }
    let probe: Vec<f32> = (0..6).map(|d| ((35usize * 5 + d) as f32 * 0.33).cos()).collect();
    let hits = index.search(&probe, 5).unwrap();
    assert_eq!(hits[0].id, 35);
}

#[test]
fn parallel_subtree_build_handles_large_sets() {
    let mut config = RptConfig::new(8, Metric::Euclidean);
    config.parallel_threshold = 50;
    let index = RptIndex::new(config, RuntimeConfig::with_seed(9)).unwrap();

    let vectors: HashMap<u64, Vec<f32>> = (0..500u64)
        .map(|i| {
            let v: Vec<f32> = (0..8)
                .map(|d| ((i as usize * 7 + d * 11) as f32 * 0.07).sin() * 3.0)
                .collect();
            (i, v)
        })
        .collect();
    index.bulk_add(&vectors).unwrap();
    assert_eq!(index.stats().count, 500);

    for id in [0u64, 123, 321, 499] {
        let hits = index.search(&vectors[&id], 5).unwrap();
        assert_eq!(hits[0].id, id, "self-search missed id {id}");
        assert!(hits[0].distance.abs() < 1e-5);
    }
}

#[test]
fn seeded_searches_are_reproducible() {
    let build = |seed: u64| {
        let index = RptIndex::new(
            RptConfig::new(4, Metric::Euclidean),
            RuntimeConfig::with_seed(seed),
        )
        .unwrap();
        for i in 0..60u64 {
            let v: Vec<f32> = (0..4)
                .map(|d| ((i as usize * 3 + d * 13) as f32 * 0.19).sin())
                .collect();
            index.add(i, v).unwrap();
        }
        index
    };

    let a = build(123);
    let b = build(123);
    let query = [0.2, -0.4, 0.6, -0.8];
    let hits_a = a.search(&query, 10).unwrap();
    let hits_b = b.search(&query, 10).unwrap();
    let ids_a: Vec<u64> = hits_a.iter().map(|n| n.id).collect();
    let ids_b: Vec<u64> = hits_b.iter().map(|n| n.id).collect();
    assert_eq!(ids_a, ids_b);
}

#[test]
fn mutators_invalidate_the_tree() {
    let index = seeded_index(3);
    index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
    index.add(2, vec![0.0, 1.0, 0.0]).unwrap();
    assert_eq!(index.search(&[1.0, 0.0, 0.0], 1).unwrap()[0].id, 1);

    index.delete(1).unwrap();
    let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 2);

    index.update(2, vec![0.0, 0.0, 1.0]).unwrap();
    let hits = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
    assert_eq!(hits[0].id, 2);
    assert!(hits[0].distance.abs() < 1e-6);
}

#[test]
fn bulk_delete_tolerates_missing_ids() {
    let index = seeded_index(2);
    index.add(1, vec![1.0, 0.0]).unwrap();
    index.add(2, vec![0.0, 1.0]).unwrap();
    index.bulk_delete(&[2, 77]).unwrap();
    assert_eq!(index.stats().count, 1);
}

#[test]
fn searching_an_empty_index_errors() {
    let index = seeded_index(2);
    assert!(matches!(
        index.search(&[0.0, 1.0], 1),
        Err(IndexError::EmptyIndex)
    ));
}
