//! Lloyd's k-means over sub-vectors, used to train one codebook per
//! subspace.

use rand::rngs::StdRng;
use rand::Rng;

use crate::simd;

/// Index of the codeword nearest to `point` under squared Euclidean
/// distance. Ties keep the lowest index.
pub(crate) fn nearest_codeword(point: &[f32], codebook: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, codeword) in codebook.iter().enumerate() {
        let d = simd::l2_distance_squared(point, codeword);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Train a codebook of (up to) `k` centroids over `data` with a fixed
/// number of Lloyd iterations.
///
/// Initialization picks `k` distinct sub-vectors from the seeded RNG; when
/// fewer than `k` sub-vectors exist, all of them are used. A cluster that
/// loses all members is re-seeded from a random sub-vector.
pub(crate) fn train_subquantizer(
    data: &[Vec<f32>],
    k: usize,
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    if data.is_empty() {
        return Vec::new();
    }
    let k = k.min(data.len());
    let sub_dim = data[0].len();

    let picks = rand::seq::index::sample(rng, data.len(), k);
    let mut centroids: Vec<Vec<f32>> = picks.into_iter().map(|i| data[i].clone()).collect();

    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; sub_dim]; k];
        let mut counts = vec![0usize; k];
        for point in data {
            let cluster = nearest_codeword(point, &centroids);
            counts[cluster] += 1;
            for (s, v) in sums[cluster].iter_mut().zip(point) {
                *s += v;
            }
        }
        for cluster in 0..k {
            if counts[cluster] == 0 {
                // Dead cluster: re-seed from a random sub-vector.
                centroids[cluster] = data[rng.random_range(0..data.len())].clone();
                continue;
            }
            let count = counts[cluster] as f32;
            for (c, s) in centroids[cluster].iter_mut().zip(&sums[cluster]) {
                *c = s / count;
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn separated_clusters_are_recovered() {
        let mut data = Vec::new();
        for i in 0..20 {
            let jitter = (i as f32) * 0.001;
            data.push(vec![0.0 + jitter, 0.0]);
            data.push(vec![10.0 + jitter, 10.0]);
        }
        let mut rng = StdRng::seed_from_u64(11);
        let centroids = train_subquantizer(&data, 2, 10, &mut rng);
        assert_eq!(centroids.len(), 2);

        // One centroid near each blob.
        let near_origin = centroids
            .iter()
            .any(|c| simd::l2_distance(c, &[0.0, 0.0]) < 1.0);
        let near_far = centroids
            .iter()
            .any(|c| simd::l2_distance(c, &[10.0, 10.0]) < 1.0);
        assert!(near_origin && near_far);
    }

    #[test]
    fn fewer_points_than_k_uses_all_points() {
        let data = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let centroids = train_subquantizer(&data, 8, 5, &mut rng);
        assert_eq!(centroids.len(), 2);
    }

    #[test]
    fn nearest_codeword_breaks_ties_low() {
        let codebook = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]];
        assert_eq!(nearest_codeword(&[1.0, 0.0], &codebook), 0);
    }

    proptest! {
        #[test]
        fn prop_training_is_deterministic_given_seed(
            seed in any::<u64>(),
            raw in proptest::collection::vec(-10.0f32..10.0, 8..128),
        ) {
            let data: Vec<Vec<f32>> = raw.chunks_exact(4).map(|c| c.to_vec()).collect();
            prop_assume!(!data.is_empty());

            let mut rng1 = StdRng::seed_from_u64(seed);
            let mut rng2 = StdRng::seed_from_u64(seed);
            let a = train_subquantizer(&data, 4, 6, &mut rng1);
            let b = train_subquantizer(&data, 4, 6, &mut rng2);
            prop_assert_eq!(a, b);
        }
    }
}
