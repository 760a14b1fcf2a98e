//! Random projection tree construction and traversal.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::simd;

/// A tree node: either a leaf of point ids or a split on a unit projection.
pub(crate) enum TreeNode {
    Leaf {
        ids: Vec<u64>,
    },
    Internal {
        projection: Vec<f32>,
        threshold: f32,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

/// Immutable inputs threaded through the recursive build.
pub(crate) struct BuildContext<'a> {
    pub(crate) points: &'a HashMap<u64, Vec<f32>>,
    pub(crate) dimension: usize,
    pub(crate) leaf_capacity: usize,
    pub(crate) candidate_projections: usize,
    pub(crate) parallel_threshold: usize,
}

struct Split {
    projection: Vec<f32>,
    threshold: f32,
    left: Vec<u64>,
    right: Vec<u64>,
    imbalance: usize,
}

/// A random direction in `[-1, 1]^D`, scaled to unit norm. A numerically
/// zero draw is replaced with a basis vector.
fn random_unit_projection(dimension: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut projection: Vec<f32> = (0..dimension)
        .map(|_| rng.random::<f32>() * 2.0 - 1.0)
        .collect();
    let norm = simd::norm(&projection);
    if norm < 1e-8 {
        projection.fill(0.0);
        projection[0] = 1.0;
    } else {
        for x in &mut projection {
            *x /= norm;
        }
    }
    projection
}

/// Recursively partition `ids`, choosing the candidate projection with the
/// least imbalanced median split. Subtrees larger than
/// `parallel_threshold` build concurrently, each with an RNG forked from
/// the parent stream.
pub(crate) fn build_tree(ids: Vec<u64>, ctx: &BuildContext<'_>, rng: &mut StdRng) -> TreeNode {
    if ids.len() <= ctx.leaf_capacity {
        return TreeNode::Leaf { ids };
    }

    let mut best: Option<Split> = None;
    for _ in 0..ctx.candidate_projections {
        let projection = random_unit_projection(ctx.dimension, rng);
        let mut pairs: Vec<(u64, f32)> = ids
            .iter()
            .map(|&id| (id, simd::dot(&ctx.points[&id], &projection)))
            .collect();
        pairs.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let threshold = pairs[pairs.len() / 2].1;

        let mut left: Vec<u64> = Vec::new();
        let mut right: Vec<u64> = Vec::new();
        for &(id, dot) in &pairs {
            if dot < threshold {
                left.push(id);
            } else {
                right.push(id);
            }
        }
        if left.is_empty() || right.is_empty() {
            // Degenerate projection (e.g. duplicate points): split evenly
            // in index order so the recursion always terminates.
            let mid = ids.len() / 2;
            left = ids[..mid].to_vec();
            right = ids[mid..].to_vec();
        }

        let imbalance = left.len().abs_diff(right.len());
        if best.as_ref().is_none_or(|b| imbalance < b.imbalance) {
            best = Some(Split {
                projection,
                threshold,
                left,
                right,
                imbalance,
            });
        }
    }
    let split = match best {
        Some(split) => split,
        None => unreachable!("candidate_projections is validated nonzero"),
    };

    let (left, right) = if ids.len() > ctx.parallel_threshold {
        let left_seed: u64 = rng.random();
        let right_seed: u64 = rng.random();
        rayon::join(
            || build_tree(split.left, ctx, &mut StdRng::seed_from_u64(left_seed)),
            || build_tree(split.right, ctx, &mut StdRng::seed_from_u64(right_seed)),
        )
    } else {
        (
            build_tree(split.left, ctx, rng),
            build_tree(split.right, ctx, rng),
        )
    };

    TreeNode::Internal {
        projection: split.projection,
        threshold: split.threshold,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Multi-probe traversal: descend on the side of the threshold the query's
/// projection falls on, probing both children when it lands within
/// `margin` of the split.
pub(crate) fn probe(node: &TreeNode, query: &[f32], margin: f32, out: &mut Vec<u64>) {
    match node {
        TreeNode::Leaf { ids } => out.extend_from_slice(ids),
        TreeNode::Internal {
            projection,
            threshold,
            left,
            right,
        } => {
            let d = simd::dot(query, projection);
            if (d - threshold).abs() < margin {
                probe(left, query, margin, out);
                probe(right, query, margin, out);
            } else if d < *threshold {
                probe(left, query, margin, out);
            } else {
                probe(right, query, margin, out);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn collect_leaves<'a>(node: &'a TreeNode, out: &mut Vec<&'a [u64]>) {
    match node {
        TreeNode::Leaf { ids } => out.push(ids),
        TreeNode::Internal { left, right, .. } => {
            collect_leaves(left, out);
            collect_leaves(right, out);
        }
    }
}
