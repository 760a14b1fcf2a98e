//! In-place vector normalization.
//!
//! Indexes configured for cosine distance call [`normalize`] on every vector
//! they ingest and [`normalize_batch`] on bulk ingests, where rows are
//! processed in parallel.

use rayon::prelude::*;

use crate::simd;

const NORM_EPSILON: f32 = 1e-9;

/// Scale `v` to unit L2 norm in place. Zero-norm (and empty) vectors are
/// left untouched.
pub fn normalize(v: &mut [f32]) {
    if v.is_empty() {
        return;
    }
    let n = simd::norm(v);
    if n < NORM_EPSILON {
        return;
    }
    for x in v.iter_mut() {
        *x /= n;
    }
}

/// Normalize every row, in parallel.
pub fn normalize_batch(rows: &mut [Vec<f32>]) {
    rows.par_iter_mut().for_each(|row| normalize(row));
}
