//! Runtime configuration shared by all engines.
//!
//! The only process-wide inputs the engines consume are a PRNG seed and the
//! log verbosity. Both are the host's responsibility: the seed is passed in
//! here (no environment parsing in the core), and log events are emitted
//! through `tracing` for the host's subscriber to filter.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Construction-time runtime knobs.
///
/// `seed` drives level sampling (HNSW), k-means initialization (PQ-IVF) and
/// projection sampling (RPT). With a fixed seed these are reproducible;
/// without one the wall clock is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Seed for the index's PRNG. `None` falls back to wall-clock time.
    pub seed: Option<u64>,
}

impl RuntimeConfig {
    /// Config with an explicit seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    /// The seed to use, resolving `None` to wall-clock nanoseconds.
    #[must_use]
    pub fn resolve_seed(&self) -> u64 {
        match self.seed {
            Some(seed) => seed,
            None => {
                let seed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or_default();
                debug!(seed, "seeding prng from wall clock");
                seed
            }
        }
    }
}
