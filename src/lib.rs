//! vecino: approximate nearest neighbor search over dense vectors.
//!
//! Three interchangeable index engines behind one [`VectorIndex`] contract:
//!
//! - **[`hnsw`]** — a hierarchical proximity graph. Best recall/latency
//!   trade-off for datasets that fit in RAM; the default choice.
//! - **[`pqivf`]** — inverted file over coarse clusters with
//!   product-quantized residuals. Trades recall for memory; call
//!   [`pqivf::PqIvfIndex::train`] once the index has representative data.
//! - **[`rpt`]** — a random projection tree with multi-probe search.
//!   Simple and rebuild-friendly for smaller or frequently mutated sets.
//!
//! Every engine supports insertion, deletion, update (singular and bulk),
//! k-nearest-neighbor search under one of four metrics (euclidean,
//! squared euclidean, manhattan, cosine), save/load to a byte stream, and
//! a statistics view. Cosine indexes L2-normalize vectors on ingress and
//! queries on entry. Indexes are internally locked: readers share, writers
//! exclude, so one instance can be used from many threads.
//!
//! Randomized behavior (HNSW level sampling, k-means initialization,
//! projection sampling) draws from a per-index PRNG seeded through
//! [`RuntimeConfig`]; fix the seed for reproducible runs.
//!
//! ```
//! use vecino::{HnswConfig, HnswIndex, Metric, RuntimeConfig, VectorIndex};
//!
//! # fn main() -> vecino::Result<()> {
//! let index = HnswIndex::new(
//!     HnswConfig::new(3, 8, 16, Metric::Euclidean),
//!     RuntimeConfig::with_seed(42),
//! )?;
//! index.add(1, vec![0.0, 0.0, 1.0])?;
//! index.add(2, vec![0.0, 1.0, 0.0])?;
//!
//! let hits = index.search(&[0.0, 0.1, 0.9], 1)?;
//! assert_eq!(hits[0].id, 1);
//! # Ok(())
//! # }
//! ```

pub mod distance;
pub mod hnsw;
pub mod pqivf;
pub mod rpt;
pub mod simd;
pub mod vector;

mod error;
mod index;
mod persist;
mod runtime;

pub use distance::Metric;
pub use error::{IndexError, Result};
pub use hnsw::{HnswConfig, HnswIndex};
pub use index::{IndexStats, Neighbor, VectorIndex};
pub use pqivf::{PqIvfConfig, PqIvfIndex};
pub use rpt::{RptConfig, RptIndex};
pub use runtime::RuntimeConfig;
