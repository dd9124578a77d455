//! # `smallworld` Core
//!
//! Graph-based approximate nearest neighbor search engine written in Rust.
//!
//! `smallworld` builds navigable proximity graphs over a vector set and
//! answers top-k and radius queries in sublinear time with high recall.
//! Two graph engines are provided:
//!
//! - **HNSW**: a hierarchical multi-layer graph supporting incremental,
//!   concurrent insertion (Malkov & Yashunin).
//! - **NSG**: a single-layer spreading-out graph built in one shot from a
//!   KNN seed graph (Fu et al., VLDB 2019).
//!
//! Both engines sit on top of a [`storage::VectorStorage`] that owns the
//! vectors and answers distance queries, so the graph machinery is
//! independent of the encoding (flat f32, scalar-quantized, product-
//! quantized).
//!
//! ## Quick Start
//!
//! ```rust
//! use smallworld_core::{HnswIndex, HnswParams, Metric};
//!
//! fn main() -> smallworld_core::Result<()> {
//!     let mut index = HnswIndex::flat(4, HnswParams::new(8), Metric::L2)?;
//!
//!     // Append vectors (row-major, 4 floats per vector).
//!     index.add(&[
//!         1.0, 0.0, 0.0, 0.0, //
//!         0.0, 1.0, 0.0, 0.0, //
//!         0.0, 0.0, 1.0, 0.0, //
//!     ])?;
//!
//!     // Top-1 search.
//!     let results = index.search(&[0.9, 0.1, 0.0, 0.0], 1, None)?;
//!     assert_eq!(results.labels[0], 0);
//!     # Ok(())
//! }
//! ```

#![warn(missing_docs)]
// Clippy lints configured in workspace Cargo.toml [workspace.lints.clippy]
#![cfg_attr(
    test,
    allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::float_cmp
    )
)]

pub mod distance;
pub mod error;
pub mod graph;
pub mod hnsw;
pub mod index;
pub mod interrupt;
pub mod nndescent;
pub mod nsg;
pub mod pool;
pub mod select;
pub mod storage;
pub mod visited;

pub use distance::{DistanceComputer, Metric, SearchStats};
pub use error::{Error, Result};
pub use graph::{Graph, NodeId, EMPTY_ID};
pub use hnsw::{EdgePolicy, HnswParams};
pub use index::{HnswIndex, NsgIndex, SearchParams, SearchResults};
pub use nsg::NsgParams;
pub use storage::{FlatStorage, PqStorage, SqStorage, VectorStorage};
