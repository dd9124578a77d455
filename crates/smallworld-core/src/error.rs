//! Crate-wide error type and result alias.

use thiserror::Error;

/// Errors surfaced by the index engines and façades.
///
/// All errors are fatal to the current call; the engine is left in a
/// consistent state (either pre-operation or post-operation).
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong order of operations (add before train, add after an NSG
    /// build, search on an index without storage).
    #[error("operation out of order: {0}")]
    Usage(String),

    /// Malformed caller input other than a dimension mismatch.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Vector dimensionality does not match the index.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the index was created with.
        expected: usize,
        /// Dimension implied by the caller's data.
        got: usize,
    },

    /// The seed KNN graph handed to the NSG builder has too many invalid
    /// entries (self-loops, out-of-range ids, or empty slots).
    #[error("seed knn graph has {invalid} invalid entries over {total} nodes")]
    InvalidKnnGraph {
        /// Number of invalid entries found.
        invalid: usize,
        /// Number of nodes in the seed graph.
        total: usize,
    },

    /// A large up-front reservation failed.
    #[error("allocation of {requested} bytes for {what} failed")]
    Allocation {
        /// What the memory was for.
        what: &'static str,
        /// Requested size in bytes.
        requested: usize,
    },

    /// The process-wide interrupt callback fired during a batched
    /// operation. Partial results are discarded.
    #[error("operation interrupted")]
    Interrupted,

    /// Persistence or diagnostics file I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persistence encoding or decoding failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
