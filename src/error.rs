//! Error types for vecino.

use thiserror::Error;

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A vector (or query) has the wrong number of dimensions.
    #[error("vector dimension {got} does not match index dimension {expected}{}", id_suffix(.id))]
    DimensionMismatch {
        expected: usize,
        got: usize,
        id: Option<u64>,
    },

    /// The id is already present in the index.
    #[error("id {0} already exists")]
    DuplicateId(u64),

    /// The id is not present in the index.
    #[error("id {0} not found")]
    MissingId(u64),

    /// The index holds no vectors.
    #[error("index is empty")]
    EmptyIndex,

    /// A construction-time parameter is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An underlying stream failed during save/load.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn id_suffix(id: &Option<u64>) -> String {
    match id {
        Some(id) => format!(" for id {id}"),
        None => String::new(),
    }
}

impl IndexError {
    pub(crate) fn dimension(expected: usize, got: usize) -> Self {
        IndexError::DimensionMismatch {
            expected,
            got,
            id: None,
        }
    }

    pub(crate) fn dimension_for(expected: usize, got: usize, id: u64) -> Self {
        IndexError::DimensionMismatch {
            expected,
            got,
            id: Some(id),
        }
    }
}

/// Result type alias for vecino operations.
pub type Result<T> = std::result::Result<T, IndexError>;
