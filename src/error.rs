//! Error taxonomy for the store/chunker/assembler core.
//!
//! Application code generally propagates `anyhow::Error`, but every error
//! that crosses a store boundary is wrapped in one of these variants so
//! callers can match on *kind* instead of parsing strings.

use thiserror::Error;

use crate::digest::ChunkId;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("chunk {0} not found")]
    NotFound(ChunkId),

    #[error("chunk invalid: requested {requested}, got {actual}")]
    ChunkInvalid {
        requested: ChunkId,
        actual: ChunkId,
    },

    #[error("transport error talking to {store}: {source}")]
    Transport {
        store: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed index: {0}")]
    MalformedIndex(String),

    #[error("malformed catar archive: {0}")]
    MalformedArchive(String),

    #[error("invalid seed {path}: chunk {id} does not match blob contents")]
    InvalidSeed { path: String, id: ChunkId },

    #[error("operation canceled")]
    Canceled,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound(_))
    }

    /// Wrap a lower-level I/O/network error with the store URL it occurred on.
    pub fn transport(store: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CasError::Transport {
            store: store.into(),
            source: source.into(),
        }
    }
}
