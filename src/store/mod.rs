//! Store interface family (spec §4.4, §9 "Store interface family").
//!
//! A base read capability (`Store`) plus optional capability traits
//! (`WriteStore`, `PruneStore`) that a given backend may or may not
//! implement. Dynamic dispatch is unavoidable: router/cache/failover
//! compositions are assembled from config at runtime, so everything here is
//! expressed in terms of `Arc<dyn Store>` / `Arc<dyn WriteStore>`.

pub mod cache;
pub mod dedup;
pub mod failover;
pub mod gcs;
pub mod http;
pub mod local;
pub mod options;
pub mod repair;
pub mod router;
pub mod s3;
pub mod sftp;
pub mod ssh;
pub mod swap;
pub mod url;

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::digest::ChunkId;

pub use cache::Cache;
pub use dedup::{DedupQueue, WriteDedupQueue};
pub use failover::FailoverGroup;
pub use options::{StoreOptions, StoreOptionsOverride};
pub use repair::RepairableCache;
pub use router::Router;
pub use swap::{SwapStore, SwapWriteStore};

/// Base read capability every backend implements.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a chunk. Implementations return `Err` wrapping
    /// `CasError::NotFound` (not a bare `Ok(None)`) so composition layers
    /// can match on error kind uniformly (spec §7).
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error>;

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error>;

    /// A human-readable identifier for error wrapping (spec §7:
    /// "backend errors are wrapped with the store's URL").
    fn url(&self) -> &str;

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Write capability; code paths that need to write request this and fail
/// fast if the backend does not implement it.
#[async_trait]
pub trait WriteStore: Store {
    async fn store_chunk(&self, id: ChunkId, chunk: Chunk) -> Result<(), Error>;
}

/// A single id -> occurrence-ish listing entry used by `PruneStore::walk_ids`.
pub type IdStream = std::pin::Pin<Box<dyn futures::Stream<Item = Result<ChunkId, Error>> + Send>>;

/// Listing + deletion capability (garbage collection, verify --repair).
#[async_trait]
pub trait PruneStore: Store {
    fn walk_ids(&self) -> IdStream;

    async fn remove(&self, id: ChunkId) -> Result<(), Error>;
}

/// Outcome of `LocalStore::verify` (spec: "Supplemented features").
#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    pub checked: u64,
    pub corrupt: Vec<ChunkId>,
    pub repaired: u64,
}

/// Index-flavoured counterparts of `Store`/`WriteStore`, keyed by an
/// arbitrary name rather than a `ChunkId` (spec §6 "Index server HTTP(S)
/// surface": "the path is the index name").
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get_index(&self, name: &str) -> Result<Vec<u8>, Error>;
    async fn has_index(&self, name: &str) -> Result<bool, Error>;
}

#[async_trait]
pub trait IndexWriteStore: IndexStore {
    async fn store_index(&self, name: &str, data: Vec<u8>) -> Result<(), Error>;
}

/// The store-file JSON used for hot-reload (spec §6): a list of store URLs
/// (each possibly a `|`-separated failover group) plus an optional cache
/// URL, resolved into a composed `Store` by the URL layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreFile {
    pub stores: Vec<String>,
    pub cache: Option<String>,
}

/// Convenience alias for a fully composed, shareable store.
pub type SharedStore = Arc<dyn Store>;
pub type SharedWriteStore = Arc<dyn WriteStore>;
