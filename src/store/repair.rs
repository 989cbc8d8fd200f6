//! `RepairableCache` (spec §4.5): wraps a cache-flavoured store so that a
//! corrupt cache entry self-heals instead of poisoning every subsequent
//! read. On `ChunkInvalid`, the bad entry is deleted and `NotFound` is
//! returned in its place — the outer `Cache` sees a miss, re-fetches from
//! the source, and repopulates the cache with a good copy.

use anyhow::Error;
use async_trait::async_trait;
use log::warn;

use crate::chunk::Chunk;
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{PruneStore, Store, WriteStore};

pub struct RepairableCache<S> {
    inner: S,
}

impl<S> RepairableCache<S> {
    pub fn new(inner: S) -> Self {
        RepairableCache { inner }
    }
}

#[async_trait]
impl<S: PruneStore> Store for RepairableCache<S> {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        match self.inner.get_chunk(id).await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                let is_invalid = matches!(e.downcast_ref::<CasError>(), Some(CasError::ChunkInvalid { .. }));
                if is_invalid {
                    warn!("cache entry {} at {} is corrupt, evicting", id, self.inner.url());
                    if let Err(remove_err) = self.inner.remove(id).await {
                        warn!("failed to evict corrupt cache entry {}: {}", id, remove_err);
                    }
                    Err(CasError::NotFound(id).into())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        self.inner.has_chunk(id).await
    }

    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

#[async_trait]
impl<S: PruneStore + WriteStore> WriteStore for RepairableCache<S> {
    async fn store_chunk(&self, id: ChunkId, chunk: Chunk) -> Result<(), Error> {
        self.inner.store_chunk(id, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::store::local::LocalStore;
    use crate::store::StoreOptions;

    #[tokio::test]
    async fn corrupt_entry_is_evicted_and_reported_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::open(dir.path(), StoreOptions::default()).unwrap();

        let data = b"repairable".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        local.store_chunk(id, Chunk::from_uncompressed(data)).await.unwrap();
        std::fs::write(local.chunk_path(&id), b"garbage").unwrap();

        let cache = RepairableCache::new(local);
        let err = cache.get_chunk(id).await.unwrap_err();
        assert!(err.downcast_ref::<CasError>().map(|e| e.is_not_found()).unwrap_or(false));
        assert!(!cache.has_chunk(id).await.unwrap());
    }
}
