//! Read-through cache (spec §4.5): consult the (writable) cache first, and
//! on miss fetch from the source and best-effort populate the cache. A
//! cache write failure is logged, never propagated — the read the caller
//! asked for already succeeded from the source.

use anyhow::Error;
use async_trait::async_trait;
use log::warn;

use crate::chunk::Chunk;
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{SharedStore, SharedWriteStore, Store};

pub struct Cache {
    cache: SharedWriteStore,
    source: SharedStore,
    url: String,
}

impl Cache {
    pub fn new(cache: SharedWriteStore, source: SharedStore) -> Self {
        let url = format!("cache({} -> {})", cache.url(), source.url());
        Cache { cache, source, url }
    }
}

#[async_trait]
impl Store for Cache {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        match self.cache.get_chunk(id).await {
            Ok(chunk) => return Ok(chunk),
            Err(e) => {
                let is_not_found = e
                    .downcast_ref::<CasError>()
                    .map(|ce| ce.is_not_found())
                    .unwrap_or(false);
                if !is_not_found {
                    warn!("cache {} read failed, falling back to source: {}", self.cache.url(), e);
                }
            }
        }

        let chunk = self.source.get_chunk(id).await?;
        if let Err(e) = self.cache.store_chunk(id, chunk.clone()).await {
            warn!("cache {} insert failed for {}: {}", self.cache.url(), id, e);
        }
        Ok(chunk)
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        if self.cache.has_chunk(id).await.unwrap_or(false) {
            return Ok(true);
        }
        self.source.has_chunk(id).await
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) -> Result<(), Error> {
        self.source.close().await?;
        self.cache.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::store::local::LocalStore;
    use crate::store::{StoreOptions, WriteStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn populates_cache_on_miss_and_serves_from_it_next_time() {
        let cache_dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let cache_store = Arc::new(LocalStore::open(cache_dir.path(), StoreOptions::default()).unwrap());
        let source_store = Arc::new(LocalStore::open(source_dir.path(), StoreOptions::default()).unwrap());

        let data = b"cached data".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        source_store
            .store_chunk(id, Chunk::from_uncompressed(data.clone()))
            .await
            .unwrap();

        let cache = Cache::new(cache_store.clone(), source_store.clone());
        let mut fetched = cache.get_chunk(id).await.unwrap();
        assert_eq!(fetched.uncompressed(None).unwrap(), &data[..]);

        assert!(cache_store.has_chunk(id).await.unwrap());
    }
}
