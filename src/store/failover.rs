//! `FailoverGroup`: N equivalent peers treated as one store, rotating
//! through on transport error. `NotFound` is a definitive negative, not an
//! error that triggers rotation (spec §4.5).

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Error;
use async_trait::async_trait;
use log::debug;

use crate::chunk::Chunk;
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{SharedStore, Store};

pub struct FailoverGroup {
    peers: Vec<SharedStore>,
    current: AtomicUsize,
    url: String,
}

impl FailoverGroup {
    pub fn new(peers: Vec<SharedStore>) -> Self {
        assert!(!peers.is_empty(), "FailoverGroup needs at least one peer");
        let url = format!(
            "failover({})",
            peers.iter().map(|p| p.url()).collect::<Vec<_>>().join("|")
        );
        FailoverGroup {
            peers,
            current: AtomicUsize::new(0),
            url,
        }
    }

    fn advance(&self, from: usize) -> usize {
        let next = (from + 1) % self.peers.len();
        self.current.store(next, Ordering::SeqCst);
        next
    }
}

#[async_trait]
impl Store for FailoverGroup {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let start = self.current.load(Ordering::SeqCst);
        let mut idx = start;
        let mut last_err: Option<Error> = None;

        for _ in 0..self.peers.len() {
            let peer = &self.peers[idx];
            match peer.get_chunk(id).await {
                Ok(chunk) => return Ok(chunk),
                Err(e) => {
                    let is_not_found = e
                        .downcast_ref::<CasError>()
                        .map(|ce| ce.is_not_found())
                        .unwrap_or(false);
                    if is_not_found {
                        return Err(e);
                    }
                    debug!("failover: peer {} errored, advancing: {}", peer.url(), e);
                    last_err = Some(e);
                    idx = self.advance(idx);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CasError::NotFound(id).into()))
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        let start = self.current.load(Ordering::SeqCst);
        let mut idx = start;
        let mut last_err: Option<Error> = None;

        for _ in 0..self.peers.len() {
            let peer = &self.peers[idx];
            match peer.has_chunk(id).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    idx = self.advance(idx);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CasError::NotFound(id).into()))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::store::local::LocalStore;
    use crate::store::{StoreOptions, WriteStore};

    struct AlwaysErrors(String);

    #[async_trait]
    impl Store for AlwaysErrors {
        async fn get_chunk(&self, _id: ChunkId) -> Result<Chunk, Error> {
            Err(CasError::transport(&self.0, anyhow::anyhow!("unreachable")).into())
        }
        async fn has_chunk(&self, _id: ChunkId) -> Result<bool, Error> {
            Err(CasError::transport(&self.0, anyhow::anyhow!("unreachable")).into())
        }
        fn url(&self) -> &str {
            &self.0
        }
    }

    #[tokio::test]
    async fn rotates_past_erroring_peer() {
        let dir = tempfile::tempdir().unwrap();
        let local = std::sync::Arc::new(LocalStore::open(dir.path(), StoreOptions::default()).unwrap());
        let data = b"fallback data".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        local
            .store_chunk(id, crate::chunk::Chunk::from_uncompressed(data.clone()))
            .await
            .unwrap();

        let broken: SharedStore = std::sync::Arc::new(AlwaysErrors("http://unreachable".into()));
        let group = FailoverGroup::new(vec![broken, local]);

        let mut chunk = group.get_chunk(id).await.unwrap();
        assert_eq!(chunk.uncompressed(None).unwrap(), &data[..]);
    }
}
