//! Index-aware read-seeker: read-only streaming of a
//! reconstructed blob without writing it out first. A byte offset maps to
//! its containing chunk via binary search over the index's chunk
//! end-offsets; the chunk is fetched (cached behind the single most
//! recently used chunk, since reads are overwhelmingly sequential) and the
//! requested slice is copied out of it.

use anyhow::{bail, Error};
use tokio::sync::Mutex;

use crate::digest::ChunkId;
use crate::index::Index;
use crate::store::SharedStore;

/// Positioned, read-only view of the blob `index` describes, backed by
/// `store`. Not `Clone`; share via `Arc` if multiple readers are needed —
/// each would contend on the same one-chunk cache.
pub struct IndexReadSeeker {
    index: Index,
    store: SharedStore,
    cached: Mutex<Option<(ChunkId, Vec<u8>)>>,
}

impl IndexReadSeeker {
    pub fn new(index: Index, store: SharedStore) -> Self {
        IndexReadSeeker {
            index,
            store,
            cached: Mutex::new(None),
        }
    }

    pub fn len(&self) -> u64 {
        self.index.total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy as many bytes as fit in `buf` starting at `offset`, stopping at
    /// a chunk boundary (the caller loops for longer reads — the same shape
    /// as `std::io::Read::read`). Returns 0 at or past end of stream.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.len() {
            return Ok(0);
        }
        let chunk_idx = self
            .index
            .chunk_at(offset)
            .ok_or_else(|| anyhow::anyhow!("offset {} has no containing chunk", offset))?;
        let c = self.index.chunks[chunk_idx];

        let bytes = self.fetch(c.id).await?;
        if bytes.len() as u64 != c.size {
            bail!("chunk {} resolved to {} bytes, index expects {}", c.id, bytes.len(), c.size);
        }

        let within = (offset - c.start) as usize;
        let n = (bytes.len() - within).min(buf.len());
        buf[..n].copy_from_slice(&bytes[within..within + n]);
        Ok(n)
    }

    /// Read an exact range `[offset, offset + buf.len())`, looping across
    /// chunk boundaries as needed. Errors if the stream ends early.
    pub async fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.read_at(offset, buf).await?;
            if n == 0 {
                bail!("unexpected end of stream reading at offset {}", offset);
            }
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    async fn fetch(&self, id: ChunkId) -> Result<Vec<u8>, Error> {
        {
            let cache = self.cached.lock().await;
            if let Some((cached_id, bytes)) = cache.as_ref() {
                if *cached_id == id {
                    return Ok(bytes.clone());
                }
            }
        }
        let mut chunk = self.store.get_chunk(id).await?;
        let bytes = chunk.uncompressed(None)?.to_vec();
        *self.cached.lock().await = Some((id, bytes.clone()));
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::chunker::{Chunker, ChunkerParams};
    use crate::digest::Digest;
    use crate::index::{IndexChunk, IndexFormat};
    use crate::store::local::LocalStore;
    use crate::store::{StoreOptions, WriteStore};
    use std::sync::Arc;

    fn deterministic_bytes(n: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(n);
        let mut x: u32 = 0xcafe_babe;
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            v.push((x & 0xff) as u8);
        }
        v
    }

    async fn build(data: &[u8]) -> (tempfile::TempDir, IndexReadSeeker) {
        let params = ChunkerParams::new(32, 64, 128).unwrap();
        let digest = Digest::Sha512_256;
        let format = IndexFormat::new(32, 64, 128, 0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path(), StoreOptions::default()).unwrap());

        let mut chunker = Chunker::new(data, params, 0);
        let mut chunks = Vec::new();
        while let Some((start, bytes)) = chunker.next_chunk().unwrap() {
            let id = digest.hash(&bytes);
            store.store_chunk(id, Chunk::from_uncompressed(bytes.clone())).await.unwrap();
            chunks.push(IndexChunk { start, size: bytes.len() as u64, id });
        }
        let index = Index { format, chunks };
        (dir, IndexReadSeeker::new(index, store))
    }

    #[tokio::test]
    async fn sequential_reads_reconstruct_the_blob() {
        let data = deterministic_bytes(5000);
        let (_dir, seeker) = build(&data).await;

        let mut out = vec![0u8; data.len()];
        seeker.read_exact_at(0, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn random_access_mid_chunk_slices_correctly() {
        let data = deterministic_bytes(5000);
        let (_dir, seeker) = build(&data).await;

        let mut out = vec![0u8; 100];
        seeker.read_exact_at(4321, &mut out).await.unwrap();
        assert_eq!(out, data[4321..4421]);
    }

    #[tokio::test]
    async fn past_end_reads_zero_bytes() {
        let data = deterministic_bytes(100);
        let (_dir, seeker) = build(&data).await;
        let mut out = [0u8; 10];
        let n = seeker.read_at(100, &mut out).await.unwrap();
        assert_eq!(n, 0);
    }
}
