//! Single-flight de-duplication of concurrent fetches/stores for the same
//! id (spec §4.5: "N concurrent requests for the same id in-flight collapse
//! into one backend call; the other N-1 await its result"). Built on
//! `futures::future::Shared`, which already guarantees the wrapped future's
//! body runs to completion exactly once no matter how many clones are
//! polled concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Error;
use async_trait::async_trait;
use futures::future::{FutureExt, Shared};

use crate::chunk::Chunk;
use crate::digest::ChunkId;

use super::{SharedStore, SharedWriteStore, Store, WriteStore};

type SharedResult<T> = Result<T, Arc<Error>>;
type InFlight<T> = Shared<Pin<Box<dyn Future<Output = SharedResult<T>> + Send>>>;

fn to_anyhow(shared_err: Arc<Error>) -> Error {
    anyhow::anyhow!("{}", shared_err)
}

/// Wraps a `Store` so concurrent `get_chunk`/`has_chunk` calls for the same
/// id share a single underlying call.
pub struct DedupQueue {
    inner: SharedStore,
    get_flight: Mutex<HashMap<ChunkId, InFlight<Chunk>>>,
    has_flight: Mutex<HashMap<ChunkId, InFlight<bool>>>,
}

impl DedupQueue {
    pub fn new(inner: SharedStore) -> Self {
        DedupQueue {
            inner,
            get_flight: Mutex::new(HashMap::new()),
            has_flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Store for DedupQueue {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let existing = self.get_flight.lock().unwrap().get(&id).cloned();
        let fut = if let Some(fut) = existing {
            fut
        } else {
            let inner = Arc::clone(&self.inner);
            let fut: InFlight<Chunk> = async move { inner.get_chunk(id).await.map_err(Arc::new) }
                .boxed()
                .shared();
            self.get_flight.lock().unwrap().insert(id, fut.clone());
            fut
        };

        let result = fut.await;
        self.get_flight.lock().unwrap().remove(&id);
        result.map_err(to_anyhow)
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        let existing = self.has_flight.lock().unwrap().get(&id).cloned();
        let fut = if let Some(fut) = existing {
            fut
        } else {
            let inner = Arc::clone(&self.inner);
            let fut: InFlight<bool> = async move { inner.has_chunk(id).await.map_err(Arc::new) }
                .boxed()
                .shared();
            self.has_flight.lock().unwrap().insert(id, fut.clone());
            fut
        };

        let result = fut.await;
        self.has_flight.lock().unwrap().remove(&id);
        result.map_err(to_anyhow)
    }

    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

/// Write-side counterpart: concurrent stores of the same id collapse into
/// one backend write.
pub struct WriteDedupQueue {
    inner: SharedWriteStore,
    flight: Mutex<HashMap<ChunkId, InFlight<()>>>,
}

impl WriteDedupQueue {
    pub fn new(inner: SharedWriteStore) -> Self {
        WriteDedupQueue {
            inner,
            flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Store for WriteDedupQueue {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        self.inner.get_chunk(id).await
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
impl WriteStore for WriteDedupQueue {
    async fn store_chunk(&self, id: ChunkId, chunk: Chunk) -> Result<(), Error> {
        let existing = self.flight.lock().unwrap().get(&id).cloned();
        let fut = if let Some(fut) = existing {
            fut
        } else {
            let inner = Arc::clone(&self.inner);
            let fut: InFlight<()> = async move { inner.store_chunk(id, chunk).await.map_err(Arc::new) }
                .boxed()
                .shared();
            self.flight.lock().unwrap().insert(id, fut.clone());
            fut
        };

        let result = fut.await;
        self.flight.lock().unwrap().remove(&id);
        result.map_err(to_anyhow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::store::local::LocalStore;
    use crate::store::{StoreOptions, WriteStore as _};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: LocalStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Give concurrent callers a chance to pile up onto the same
            // in-flight future before this resolves.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.inner.get_chunk(id).await
        }
        async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
            self.inner.has_chunk(id).await
        }
        fn url(&self) -> &str {
            self.inner.url()
        }
    }

    #[tokio::test]
    async fn concurrent_gets_for_same_id_collapse_into_one_call() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::open(dir.path(), StoreOptions::default()).unwrap();
        let data = b"deduped".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        local.store_chunk(id, Chunk::from_uncompressed(data.clone())).await.unwrap();

        let counting = Arc::new(CountingStore {
            inner: local,
            calls: AtomicUsize::new(0),
        });
        let calls_handle = Arc::clone(&counting);
        let queue = Arc::new(DedupQueue::new(counting as SharedStore));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.get_chunk(id).await }));
        }
        for h in handles {
            let mut chunk = h.await.unwrap().unwrap();
            assert_eq!(chunk.uncompressed(None).unwrap(), &data[..]);
        }

        assert_eq!(calls_handle.calls.load(Ordering::SeqCst), 1);
    }
}
