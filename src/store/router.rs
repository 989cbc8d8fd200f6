//! Ordered router: tries each child store left-to-right on read.

use anyhow::Error;
use async_trait::async_trait;
use log::debug;

use crate::chunk::Chunk;
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{SharedStore, Store};

pub struct Router {
    children: Vec<SharedStore>,
    url: String,
    /// If true, a transport error from a child aborts the whole lookup
    /// instead of falling through to the next child (spec §4.5: "either
    /// fall through to the next child (default) or fail fast").
    fail_fast: bool,
}

impl Router {
    pub fn new(children: Vec<SharedStore>, fail_fast: bool) -> Self {
        let url = format!(
            "router({})",
            children.iter().map(|c| c.url()).collect::<Vec<_>>().join("|")
        );
        Router { children, url, fail_fast }
    }
}

#[async_trait]
impl Store for Router {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let mut last_err: Option<Error> = None;
        for child in &self.children {
            match child.get_chunk(id).await {
                Ok(chunk) => return Ok(chunk),
                Err(e) => {
                    let is_not_found = e
                        .downcast_ref::<CasError>()
                        .map(|ce| ce.is_not_found())
                        .unwrap_or(false);
                    if is_not_found {
                        last_err = Some(e);
                        continue;
                    }
                    debug!("router: child {} failed for {}: {}", child.url(), id, e);
                    if self.fail_fast {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CasError::NotFound(id).into()))
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        for child in &self.children {
            if child.has_chunk(id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) -> Result<(), Error> {
        // reverse dependency order (spec §3 lifecycle)
        for child in self.children.iter().rev() {
            child.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local::LocalStore;
    use crate::store::StoreOptions;
    use crate::digest::Digest;

    #[tokio::test]
    async fn falls_through_to_next_child_on_not_found() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = std::sync::Arc::new(LocalStore::open(dir_a.path(), StoreOptions::default()).unwrap());
        let b = std::sync::Arc::new(LocalStore::open(dir_b.path(), StoreOptions::default()).unwrap());

        let data = b"only in b".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        use crate::store::WriteStore;
        b.store_chunk(id, crate::chunk::Chunk::from_uncompressed(data.clone())).await.unwrap();

        let router = Router::new(vec![a, b], false);
        let mut chunk = router.get_chunk(id).await.unwrap();
        assert_eq!(chunk.uncompressed(None).unwrap(), &data[..]);
    }
}
