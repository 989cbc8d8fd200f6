//! Local filesystem chunk store.
//!
//! Layout (spec §4.4): `<root>/<id[0..4]>/<id>.cacnk`, sharded by the first
//! four hex characters of the id to keep per-directory population and
//! listing cheap. Writes go to a unique temp file in the target directory,
//! fsynced where available, then renamed into place — concurrent puts of
//! the same id are safe because the final content is content-addressed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Error};
use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::chunk::{self, Chunk};
use crate::crypt::CryptConfig;
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{IdStream, PruneStore, Store, StoreOptions, VerifyReport, WriteStore};

pub struct LocalStore {
    root: PathBuf,
    options: StoreOptions,
    crypt: Option<CryptConfig>,
    tmp_counter: AtomicU64,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating store root {:?}", root))?;
        let crypt = if options.encryption {
            let password = options
                .encryption_password
                .as_ref()
                .ok_or_else(|| CasError::Configuration("encryption enabled without a password".into()))?;
            let salt = root.to_string_lossy();
            Some(CryptConfig::derive(password.as_bytes(), salt.as_bytes())?)
        } else {
            None
        };
        Ok(LocalStore {
            root,
            options,
            crypt,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn shard_dir(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[0..4])
    }

    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        self.shard_dir(id).join(format!("{}.cacnk", id.to_hex()))
    }

    fn next_tmp_name(&self, dir: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(".tmp-{}-{}", std::process::id(), n))
    }

    async fn read_raw(&self, id: ChunkId) -> Result<Vec<u8>, Error> {
        let path = self.chunk_path(&id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::NotFound(id).into())
            }
            Err(e) => Err(CasError::transport(self.url(), e).into()),
        }
    }

    /// Walk every chunk file, recompute its digest in a bounded worker
    /// pool, and optionally delete files that don't hash to their own
    /// filename (spec "Supplemented features": verify --repair).
    pub async fn verify(&self, concurrency: usize, repair: bool) -> Result<VerifyReport, Error> {
        let ids: Vec<ChunkId> = walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ChunkId>().ok())
            })
            .collect();

        let report = Arc::new(std::sync::Mutex::new(VerifyReport::default()));

        futures::stream::iter(ids)
            .for_each_concurrent(concurrency, |id| {
                let report = Arc::clone(&report);
                async move {
                    let corrupt = match self.read_raw(id).await {
                        Ok(data) => chunk::chunk_from_store_bytes(
                            data,
                            id,
                            !self.options.uncompressed,
                            self.options.encryption,
                            self.crypt.as_ref(),
                            self.options.digest,
                            false,
                        )
                        .is_err(),
                        Err(_) => true,
                    };

                    let mut report = report.lock().unwrap();
                    report.checked += 1;
                    if corrupt {
                        report.corrupt.push(id);
                        if repair {
                            let _ = std::fs::remove_file(self.chunk_path(&id));
                            report.repaired += 1;
                        }
                    }
                }
            })
            .await;

        Ok(Arc::try_unwrap(report).unwrap().into_inner().unwrap())
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let data = self.read_raw(id).await?;
        chunk::chunk_from_store_bytes(
            data,
            id,
            !self.options.uncompressed,
            self.options.encryption,
            self.crypt.as_ref(),
            self.options.digest,
            self.options.skip_verify,
        )
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        Ok(tokio::fs::metadata(self.chunk_path(&id)).await.is_ok())
    }

    fn url(&self) -> &str {
        self.root.to_str().unwrap_or("<local store>")
    }
}

#[async_trait]
impl WriteStore for LocalStore {
    async fn store_chunk(&self, id: ChunkId, mut chunk: Chunk) -> Result<(), Error> {
        let dir = self.shard_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        chunk.set_encrypted(self.options.encryption);
        let bytes = if self.options.uncompressed {
            chunk.uncompressed(self.crypt.as_ref())?.to_vec()
        } else {
            chunk
                .compressed(self.crypt.as_ref(), self.options.compression_level)?
                .to_vec()
        };

        let tmp_path = self.next_tmp_name(&dir);
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            use tokio::io::AsyncWriteExt;
            f.write_all(&bytes).await?;
            f.sync_all().await.ok(); // best-effort fsync
        }

        let final_path = self.chunk_path(&id);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

#[async_trait]
impl PruneStore for LocalStore {
    fn walk_ids(&self) -> IdStream {
        let ids: Vec<ChunkId> = walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ChunkId>().ok())
            })
            .collect();
        Box::pin(futures::stream::iter(ids.into_iter().map(Ok)))
    }

    async fn remove(&self, id: ChunkId) -> Result<(), Error> {
        match tokio::fs::remove_file(self.chunk_path(&id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn opts() -> StoreOptions {
        StoreOptions::default()
    }

    #[tokio::test]
    async fn store_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), opts()).unwrap();

        let data = b"hello local store".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        let chunk = Chunk::from_uncompressed(data.clone());
        store.store_chunk(id, chunk).await.unwrap();

        assert!(store.has_chunk(id).await.unwrap());
        let mut fetched = store.get_chunk(id).await.unwrap();
        assert_eq!(fetched.uncompressed(None).unwrap(), &data[..]);
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), opts()).unwrap();
        let id = Digest::Sha512_256.hash(b"nope");
        let err = store.get_chunk(id).await.unwrap_err();
        assert!(err.downcast_ref::<CasError>().map(|e| e.is_not_found()).unwrap_or(false));
    }

    #[tokio::test]
    async fn verify_repair_removes_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), opts()).unwrap();

        let data = b"good chunk".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        store.store_chunk(id, Chunk::from_uncompressed(data)).await.unwrap();

        // corrupt the file in place
        std::fs::write(store.chunk_path(&id), b"garbage").unwrap();

        let report = store.verify(4, true).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.corrupt, vec![id]);
        assert_eq!(report.repaired, 1);
        assert!(!store.has_chunk(id).await.unwrap());
    }
}
