//! `make`: directory or blob → index. A directory goes through
//! `catar::encode_tree` to become a byte stream first; a blob is read
//! directly. Either way the stream is chunked, each chunk is digested,
//! compressed, and put into the store, and the resulting chunk list is
//! handed to the index writer.
//!
//! A directory source is bridged into the chunker through a `UnixStream`
//! pair: [`crate::catar::encode_tree`] runs on its own thread writing one
//! end, the chunker reads the other, so an arbitrarily large tree never
//! has to sit fully in memory before chunking starts.

use std::fs::File;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Error};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::catar;
use crate::chunk::Chunk;
use crate::chunker::{Chunker, ChunkerParams};
use crate::digest::Digest;
use crate::error::CasError;
use crate::index::{Index, IndexChunk, IndexFormat, FEATURE_FLAG_TAR};
use crate::store::SharedWriteStore;

/// What `make` reads from.
pub enum MakeSource {
    /// A single file, chunked as an opaque blob.
    Blob(PathBuf),
    /// A directory tree, chunked as its `catar` encoding.
    Directory(PathBuf),
}

#[derive(Clone, Debug)]
pub struct MakeOptions {
    pub chunker: ChunkerParams,
    pub digest: Digest,
    pub concurrency: usize,
}

/// Chunk `source`, push every chunk to `store`, and return the index that
/// reassembles it.
pub async fn make(
    ctx: CancellationToken,
    source: MakeSource,
    store: SharedWriteStore,
    options: MakeOptions,
) -> Result<Index, Error> {
    let is_tar = matches!(source, MakeSource::Directory(_));
    let input: Box<dyn Read + Send> = match source {
        MakeSource::Blob(path) => {
            Box::new(File::open(&path).with_context(|| format!("opening {:?}", path))?)
        }
        MakeSource::Directory(path) => Box::new(spawn_tar_encoder(ctx.clone(), path)?),
    };

    let feature_flags = options.digest.feature_flag() | if is_tar { FEATURE_FLAG_TAR } else { 0 };
    let format = IndexFormat::new(
        options.chunker.min as u64,
        options.chunker.avg as u64,
        options.chunker.max as u64,
        feature_flags,
    )?;

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::new();
    let mut chunks = Vec::new();

    let mut chunker = Chunker::new(input, options.chunker, 0);
    loop {
        if ctx.is_cancelled() {
            for h in handles {
                let h: tokio::task::JoinHandle<Result<(), Error>> = h;
                h.abort();
            }
            return Err(CasError::Canceled.into());
        }

        let next = tokio::task::block_in_place(|| chunker.next_chunk())?;
        let (start, bytes) = match next {
            Some(c) => c,
            None => break,
        };

        let id = options.digest.hash(&bytes);
        chunks.push(IndexChunk {
            start,
            size: bytes.len() as u64,
            id,
        });

        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            store.store_chunk(id, Chunk::from_uncompressed(bytes)).await
        }));
    }

    for h in handles {
        h.await.context("chunk upload task panicked")??;
    }

    let index = Index { format, chunks };
    index.validate()?;
    Ok(index)
}

/// Run the `catar` encoder on a background thread, writing into one end of
/// a `UnixStream` pair and returning the other end as the chunker's input.
fn spawn_tar_encoder(ctx: CancellationToken, root: PathBuf) -> Result<UnixStream, Error> {
    let (writer_end, reader_end) = UnixStream::pair().context("creating encoder pipe")?;
    std::thread::Builder::new()
        .name("catar-encode".into())
        .spawn(move || {
            let mut writer_end = writer_end;
            if let Err(e) = catar::encode_tree(&ctx, &mut writer_end, &root) {
                log::warn!("catar encoder for {:?} failed: {:#}", root, e);
            }
        })
        .context("spawning catar encoder thread")?;
    Ok(reader_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local::LocalStore;
    use crate::store::StoreOptions;
    use std::fs;

    #[tokio::test]
    async fn makes_an_index_from_a_blob() {
        let src_dir = tempfile::tempdir().unwrap();
        let blob_path = src_dir.path().join("data.bin");
        fs::write(&blob_path, vec![7u8; 10_000]).unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());

        let options = MakeOptions {
            chunker: ChunkerParams::new(256, 512, 1024).unwrap(),
            digest: Digest::Sha512_256,
            concurrency: 4,
        };
        let index = make(
            CancellationToken::new(),
            MakeSource::Blob(blob_path),
            store.clone(),
            options,
        )
        .await
        .unwrap();

        assert_eq!(index.total_size(), 10_000);
        for c in &index.chunks {
            assert!(store.has_chunk(c.id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn makes_an_index_from_a_directory_with_the_tar_flag_set() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::write(src_dir.path().join("a.txt"), b"contents of a").unwrap();
        fs::create_dir(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("sub/b.txt"), b"contents of b").unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());

        let options = MakeOptions {
            chunker: ChunkerParams::new(64, 128, 256).unwrap(),
            digest: Digest::Sha512_256,
            concurrency: 4,
        };
        let index = make(
            CancellationToken::new(),
            MakeSource::Directory(src_dir.path().to_path_buf()),
            store,
            options,
        )
        .await
        .unwrap();

        assert!(index.format.is_tar());
        assert!(index.total_size() > 0);
    }
}
