//! Seed-aware parallel assembler.
//!
//! For each unique chunk id in the output index, bytes are obtained once —
//! preferring a seed's blob over a store round-trip — and then written to
//! every offset that id occurs at. That single-fetch-per-id cache is the
//! same single-flight shape as [`crate::store::DedupQueue`], generalized
//! here to also look in seeds before falling through to the store; it is
//! what gives duplicate chunk ids at most one fetch and a multi-offset
//! write fan-out, without a separate read-back from the partially-written
//! target file racing the writer that produced it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Error};
use log::debug;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::CasError;
use crate::index::Index;
use crate::seed::{InvalidSeedAction, Seed};
use crate::store::SharedStore;

/// Where to put the reconstructed file: either the caller-provided path
/// directly, or a sibling temp file renamed into place on success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetMode {
    /// Write directly into `target_path`; left partially-written on error.
    InPlace,
    /// Write into a sibling temp file, renamed into place on success and
    /// removed on error or cancellation.
    Atomic,
}

#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub concurrency: usize,
    pub invalid_seed_action: InvalidSeedAction,
    pub target_mode: TargetMode,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            concurrency: 10,
            invalid_seed_action: InvalidSeedAction::BailOut,
            target_mode: TargetMode::Atomic,
        }
    }
}

/// Per-extract statistics, published on success.
#[derive(Debug, Default, Clone)]
pub struct ExtractStats {
    pub chunks_total: u64,
    pub bytes_total: u64,
    pub chunks_from_storage: u64,
    pub chunks_from_seed: u64,
    pub chunks_self_seeded: u64,
}

enum Source {
    Seed,
    Store,
}

/// Reconstruct `target_path` from `index`, fetching chunks from `store`
/// and preferring `seeds` where possible.
pub async fn extract(
    target_path: &Path,
    index: &Index,
    store: SharedStore,
    seeds: Vec<Seed>,
    options: ExtractOptions,
    cancel: CancellationToken,
) -> Result<ExtractStats, Error> {
    let mut live_seeds = Vec::with_capacity(seeds.len());
    for seed in seeds {
        if let Some(seed) = seed.preflight(options.invalid_seed_action)? {
            live_seeds.push(seed);
        }
    }
    let seeds = Arc::new(live_seeds);

    let (mut file, final_path, tmp_path) = open_target(target_path, index.total_size(), options.target_mode)?;
    file.set_len(index.total_size())
        .with_context(|| format!("preallocating target file {:?}", target_path))?;
    let file = Arc::new(file);

    let result = run(index, store, Arc::clone(&seeds), Arc::clone(&file), options, cancel).await;

    drop(file); // all writers dropped before rename/cleanup

    match (&result, tmp_path) {
        (Ok(_), Some(tmp)) => {
            std::fs::rename(&tmp, &final_path)
                .with_context(|| format!("renaming {:?} into place as {:?}", tmp, final_path))?;
        }
        (Err(_), Some(tmp)) => {
            let _ = std::fs::remove_file(&tmp);
        }
        _ => {}
    }

    result
}

fn open_target(
    target_path: &Path,
    _total_size: u64,
    mode: TargetMode,
) -> Result<(File, PathBuf, Option<PathBuf>), Error> {
    match mode {
        TargetMode::InPlace => {
            let file = File::create(target_path)
                .with_context(|| format!("creating target file {:?}", target_path))?;
            Ok((file, target_path.to_path_buf(), None))
        }
        TargetMode::Atomic => {
            let dir = target_path.parent().unwrap_or_else(|| Path::new("."));
            let tmp_path = dir.join(format!(
                ".{}.tmp-{}",
                target_path.file_name().and_then(|n| n.to_str()).unwrap_or("extract"),
                std::process::id()
            ));
            let file = File::create(&tmp_path)
                .with_context(|| format!("creating temp target file {:?}", tmp_path))?;
            Ok((file, target_path.to_path_buf(), Some(tmp_path)))
        }
    }
}

async fn run(
    index: &Index,
    store: SharedStore,
    seeds: Arc<Vec<Seed>>,
    file: Arc<File>,
    options: ExtractOptions,
    cancel: CancellationToken,
) -> Result<ExtractStats, Error> {
    let digest = index.format.digest();

    // Group occurrences by id, preserving first-appearance order, so every
    // unique id is fetched exactly once and the rest fan out from it.
    let mut offsets_by_id: HashMap<crate::digest::ChunkId, Vec<u64>> = HashMap::new();
    let mut order = Vec::new();
    for c in &index.chunks {
        if !offsets_by_id.contains_key(&c.id) {
            order.push(c.id);
        }
        offsets_by_id.entry(c.id).or_default().push(c.start);
    }
    let sizes: HashMap<crate::digest::ChunkId, u64> =
        index.chunks.iter().map(|c| (c.id, c.size)).collect();

    let stats = Arc::new(Stats::default());
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::new();

    for id in order {
        if cancel.is_cancelled() {
            return Err(CasError::Canceled.into());
        }
        let offsets = offsets_by_id.remove(&id).unwrap();
        let size = sizes[&id];
        let store = Arc::clone(&store);
        let seeds = Arc::clone(&seeds);
        let file = Arc::clone(&file);
        let stats = Arc::clone(&stats);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            if cancel.is_cancelled() {
                return Err::<(), Error>(CasError::Canceled.into());
            }

            let (bytes, source) = fetch_chunk_bytes(id, size, &seeds, &store, digest).await?;
            if bytes.len() as u64 != size {
                return Err(anyhow::anyhow!(
                    "chunk {} resolved to {} bytes, index expects {}",
                    id,
                    bytes.len(),
                    size
                ));
            }

            for (i, &offset) in offsets.iter().enumerate() {
                tokio::task::block_in_place(|| file.write_all_at(&bytes, offset))
                    .with_context(|| format!("writing chunk {} at offset {}", id, offset))?;
                if i == 0 {
                    match source {
                        Source::Seed => stats.from_seed.fetch_add(1, Ordering::Relaxed),
                        Source::Store => stats.from_storage.fetch_add(1, Ordering::Relaxed),
                    };
                } else {
                    stats.self_seeded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.await.context("assembler worker task panicked")??;
    }

    Ok(ExtractStats {
        chunks_total: index.chunks.len() as u64,
        bytes_total: index.total_size(),
        chunks_from_storage: stats.from_storage.load(Ordering::Relaxed),
        chunks_from_seed: stats.from_seed.load(Ordering::Relaxed),
        chunks_self_seeded: stats.self_seeded.load(Ordering::Relaxed),
    })
}

#[derive(Default)]
struct Stats {
    from_storage: AtomicU64,
    from_seed: AtomicU64,
    self_seeded: AtomicU64,
}

/// Resolve one unique chunk id to its uncompressed bytes: try every seed in
/// order, with a byte-level re-verify, else fetch from the store.
async fn fetch_chunk_bytes(
    id: crate::digest::ChunkId,
    size: u64,
    seeds: &[Seed],
    store: &SharedStore,
    digest: crate::digest::Digest,
) -> Result<(Vec<u8>, Source), Error> {
    for seed in seeds {
        for occ in seed.occurrences(id) {
            if occ.size != size {
                continue;
            }
            let path = seed.path().to_path_buf();
            let occ = *occ;
            let verified = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, Error> {
                let mut f = File::open(&path)?;
                let mut buf = vec![0u8; occ.size as usize];
                f.seek(SeekFrom::Start(occ.offset))?;
                f.read_exact(&mut buf)?;
                if digest.hash(&buf) == id {
                    Ok(Some(buf))
                } else {
                    Ok(None)
                }
            })
            .await
            .context("seed re-verify task panicked")??;

            if let Some(bytes) = verified {
                return Ok((bytes, Source::Seed));
            }
            debug!("seed {:?} claimed {} but bytes changed underneath us, falling through", seed.path(), id);
        }
    }

    let mut chunk = store.get_chunk(id).await?;
    let bytes = chunk.uncompressed(None)?.to_vec();
    Ok((bytes, Source::Store))
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
    use std::sync::Arc as StdArc;

    fn build_index(data: &[u8], params: ChunkerParams) -> Index {
        let digest = Digest::Sha512_256;
        let format = IndexFormat::new(params.min as u64, params.avg as u64, params.max as u64, 0).unwrap();
        let mut chunker = Chunker::new(data, params, 0);
        let mut chunks = Vec::new();
        while let Some((start, bytes)) = chunker.next_chunk().unwrap() {
            chunks.push(IndexChunk {
                start,
                size: bytes.len() as u64,
                id: digest.hash(&bytes),
            });
        }
        Index { format, chunks }
    }

    fn deterministic_bytes(n: usize, seed: u32) -> Vec<u8> {
        let mut v = Vec::with_capacity(n);
        let mut x = seed | 1;
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            v.push((x & 0xff) as u8);
        }
        v
    }

    #[tokio::test]
    async fn extract_from_store_reconstructs_the_blob() {
        let params = ChunkerParams::new(64, 128, 256).unwrap();
        let data = deterministic_bytes(4096, 0x1234);
        let index = build_index(&data, params);

        let store_dir = tempfile::tempdir().unwrap();
        let store = StdArc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());
        for c in &index.chunks {
            let bytes = data[c.start as usize..c.end() as usize].to_vec();
            store.store_chunk(c.id, Chunk::from_uncompressed(bytes)).await.unwrap();
        }

        let out_dir = tempfile::tempdir().unwrap();
        let target = out_dir.path().join("out.bin");
        let stats = extract(
            &target,
            &index,
            store,
            Vec::new(),
            ExtractOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let written = std::fs::read(&target).unwrap();
        assert_eq!(written, data);
        assert_eq!(stats.chunks_from_storage, index.chunks.len() as u64);
        assert_eq!(stats.chunks_from_seed, 0);
    }

    #[tokio::test]
    async fn extract_with_full_seed_makes_zero_store_calls() {
        let params = ChunkerParams::new(64, 128, 256).unwrap();
        let data = deterministic_bytes(4096, 0xabcd);
        let index = build_index(&data, params);

        let seed_dir = tempfile::tempdir().unwrap();
        let seed_blob = seed_dir.path().join("seed.bin");
        std::fs::write(&seed_blob, &data).unwrap();
        let seed = Seed::new(seed_blob, index.clone());

        // empty store: any store.get_chunk call would fail.
        let store_dir = tempfile::tempdir().unwrap();
        let store = StdArc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());

        let out_dir = tempfile::tempdir().unwrap();
        let target = out_dir.path().join("out.bin");
        let stats = extract(
            &target,
            &index,
            store,
            vec![seed],
            ExtractOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert_eq!(stats.chunks_from_storage, 0);
        assert_eq!(stats.chunks_from_seed, index.chunks.len() as u64);
    }

    #[tokio::test]
    async fn duplicate_chunk_ids_fetch_once_and_fan_out() {
        // repeat a block so the same chunk id shows up twice in the index.
        let params = ChunkerParams::new(8, 16, 32).unwrap();
        let block = deterministic_bytes(400, 0x55);
        let mut data = block.clone();
        data.extend_from_slice(&block);
        let index = build_index(&data, params);

        let store_dir = tempfile::tempdir().unwrap();
        let store = StdArc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());
        let mut unique_ids = std::collections::HashSet::new();
        for c in &index.chunks {
            unique_ids.insert(c.id);
            if store.has_chunk(c.id).await.unwrap() {
                continue;
            }
            let bytes = data[c.start as usize..c.end() as usize].to_vec();
            store.store_chunk(c.id, Chunk::from_uncompressed(bytes)).await.unwrap();
        }

        let out_dir = tempfile::tempdir().unwrap();
        let target = out_dir.path().join("out.bin");
        let stats = extract(
            &target,
            &index,
            store,
            Vec::new(),
            ExtractOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(stats.chunks_from_storage <= unique_ids.len() as u64);
        assert_eq!(stats.chunks_from_storage + stats.self_seeded, index.chunks.len() as u64);
    }
}
