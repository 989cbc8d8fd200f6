//! Cross-module integration tests (spec §8): these exercise the public API
//! the way a `make`/`extract` CLI pair would, rather than a single
//! module's internals. Per-module unit tests already cover the fine-grained
//! invariants; these confirm the pieces compose.

use std::sync::Arc;

use castore::chunker::ChunkerParams;
use castore::digest::Digest;
use castore::error::CasError;
use castore::index::{write_index, Index};
use castore::make::{make, MakeOptions, MakeSource};
use castore::store::local::LocalStore;
use castore::store::{StoreOptions, WriteStore as _};
use castore::{assembler, seed::Seed, InvalidSeedAction};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
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

fn make_options() -> MakeOptions {
    MakeOptions {
        chunker: ChunkerParams::new(1024, 4096, 16384).unwrap(),
        digest: Digest::Sha512_256,
        concurrency: 4,
    }
}

/// Testable property 4: `extract(index(chop(F)), store) == F`.
#[tokio::test]
async fn make_then_extract_reconstructs_the_original_blob() {
    init_logging();

    let src_dir = tempfile::tempdir().unwrap();
    let blob_path = src_dir.path().join("original.bin");
    let data = deterministic_bytes(300_000, 0xf00d);
    std::fs::write(&blob_path, &data).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());

    let index = make(
        CancellationToken::new(),
        MakeSource::Blob(blob_path),
        store.clone(),
        make_options(),
    )
    .await
    .unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let target = out_dir.path().join("reconstructed.bin");
    let stats = assembler::extract(
        &target,
        &index,
        store,
        Vec::new(),
        assembler::ExtractOptions::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert_eq!(stats.chunks_total, index.chunks.len() as u64);
    assert_eq!(stats.chunks_from_storage, index.chunks.len() as u64);
}

/// An index written to disk by `make` and reloaded from bytes must parse
/// back into the same chunk list (testable property 3, exercised against
/// the on-disk `.caibx` bytes rather than an in-memory `Index`).
#[tokio::test]
async fn index_survives_a_round_trip_through_disk() {
    init_logging();

    let src_dir = tempfile::tempdir().unwrap();
    let blob_path = src_dir.path().join("blob.bin");
    let data = deterministic_bytes(50_000, 0xbeef);
    std::fs::write(&blob_path, &data).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());

    let index = make(
        CancellationToken::new(),
        MakeSource::Blob(blob_path),
        store,
        make_options(),
    )
    .await
    .unwrap();

    let mut bytes = Vec::new();
    write_index(&mut bytes, &index).unwrap();
    let reparsed: Index = castore::index::read_index(&mut &bytes[..]).unwrap();

    assert_eq!(reparsed.chunks, index.chunks);
    assert_eq!(reparsed.format, index.format);
}

/// Testable property 8 / scenario S3: a seed holding every chunk of the
/// target means zero fetches ever reach the (here: poisoned) store.
#[tokio::test]
async fn seed_holding_every_chunk_avoids_the_store_entirely() {
    init_logging();

    let src_dir = tempfile::tempdir().unwrap();
    let blob_path = src_dir.path().join("seed_source.bin");
    let data = deterministic_bytes(120_000, 0xc0ffee);
    std::fs::write(&blob_path, &data).unwrap();

    // Build the index with a throwaway store, then reuse the same blob as
    // its own seed against a store that errors on every call.
    let scratch_store_dir = tempfile::tempdir().unwrap();
    let scratch_store = Arc::new(LocalStore::open(scratch_store_dir.path(), StoreOptions::default()).unwrap());
    let index = make(
        CancellationToken::new(),
        MakeSource::Blob(blob_path.clone()),
        scratch_store,
        make_options(),
    )
    .await
    .unwrap();

    struct PoisonedStore;
    #[async_trait::async_trait]
    impl castore::store::Store for PoisonedStore {
        async fn get_chunk(&self, id: castore::digest::ChunkId) -> Result<castore::Chunk, anyhow::Error> {
            panic!("store.get_chunk({}) should never be called when the seed covers everything", id);
        }
        async fn has_chunk(&self, _id: castore::digest::ChunkId) -> Result<bool, anyhow::Error> {
            Ok(false)
        }
        fn url(&self) -> &str {
            "poisoned://unreachable"
        }
    }

    let seed = Seed::new(blob_path, index.clone());

    let out_dir = tempfile::tempdir().unwrap();
    let target = out_dir.path().join("out.bin");
    let stats = assembler::extract(
        &target,
        &index,
        Arc::new(PoisonedStore),
        vec![seed],
        assembler::ExtractOptions {
            invalid_seed_action: InvalidSeedAction::BailOut,
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert_eq!(stats.chunks_from_storage, 0);
    assert_eq!(stats.chunks_from_seed, index.chunks.len() as u64);
}

/// Scenario S7 BailOut: a seed whose blob no longer matches its index
/// fails the whole extract with `InvalidSeed`, without writing a target.
#[tokio::test]
async fn tampered_seed_bails_out_the_whole_extract() {
    init_logging();

    let src_dir = tempfile::tempdir().unwrap();
    let blob_path = src_dir.path().join("seed.bin");
    let data = deterministic_bytes(80_000, 0x1337);
    std::fs::write(&blob_path, &data).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::open(store_dir.path(), StoreOptions::default()).unwrap());
    let index = make(
        CancellationToken::new(),
        MakeSource::Blob(blob_path.clone()),
        store.clone(),
        make_options(),
    )
    .await
    .unwrap();

    // Tamper with the seed blob after the index was built against it.
    let mut tampered = data.clone();
    tampered[40_000] ^= 0xff;
    std::fs::write(&blob_path, &tampered).unwrap();

    let seed = Seed::new(blob_path, index.clone());
    let out_dir = tempfile::tempdir().unwrap();
    let target = out_dir.path().join("out.bin");

    let err = assembler::extract(
        &target,
        &index,
        store,
        vec![seed],
        assembler::ExtractOptions {
            invalid_seed_action: InvalidSeedAction::BailOut,
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err.downcast_ref::<CasError>(), Some(CasError::InvalidSeed { .. })));
    assert!(!target.exists());
}
