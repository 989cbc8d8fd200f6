//! `UnTarIndex(ctx, fs_sink, index, store, n)` (spec §4.8): plumbs an index
//! + store pair into [`super::decoder::decode_tree`] by first materializing
//! the reconstructed `catar` stream to a temp file via the same seed-aware
//! assembler used for plain blobs (spec §4.7), then decoding that file.
//! There is deliberately no seed list here — a directory restore has
//! nothing locally to seed from before it exists.

use std::path::PathBuf;

use anyhow::{Context as _, Error};
use tokio_util::sync::CancellationToken;

use crate::assembler::{self, ExtractOptions};
use crate::index::Index;
use crate::store::SharedStore;

use super::decoder::decode_tree;
use super::sink::FsSink;

/// Reassemble the `catar` stream described by `index` from `store` and feed
/// it through the decoder into `sink`. `concurrency` bounds the assembler's
/// chunk-fetch fan-out, same as a plain extract.
pub async fn untar_index(
    ctx: CancellationToken,
    sink: &mut dyn FsSink,
    index: &Index,
    store: SharedStore,
    concurrency: usize,
) -> Result<(), Error> {
    if !index.format.is_tar() {
        anyhow::bail!("index does not carry the catar feature flag; refusing to untar a plain blob index");
    }

    let tmp_dir = tempfile_dir()?;
    let tmp_path = tmp_dir.join(format!("untar-index-{}.tmp", std::process::id()));

    let options = ExtractOptions {
        concurrency: concurrency.max(1),
        ..ExtractOptions::default()
    };
    assembler::extract(&tmp_path, index, store, Vec::new(), options, ctx.clone())
        .await
        .context("reassembling catar stream for untar")?;

    // decode_tree and the sink it drives are synchronous filesystem work;
    // block_in_place keeps it off the async scheduler without requiring a
    // 'static, Send sink the way spawn_blocking would (mirrors the
    // per-offset writes in crate::assembler::run).
    let result = tokio::task::block_in_place(|| -> Result<(), Error> {
        let mut f = std::fs::File::open(&tmp_path).with_context(|| format!("opening {:?}", tmp_path))?;
        decode_tree(&ctx, &mut f, sink)
    });

    let _ = std::fs::remove_file(&tmp_path);
    result
}

fn tempfile_dir() -> Result<PathBuf, Error> {
    Ok(std::env::temp_dir())
}
