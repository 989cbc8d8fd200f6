//! Seeds: a local blob + its index, used by the assembler to satisfy
//! chunks without touching the network.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Error};
use log::warn;

use crate::chunker::{Chunker, ChunkerParams};
use crate::digest::{ChunkId, Digest};
use crate::error::CasError;
use crate::index::Index;

/// What to do when a seed's on-disk index no longer matches its blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidSeedAction {
    /// Abort the whole extract.
    BailOut,
    /// Drop this seed; its chunks come from the store instead.
    Skip,
    /// Re-chunk the blob in memory (the disk index is never touched).
    Regenerate,
}

/// One occurrence of a chunk id inside a seed's blob.
#[derive(Clone, Copy, Debug)]
pub struct Occurrence {
    pub offset: u64,
    pub size: u64,
}

/// A local blob plus its parsed index, with a derived `ChunkId ->
/// occurrences` map built during preflight.
pub struct Seed {
    pub blob_path: PathBuf,
    pub index: Index,
    occurrences: HashMap<ChunkId, Vec<Occurrence>>,
}

impl Seed {
    pub fn new(blob_path: impl Into<PathBuf>, index: Index) -> Self {
        let blob_path = blob_path.into();
        let mut occurrences: HashMap<ChunkId, Vec<Occurrence>> = HashMap::new();
        for chunk in &index.chunks {
            occurrences.entry(chunk.id).or_default().push(Occurrence {
                offset: chunk.start,
                size: chunk.size,
            });
        }
        Seed {
            blob_path,
            index,
            occurrences,
        }
    }

    /// Whether this seed claims to have `id` at all, and at which offsets.
    pub fn occurrences(&self, id: ChunkId) -> &[Occurrence] {
        self.occurrences.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn has(&self, id: ChunkId) -> bool {
        self.occurrences.contains_key(&id)
    }

    /// Re-hash the bytes at `occ` and compare against `id` — the
    /// byte-level re-verify the assembler does before trusting a seed copy.
    pub fn verify_occurrence(&self, file: &mut File, id: ChunkId, occ: Occurrence, digest: Digest) -> Result<bool, Error> {
        let mut buf = vec![0u8; occ.size as usize];
        file.seek(SeekFrom::Start(occ.offset))?;
        file.read_exact(&mut buf)?;
        Ok(digest.hash(&buf) == id)
    }

    /// Run preflight validation: validate one offset per unique id by
    /// re-hashing the referenced region, then act according to `action` on
    /// the first mismatch found.
    ///
    /// Returns `Ok(Some(seed))` with a (possibly regenerated) seed to keep
    /// using, or `Ok(None)` if the seed should be dropped (`Skip`).
    pub fn preflight(mut self, action: InvalidSeedAction) -> Result<Option<Seed>, Error> {
        let digest = self.index.format.digest();
        let mut file = File::open(&self.blob_path)
            .with_context(|| format!("opening seed blob {:?}", self.blob_path))?;

        let mut first_mismatch: Option<ChunkId> = None;
        for (&id, occs) in &self.occurrences {
            let occ = occs[0];
            match self.verify_occurrence(&mut file, id, occ, digest) {
                Ok(true) => continue,
                Ok(false) | Err(_) => {
                    first_mismatch = Some(id);
                    break;
                }
            }
        }

        match first_mismatch {
            None => Ok(Some(self)),
            Some(id) => match action {
                InvalidSeedAction::BailOut => Err(CasError::InvalidSeed {
                    path: self.blob_path.to_string_lossy().into_owned(),
                    id,
                }
                .into()),
                InvalidSeedAction::Skip => {
                    warn!("seed {:?} no longer matches its index, skipping", self.blob_path);
                    Ok(None)
                }
                InvalidSeedAction::Regenerate => {
                    warn!("seed {:?} no longer matches its index, regenerating in memory", self.blob_path);
                    self.regenerate(&mut file)?;
                    Ok(Some(self))
                }
            },
        }
    }

    /// Re-chunk the blob with the index's own size bounds and rebuild the
    /// occurrence map from the result, discarding the stale on-disk index,
    /// without touching disk.
    fn regenerate(&mut self, file: &mut File) -> Result<(), Error> {
        let params = ChunkerParams::new(
            self.index.format.chunk_size_min as usize,
            self.index.format.chunk_size_avg as usize,
            self.index.format.chunk_size_max as usize,
        )?;
        file.seek(SeekFrom::Start(0))?;
        let digest = self.index.format.digest();
        let mut chunker = Chunker::new(&mut *file, params, 0);

        let mut chunks = Vec::new();
        let mut occurrences: HashMap<ChunkId, Vec<Occurrence>> = HashMap::new();
        while let Some((start, bytes)) = chunker.next_chunk()? {
            let id = digest.hash(&bytes);
            let size = bytes.len() as u64;
            occurrences.entry(id).or_default().push(Occurrence { offset: start, size });
            chunks.push(crate::index::IndexChunk { start, size, id });
        }

        self.index.chunks = chunks;
        self.occurrences = occurrences;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.blob_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerParams;
    use crate::index::{Index, IndexChunk, IndexFormat};
    use std::io::Write;

    fn build_seed(data: &[u8], params: ChunkerParams) -> (tempfile::TempDir, Seed) {
        let dir = tempfile::tempdir().unwrap();
        let blob_path = dir.path().join("blob");
        std::fs::write(&blob_path, data).unwrap();

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
        let index = Index { format, chunks };
        (dir, Seed::new(blob_path, index))
    }

    #[test]
    fn preflight_accepts_a_matching_seed() {
        let params = ChunkerParams::new(16, 32, 64).unwrap();
        let (_dir, seed) = build_seed(&[7u8; 500], params);
        let seed = seed.preflight(InvalidSeedAction::BailOut).unwrap();
        assert!(seed.is_some());
    }

    #[test]
    fn bail_out_fails_on_tampered_blob() {
        let params = ChunkerParams::new(16, 32, 64).unwrap();
        let (dir, seed) = build_seed(&[7u8; 500], params);
        let blob_path = dir.path().join("blob");
        let mut f = std::fs::OpenOptions::new().write(true).open(&blob_path).unwrap();
        f.write_all(b"tampered!").unwrap();

        let err = seed.preflight(InvalidSeedAction::BailOut).unwrap_err();
        assert!(matches!(err.downcast_ref::<CasError>(), Some(CasError::InvalidSeed { .. })));
    }

    #[test]
    fn skip_drops_the_seed() {
        let params = ChunkerParams::new(16, 32, 64).unwrap();
        let (dir, seed) = build_seed(&[7u8; 500], params);
        let blob_path = dir.path().join("blob");
        let mut f = std::fs::OpenOptions::new().write(true).open(&blob_path).unwrap();
        f.write_all(b"tampered!").unwrap();

        let seed = seed.preflight(InvalidSeedAction::Skip).unwrap();
        assert!(seed.is_none());
    }

    #[test]
    fn regenerate_rebuilds_from_actual_bytes() {
        let params = ChunkerParams::new(16, 32, 64).unwrap();
        let (dir, seed) = build_seed(&[7u8; 500], params);
        let blob_path = dir.path().join("blob");
        let new_data = vec![9u8; 300];
        std::fs::write(&blob_path, &new_data).unwrap();

        let seed = seed.preflight(InvalidSeedAction::Regenerate).unwrap().unwrap();
        assert_eq!(seed.index.total_size(), 300);
    }
}
