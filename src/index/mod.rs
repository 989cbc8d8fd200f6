//! The `.caibx`/`.caidx` index format: header + ordered chunk records.
//!
//! On-disk layout (spec §4.3), little-endian 64-bit words throughout:
//!
//! ```text
//! IndexHeader:  size:u64  type:u64 = CA_FORMAT_INDEX
//!               flags:u64
//!               min:u64  avg:u64  max:u64
//! TableHeader:  size:u64 = 0xFFFFFFFFFFFFFFFF   // sentinel
//!               type:u64 = CA_FORMAT_TABLE
//! Records*:     offset:u64  id:[32]byte          // repeated
//! Terminator:   offset:u64 = 0
//! ```
//!
//! The stored `offset` is the *end* of each chunk; size is derived as
//! `offset_i - offset_{i-1}` with `offset_{-1} == 0`.

mod reader;
mod writer;

pub use reader::{read_index, IndexStreamReader};
pub use writer::{write_index, IndexStreamWriter};

use anyhow::{bail, Error};

use crate::digest::{ChunkId, Digest};

pub const CA_FORMAT_INDEX: u64 = 0x96824d9c7b129ff9;
pub const CA_FORMAT_TABLE: u64 = 0xe75b9e112f17417d;
pub const CA_FORMAT_TABLE_SENTINEL: u64 = 0xFFFFFFFFFFFFFFFF;

const INDEX_HEADER_SIZE: u64 = 8 + 8 + 8 + 8 + 8 + 8; // size,type,flags,min,avg,max
const TABLE_HEADER_SIZE: u64 = 8 + 8; // sentinel,type
const RECORD_SIZE: u64 = 8 + 32; // offset,id

/// Bit signaling that an index's payload is a `catar` archive stream
/// rather than an opaque blob (spec §6 `TarFeatureFlags`).
pub const FEATURE_FLAG_TAR: u64 = 1 << 62;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexFormat {
    pub feature_flags: u64,
    pub chunk_size_min: u64,
    pub chunk_size_avg: u64,
    pub chunk_size_max: u64,
}

impl IndexFormat {
    pub fn new(min: u64, avg: u64, max: u64, feature_flags: u64) -> Result<Self, Error> {
        if !(1 <= min && min <= avg && avg <= max) {
            bail!("invalid index chunk size bounds: min={} avg={} max={}", min, avg, max);
        }
        if !avg.is_power_of_two() {
            bail!("index avg chunk size {} is not a power of two", avg);
        }
        Ok(IndexFormat {
            feature_flags,
            chunk_size_min: min,
            chunk_size_avg: avg,
            chunk_size_max: max,
        })
    }

    pub fn digest(&self) -> Digest {
        Digest::from_feature_flags(self.feature_flags)
    }

    pub fn is_tar(&self) -> bool {
        self.feature_flags & FEATURE_FLAG_TAR != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexChunk {
    pub start: u64,
    pub size: u64,
    pub id: ChunkId,
}

impl IndexChunk {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Clone, Debug)]
pub struct Index {
    pub format: IndexFormat,
    pub chunks: Vec<IndexChunk>,
}

impl Index {
    pub fn total_size(&self) -> u64 {
        self.chunks.last().map(|c| c.end()).unwrap_or(0)
    }

    /// Validate the invariants of spec §3: contiguity, and every size in
    /// `[min, max]` except possibly the final (tail) chunk.
    pub fn validate(&self) -> Result<(), Error> {
        let mut expected_start = 0u64;
        let n = self.chunks.len();
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.start != expected_start {
                bail!(
                    "index chunk {} starts at {} but previous chunk ended at {}",
                    i,
                    chunk.start,
                    expected_start
                );
            }
            let is_last = i + 1 == n;
            if chunk.size < self.format.chunk_size_min && !is_last {
                bail!("index chunk {} is {} bytes, below min {}", i, chunk.size, self.format.chunk_size_min);
            }
            if chunk.size > self.format.chunk_size_max {
                bail!("index chunk {} is {} bytes, above max {}", i, chunk.size, self.format.chunk_size_max);
            }
            expected_start = chunk.end();
        }
        Ok(())
    }

    /// Binary search for the chunk containing stream offset `pos`.
    pub fn chunk_at(&self, pos: u64) -> Option<usize> {
        if pos >= self.total_size() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.chunks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if pos < self.chunks[mid].end() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Some(lo)
    }
}
