use std::io::Read;

use anyhow::{bail, Error};

use super::{
    Index, IndexChunk, IndexFormat, CA_FORMAT_INDEX, CA_FORMAT_TABLE, CA_FORMAT_TABLE_SENTINEL,
};
use crate::digest::ChunkId;
use crate::error::CasError;

fn read_u64<R: Read>(r: &mut R) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_format<R: Read>(r: &mut R) -> Result<IndexFormat, Error> {
    let size = read_u64(r)?;
    let expected_size = 6 * 8;
    if size != expected_size {
        return Err(CasError::MalformedIndex(format!(
            "unexpected index header size {}",
            size
        ))
        .into());
    }
    let ty = read_u64(r)?;
    if ty != CA_FORMAT_INDEX {
        return Err(CasError::MalformedIndex(format!(
            "index type {:#x} != CA_FORMAT_INDEX",
            ty
        ))
        .into());
    }
    let feature_flags = read_u64(r)?;
    let min = read_u64(r)?;
    let avg = read_u64(r)?;
    let max = read_u64(r)?;

    let format = IndexFormat::new(min, avg, max, feature_flags)
        .map_err(|e| CasError::MalformedIndex(e.to_string()))?;

    let table_size = read_u64(r)?;
    if table_size != CA_FORMAT_TABLE_SENTINEL {
        return Err(CasError::MalformedIndex(
            "table header size is not the variable-length sentinel".into(),
        )
        .into());
    }
    let table_type = read_u64(r)?;
    if table_type != CA_FORMAT_TABLE {
        return Err(CasError::MalformedIndex(format!(
            "table type {:#x} != CA_FORMAT_TABLE",
            table_type
        ))
        .into());
    }

    Ok(format)
}

/// Parse a full index from any reader (spec §4.3 "Reader contract").
pub fn read_index<R: Read>(r: &mut R) -> Result<Index, Error> {
    let format = read_format(r)?;

    let mut chunks = Vec::new();
    let mut prev_offset = 0u64;

    loop {
        let offset = read_u64(r)?;
        if offset == 0 {
            break; // terminator
        }
        let mut id_bytes = [0u8; 32];
        r.read_exact(&mut id_bytes)?;

        if offset <= prev_offset {
            return Err(CasError::MalformedIndex(format!(
                "non-increasing chunk offset {} after {}",
                offset, prev_offset
            ))
            .into());
        }

        chunks.push(IndexChunk {
            start: prev_offset,
            size: offset - prev_offset,
            id: ChunkId::from_bytes(id_bytes),
        });
        prev_offset = offset;
    }

    let index = Index { format, chunks };
    index.validate()?;
    Ok(index)
}

/// Incremental record-by-record reader for low-memory streaming
/// consumption (used by the assembler and the index-aware read-seeker).
pub struct IndexStreamReader<R: Read> {
    reader: R,
    pub format: IndexFormat,
    prev_offset: u64,
    done: bool,
}

impl<R: Read> IndexStreamReader<R> {
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let format = read_format(&mut reader)?;
        Ok(IndexStreamReader {
            reader,
            format,
            prev_offset: 0,
            done: false,
        })
    }

    /// Next chunk record, or `None` at the terminator.
    pub fn next_chunk(&mut self) -> Result<Option<IndexChunk>, Error> {
        if self.done {
            return Ok(None);
        }
        let offset = read_u64(&mut self.reader)?;
        if offset == 0 {
            self.done = true;
            return Ok(None);
        }
        let mut id_bytes = [0u8; 32];
        self.reader.read_exact(&mut id_bytes)?;

        if offset <= self.prev_offset {
            bail!(CasError::MalformedIndex(format!(
                "non-increasing chunk offset {} after {}",
                offset, self.prev_offset
            )));
        }

        let chunk = IndexChunk {
            start: self.prev_offset,
            size: offset - self.prev_offset,
            id: ChunkId::from_bytes(id_bytes),
        };
        self.prev_offset = offset;
        Ok(Some(chunk))
    }
}
