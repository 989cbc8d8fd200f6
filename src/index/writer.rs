use std::io::Write;

use anyhow::Error;

use super::{Index, IndexFormat, CA_FORMAT_INDEX, CA_FORMAT_TABLE, CA_FORMAT_TABLE_SENTINEL};
use crate::digest::ChunkId;

fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<(), Error> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_header<W: Write>(w: &mut W, format: &IndexFormat) -> Result<(), Error> {
    write_u64(w, 6 * 8)?; // header size
    write_u64(w, CA_FORMAT_INDEX)?;
    write_u64(w, format.feature_flags)?;
    write_u64(w, format.chunk_size_min)?;
    write_u64(w, format.chunk_size_avg)?;
    write_u64(w, format.chunk_size_max)?;

    write_u64(w, CA_FORMAT_TABLE_SENTINEL)?;
    write_u64(w, CA_FORMAT_TABLE)?;
    Ok(())
}

/// Serialize a full index (spec §4.3 "Writer contract"). Byte-exact
/// round-trip with `read_index` for any valid index (testable property 3).
pub fn write_index<W: Write>(w: &mut W, index: &Index) -> Result<(), Error> {
    write_header(w, &index.format)?;
    for chunk in &index.chunks {
        write_u64(w, chunk.end())?;
        w.write_all(chunk.id.as_bytes())?;
    }
    write_u64(w, 0)?; // terminator
    Ok(())
}

/// Incremental writer used by the chunker/"make" pipeline: the header is
/// flushed immediately, chunk records are appended one at a time as the
/// chunker produces boundaries, and the terminator is written on `finish`.
pub struct IndexStreamWriter<W: Write> {
    writer: W,
    format: IndexFormat,
}

impl<W: Write> IndexStreamWriter<W> {
    pub fn new(mut writer: W, format: IndexFormat) -> Result<Self, Error> {
        write_header(&mut writer, &format)?;
        Ok(IndexStreamWriter { writer, format })
    }

    pub fn push_chunk(&mut self, end_offset: u64, id: ChunkId) -> Result<(), Error> {
        write_u64(&mut self.writer, end_offset)?;
        self.writer.write_all(id.as_bytes())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, Error> {
        write_u64(&mut self.writer, 0)?;
        Ok(self.writer)
    }

    pub fn format(&self) -> &IndexFormat {
        &self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::index::{read_index, IndexChunk};

    #[test]
    fn round_trip() {
        let format = IndexFormat::new(1024, 4096, 16384, 0).unwrap();
        let ids: Vec<ChunkId> = (0u8..5)
            .map(|i| Digest::Sha512_256.hash(&[i; 8]))
            .collect();
        let mut start = 0u64;
        let mut chunks = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let size = if i == 4 { 500 } else { 4096 };
            chunks.push(IndexChunk { start, size, id: *id });
            start += size;
        }
        let index = Index { format, chunks };
        index.validate().unwrap();

        let mut buf = Vec::new();
        write_index(&mut buf, &index).unwrap();

        let parsed = read_index(&mut &buf[..]).unwrap();
        assert_eq!(parsed.format, index.format);
        assert_eq!(parsed.chunks, index.chunks);

        let mut buf2 = Vec::new();
        write_index(&mut buf2, &parsed).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn streaming_writer_matches_batch() {
        let format = IndexFormat::new(16, 32, 64, 0).unwrap();
        let mut sw = IndexStreamWriter::new(Vec::new(), format).unwrap();
        let id1 = Digest::Sha512_256.hash(b"a");
        let id2 = Digest::Sha512_256.hash(b"b");
        sw.push_chunk(32, id1).unwrap();
        sw.push_chunk(60, id2).unwrap();
        let streamed = sw.finish().unwrap();

        let index = Index {
            format,
            chunks: vec![
                IndexChunk { start: 0, size: 32, id: id1 },
                IndexChunk { start: 32, size: 28, id: id2 },
            ],
        };
        let mut batch = Vec::new();
        write_index(&mut batch, &index).unwrap();

        assert_eq!(streamed, batch);
    }
}
