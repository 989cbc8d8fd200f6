//! Content-defined chunking via a Buzhash-style rolling hash.
//!
//! Boundary rule (spec §4.1): scanning forward from the last boundary, the
//! first `min` bytes are never evaluated. After that, the rolling hash is
//! updated for every byte and a boundary is declared when
//! `(hash mod avg) == avg - 1`, or when the chunk reaches `max` bytes —
//! whichever comes first. If both conditions would fire on the same byte,
//! the `max` rule wins (the cut lands exactly at `max`).

use std::io::Read;

use anyhow::{bail, Error};

/// Width of the rolling window, in bytes. Part of the on-disk-compatible
/// boundary algorithm; changing it changes where chunks are cut.
pub const WINDOW_SIZE: usize = 48;

include!("chunker_table.rs");

#[inline]
fn rol32(v: u32, shift: u32) -> u32 {
    v.rotate_left(shift % 32)
}

/// Parameters for content-defined chunking. `avg` must be a power of two;
/// `min < avg < max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkerParams {
    pub min: usize,
    pub avg: usize,
    pub max: usize,
}

impl ChunkerParams {
    pub fn new(min: usize, avg: usize, max: usize) -> Result<Self, Error> {
        if !avg.is_power_of_two() {
            bail!("chunker avg size {} is not a power of two", avg);
        }
        if !(min < avg && avg < max) {
            bail!(
                "chunker sizes must satisfy min < avg < max (got {}, {}, {})",
                min,
                avg,
                max
            );
        }
        Ok(ChunkerParams { min, avg, max })
    }

    fn avg_mask(&self) -> u32 {
        (self.avg as u32) - 1
    }
}

/// Streaming chunk boundary producer over any `Read`.
pub struct Chunker<R: Read> {
    input: R,
    params: ChunkerParams,

    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_filled: usize,
    hash: u32,

    chunk: Vec<u8>,
    /// Offset (in the underlying stream) of the first byte of `chunk`.
    chunk_start: u64,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(input: R, params: ChunkerParams, start_offset: u64) -> Self {
        Chunker {
            input,
            params,
            window: [0u8; WINDOW_SIZE],
            window_pos: 0,
            window_filled: 0,
            hash: 0,
            chunk: Vec::with_capacity(params.avg),
            chunk_start: start_offset,
            eof: false,
        }
    }

    fn roll_byte(&mut self, byte: u8) {
        let leaving = self.window[self.window_pos];
        self.window[self.window_pos] = byte;
        self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;

        if self.window_filled < WINDOW_SIZE {
            self.window_filled += 1;
            // Window not yet full: no byte leaves, just shift in.
            self.hash = rol32(self.hash, 1) ^ BUZHASH_TABLE[byte as usize];
        } else {
            self.hash = rol32(self.hash, 1)
                ^ rol32(BUZHASH_TABLE[leaving as usize], WINDOW_SIZE as u32)
                ^ BUZHASH_TABLE[byte as usize];
        }
    }

    fn read_one(&mut self) -> Result<Option<u8>, Error> {
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Produce the next chunk, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<(u64, Vec<u8>)>, Error> {
        if self.eof {
            return Ok(None);
        }

        loop {
            let byte = match self.read_one()? {
                Some(b) => b,
                None => {
                    self.eof = true;
                    if self.chunk.is_empty() {
                        return Ok(None);
                    }
                    let start = self.chunk_start;
                    let data = std::mem::take(&mut self.chunk);
                    return Ok(Some((start, data)));
                }
            };

            self.chunk.push(byte);
            self.roll_byte(byte);

            let pos = self.chunk.len();

            if pos >= self.params.max {
                // max rule always wins on a tie with the hash hit.
                let start = self.chunk_start;
                let data = std::mem::take(&mut self.chunk);
                self.chunk_start = start + data.len() as u64;
                self.reset_window();
                return Ok(Some((start, data)));
            }

            if pos >= self.params.min && (self.hash & self.params.avg_mask()) == self.params.avg_mask() {
                let start = self.chunk_start;
                let data = std::mem::take(&mut self.chunk);
                self.chunk_start = start + data.len() as u64;
                self.reset_window();
                return Ok(Some((start, data)));
            }
        }
    }

    fn reset_window(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.window_pos = 0;
        self.window_filled = 0;
        self.hash = 0;
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<(u64, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(c)) => Some(Ok(c)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChunkerParams {
        ChunkerParams::new(16 * 1024, 64 * 1024, 256 * 1024).unwrap()
    }

    fn deterministic_bytes(n: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(n);
        let mut x: u32 = 0x9e3779b9;
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            v.push((x & 0xff) as u8);
        }
        v
    }

    #[test]
    fn rejects_bad_params() {
        assert!(ChunkerParams::new(10, 100, 1000).is_err()); // avg not pow2
        assert!(ChunkerParams::new(100, 64, 1000).is_err()); // min >= avg
        assert!(ChunkerParams::new(10, 64, 32).is_err()); // avg >= max
    }

    #[test]
    fn deterministic_and_bounded() {
        let data = deterministic_bytes(1024 * 1024);

        let mut chunker1 = Chunker::new(&data[..], params(), 0);
        let mut boundaries1 = Vec::new();
        while let Some((start, bytes)) = chunker1.next_chunk().unwrap() {
            boundaries1.push((start, bytes.len()));
        }

        let mut chunker2 = Chunker::new(&data[..], params(), 0);
        let mut boundaries2 = Vec::new();
        while let Some((start, bytes)) = chunker2.next_chunk().unwrap() {
            boundaries2.push((start, bytes.len()));
        }

        assert_eq!(boundaries1, boundaries2);

        let total: usize = boundaries1.iter().map(|(_, l)| l).sum();
        assert_eq!(total, data.len());

        let p = params();
        let n = boundaries1.len();
        for (i, (_start, len)) in boundaries1.iter().enumerate() {
            if i + 1 == n {
                assert!(*len <= p.max);
            } else {
                assert!(*len >= p.min && *len <= p.max);
            }
        }

        // contiguity
        let mut expect_start = 0u64;
        for (start, len) in &boundaries1 {
            assert_eq!(*start, expect_start);
            expect_start += *len as u64;
        }
    }

    #[test]
    fn tail_shorter_than_min_is_emitted() {
        let data = deterministic_bytes(100);
        let p = ChunkerParams::new(1024, 4096, 16384).unwrap();
        let mut chunker = Chunker::new(&data[..], p, 0);
        let (start, bytes) = chunker.next_chunk().unwrap().unwrap();
        assert_eq!(start, 0);
        assert_eq!(bytes.len(), 100);
        assert!(chunker.next_chunk().unwrap().is_none());
    }
}
