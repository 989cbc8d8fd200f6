//! Chunk identity, compression and the encode/decode/verify pipeline.
//!
//! A `Chunk` is a tagged variant, not a subclass hierarchy, that holds the
//! uncompressed bytes, the compressed-(and-possibly-encrypted) bytes, or
//! both, deriving whichever form is missing on demand and verifying the id
//! lazily on first access.

use anyhow::Error;

use crate::crypt::CryptConfig;
use crate::digest::{ChunkId, Digest};
use crate::error::CasError;

#[derive(Clone)]
enum Body {
    Uncompressed(Vec<u8>),
    Compressed(Vec<u8>),
    Both {
        uncompressed: Vec<u8>,
        compressed: Vec<u8>,
    },
}

/// In-memory carrier for a chunk's bytes. `compressed` here means "as
/// stored" — possibly also encrypted, tracked separately via `encrypted`.
///
/// Cheaply `Clone`-able (a plain byte copy) so composition layers such as
/// the dedup single-flight queue can hand the same fetched chunk to several
/// waiters.
#[derive(Clone)]
pub struct Chunk {
    body: Body,
    encrypted: bool,
    id: Option<ChunkId>,
    id_verified: bool,
}

impl Chunk {
    /// Build a chunk from freshly-read uncompressed bytes (the "make" path).
    pub fn from_uncompressed(data: Vec<u8>) -> Self {
        Chunk {
            body: Body::Uncompressed(data),
            encrypted: false,
            id: None,
            id_verified: false,
        }
    }

    /// Build a chunk from bytes read off a store, in their stored form.
    /// `id` is the id the store was asked for; `skip_verify` controls
    /// whether it's trusted without recomputation (only safe on a trusted
    /// path).
    pub fn from_stored(
        data: Vec<u8>,
        id: ChunkId,
        compressed: bool,
        encrypted: bool,
        skip_verify: bool,
    ) -> Self {
        let body = if compressed {
            Body::Compressed(data)
        } else {
            Body::Uncompressed(data)
        };
        Chunk {
            body,
            encrypted,
            id: Some(id),
            id_verified: skip_verify, // skip_verify: trust without recomputation
        }
    }

    /// Compute (and cache) this chunk's id from its uncompressed bytes.
    /// `crypt` must be `Some` if this chunk is encrypted and only the
    /// stored (compressed+encrypted) bytes are currently held.
    pub fn id(&mut self, digest: Digest, crypt: Option<&CryptConfig>) -> Result<ChunkId, Error> {
        if let Some(id) = self.id {
            if self.id_verified {
                return Ok(id);
            }
        }
        let uncompressed = self.uncompressed(crypt)?.to_vec();
        let computed = digest.hash(&uncompressed);
        if let Some(requested) = self.id {
            if requested != computed {
                return Err(CasError::ChunkInvalid {
                    requested,
                    actual: computed,
                }
                .into());
            }
        }
        self.id = Some(computed);
        self.id_verified = true;
        Ok(computed)
    }

    /// Uncompressed bytes, decrypting/decompressing as needed. `crypt` must
    /// be `Some` if this chunk is encrypted.
    pub fn uncompressed(&mut self, crypt: Option<&CryptConfig>) -> Result<&[u8], Error> {
        if let Body::Compressed(_) = &self.body {
            self.decompress(crypt)?;
        }
        match &self.body {
            Body::Uncompressed(data) => Ok(data),
            Body::Both { uncompressed, .. } => Ok(uncompressed),
            Body::Compressed(_) => unreachable!("decompressed above"),
        }
    }

    fn decompress(&mut self, crypt: Option<&CryptConfig>) -> Result<(), Error> {
        let compressed = match &self.body {
            Body::Compressed(data) => data.clone(),
            _ => return Ok(()),
        };

        let plain_compressed = if self.encrypted {
            let crypt = crypt.ok_or_else(|| anyhow::anyhow!("chunk is encrypted but no CryptConfig was provided"))?;
            crypt.decrypt(&compressed)?
        } else {
            compressed.clone()
        };

        let uncompressed = zstd::decode_all(&plain_compressed[..])?;

        self.body = Body::Both {
            uncompressed,
            compressed,
        };
        Ok(())
    }

    /// Bytes as they should be stored (compressed, optionally encrypted),
    /// computing that form from the uncompressed bytes if necessary.
    pub fn compressed(
        &mut self,
        crypt: Option<&CryptConfig>,
        compression_level: i32,
    ) -> Result<&[u8], Error> {
        if let Body::Uncompressed(_) = &self.body {
            self.compress(crypt, compression_level)?;
        }
        match &self.body {
            Body::Compressed(data) => Ok(data),
            Body::Both { compressed, .. } => Ok(compressed),
            Body::Uncompressed(_) => unreachable!("compressed above"),
        }
    }

    fn compress(&mut self, crypt: Option<&CryptConfig>, level: i32) -> Result<(), Error> {
        let uncompressed = match &self.body {
            Body::Uncompressed(data) => data.clone(),
            _ => return Ok(()),
        };

        let zstd_bytes = zstd::encode_all(&uncompressed[..], level)?;

        let stored = if self.encrypted {
            let crypt = crypt.ok_or_else(|| anyhow::anyhow!("encryption requested but no CryptConfig was provided"))?;
            crypt.encrypt(&zstd_bytes)?
        } else {
            zstd_bytes
        };

        self.body = Body::Both {
            uncompressed,
            compressed: stored,
        };
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }
}

/// Build a `Chunk` from bytes just fetched off a store, applying the
/// store's verify policy. Used by every `Store::get_chunk` implementation
/// so verification policy lives in one place.
pub fn chunk_from_store_bytes(
    data: Vec<u8>,
    expected_id: ChunkId,
    compressed: bool,
    encrypted: bool,
    crypt: Option<&CryptConfig>,
    digest: Digest,
    skip_verify: bool,
) -> Result<Chunk, Error> {
    let mut chunk = Chunk::from_stored(data, expected_id, compressed, encrypted, skip_verify);

    if !skip_verify {
        // `id()` recomputes the digest since `id_verified` is false, and
        // raises `ChunkInvalid` itself on mismatch.
        chunk.id(digest, crypt)?;
    }

    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_plain() {
        let data = b"hello castore".to_vec();
        let mut chunk = Chunk::from_uncompressed(data.clone());
        let id = chunk.id(Digest::Sha512_256, None).unwrap();
        let stored = chunk.compressed(None, 3).unwrap().to_vec();

        let mut fetched = chunk_from_store_bytes(stored, id, true, false, None, Digest::Sha512_256, false).unwrap();
        assert_eq!(fetched.uncompressed(None).unwrap(), &data[..]);
    }

    #[test]
    fn encode_decode_round_trip_encrypted() {
        let crypt = CryptConfig::derive(b"pw", b"salt1234salt1234").unwrap();
        let data = vec![7u8; 10_000];

        let mut chunk = Chunk::from_uncompressed(data.clone());
        chunk.set_encrypted(true);
        let id = chunk.id(Digest::Sha256, Some(&crypt)).unwrap();
        let stored = chunk.compressed(Some(&crypt), 1).unwrap().to_vec();

        let mut fetched =
            chunk_from_store_bytes(stored, id, true, true, Some(&crypt), Digest::Sha256, false).unwrap();
        assert_eq!(fetched.uncompressed(Some(&crypt)).unwrap(), &data[..]);
    }

    #[test]
    fn verify_mismatch_is_rejected() {
        let data = b"abc".to_vec();
        let mut chunk = Chunk::from_uncompressed(data);
        let _id = chunk.id(Digest::Sha512_256, None).unwrap();
        let stored = chunk.compressed(None, 3).unwrap().to_vec();

        let wrong_id = Digest::Sha512_256.hash(b"xyz");
        let result = chunk_from_store_bytes(stored, wrong_id, true, false, None, Digest::Sha512_256, false);
        assert!(result.is_err());
    }
}
