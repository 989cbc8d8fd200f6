//! Content digests and chunk identifiers.
//!
//! `Digest` is a construction-time choice attached to the data structures
//! that depend on it (an `Index`, a `Store`) rather than process-wide global
//! state.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512Trunc256};

/// Opaque 32-byte chunk identifier. Equality is byte-equal; it has no
/// meaning independent of the `Digest` that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl ChunkId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        ChunkId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 64 {
            bail!("chunk id must be 64 hex characters, got {}", s.len());
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }
        Ok(ChunkId(bytes))
    }
}

/// Selectable cryptographic hash used to derive `ChunkId`s. Rather than a
/// process-wide default, this travels with the `Index`/`Store` that use it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Digest {
    /// SHA-512/256 (the casync/desync default).
    Sha512_256,
    Sha256,
}

impl Default for Digest {
    fn default() -> Self {
        Digest::Sha512_256
    }
}

impl Digest {
    pub fn hash(self, data: &[u8]) -> ChunkId {
        let mut out = [0u8; 32];
        match self {
            Digest::Sha512_256 => {
                let digest = Sha512Trunc256::digest(data);
                out.copy_from_slice(&digest);
            }
            Digest::Sha256 => {
                let digest = Sha256::digest(data);
                out.copy_from_slice(&digest);
            }
        }
        ChunkId(out)
    }

    /// Bit in `IndexFormat::feature_flags` that records which digest was used
    /// to build an index.
    pub fn feature_flag(self) -> u64 {
        match self {
            Digest::Sha512_256 => 0,
            Digest::Sha256 => 1 << 0,
        }
    }

    pub fn from_feature_flags(flags: u64) -> Self {
        if flags & 1 != 0 {
            Digest::Sha256
        } else {
            Digest::Sha512_256
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

mod hex_bytes {
    use serde::{Deserializer, Serializer};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::hex_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let id: super::ChunkId = s.parse().map_err(D::Error::custom)?;
        Ok(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = Digest::Sha512_256.hash(b"hello world");
        let s = id.to_hex();
        assert_eq!(s.len(), 64);
        let parsed: ChunkId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn different_digests_disagree() {
        let a = Digest::Sha512_256.hash(b"abc");
        let b = Digest::Sha256.hash(b"abc");
        assert_ne!(a, b);
    }
}
