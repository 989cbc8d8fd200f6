//! Content-addressed deduplicating blob store and assembler, compatible
//! with the `casync` on-disk formats (`.caibx`/`.caidx` indexes, `.catar`
//! archives, `.cacnk` chunk files).
//!
//! Leaf-to-root: [`digest`] and [`chunk`] give every byte span an identity
//! and an on-store encoding; [`chunker`] cuts a stream into such spans;
//! [`index`] serializes the ordered list that reassembles a blob; [`store`]
//! is the pluggable backend family (+ composition: router, failover,
//! cache, dedup, swap, repair) that chunks live in; [`seed`] and
//! [`assembler`] turn an index plus a store plus local seed blobs back into
//! a file; [`catar`] is the archive format the chunker ingests when the
//! target is a directory tree rather than a flat blob; [`make`] and
//! [`read_seeker`] are the two streaming entry points (produce an index,
//! read a reconstructed blob positionally); [`chunk_server`] exposes a
//! store over the HTTP(S) boundary named in spec §6.

pub mod assembler;
pub mod catar;
pub mod chunk;
pub mod chunk_server;
pub mod chunker;
pub mod crypt;
pub mod digest;
pub mod error;
pub mod index;
pub mod make;
pub mod read_seeker;
pub mod seed;
pub mod store;

pub use chunk::Chunk;
pub use chunker::{Chunker, ChunkerParams};
pub use digest::{ChunkId, Digest};
pub use error::CasError;
pub use index::{Index, IndexChunk, IndexFormat};
pub use seed::{InvalidSeedAction, Seed};
