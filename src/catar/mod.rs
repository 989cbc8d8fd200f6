//! `catar`: the streaming directory archive format (spec §4.8). This is the
//! format the chunker ingests when `make` is pointed at a directory tree
//! instead of a flat blob, and the format `extract`/`untar` reconstitutes
//! through one of three sinks: a real filesystem, a GNU-tar archive, or a
//! diff-friendly mtree manifest.

pub mod decoder;
pub mod encoder;
pub mod format;
pub mod mtree;
pub mod sink;
pub mod untar_index;

pub use decoder::decode_tree;
pub use encoder::encode_tree;
pub use format::EntryMetadata;
pub use mtree::MtreeSink;
pub use sink::{FsSink, LocalFsSink, TarSink};
pub use untar_index::untar_index;
