//! `Tar(ctx, writer, fs_source)` (spec §4.8): depth-first walk of a real
//! directory tree, emitting the binary record stream. `fs_source` here is
//! simply the local filesystem rooted at the given path — the archive
//! codec's role in THE CORE is the streaming format, not an abstract
//! traversal interface (spec §1: command-line/filesystem-discovery plumbing
//! beyond the store contract is out of scope).

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use anyhow::{Context as _, Error};
use nix::sys::stat::{major, minor};
use tokio_util::sync::CancellationToken;

use crate::error::CasError;

use super::format::{self, EntryFlags, EntryMetadata};

/// Encode the directory tree rooted at `root` as a `catar` record stream.
pub fn encode_tree<W: Write>(ctx: &CancellationToken, writer: &mut W, root: &Path) -> Result<(), Error> {
    let meta = fs::symlink_metadata(root).with_context(|| format!("stat {:?}", root))?;
    if !meta.is_dir() {
        return Err(CasError::MalformedArchive(format!("{:?} is not a directory", root)).into());
    }
    encode_dir(ctx, writer, root, &entry_metadata_for(&meta))
}

fn entry_metadata_for(meta: &fs::Metadata) -> EntryMetadata {
    let mut flags = EntryFlags::empty();
    if meta.is_dir() {
        flags |= EntryFlags::DIRECTORY;
    } else if meta.file_type().is_symlink() {
        flags |= EntryFlags::SYMLINK;
    } else if meta.file_type().is_char_device() || meta.file_type().is_block_device() {
        flags |= EntryFlags::DEVICE;
    }
    let is_regular = flags.is_empty();
    EntryMetadata {
        mode: meta.mode(),
        flags,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime_ns: (meta.mtime().max(0) as u64) * 1_000_000_000 + meta.mtime_nsec() as u64,
        size: if is_regular { meta.size() } else { 0 },
    }
}

fn encode_dir<W: Write>(
    ctx: &CancellationToken,
    writer: &mut W,
    dir: &Path,
    dir_meta: &EntryMetadata,
) -> Result<(), Error> {
    format::write_entry(writer, dir_meta)?;

    let mut children: Vec<fs::DirEntry> = fs::read_dir(dir)
        .with_context(|| format!("reading directory {:?}", dir))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading directory {:?}", dir))?;
    children.sort_by_key(|e| e.file_name());

    for entry in &children {
        if ctx.is_cancelled() {
            return Err(CasError::Canceled.into());
        }
        let path = entry.path();
        let meta = fs::symlink_metadata(&path).with_context(|| format!("stat {:?}", path))?;
        let child_meta = entry_metadata_for(&meta);

        format::write_filename(writer, entry.file_name().to_string_lossy().as_bytes())?;

        if child_meta.is_dir() {
            encode_dir(ctx, writer, &path, &child_meta)?;
        } else if child_meta.is_symlink() {
            format::write_entry(writer, &child_meta)?;
            let target = fs::read_link(&path).with_context(|| format!("reading symlink {:?}", path))?;
            format::write_symlink(writer, target.to_string_lossy().as_bytes())?;
        } else if child_meta.is_device() {
            format::write_entry(writer, &child_meta)?;
            let rdev = meta.rdev();
            format::write_device(writer, major(rdev), minor(rdev))?;
        } else {
            format::write_entry(writer, &child_meta)?;
            let mut f = fs::File::open(&path).with_context(|| format!("opening file {:?}", path))?;
            let mut buf = Vec::with_capacity(child_meta.size as usize);
            f.read_to_end(&mut buf).with_context(|| format!("reading file {:?}", path))?;
            format::write_payload(writer, &buf)?;
        }
    }

    format::write_goodbye(writer, children.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catar::decoder::decode_tree;
    use crate::catar::sink::LocalFsSink;

    #[test]
    fn encodes_and_decodes_a_small_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/file.txt"), b"hello catar").unwrap();
        std::os::unix::fs::symlink("file.txt", src.path().join("sub/link")).unwrap();

        let mut buf = Vec::new();
        let ctx = CancellationToken::new();
        encode_tree(&ctx, &mut buf, src.path()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let mut sink = LocalFsSink::new(dst.path());
        decode_tree(&ctx, &mut &buf[..], &mut sink).unwrap();

        assert_eq!(fs::read(dst.path().join("sub/file.txt")).unwrap(), b"hello catar");
        assert_eq!(fs::read_link(dst.path().join("sub/link")).unwrap(), Path::new("file.txt"));
    }
}
