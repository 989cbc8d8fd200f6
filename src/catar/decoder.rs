//! `UnTar(ctx, reader, fs_sink)` (spec §4.8): parses the record stream and
//! issues operations against an [`FsSink`]. Record types this decoder does
//! not know about (today: `USER`/`GROUP`/`XATTR`/`ACL_USER`/`ACL_GROUP`/
//! `FCAPS`/`SELINUX`, or anything a future producer invents) are skipped —
//! the forward-compatibility contract in spec §6.

use std::convert::TryInto;
use std::io::Read;
use std::path::Path;

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use crate::error::CasError;

use super::format::{
    self, EntryMetadata, RawRecord, CA_FORMAT_DEVICE, CA_FORMAT_ENTRY, CA_FORMAT_FILENAME,
    CA_FORMAT_GOODBYE, CA_FORMAT_PAYLOAD, CA_FORMAT_SYMLINK,
};
use super::sink::FsSink;

/// Decode a `catar` stream into `sink`, starting from the root directory.
pub fn decode_tree<R: Read>(ctx: &CancellationToken, reader: &mut R, sink: &mut dyn FsSink) -> Result<(), Error> {
    let root_entry = expect_record(reader, CA_FORMAT_ENTRY)?;
    let root_meta = format::decode_entry(&root_entry.body)?;
    if !root_meta.is_dir() {
        return Err(CasError::MalformedArchive("archive root is not a directory".into()).into());
    }
    let root = Path::new(".");
    sink.make_dir(root, &root_meta)?;
    apply_common(sink, root, &root_meta)?;

    decode_dir_body(ctx, reader, sink, root)?;
    sink.finalize()
}

fn apply_common(sink: &mut dyn FsSink, path: &Path, meta: &EntryMetadata) -> Result<(), Error> {
    sink.set_owner(path, meta.uid, meta.gid)?;
    sink.set_permissions(path, meta.mode)?;
    sink.set_times(path, meta.mtime_ns)?;
    Ok(())
}

fn decode_dir_body<R: Read>(
    ctx: &CancellationToken,
    reader: &mut R,
    sink: &mut dyn FsSink,
    dir: &Path,
) -> Result<(), Error> {
    loop {
        if ctx.is_cancelled() {
            return Err(CasError::Canceled.into());
        }
        let record = match format::read_record(reader)? {
            Some(r) => r,
            None => {
                return Err(CasError::MalformedArchive("archive ended mid-directory, no GOODBYE seen".into()).into())
            }
        };

        if record.ty == CA_FORMAT_GOODBYE {
            return Ok(());
        }
        if record.ty != CA_FORMAT_FILENAME {
            continue; // unrecognized extension record: ignore, keep scanning (spec §6)
        }

        let name = String::from_utf8(record.body)
            .map_err(|_| Error::from(CasError::MalformedArchive("filename is not valid utf-8".into())))?;
        let path = dir.join(&name);

        let entry = expect_record(reader, CA_FORMAT_ENTRY)?;
        let meta = format::decode_entry(&entry.body)?;

        if meta.is_dir() {
            sink.make_dir(&path, &meta)?;
            apply_common(sink, &path, &meta)?;
            decode_dir_body(ctx, reader, sink, &path)?;
        } else if meta.is_symlink() {
            let target = expect_record(reader, CA_FORMAT_SYMLINK)?;
            sink.make_symlink(&path, &target.body)?;
        } else if meta.is_device() {
            let dev = expect_record(reader, CA_FORMAT_DEVICE)?;
            if dev.body.len() != 16 {
                return Err(CasError::MalformedArchive("DEVICE record must be 16 bytes".into()).into());
            }
            let major = u64::from_le_bytes(dev.body[0..8].try_into().unwrap());
            let minor = u64::from_le_bytes(dev.body[8..16].try_into().unwrap());
            sink.make_device(&path, &meta, major, minor)?;
            apply_common(sink, &path, &meta)?;
        } else {
            let payload = expect_record(reader, CA_FORMAT_PAYLOAD)?;
            sink.make_file(&path, &meta, &mut &payload.body[..])?;
            apply_common(sink, &path, &meta)?;
        }
    }
}

/// Read records until one of type `ty` is found, discarding any
/// unrecognized extension records encountered along the way.
fn expect_record<R: Read>(reader: &mut R, ty: u64) -> Result<RawRecord, Error> {
    loop {
        let record = format::read_record(reader)?.ok_or_else(|| {
            CasError::MalformedArchive(format!("expected record type {:#x}, got end of stream", ty))
        })?;
        if record.ty == ty {
            return Ok(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catar::format::{write_entry, write_filename, write_goodbye, CA_FORMAT_USER};
    use crate::catar::sink::LocalFsSink;

    #[test]
    fn skips_unrecognized_record_types() {
        let mut buf = Vec::new();
        let dir_meta = EntryMetadata {
            mode: 0o40755,
            flags: super::super::format::EntryFlags::DIRECTORY,
            ..Default::default()
        };
        write_entry(&mut buf, &dir_meta).unwrap();

        // An extension record with no structural meaning, right where a
        // real producer might emit USER/GROUP metadata for the root.
        format::write_record(&mut buf, CA_FORMAT_USER, b"nobody").unwrap();

        write_filename(&mut buf, b"f").unwrap();
        let file_meta = EntryMetadata {
            mode: 0o100644,
            size: 3,
            ..Default::default()
        };
        write_entry(&mut buf, &file_meta).unwrap();
        format::write_payload(&mut buf, b"hi!").unwrap();
        write_goodbye(&mut buf, 1).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let mut sink = LocalFsSink::new(dst.path());
        decode_tree(&CancellationToken::new(), &mut &buf[..], &mut sink).unwrap();

        assert_eq!(std::fs::read(dst.path().join("f")).unwrap(), b"hi!");
    }

    #[test]
    fn truncated_directory_is_malformed() {
        let mut buf = Vec::new();
        let dir_meta = EntryMetadata {
            mode: 0o40755,
            flags: super::super::format::EntryFlags::DIRECTORY,
            ..Default::default()
        };
        write_entry(&mut buf, &dir_meta).unwrap();
        // no GOODBYE

        let dst = tempfile::tempdir().unwrap();
        let mut sink = LocalFsSink::new(dst.path());
        let err = decode_tree(&CancellationToken::new(), &mut &buf[..], &mut sink).unwrap_err();
        assert!(matches!(err.downcast_ref::<CasError>(), Some(CasError::MalformedArchive(_))));
    }
}
