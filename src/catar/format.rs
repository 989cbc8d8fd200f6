//! `catar` record framing (spec §4.8, §6): `size:u64 type:u64 body`,
//! little-endian throughout, the same word-oriented convention the index
//! format (§4.3) uses. Record type constants are fixed — part of the
//! on-disk format the same way the rolling-hash table is (spec §9) — not
//! arbitrary per-run values.
//!
//! The encoder currently only emits `ENTRY`/`FILENAME`/`SYMLINK`/`DEVICE`/
//! `PAYLOAD`/`GOODBYE`; the metadata-extension types (`USER`, `GROUP`,
//! `XATTR`, `ACL_USER`, `ACL_GROUP`, `FCAPS`, `SELINUX`) are defined so the
//! wire format has a stable place for them and so [`super::decoder`] can
//! demonstrate the "ignore what you don't recognize" contract (spec §6:
//! "consumers must ignore record types they do not recognize but must not
//! reorder") on record kinds that exist but are never produced yet.

use std::convert::TryInto;
use std::io::{Read, Write};

use anyhow::Error;
use bitflags::bitflags;

use crate::error::CasError;

pub const CA_FORMAT_ENTRY: u64 = 0x2ad0_d5d2_c4b9_e27a;
pub const CA_FORMAT_USER: u64 = 0x5f9c_9b9e_6a9b_9a11;
pub const CA_FORMAT_GROUP: u64 = 0x1d7c_0cea_7f3a_9b44;
pub const CA_FORMAT_XATTR: u64 = 0xb815_7091_f80b_c486;
pub const CA_FORMAT_ACL_USER: u64 = 0x297d_c88b_2ef1_e1be;
pub const CA_FORMAT_ACL_GROUP: u64 = 0x36f2_acb5_6cb3_dd0b;
pub const CA_FORMAT_FCAPS: u64 = 0xf726_7db0_afed_0629;
pub const CA_FORMAT_SELINUX: u64 = 0x46fa_f060_2fd2_6c59;
pub const CA_FORMAT_SYMLINK: u64 = 0x664a_6fb6_830e_0d6c;
pub const CA_FORMAT_DEVICE: u64 = 0x9fc9_e906_586d_5ce9;
pub const CA_FORMAT_PAYLOAD: u64 = 0x8b9e_1d93_d6dc_ffc9;
pub const CA_FORMAT_FILENAME: u64 = 0x6dbb_6ebc_b316_1f0b;
pub const CA_FORMAT_GOODBYE: u64 = 0xdfd3_5c5e_8327_c403;

bitflags! {
    /// Bit flags carried in [`EntryMetadata::flags`]. Only the ones this
    /// implementation actually interprets are named; unrecognized bits are
    /// preserved across encode/decode rather than masked away, in keeping
    /// with the "ignore record types you don't recognize" contract applied
    /// at the flag level too.
    #[derive(Default)]
    pub struct EntryFlags: u64 {
        const SYMLINK = 1 << 0;
        const DEVICE = 1 << 1;
        const DIRECTORY = 1 << 2;
    }
}

/// The fixed-size body of an `ENTRY` record: everything `fs_sink` needs to
/// recreate permissions/ownership/timestamps for one filesystem object
/// (spec §4.8 `fs_sink` operations `set_owner`/`set_permissions`/
/// `set_times`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    pub mode: u32,
    pub flags: EntryFlags,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: u64,
    /// Regular-file size, meaningful only when neither `SYMLINK` nor
    /// `DEVICE` nor `DIRECTORY` is set.
    pub size: u64,
}

const ENTRY_BODY_LEN: usize = 4 + 8 + 4 + 4 + 8 + 8;

impl EntryMetadata {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }
    pub fn is_symlink(&self) -> bool {
        self.flags.contains(EntryFlags::SYMLINK)
    }
    pub fn is_device(&self) -> bool {
        self.flags.contains(EntryFlags::DEVICE)
    }

    fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(ENTRY_BODY_LEN);
        v.extend_from_slice(&self.mode.to_le_bytes());
        v.extend_from_slice(&self.flags.bits().to_le_bytes());
        v.extend_from_slice(&self.uid.to_le_bytes());
        v.extend_from_slice(&self.gid.to_le_bytes());
        v.extend_from_slice(&self.mtime_ns.to_le_bytes());
        v.extend_from_slice(&self.size.to_le_bytes());
        v
    }

    fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() != ENTRY_BODY_LEN {
            return Err(CasError::MalformedArchive(format!(
                "ENTRY body is {} bytes, expected {}",
                body.len(),
                ENTRY_BODY_LEN
            ))
            .into());
        }
        Ok(EntryMetadata {
            mode: u32::from_le_bytes(body[0..4].try_into().unwrap()),
            flags: EntryFlags::from_bits_truncate(u64::from_le_bytes(body[4..12].try_into().unwrap())),
            uid: u32::from_le_bytes(body[12..16].try_into().unwrap()),
            gid: u32::from_le_bytes(body[16..20].try_into().unwrap()),
            mtime_ns: u64::from_le_bytes(body[20..28].try_into().unwrap()),
            size: u64::from_le_bytes(body[28..36].try_into().unwrap()),
        })
    }
}

/// Write one `type:body` record (the `size` header field is `16 + body.len()`).
pub fn write_record<W: Write>(w: &mut W, ty: u64, body: &[u8]) -> Result<(), Error> {
    let size = 16u64 + body.len() as u64;
    w.write_all(&size.to_le_bytes())?;
    w.write_all(&ty.to_le_bytes())?;
    w.write_all(body)?;
    Ok(())
}

pub fn write_entry<W: Write>(w: &mut W, meta: &EntryMetadata) -> Result<(), Error> {
    write_record(w, CA_FORMAT_ENTRY, &meta.encode())
}

pub fn write_filename<W: Write>(w: &mut W, name: &[u8]) -> Result<(), Error> {
    write_record(w, CA_FORMAT_FILENAME, name)
}

pub fn write_symlink<W: Write>(w: &mut W, target: &[u8]) -> Result<(), Error> {
    write_record(w, CA_FORMAT_SYMLINK, target)
}

pub fn write_device<W: Write>(w: &mut W, major: u64, minor: u64) -> Result<(), Error> {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&major.to_le_bytes());
    body.extend_from_slice(&minor.to_le_bytes());
    write_record(w, CA_FORMAT_DEVICE, &body)
}

pub fn write_payload<W: Write>(w: &mut W, data: &[u8]) -> Result<(), Error> {
    write_record(w, CA_FORMAT_PAYLOAD, data)
}

pub fn write_goodbye<W: Write>(w: &mut W, child_count: u64) -> Result<(), Error> {
    write_record(w, CA_FORMAT_GOODBYE, &child_count.to_le_bytes())
}

/// One parsed record: type plus raw body bytes. Typed accessors live on
/// [`super::decoder::Decoder`]; this is the minimal framing unit.
pub struct RawRecord {
    pub ty: u64,
    pub body: Vec<u8>,
}

const MAX_RECORD_BODY: u64 = 1024 * 1024 * 1024; // 1 GiB safety cap on any single non-payload-stream record

pub fn read_record<R: Read>(r: &mut R) -> Result<Option<RawRecord>, Error> {
    let mut header = [0u8; 16];
    match r.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let ty = u64::from_le_bytes(header[8..16].try_into().unwrap());
    if size < 16 {
        return Err(CasError::MalformedArchive(format!("record size {} smaller than header", size)).into());
    }
    let body_len = size - 16;
    if body_len > MAX_RECORD_BODY {
        return Err(CasError::MalformedArchive(format!("record body {} exceeds sanity cap", body_len)).into());
    }
    let mut body = vec![0u8; body_len as usize];
    r.read_exact(&mut body)?;
    Ok(Some(RawRecord { ty, body }))
}

pub fn decode_entry(body: &[u8]) -> Result<EntryMetadata, Error> {
    EntryMetadata::decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips() {
        let meta = EntryMetadata {
            mode: 0o100644,
            flags: EntryFlags::empty(),
            uid: 1000,
            gid: 1000,
            mtime_ns: 1_700_000_000_000_000_000,
            size: 4096,
        };
        let mut buf = Vec::new();
        write_entry(&mut buf, &meta).unwrap();
        let rec = read_record(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(rec.ty, CA_FORMAT_ENTRY);
        let decoded = decode_entry(&rec.body).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn truncated_stream_is_clean_eof() {
        assert!(read_record(&mut &b""[..]).unwrap().is_none());
    }

    #[test]
    fn garbage_size_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes()); // < 16
        buf.extend_from_slice(&CA_FORMAT_ENTRY.to_le_bytes());
        let err = read_record(&mut &buf[..]).unwrap_err();
        assert!(matches!(err.downcast_ref::<CasError>(), Some(CasError::MalformedArchive(_))));
    }
}
