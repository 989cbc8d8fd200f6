//! `fs_sink` (spec §4.8): what [`super::decoder`] drives to recreate a tree.
//! Two concrete sinks live here — a local filesystem writer and a GNU-tar
//! writer; [`super::mtree::MtreeSink`] is the third.

use std::fs::Permissions;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Error};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{Gid, Uid};

use super::format::EntryMetadata;

/// Destination for a decoded record stream. One call per structural event;
/// `finalize` runs once, after the whole tree has been walked.
pub trait FsSink {
    fn make_dir(&mut self, path: &Path, meta: &EntryMetadata) -> Result<(), Error>;
    fn make_file(&mut self, path: &Path, meta: &EntryMetadata, contents: &mut dyn Read) -> Result<(), Error>;
    fn make_symlink(&mut self, path: &Path, target: &[u8]) -> Result<(), Error>;
    fn make_device(&mut self, path: &Path, meta: &EntryMetadata, major: u64, minor: u64) -> Result<(), Error>;

    fn set_xattr(&mut self, _path: &Path, _name: &str, _value: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn set_owner(&mut self, path: &Path, uid: u32, gid: u32) -> Result<(), Error>;
    fn set_permissions(&mut self, path: &Path, mode: u32) -> Result<(), Error>;
    fn set_times(&mut self, path: &Path, mtime_ns: u64) -> Result<(), Error>;

    fn finalize(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Writes directly into a real directory tree rooted at `root`.
pub struct LocalFsSink {
    root: PathBuf,
    pub no_same_owner: bool,
    pub no_same_permissions: bool,
}

impl LocalFsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFsSink {
            root: root.into(),
            no_same_owner: false,
            no_same_permissions: false,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl FsSink for LocalFsSink {
    fn make_dir(&mut self, path: &Path, _meta: &EntryMetadata) -> Result<(), Error> {
        let full = self.resolve(path);
        match std::fs::create_dir(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e).with_context(|| format!("creating directory {:?}", full)),
        }
    }

    fn make_file(&mut self, path: &Path, _meta: &EntryMetadata, contents: &mut dyn Read) -> Result<(), Error> {
        let full = self.resolve(path);
        let mut f = std::fs::File::create(&full).with_context(|| format!("creating file {:?}", full))?;
        io::copy(contents, &mut f).with_context(|| format!("writing file {:?}", full))?;
        Ok(())
    }

    fn make_symlink(&mut self, path: &Path, target: &[u8]) -> Result<(), Error> {
        let full = self.resolve(path);
        let target = Path::new(std::str::from_utf8(target).context("symlink target is not valid utf-8")?);
        std::os::unix::fs::symlink(target, &full).with_context(|| format!("creating symlink {:?}", full))
    }

    fn make_device(&mut self, path: &Path, meta: &EntryMetadata, major: u64, minor: u64) -> Result<(), Error> {
        let full = self.resolve(path);
        let kind = if meta.mode & libc::S_IFMT as u32 == libc::S_IFCHR as u32 {
            SFlag::S_IFCHR
        } else {
            SFlag::S_IFBLK
        };
        let perm = Mode::from_bits_truncate(meta.mode & 0o7777);
        mknod(&full, kind, perm, makedev(major, minor)).with_context(|| format!("creating device node {:?}", full))
    }

    fn set_owner(&mut self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        if self.no_same_owner {
            return Ok(());
        }
        let full = self.resolve(path);
        match nix::unistd::chown(&full, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
            Ok(()) => Ok(()),
            Err(nix::Error::Sys(nix::errno::Errno::EPERM)) => Ok(()), // unprivileged extract, as casync does
            Err(e) => Err(e).with_context(|| format!("chown {:?}", full)),
        }
    }

    fn set_permissions(&mut self, path: &Path, mode: u32) -> Result<(), Error> {
        if self.no_same_permissions {
            return Ok(());
        }
        let full = self.resolve(path);
        std::fs::set_permissions(&full, Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("chmod {:?}", full))
    }

    fn set_times(&mut self, path: &Path, mtime_ns: u64) -> Result<(), Error> {
        let full = self.resolve(path);
        let c_path = std::ffi::CString::new(full.as_os_str().to_string_lossy().as_bytes())?;
        let spec = libc::timespec {
            tv_sec: (mtime_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (mtime_ns % 1_000_000_000) as _,
        };
        let times = [
            libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
            spec,
        ];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).with_context(|| format!("setting mtime on {:?}", full));
        }
        Ok(())
    }
}

/// Writes a GNU-tar-format archive instead of touching the real filesystem
/// (spec §4.8: "a GNU-tar-format writer (a separate archive sink)").
pub struct TarSink<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> TarSink<W> {
    pub fn new(writer: W) -> Self {
        TarSink {
            builder: tar::Builder::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, Error> {
        Ok(self.builder.into_inner()?)
    }

    fn header_for(path: &Path, meta: &EntryMetadata, entry_type: tar::EntryType, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).ok();
        header.set_mode(meta.mode & 0o7777);
        header.set_uid(meta.uid as u64);
        header.set_gid(meta.gid as u64);
        header.set_mtime(meta.mtime_ns / 1_000_000_000);
        header.set_size(size);
        header.set_entry_type(entry_type);
        header
    }
}

impl<W: Write> FsSink for TarSink<W> {
    fn make_dir(&mut self, path: &Path, meta: &EntryMetadata) -> Result<(), Error> {
        let mut header = Self::header_for(path, meta, tar::EntryType::Directory, 0);
        header.set_cksum();
        self.builder.append(&header, io::empty())?;
        Ok(())
    }

    fn make_file(&mut self, path: &Path, meta: &EntryMetadata, contents: &mut dyn Read) -> Result<(), Error> {
        let mut header = Self::header_for(path, meta, tar::EntryType::Regular, meta.size);
        header.set_cksum();
        self.builder.append(&header, contents)?;
        Ok(())
    }

    fn make_symlink(&mut self, path: &Path, target: &[u8]) -> Result<(), Error> {
        let target = Path::new(std::str::from_utf8(target).context("symlink target is not valid utf-8")?);
        let mut header = Self::header_for(path, &EntryMetadata::default(), tar::EntryType::Symlink, 0);
        header.set_cksum();
        self.builder.append_link(&mut header, path, target)?;
        Ok(())
    }

    fn make_device(&mut self, path: &Path, meta: &EntryMetadata, major: u64, minor: u64) -> Result<(), Error> {
        let kind = if meta.mode & libc::S_IFMT as u32 == libc::S_IFCHR as u32 {
            tar::EntryType::Char
        } else {
            tar::EntryType::Block
        };
        let mut header = Self::header_for(path, meta, kind, 0);
        header.set_device_major(major as u32).ok();
        header.set_device_minor(minor as u32).ok();
        header.set_cksum();
        self.builder.append(&header, io::empty())?;
        Ok(())
    }

    fn set_owner(&mut self, _path: &Path, _uid: u32, _gid: u32) -> Result<(), Error> {
        Ok(()) // baked into the header at make_* time
    }

    fn set_permissions(&mut self, _path: &Path, _mode: u32) -> Result<(), Error> {
        Ok(())
    }

    fn set_times(&mut self, _path: &Path, _mtime_ns: u64) -> Result<(), Error> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        self.builder.finish()?;
        Ok(())
    }
}
