//! SFTP chunk store backend (spec §3 `sftp://`). A persistent `ssh2::Session`
//! mirrors the local sharded layout on the far end. `ssh2` is a blocking
//! API, so every call runs inside `tokio::task::block_in_place` — the
//! runtime is told the current worker thread is about to block so it can
//! shift other work elsewhere, without the `'static` bound `spawn_blocking`
//! would force on a `&self` method (spec: "external collaborators" own
//! credential discovery, so auth here is whatever the local `ssh-agent`
//! offers — the same assumption `ssh://` scp/rsync tooling makes).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use anyhow::{bail, Context as _, Error};
use async_trait::async_trait;

use crate::chunk::{self, Chunk};
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{Store, StoreOptions, WriteStore};

struct Target {
    host: String,
    port: u16,
    user: Option<String>,
    path: String,
}

fn parse_target(rest: &str) -> Result<Target, Error> {
    // rest: [user@]host[:port]/path
    let (authority, path) = rest.split_once('/').ok_or_else(|| {
        CasError::Configuration(format!("sftp:// URL {:?} is missing a path", rest))
    })?;
    let (user, hostport) = match authority.split_once('@') {
        Some((u, h)) => (Some(u.to_string()), h),
        None => (None, authority),
    };
    let (host, port) = match hostport.split_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().context("invalid sftp port")?),
        None => (hostport.to_string(), 22),
    };
    Ok(Target {
        host,
        port,
        user,
        path: format!("/{}", path),
    })
}

pub struct SftpStore {
    session: Mutex<ssh2::Session>,
    target: Target,
    options: StoreOptions,
    crypt: Option<crate::crypt::CryptConfig>,
    url: String,
}

impl SftpStore {
    pub fn new(rest: &str, options: StoreOptions) -> Result<Self, Error> {
        let target = parse_target(rest)?;
        let url = format!("sftp://{}", rest);

        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .with_context(|| format!("connecting to {}:{}", target.host, target.port))?;
        let mut session = ssh2::Session::new().context("creating ssh2 session")?;
        session.set_tcp_stream(tcp);
        session.handshake().context("ssh handshake failed")?;

        let user = target.user.clone().unwrap_or_else(|| whoami());
        session
            .userauth_agent(&user)
            .context("ssh-agent authentication failed")?;
        if !session.authenticated() {
            bail!(CasError::Configuration(format!("ssh-agent authentication for {} did not succeed", user)));
        }

        let crypt = if options.encryption {
            let password = options
                .encryption_password
                .as_ref()
                .ok_or_else(|| CasError::Configuration("encryption enabled without a password".into()))?;
            Some(crate::crypt::CryptConfig::derive(password.as_bytes(), target.path.as_bytes())?)
        } else {
            None
        };

        Ok(SftpStore {
            session: Mutex::new(session),
            target,
            options,
            crypt,
            url,
        })
    }

    fn shard_path(&self, id: &ChunkId) -> (String, String) {
        let hex = id.to_hex();
        let dir = format!("{}/{}", self.target.path, &hex[0..4]);
        let file = format!("{}/{}.cacnk", dir, hex);
        (dir, file)
    }

    fn read_raw_blocking(&self, id: ChunkId) -> Result<Vec<u8>, Error> {
        let (_, path) = self.shard_path(&id);
        let session = self.session.lock().unwrap();
        let sftp = session.sftp().context("opening sftp channel")?;
        const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
        let mut file = match sftp.open(std::path::Path::new(&path)) {
            Ok(f) => f,
            Err(e) if e.code() == ssh2::ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => {
                return Err(CasError::NotFound(id).into())
            }
            Err(e) => return Err(CasError::transport(&self.url, e).into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).context("reading sftp file")?;
        Ok(buf)
    }

    fn write_raw_blocking(&self, id: ChunkId, bytes: &[u8]) -> Result<(), Error> {
        let (dir, path) = self.shard_path(&id);
        let session = self.session.lock().unwrap();
        let sftp = session.sftp().context("opening sftp channel")?;
        let _ = sftp.mkdir(std::path::Path::new(&dir), 0o755);

        let tmp = format!("{}.tmp-{}", path, std::process::id());
        {
            let mut file = sftp
                .create(std::path::Path::new(&tmp))
                .context("creating remote temp file")?;
            file.write_all(bytes).context("writing remote temp file")?;
        }
        sftp.rename(
            std::path::Path::new(&tmp),
            std::path::Path::new(&path),
            Some(ssh2::RenameFlags::OVERWRITE),
        )
        .context("renaming remote temp file into place")?;
        Ok(())
    }

    fn has_blocking(&self, id: ChunkId) -> Result<bool, Error> {
        let (_, path) = self.shard_path(&id);
        let session = self.session.lock().unwrap();
        let sftp = session.sftp().context("opening sftp channel")?;
        Ok(sftp.stat(std::path::Path::new(&path)).is_ok())
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

#[async_trait]
impl Store for SftpStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let data = tokio::task::block_in_place(|| self.read_raw_blocking(id))?;
        chunk::chunk_from_store_bytes(
            data,
            id,
            !self.options.uncompressed,
            self.options.encryption,
            self.crypt.as_ref(),
            self.options.digest,
            self.options.skip_verify,
        )
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        tokio::task::block_in_place(|| self.has_blocking(id))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WriteStore for SftpStore {
    async fn store_chunk(&self, id: ChunkId, mut chunk: Chunk) -> Result<(), Error> {
        chunk.set_encrypted(self.options.encryption);
        let bytes = if self.options.uncompressed {
            chunk.uncompressed(self.crypt.as_ref())?.to_vec()
        } else {
            chunk.compressed(self.crypt.as_ref(), self.options.compression_level)?.to_vec()
        };
        tokio::task::block_in_place(|| self.write_raw_blocking(id, &bytes))
    }
}
