//! SSH chunk store backend (spec §3 `ssh://`, glossary "SSH (casync
//! protocol)"): a framed request/response protocol carried over a spawned
//! `ssh` child process's stdio. [`SshStore`] is the client half; the frame
//! format mirrors `catar`'s own `size:u64 type:u64 body` convention for
//! consistency. [`ProtocolServer`] is the remote-side half ("the server side
//! reads typed frames, serves GET responses from a local store, and
//! enforces a simple state machine (HELLO → GOAL → repeated GET →
//! GOODBYE)"); it is what the process spawned on the far end would run.

use anyhow::{bail, Context as _, Error};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::chunk::{self, Chunk};
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{Store, StoreOptions};

const FRAME_HELLO: u64 = 1;
const FRAME_GOAL: u64 = 2;
const FRAME_GET: u64 = 3;
const FRAME_CHUNK: u64 = 4;
const FRAME_NOT_FOUND: u64 = 5;
const FRAME_ERROR: u64 = 6;
const FRAME_GOODBYE: u64 = 7;

const PROTOCOL_VERSION: u64 = 1;

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, kind: u64, body: &[u8]) -> Result<(), Error> {
    w.write_all(&kind.to_le_bytes()).await?;
    w.write_all(&(body.len() as u64).to_le_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u64, Vec<u8>), Error> {
    let mut header = [0u8; 16];
    r.read_exact(&mut header).await.context("reading frame header")?;
    let kind = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let len = u64::from_le_bytes(header[8..16].try_into().unwrap());
    if len > 256 * 1024 * 1024 {
        bail!("ssh protocol frame too large: {} bytes", len);
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await.context("reading frame body")?;
    Ok((kind, body))
}

/// Client half: spawns `ssh <host> <remote-command>` and speaks the framed
/// protocol over its stdin/stdout. Every request/response cycle is
/// serialized through the mutex — the wire protocol has no multiplexing of
/// its own, matching the one-request-in-flight state machine the server
/// enforces.
pub struct SshStore {
    child: Mutex<Child>,
    url: String,
    options: StoreOptions,
}

impl SshStore {
    pub fn new(rest: &str, options: StoreOptions) -> Result<Self, Error> {
        let (host, path) = rest.split_once('/').ok_or_else(|| {
            CasError::Configuration(format!("ssh:// URL {:?} is missing a path", rest))
        })?;
        let url = format!("ssh://{}", rest);

        let mut child = Command::new("ssh")
            .arg(host)
            .arg("casync-chunk-server")
            .arg("--serve")
            .arg(format!("/{}", path))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .context("spawning ssh child process")?;

        {
            let stdin = child.stdin.as_mut().expect("piped stdin");
            let stdout = child.stdout.as_mut().expect("piped stdout");
            // `new` is synchronous but the handshake needs the child's
            // async stdio; run it in place rather than forcing every
            // caller of `open_write_store` to become async for this one
            // backend.
            tokio::task::block_in_place(|| {
                futures::executor::block_on(async {
                    write_frame(stdin, FRAME_HELLO, &PROTOCOL_VERSION.to_le_bytes()).await?;
                    let (kind, body) = read_frame(stdout).await?;
                    if kind != FRAME_HELLO {
                        bail!("expected HELLO reply from ssh store, got frame type {}", kind);
                    }
                    let peer_version = u64::from_le_bytes(body[0..8].try_into().unwrap_or_default());
                    if peer_version != PROTOCOL_VERSION {
                        bail!("ssh store protocol mismatch: local {} remote {}", PROTOCOL_VERSION, peer_version);
                    }
                    write_frame(stdin, FRAME_GOAL, b"sync").await?;
                    Ok::<(), Error>(())
                })
            })?;
        }

        Ok(SshStore {
            child: Mutex::new(child),
            url,
            options,
        })
    }
}

#[async_trait]
impl Store for SshStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let mut child = self.child.lock().await;
        let stdin = child.stdin.as_mut().expect("piped stdin");
        let stdout = child.stdout.as_mut().expect("piped stdout");

        write_frame(stdin, FRAME_GET, id.as_bytes()).await?;
        let (kind, body) = read_frame(stdout).await?;
        match kind {
            // The server always decompresses/decrypts before replying
            // (spec §4.2: the wire carries plaintext chunk bytes), so the
            // client verifies against the uncompressed form directly.
            FRAME_CHUNK => chunk::chunk_from_store_bytes(
                body,
                id,
                false,
                false,
                None,
                self.options.digest,
                self.options.skip_verify,
            ),
            FRAME_NOT_FOUND => Err(CasError::NotFound(id).into()),
            FRAME_ERROR => Err(CasError::transport(&self.url, anyhow::anyhow!(String::from_utf8_lossy(&body).into_owned())).into()),
            other => bail!("unexpected ssh store frame type {} in reply to GET", other),
        }
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        match self.get_chunk(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.downcast_ref::<CasError>().map(|c| c.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) -> Result<(), Error> {
        let mut child = self.child.lock().await;
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = write_frame(stdin, FRAME_GOODBYE, &[]).await;
        }
        let _ = child.kill().await;
        Ok(())
    }
}

/// Server half, run by the remote-spawned process: serves `GET` requests
/// out of a local store over a pair of framed streams, enforcing HELLO →
/// GOAL → GET* → GOODBYE.
pub struct ProtocolServer<S> {
    store: S,
}

impl<S: Store> ProtocolServer<S> {
    pub fn new(store: S) -> Self {
        ProtocolServer { store }
    }

    pub async fn serve<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
        &self,
        mut input: R,
        mut output: W,
    ) -> Result<(), Error> {
        let (kind, body) = read_frame(&mut input).await?;
        if kind != FRAME_HELLO {
            bail!("expected HELLO as first frame, got {}", kind);
        }
        let peer_version = u64::from_le_bytes(body[0..8].try_into().unwrap_or_default());
        if peer_version != PROTOCOL_VERSION {
            write_frame(&mut output, FRAME_ERROR, b"protocol version mismatch").await?;
            bail!("protocol version mismatch: peer sent {}", peer_version);
        }
        write_frame(&mut output, FRAME_HELLO, &PROTOCOL_VERSION.to_le_bytes()).await?;

        let (kind, _goal) = read_frame(&mut input).await?;
        if kind != FRAME_GOAL {
            bail!("expected GOAL after HELLO, got {}", kind);
        }

        loop {
            let (kind, body) = read_frame(&mut input).await?;
            match kind {
                FRAME_GET => {
                    if body.len() != 32 {
                        write_frame(&mut output, FRAME_ERROR, b"malformed chunk id").await?;
                        continue;
                    }
                    let mut raw = [0u8; 32];
                    raw.copy_from_slice(&body);
                    let id = ChunkId::from_bytes(raw);
                    match self.store.get_chunk(id).await {
                        Ok(mut chunk) => {
                            let bytes = chunk.uncompressed(None)?.to_vec();
                            write_frame(&mut output, FRAME_CHUNK, &bytes).await?;
                        }
                        Err(e) => {
                            let is_not_found = e.downcast_ref::<CasError>().map(|c| c.is_not_found()).unwrap_or(false);
                            if is_not_found {
                                write_frame(&mut output, FRAME_NOT_FOUND, &[]).await?;
                            } else {
                                write_frame(&mut output, FRAME_ERROR, e.to_string().as_bytes()).await?;
                            }
                        }
                    }
                }
                FRAME_GOODBYE => return Ok(()),
                other => bail!("unexpected frame type {} in GET phase", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::store::local::LocalStore;
    use crate::store::{StoreOptions, WriteStore};
    use std::sync::Arc;
    use tokio::io::duplex;

    #[tokio::test]
    async fn protocol_server_serves_a_known_chunk_over_a_duplex_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalStore::open(dir.path(), StoreOptions::default()).unwrap());
        let data = b"over the wire".to_vec();
        let id = Digest::Sha512_256.hash(&data);
        local.store_chunk(id, Chunk::from_uncompressed(data.clone())).await.unwrap();

        let (client_end, server_end) = duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let server = tokio::spawn(async move {
            let server = ProtocolServer::new(local);
            server.serve(server_read, server_write).await
        });

        write_frame(&mut client_write, FRAME_HELLO, &PROTOCOL_VERSION.to_le_bytes()).await.unwrap();
        let (kind, _) = read_frame(&mut client_read).await.unwrap();
        assert_eq!(kind, FRAME_HELLO);
        write_frame(&mut client_write, FRAME_GOAL, b"sync").await.unwrap();

        write_frame(&mut client_write, FRAME_GET, id.as_bytes()).await.unwrap();
        let (kind, body) = read_frame(&mut client_read).await.unwrap();
        assert_eq!(kind, FRAME_CHUNK);
        assert_eq!(body, data);

        write_frame(&mut client_write, FRAME_GOODBYE, &[]).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
