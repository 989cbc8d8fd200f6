//! Chunk server / index server HTTP(S) surface (spec §6).
//!
//! Grounded on [`crate::store::http::HttpStore`]'s client-side connector:
//! the same `openssl`/`tokio-openssl` pair, used here to terminate TLS on
//! accepted connections instead of originating it. Routing is hand-rolled
//! (spec §1: "HTTP(S) request/route plumbing beyond the store contract" is
//! out of scope — this module *is* that boundary, nothing more).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Error};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use crate::digest::ChunkId;
use crate::store::{IndexStore, IndexWriteStore, SharedStore, SharedWriteStore};

/// Credential check applied to every request when set (spec §6: "Optional
/// Basic/Bearer Authorization").
#[derive(Clone, Debug)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer(String),
}

impl AuthConfig {
    fn accepts(&self, header: Option<&str>) -> bool {
        let header = match header {
            Some(h) => h,
            None => return false,
        };
        match self {
            AuthConfig::Basic { username, password } => {
                let expected = format!("{}:{}", username, password);
                let expected = format!("Basic {}", base64::encode(expected.as_bytes()));
                header == expected
            }
            AuthConfig::Bearer(token) => header == format!("Bearer {}", token),
        }
    }
}

/// TLS material for the server side of the listener (spec §6: "HTTPS when
/// cert/key provided", "mTLS when configured").
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert: std::path::PathBuf,
    pub key: std::path::PathBuf,
    pub client_ca: Option<std::path::PathBuf>,
}

#[derive(Clone)]
pub struct ChunkServerConfig {
    pub bind_addr: SocketAddr,
    pub auth: Option<AuthConfig>,
    pub tls: Option<TlsConfig>,
}

#[derive(Default)]
struct Stats {
    requests_total: AtomicU64,
    chunk_gets: AtomicU64,
    chunk_heads: AtomicU64,
    chunk_puts: AtomicU64,
    index_gets: AtomicU64,
    index_puts: AtomicU64,
    bytes_served: AtomicU64,
    bytes_received: AtomicU64,
    errors_total: AtomicU64,
}

#[derive(Serialize)]
struct StatsSnapshot {
    requests_total: u64,
    chunk_gets: u64,
    chunk_heads: u64,
    chunk_puts: u64,
    index_gets: u64,
    index_puts: u64,
    bytes_served: u64,
    bytes_received: u64,
    errors_total: u64,
}

struct Handler {
    chunk_store: SharedStore,
    chunk_write: Option<SharedWriteStore>,
    index_store: Option<Arc<dyn IndexStore>>,
    index_write: Option<Arc<dyn IndexWriteStore>>,
    auth: Option<AuthConfig>,
    stats: Arc<Stats>,
}

/// `/<hex4>/<hex64>.cacnk` (spec §6 "Chunk file naming").
fn parse_chunk_path(path: &str) -> Option<ChunkId> {
    let path = path.strip_prefix('/')?;
    let (shard, rest) = path.split_once('/')?;
    let hex = rest.strip_suffix(".cacnk")?;
    if shard.len() != 4 || hex.len() != 64 || !hex.starts_with(shard) {
        return None;
    }
    hex.parse().ok()
}

impl Handler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        if let Some(auth) = &self.auth {
            let header = req
                .headers()
                .get(hyper::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !auth.accepts(header) {
                return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
        }

        let path = req.uri().path().to_string();

        if path == "/stats" && req.method() == Method::GET {
            return self.handle_stats();
        }

        if let Some(id) = parse_chunk_path(&path) {
            return self.handle_chunk(req, id).await;
        }

        if path.starts_with('/') && path.len() > 1 && !path.contains("..") {
            return self.handle_index(req, path[1..].to_string()).await;
        }

        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        text_response(StatusCode::BAD_REQUEST, "not a valid sharded chunk path or index name")
    }

    fn handle_stats(&self) -> Response<Body> {
        let snapshot = StatsSnapshot {
            requests_total: self.stats.requests_total.load(Ordering::Relaxed),
            chunk_gets: self.stats.chunk_gets.load(Ordering::Relaxed),
            chunk_heads: self.stats.chunk_heads.load(Ordering::Relaxed),
            chunk_puts: self.stats.chunk_puts.load(Ordering::Relaxed),
            index_gets: self.stats.index_gets.load(Ordering::Relaxed),
            index_puts: self.stats.index_puts.load(Ordering::Relaxed),
            bytes_served: self.stats.bytes_served.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            errors_total: self.stats.errors_total.load(Ordering::Relaxed),
        };
        let body = serde_json::to_vec(&snapshot).unwrap_or_default();
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("valid stats response")
    }

    async fn handle_chunk(&self, req: Request<Body>, id: ChunkId) -> Response<Body> {
        match *req.method() {
            Method::GET => {
                self.stats.chunk_gets.fetch_add(1, Ordering::Relaxed);
                match self.chunk_store.get_chunk(id).await {
                    Ok(mut chunk) => match chunk.compressed(None, 3) {
                        Ok(bytes) => {
                            self.stats.bytes_served.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            Response::new(Body::from(bytes.to_vec()))
                        }
                        Err(e) => self.server_error(e),
                    },
                    Err(e) if e.downcast_ref::<crate::error::CasError>().map(|e| e.is_not_found()).unwrap_or(false) => {
                        text_response(StatusCode::NOT_FOUND, "chunk not found")
                    }
                    Err(e) => self.server_error(e),
                }
            }
            Method::HEAD => {
                self.stats.chunk_heads.fetch_add(1, Ordering::Relaxed);
                match self.chunk_store.has_chunk(id).await {
                    Ok(true) => Response::new(Body::empty()),
                    Ok(false) => text_response(StatusCode::NOT_FOUND, ""),
                    Err(e) => self.server_error(e),
                }
            }
            Method::PUT => {
                self.stats.chunk_puts.fetch_add(1, Ordering::Relaxed);
                let write = match &self.chunk_write {
                    Some(w) => w,
                    None => return text_response(StatusCode::FORBIDDEN, "store is not writable"),
                };
                let data = match hyper::body::to_bytes(req.into_body()).await {
                    Ok(b) => b.to_vec(),
                    Err(_) => return text_response(StatusCode::BAD_REQUEST, "malformed body"),
                };
                self.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                let chunk = match crate::chunk::chunk_from_store_bytes(data, id, true, false, None, Default::default(), false) {
                    Ok(c) => c,
                    Err(_) => return text_response(StatusCode::BAD_REQUEST, "chunk data does not match its id"),
                };
                match write.store_chunk(id, chunk).await {
                    Ok(()) => Response::new(Body::empty()),
                    Err(e) => self.server_error(e),
                }
            }
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    async fn handle_index(&self, req: Request<Body>, name: String) -> Response<Body> {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let store = match &self.index_store {
                    Some(s) => s,
                    None => return text_response(StatusCode::NOT_FOUND, "no index store configured"),
                };
                self.stats.index_gets.fetch_add(1, Ordering::Relaxed);
                match store.get_index(&name).await {
                    Ok(data) => {
                        self.stats.bytes_served.fetch_add(data.len() as u64, Ordering::Relaxed);
                        if *req.method() == Method::HEAD {
                            Response::new(Body::empty())
                        } else {
                            Response::new(Body::from(data))
                        }
                    }
                    Err(e) if e.downcast_ref::<crate::error::CasError>().map(|e| e.is_not_found()).unwrap_or(false) => {
                        text_response(StatusCode::NOT_FOUND, "index not found")
                    }
                    Err(e) => self.server_error(e),
                }
            }
            Method::PUT => {
                let write = match &self.index_write {
                    Some(w) => w,
                    None => return text_response(StatusCode::FORBIDDEN, "index store is not writable"),
                };
                self.stats.index_puts.fetch_add(1, Ordering::Relaxed);
                let data = match hyper::body::to_bytes(req.into_body()).await {
                    Ok(b) => b.to_vec(),
                    Err(_) => return text_response(StatusCode::BAD_REQUEST, "malformed body"),
                };
                self.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                match write.store_index(&name, data).await {
                    Ok(()) => Response::new(Body::empty()),
                    Err(e) => self.server_error(e),
                }
            }
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    fn server_error(&self, e: Error) -> Response<Body> {
        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        warn!("chunk server backend error: {:#}", e);
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "backend error")
    }
}

fn text_response(status: StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(msg.to_string()))
        .expect("valid error response")
}

/// Serve `chunk_store` (and optionally `index_store`) over HTTP(S) until
/// `cancel` fires. `chunk_write`/`index_write` are `None` to expose a
/// read-only surface (spec §6: "403 if not writable").
#[allow(clippy::too_many_arguments)]
pub async fn serve(
    config: ChunkServerConfig,
    chunk_store: SharedStore,
    chunk_write: Option<SharedWriteStore>,
    index_store: Option<Arc<dyn IndexStore>>,
    index_write: Option<Arc<dyn IndexWriteStore>>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let handler = Arc::new(Handler {
        chunk_store,
        chunk_write,
        index_store,
        index_write,
        auth: config.auth.clone(),
        stats: Arc::new(Stats::default()),
    });

    match &config.tls {
        None => serve_plain(config.bind_addr, handler, cancel).await,
        Some(tls) => serve_tls(config.bind_addr, tls.clone(), handler, cancel).await,
    }
}

async fn serve_plain(addr: SocketAddr, handler: Arc<Handler>, cancel: CancellationToken) -> Result<(), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let handler = Arc::clone(&handler);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            }))
        }
    });

    info!("chunk server listening on {}", addr);
    let server = hyper::Server::bind(&addr).serve(make_svc);
    let graceful = server.with_graceful_shutdown(cancel.cancelled());
    graceful.await.context("chunk server error")
}

fn build_acceptor(tls: &TlsConfig) -> Result<SslAcceptor, Error> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder
        .set_certificate_file(&tls.cert, SslFiletype::PEM)
        .with_context(|| format!("loading server cert {:?}", tls.cert))?;
    builder
        .set_private_key_file(&tls.key, SslFiletype::PEM)
        .with_context(|| format!("loading server key {:?}", tls.key))?;
    if let Some(ca) = &tls.client_ca {
        builder
            .set_ca_file(ca)
            .with_context(|| format!("loading client CA {:?}", ca))?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }
    Ok(builder.build())
}

async fn serve_tls(addr: SocketAddr, tls: TlsConfig, handler: Arc<Handler>, cancel: CancellationToken) -> Result<(), Error> {
    let acceptor = Arc::new(build_acceptor(&tls)?);
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!("chunk server listening on {} (tls)", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (tcp, peer) = accepted.context("accept failed")?;
                let acceptor = Arc::clone(&acceptor);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = serve_one_tls_connection(tcp, acceptor, handler).await {
                        warn!("tls connection from {} failed: {:#}", peer, e);
                    }
                });
            }
        }
    }
}

async fn serve_one_tls_connection(tcp: TcpStream, acceptor: Arc<SslAcceptor>, handler: Arc<Handler>) -> Result<(), Error> {
    use std::pin::Pin;
    let ssl = openssl::ssl::Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream).accept().await?;

    hyper::server::conn::Http::new()
        .serve_connection(
            stream,
            service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            }),
        )
        .await
        .context("serving tls connection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_sharded_chunk_paths() {
        let hex = "a".repeat(64);
        let path = format!("/{}/{}.cacnk", &hex[0..4], hex);
        assert!(parse_chunk_path(&path).is_some());
    }

    #[test]
    fn rejects_mismatched_shard_prefix() {
        let hex = "a".repeat(64);
        let path = format!("/bbbb/{}.cacnk", hex);
        assert!(parse_chunk_path(&path).is_none());
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_chunk_path("/not-a-chunk").is_none());
        assert!(parse_chunk_path("/a/b.cacnk").is_none());
    }

    #[test]
    fn basic_auth_accepts_matching_credentials() {
        let auth = AuthConfig::Basic {
            username: "alice".into(),
            password: "wonderland".into(),
        };
        let header = format!("Basic {}", base64::encode(b"alice:wonderland"));
        assert!(auth.accepts(Some(&header)));
        assert!(!auth.accepts(Some("Basic deadbeef")));
        assert!(!auth.accepts(None));
    }

    #[test]
    fn bearer_auth_accepts_matching_token() {
        let auth = AuthConfig::Bearer("secret-token".into());
        assert!(auth.accepts(Some("Bearer secret-token")));
        assert!(!auth.accepts(Some("Bearer wrong")));
    }
}
