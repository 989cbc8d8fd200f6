//! HTTP(S) chunk store backend (spec §3 `http(s)://`, §6 "chunk server
//! HTTP(S) surface"). Grounded on the teacher's `SimpleHttp`/`HttpsConnector`
//! pair: a `hyper::Client` over a hand-rolled `hyper::service::Service` that
//! upgrades the connection to TLS via `openssl`, with client-certificate
//! support wired in for mTLS (spec `StoreOptions.client_cert/client_key`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context as _, Error};
use async_trait::async_trait;
use futures::FutureExt;
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Request, Uri};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::chunk::{self, Chunk};
use crate::digest::ChunkId;
use crate::error::CasError;

use super::{Store, StoreOptions, WriteStore};

#[derive(Clone)]
struct HttpsConnector {
    connector: HttpConnector,
    ssl_connector: Arc<SslConnector>,
}

impl hyper::service::Service<Uri> for HttpsConnector {
    type Response = SslStream<TcpStream>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(cx).map_err(Error::from)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut connector = self.connector.clone();
        let ssl_connector = Arc::clone(&self.ssl_connector);
        async move {
            let host = dst.host().context("missing host in store URL")?.to_owned();
            let tcp = connector
                .call(dst)
                .await
                .map_err(|e| anyhow::anyhow!("connect failed: {}", e))?;
            let config = ssl_connector.configure()?;
            let mut stream = SslStream::new(config.into_ssl(&host)?, tcp)?;
            Pin::new(&mut stream).connect().await?;
            Ok(stream)
        }
        .boxed()
    }
}

/// A chunk store reached over HTTP(S) (spec §6 surface: `GET /<sharded
/// path>` fetches, `HEAD` probes existence, `PUT` stores).
pub struct HttpStore {
    client: Client<HttpsConnector, Body>,
    base: String,
    options: StoreOptions,
    crypt: Option<crate::crypt::CryptConfig>,
}

impl HttpStore {
    pub fn new(scheme: &str, rest: &str, options: StoreOptions) -> Result<Self, Error> {
        let base = format!("{}://{}", scheme, rest.trim_end_matches('/'));

        let mut builder = SslConnector::builder(SslMethod::tls())?;
        if options.trust_insecure {
            builder.set_verify(SslVerifyMode::NONE);
        }
        if let Some(ca) = &options.ca_cert {
            builder.set_ca_file(ca).with_context(|| format!("loading CA cert {:?}", ca))?;
        }
        if let (Some(cert), Some(key)) = (&options.client_cert, &options.client_key) {
            builder
                .set_certificate_file(cert, SslFiletype::PEM)
                .with_context(|| format!("loading client cert {:?}", cert))?;
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .with_context(|| format!("loading client key {:?}", key))?;
        }
        let ssl_connector = Arc::new(builder.build());

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(options.timeout));

        let connector = HttpsConnector {
            connector: http_connector,
            ssl_connector,
        };
        let client = Client::builder().build(connector);

        let crypt = if options.encryption {
            let password = options
                .encryption_password
                .as_ref()
                .ok_or_else(|| CasError::Configuration("encryption enabled without a password".into()))?;
            Some(crate::crypt::CryptConfig::derive(password.as_bytes(), base.as_bytes())?)
        } else {
            None
        };

        Ok(HttpStore {
            client,
            base,
            options,
            crypt,
        })
    }

    fn chunk_url(&self, id: &ChunkId) -> String {
        let hex = id.to_hex();
        format!("{}/{}/{}.cacnk", self.base, &hex[0..4], hex)
    }

    async fn request_with_retry(&self, build: impl Fn() -> Request<Body>) -> Result<hyper::Response<Body>, Error> {
        let mut attempt = 0;
        loop {
            let resp = self.client.request(build()).await;
            match resp {
                Ok(r) => return Ok(r),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.options.error_retry {
                        return Err(CasError::transport(&self.base, e).into());
                    }
                    let backoff = self.options.error_retry_base_interval * attempt;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let url = self.chunk_url(&id);
        let resp = self
            .request_with_retry(|| {
                Request::builder()
                    .method("GET")
                    .uri(url.clone())
                    .body(Body::empty())
                    .expect("valid GET request")
            })
            .await?;

        match resp.status() {
            s if s.is_success() => {
                let data = hyper::body::to_bytes(resp.into_body())
                    .await
                    .map_err(|e| CasError::transport(&self.base, e))?
                    .to_vec();
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
            s if s.as_u16() == 404 => Err(CasError::NotFound(id).into()),
            s => Err(CasError::transport(&self.base, anyhow::anyhow!("unexpected status {}", s)).into()),
        }
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, Error> {
        let url = self.chunk_url(&id);
        let resp = self
            .request_with_retry(|| {
                Request::builder()
                    .method("HEAD")
                    .uri(url.clone())
                    .body(Body::empty())
                    .expect("valid HEAD request")
            })
            .await?;
        Ok(resp.status().is_success())
    }

    fn url(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl WriteStore for HttpStore {
    async fn store_chunk(&self, id: ChunkId, mut chunk: Chunk) -> Result<(), Error> {
        chunk.set_encrypted(self.options.encryption);
        let bytes = if self.options.uncompressed {
            chunk.uncompressed(self.crypt.as_ref())?.to_vec()
        } else {
            chunk.compressed(self.crypt.as_ref(), self.options.compression_level)?.to_vec()
        };
        let url = self.chunk_url(&id);
        let resp = self
            .request_with_retry(|| {
                Request::builder()
                    .method("PUT")
                    .uri(url.clone())
                    .body(Body::from(bytes.clone()))
                    .expect("valid PUT request")
            })
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CasError::transport(&self.base, anyhow::anyhow!("PUT failed with status {}", resp.status())).into())
        }
    }
}
