//! GCS chunk store backend (spec §3 `gs://`). Google's JSON API takes a
//! plain OAuth2 bearer token rather than the per-request signature S3
//! needs, so this backend is a thinner sibling of [`super::s3::S3Store`]
//! over the same `hyper`+`openssl` stack: no SigV4, just `Authorization:
//! Bearer`. Token *acquisition* is an external collaborator's job (spec
//! Non-goals: "authentication schemes beyond basic credentials/mTLS" and
//! "shared-credential parsing for object storage" are out of scope) — this
//! backend reads an already-minted token from `GOOGLE_OAUTH_ACCESS_TOKEN`,
//! the same "assume it's already resolved" stance taken for S3.

use anyhow::{bail, Context as _, Error};
use async_trait::async_trait;
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Request};

use crate::chunk::{self, Chunk};
use crate::digest::ChunkId;
use crate::error::CasError;

use super::s3::hyper_tls_shim::HttpsOnly;
use super::{Store, StoreOptions, WriteStore};

const GCS_HOST: &str = "storage.googleapis.com";

pub struct GcsStore {
    client: Client<HttpsOnly, Body>,
    bucket: String,
    prefix: String,
    token: String,
    options: StoreOptions,
    crypt: Option<crate::crypt::CryptConfig>,
    url: String,
}

impl GcsStore {
    /// `rest` is `<bucket>[/<prefix>]`, e.g. `my-bucket/chunks`.
    pub fn new(rest: &str, options: StoreOptions) -> Result<Self, Error> {
        let (bucket, prefix) = match rest.split_once('/') {
            Some((b, p)) => (b.to_string(), p.trim_end_matches('/').to_string()),
            None => (rest.to_string(), String::new()),
        };
        let token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .context("GOOGLE_OAUTH_ACCESS_TOKEN not set")?;
        let url = format!("gs://{}", rest);

        let crypt = if options.encryption {
            let password = options
                .encryption_password
                .as_ref()
                .ok_or_else(|| CasError::Configuration("encryption enabled without a password".into()))?;
            Some(crate::crypt::CryptConfig::derive(password.as_bytes(), url.as_bytes())?)
        } else {
            None
        };

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let client = Client::builder().build(HttpsOnly::new(http, true)?);

        Ok(GcsStore {
            client,
            bucket,
            prefix,
            token,
            options,
            crypt,
            url,
        })
    }

    fn object_key(&self, id: &ChunkId) -> String {
        let hex = id.to_hex();
        if self.prefix.is_empty() {
            format!("{}/{}.cacnk", &hex[0..4], hex)
        } else {
            format!("{}/{}/{}.cacnk", self.prefix, &hex[0..4], hex)
        }
    }

    fn legacy_object_key(&self, id: &ChunkId) -> String {
        let hex = id.to_hex();
        if self.prefix.is_empty() {
            format!("{}.cacnk", hex)
        } else {
            format!("{}/{}.cacnk", self.prefix, hex)
        }
    }

    /// Media-upload/download endpoint: `…/storage/v1/b/<bucket>/o/<object>`.
    /// `alt=media` on GET returns raw bytes instead of a JSON object
    /// resource (the GCS JSON API convention).
    fn object_uri(&self, key: &str, upload: bool) -> String {
        let encoded_key = percent_encode(key);
        if upload {
            format!(
                "https://{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
                GCS_HOST, self.bucket, encoded_key
            )
        } else {
            format!(
                "https://{}/storage/v1/b/{}/o/{}?alt=media",
                GCS_HOST, self.bucket, encoded_key
            )
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let req = Request::builder()
            .method("GET")
            .uri(self.object_uri(key, false))
            .header("authorization", format!("Bearer {}", self.token))
            .body(Body::empty())?;
        let resp = self.client.request(req).await.map_err(|e| CasError::transport(&self.url, e))?;
        match resp.status() {
            s if s.is_success() => Ok(Some(
                hyper::body::to_bytes(resp.into_body())
                    .await
                    .map_err(|e| CasError::transport(&self.url, e))?
                    .to_vec(),
            )),
            s if s.as_u16() == 404 => Ok(None),
            s => bail!(CasError::transport(&self.url, anyhow::anyhow!("unexpected status {}", s))),
        }
    }

    /// One-time migration from a legacy flat key layout to the sharded
    /// layout (spec "Supplemented features"): copy-then-delete every
    /// legacy key whose sharded counterpart is absent or differs.
    pub async fn upgrade(&self) -> Result<u64, Error> {
        let list_uri = format!(
            "https://{}/storage/v1/b/{}/o?prefix={}",
            GCS_HOST,
            self.bucket,
            percent_encode(&self.prefix)
        );
        let req = Request::builder()
            .method("GET")
            .uri(list_uri)
            .header("authorization", format!("Bearer {}", self.token))
            .body(Body::empty())?;
        let resp = self.client.request(req).await.map_err(|e| CasError::transport(&self.url, e))?;
        if !resp.status().is_success() {
            bail!(CasError::transport(&self.url, anyhow::anyhow!("list failed with status {}", resp.status())));
        }
        let body = hyper::body::to_bytes(resp.into_body()).await.map_err(|e| CasError::transport(&self.url, e))?;
        let listing: serde_json::Value = serde_json::from_slice(&body)?;

        let mut migrated = 0u64;
        if let Some(items) = listing.get("items").and_then(|v| v.as_array()) {
            for item in items {
                let name = match item.get("name").and_then(|v| v.as_str()) {
                    Some(n) => n,
                    None => continue,
                };
                let base = name.rsplit('/').next().unwrap_or(name);
                let id: ChunkId = match base.trim_end_matches(".cacnk").parse() {
                    Ok(id) => id,
                    Err(_) => continue, // not a chunk name, e.g. already-sharded dir marker
                };
                let sharded_key = self.object_key(&id);
                if name == sharded_key {
                    continue; // already in sharded form
                }
                if self.get_object(&sharded_key).await?.is_some() {
                    continue; // sharded copy already exists
                }
                if let Some(data) = self.get_object(name).await? {
                    self.put_object(&sharded_key, &data).await?;
                    migrated += 1;
                }
            }
        }
        Ok(migrated)
    }

    async fn put_object(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let req = Request::builder()
            .method("POST")
            .uri(self.object_uri(key, true))
            .header("authorization", format!("Bearer {}", self.token))
            .header("content-type", "application/octet-stream")
            .body(Body::from(data.to_vec()))?;
        let resp = self.client.request(req).await.map_err(|e| CasError::transport(&self.url, e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CasError::transport(&self.url, anyhow::anyhow!("upload failed with status {}", resp.status())).into())
        }
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[async_trait]
impl Store for GcsStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, Error> {
        let key = self.object_key(&id);
        let data = match self.get_object(&key).await? {
            Some(data) => data,
            None => match self.get_object(&self.legacy_object_key(&id)).await? {
                Some(data) => data,
                None => return Err(CasError::NotFound(id).into()),
            },
        };
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
        Ok(self.get_object(&self.object_key(&id)).await?.is_some()
            || self.get_object(&self.legacy_object_key(&id)).await?.is_some())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WriteStore for GcsStore {
    async fn store_chunk(&self, id: ChunkId, mut chunk: Chunk) -> Result<(), Error> {
        chunk.set_encrypted(self.options.encryption);
        let bytes = if self.options.uncompressed {
            chunk.uncompressed(self.crypt.as_ref())?.to_vec()
        } else {
            chunk.compressed(self.crypt.as_ref(), self.options.compression_level)?.to_vec()
        };
        let key = self.object_key(&id);
        self.put_object(&key, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_preserves_path_separators() {
        assert_eq!(percent_encode("ab/cd ef"), "ab/cd%20ef");
    }
}
