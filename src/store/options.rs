//! Per-store-URL options (spec §3 `StoreOptions`). Mergeable: a CLI layer
//! (out of scope here) would overlay command-line flags onto a config-file
//! instance of this struct.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub uncompressed: bool,
    pub skip_verify: bool,
    pub trust_insecure: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub error_retry: u32,
    #[serde(with = "duration_secs")]
    pub error_retry_base_interval: Duration,
    pub concurrency: usize,
    pub encryption: bool,
    pub encryption_password: Option<String>,
    pub digest: Digest,
    pub compression_level: i32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            uncompressed: false,
            skip_verify: false,
            trust_insecure: false,
            client_cert: None,
            client_key: None,
            ca_cert: None,
            timeout: Duration::from_secs(60),
            error_retry: 3,
            error_retry_base_interval: Duration::from_millis(500),
            concurrency: 10,
            encryption: false,
            encryption_password: None,
            digest: Digest::default(),
            compression_level: 3,
        }
    }
}

impl StoreOptions {
    /// Overlay `other`'s explicitly-set fields on top of `self` — used to
    /// let command-line flags (an external collaborator) override a
    /// config-file instance without this crate knowing about flag parsing.
    pub fn merged_with(mut self, other: StoreOptionsOverride) -> Self {
        if let Some(v) = other.uncompressed {
            self.uncompressed = v;
        }
        if let Some(v) = other.skip_verify {
            self.skip_verify = v;
        }
        if let Some(v) = other.trust_insecure {
            self.trust_insecure = v;
        }
        if other.client_cert.is_some() {
            self.client_cert = other.client_cert;
        }
        if other.client_key.is_some() {
            self.client_key = other.client_key;
        }
        if other.ca_cert.is_some() {
            self.ca_cert = other.ca_cert;
        }
        if let Some(v) = other.timeout {
            self.timeout = v;
        }
        if let Some(v) = other.error_retry {
            self.error_retry = v;
        }
        if let Some(v) = other.error_retry_base_interval {
            self.error_retry_base_interval = v;
        }
        if let Some(v) = other.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = other.encryption {
            self.encryption = v;
        }
        if other.encryption_password.is_some() {
            self.encryption_password = other.encryption_password;
        }
        self
    }
}

/// Sparse overlay of `StoreOptions`, the shape a CLI flag layer would
/// populate (command-line parsing itself stays out of scope, spec §1).
#[derive(Clone, Debug, Default)]
pub struct StoreOptionsOverride {
    pub uncompressed: Option<bool>,
    pub skip_verify: Option<bool>,
    pub trust_insecure: Option<bool>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub error_retry: Option<u32>,
    pub error_retry_base_interval: Option<Duration>,
    pub concurrency: Option<usize>,
    pub encryption: Option<bool>,
    pub encryption_password: Option<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
