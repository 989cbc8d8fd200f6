//! Store URL resolution (spec §3 "Store URL schemes", §6 store-file JSON).
//!
//! A single entry in a store-file's `stores` list may itself be a
//! `|`-separated failover group. Each member is either a bare filesystem
//! path or a URL with one of the recognized schemes. This module turns one
//! such entry into a composed [`SharedStore`], and a whole [`StoreFile`]
//! into the fully assembled router+cache+dedup stack described in §4.5.

use std::sync::Arc;

use anyhow::{bail, Error};

use crate::error::CasError;

use super::{failover::FailoverGroup, router::Router, Cache, DedupQueue, SharedStore, SharedWriteStore, StoreFile, StoreOptions};

/// Build a single backend store from one URL (or bare path). `options`
/// carries the per-store config merged from the store-file and any
/// command-line override (spec §3 "Options are per-store-URL, mergeable").
pub fn open_store(spec: &str, options: StoreOptions) -> Result<SharedStore, Error> {
    open_write_store(spec, options).map(|w| w as SharedStore)
}

/// Like [`open_store`] but requires the backend to support writes; used for
/// the destination side of `store`/`copy` operations and as the sink half of
/// a [`Cache`].
pub fn open_write_store(spec: &str, options: StoreOptions) -> Result<SharedWriteStore, Error> {
    if let Some((scheme, rest)) = spec.split_once("://") {
        match scheme {
            "ssh" => Ok(Arc::new(super::ssh::SshStore::new(rest, options)?)),
            "sftp" => Ok(Arc::new(super::sftp::SftpStore::new(rest, options)?)),
            "http" | "https" => Ok(Arc::new(super::http::HttpStore::new(scheme, rest, options)?)),
            "s3+http" | "s3+https" => {
                let inner_scheme = &scheme[3..];
                Ok(Arc::new(super::s3::S3Store::new(inner_scheme, rest, options)?))
            }
            "gs" => Ok(Arc::new(super::gcs::GcsStore::new(rest, options)?)),
            "oci" => bail!(CasError::Configuration(
                "oci:// store URLs are not a writable chunk store target".into()
            )),
            other => bail!(CasError::Configuration(format!("unrecognized store URL scheme {:?}", other))),
        }
    } else {
        Ok(Arc::new(super::local::LocalStore::open(spec, options)?))
    }
}

/// Resolve one `stores` entry, which may be a `|`-separated failover group,
/// into a single [`SharedStore`] (spec §3: "A `|`-separated list of URLs
/// denotes a failover group").
pub fn open_entry(entry: &str, options: StoreOptions) -> Result<SharedStore, Error> {
    let members: Vec<&str> = entry.split('|').map(str::trim).filter(|s| !s.is_empty()).collect();
    if members.is_empty() {
        bail!(CasError::Configuration("empty store entry".into()));
    }
    if members.len() == 1 {
        return open_store(members[0], options);
    }
    let peers = members
        .iter()
        .map(|m| open_store(m, options.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(FailoverGroup::new(peers)))
}

/// Resolve a full store-file (spec §6) into one composed store: an ordered
/// [`Router`] over every `stores` entry (each already a failover group if it
/// contained `|`), wrapped in a read-through, single-flight-deduped
/// [`Cache`] when a `cache` URL is present.
pub fn open_store_file(file: &StoreFile, options: StoreOptions) -> Result<SharedStore, Error> {
    if file.stores.is_empty() {
        bail!(CasError::Configuration("store file has no stores".into()));
    }

    let children = file
        .stores
        .iter()
        .map(|entry| open_entry(entry, options.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let source: SharedStore = if children.len() == 1 {
        children.into_iter().next().unwrap()
    } else {
        Arc::new(Router::new(children, false))
    };

    let source = Arc::new(DedupQueue::new(source)) as SharedStore;

    match &file.cache {
        Some(cache_url) => {
            let cache_store = open_write_store(cache_url, StoreOptions::default())?;
            Ok(Arc::new(Cache::new(cache_store, source)))
        }
        None => Ok(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_opens_a_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path().to_str().unwrap(), StoreOptions::default()).unwrap();
        assert_eq!(store.url(), dir.path().to_str().unwrap());
    }

    #[test]
    fn unknown_scheme_is_a_configuration_error() {
        let err = open_store("ftp://example.com/repo", StoreOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CasError>(),
            Some(CasError::Configuration(_))
        ));
    }

    #[test]
    fn failover_group_entry_requires_successfully_opening_every_member() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let entry = format!("{}|{}", dir_a.path().to_str().unwrap(), dir_b.path().to_str().unwrap());
        let store = open_entry(&entry, StoreOptions::default()).unwrap();
        assert!(store.url().starts_with("failover("));
    }
}
