//! Catalog adapters and remote-name resolution.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{VaultError, VaultResult};
use crate::image::ImageInfo;
use crate::query::Query;

/// An adapter over one upstream image catalog.
///
/// Hosts must not call back into the vault; they only answer metadata
/// queries against their upstream index.
pub trait ImageHost: Send + Sync {
    /// Catalog metadata for `query`, or `None` when this host has no match.
    fn info_for(&self, query: &Query) -> VaultResult<Option<ImageInfo>>;

    /// Remote names this host serves.
    fn supported_remotes(&self) -> Vec<String>;
}

/// Ordered collection of image hosts with remote-name lookup.
///
/// The remote map stores indices into the owning host list, built
/// first-registered-wins when two hosts claim the same remote.
pub struct HostRegistry {
    hosts: Vec<Arc<dyn ImageHost>>,
    by_remote: HashMap<String, usize>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<Arc<dyn ImageHost>>) -> Self {
        let mut by_remote = HashMap::new();
        for (index, host) in hosts.iter().enumerate() {
            for remote in host.supported_remotes() {
                by_remote.entry(remote).or_insert(index);
            }
        }
        Self { hosts, by_remote }
    }

    /// Resolve a query to catalog metadata.
    ///
    /// A non-empty `remote_name` selects one host (`UnknownRemote` if none
    /// serves it); otherwise hosts are asked in registration order and the
    /// first match wins. No match anywhere is `NoMatch`.
    pub fn info_for(&self, query: &Query) -> VaultResult<ImageInfo> {
        if !query.remote_name.is_empty() {
            let index = self
                .by_remote
                .get(&query.remote_name)
                .ok_or_else(|| VaultError::UnknownRemote(query.remote_name.clone()))?;
            return match self.hosts[*index].info_for(query)? {
                Some(info) => Ok(info),
                None => Err(VaultError::NoMatch(query.release.clone())),
            };
        }

        for host in &self.hosts {
            if let Some(info) = host.info_for(query)? {
                return Ok(info);
            }
        }
        Err(VaultError::NoMatch(query.release.clone()))
    }
}
