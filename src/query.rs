//! Request model for vault lookups.

use serde::{Deserialize, Serialize};

/// What a fetch should retrieve besides the disk image itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchType {
    ImageOnly,
    ImageKernelAndInitrd,
}

/// How the `release` field of a [`Query`] is interpreted.
///
/// Persisted as an integer, so variant order is part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QueryType {
    /// A human-readable name resolved through an image host.
    Alias,
    /// A direct http(s) URL to an image.
    HttpUrl,
    /// A path to an image file on the local filesystem.
    LocalFile,
}

impl From<QueryType> for u8 {
    fn from(query_type: QueryType) -> u8 {
        match query_type {
            QueryType::Alias => 0,
            QueryType::HttpUrl => 1,
            QueryType::LocalFile => 2,
        }
    }
}

impl TryFrom<u8> for QueryType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QueryType::Alias),
            1 => Ok(QueryType::HttpUrl),
            2 => Ok(QueryType::LocalFile),
            other => Err(format!("unknown query type {other}")),
        }
    }
}

/// An immutable image request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    /// Instance the image is for; empty for catalog-only lookups.
    pub name: String,
    /// Alias string, or a URL or path for non-alias queries.
    pub release: String,
    /// Exempts the resulting cache entry from age-based expiry.
    pub persistent: bool,
    /// Which image host to consult; empty means any, in registration order.
    pub remote_name: String,
    pub query_type: QueryType,
}
