//! Error types surfaced by vault operations.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type VaultResult<T> = Result<T, VaultError>;

/// Everything a vault operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The platform forbids http and file based image sources.
    #[error("http and file based images are not supported")]
    UnsupportedSource,

    /// The platform forbids the requested remote.
    #[error("\"{0}\" is not a supported remote")]
    UnsupportedRemote(String),

    /// The platform forbids the requested alias.
    #[error("\"{0}\" is not a supported alias")]
    UnsupportedAlias(String),

    /// A remote name was given that no registered image host serves.
    #[error("remote \"{0}\" is unknown")]
    UnknownRemote(String),

    /// No image host could resolve the query.
    #[error("unable to find an image matching \"{0}\"")]
    NoMatch(String),

    /// A local image file does not exist.
    #[error("custom image `{}` does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("failed to decode {}: {reason}", .path.display())]
    DecodeFailed { path: PathBuf, reason: String },

    /// The downloaded bytes do not hash to the catalog-declared id.
    #[error("downloaded image hash does not match")]
    HashMismatch,

    /// Uniform wrapper for any failure inside an image fetch task. Callers
    /// joining a shared fetch all observe the same error through this kind.
    #[error("failed to create image: {0}")]
    CreateImageFailed(String),

    /// The caller-supplied prepare step failed.
    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    /// A record store could not be rewritten.
    #[error("failed to persist records to {}: {reason}", .path.display())]
    Persist { path: PathBuf, reason: String },

    /// Local filesystem operation failed.
    #[error("{0}")]
    Storage(String),
}
