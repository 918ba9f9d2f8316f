//! Transport seams: URL downloads and archive decoding.

mod decoder;
mod http;

pub use decoder::XzDecoder;
pub use http::UrlFetcher;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::VaultResult;
use crate::image::{ProgressMonitor, ProgressPhase};

/// Downloads URLs to local paths with progress reporting.
///
/// The vault only depends on this trait; the default implementation is
/// [`UrlFetcher`]. Tests substitute their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` to `dest`, reporting progress under `phase`.
    ///
    /// `size` is the expected byte count when the caller knows it up front
    /// (image hosts publish it) and `-1` or `0` otherwise, in which case the
    /// transfer's own length information is used. The monitor receives
    /// percent values, `-1` when indeterminate; a `false` return aborts the
    /// download best-effort.
    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        size: i64,
        phase: ProgressPhase,
        monitor: &ProgressMonitor,
    ) -> VaultResult<()>;

    /// Upstream modification timestamp for `url`, if the server reports one.
    async fn last_modified(&self, url: &str) -> VaultResult<Option<DateTime<Utc>>>;
}
