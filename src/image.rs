//! Artifact model: catalog metadata and materialized images.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::VaultResult;

/// Pipeline phases reported to a [`ProgressMonitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressPhase {
    Image,
    Kernel,
    Initrd,
    Verify,
    Decode,
    /// Another caller's fetch for the same image is being joined.
    Waiting,
}

/// Caller-supplied progress callback, invoked with a phase and a percent
/// (`-1` when indeterminate). Returning `false` requests a best-effort abort
/// of the current download.
pub type ProgressMonitor = Arc<dyn Fn(ProgressPhase, i32) -> bool + Send + Sync>;

/// Caller-supplied transformation applied to a fetched image before it is
/// published to the cache. It may return the same image or one with different
/// paths; replaced source files are deleted by the vault.
pub type PrepareAction = Arc<dyn Fn(VMImage) -> VaultResult<VMImage> + Send + Sync>;

/// What an image host returns for a query.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInfo {
    /// Upstream-declared SHA-256 hex of the image contents.
    pub id: String,
    pub release: String,
    pub version: String,
    pub release_title: String,
    pub aliases: Vec<String>,
    /// Download locations; empty string when the artifact does not exist.
    pub image_location: String,
    pub kernel_location: String,
    pub initrd_location: String,
    /// Image size in bytes, `-1` when unknown.
    pub size: i64,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            release: String::new(),
            version: String::new(),
            release_title: String::new(),
            aliases: Vec::new(),
            image_location: String::new(),
            kernel_location: String::new(),
            initrd_location: String::new(),
            size: -1,
        }
    }
}

/// A materialized image on disk. Empty paths mean the artifact is absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VMImage {
    #[serde(rename = "path")]
    pub image_path: PathBuf,
    #[serde(default)]
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: PathBuf,
    /// Content identifier: the upstream hash for alias images, the hash of
    /// the URL string for http images.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub original_release: String,
    #[serde(default)]
    pub current_release: String,
    /// Free-form upstream marker compared against `Last-Modified` to detect
    /// staleness of URL images.
    #[serde(default)]
    pub release_date: String,
    #[serde(default, with = "alias_entries")]
    pub aliases: Vec<String>,
}

/// Aliases are stored as an array of `{"alias": ...}` objects.
mod alias_entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Entry {
        alias: String,
    }

    pub fn serialize<S: Serializer>(aliases: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(aliases.iter().map(|alias| Entry {
            alias: alias.clone(),
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|entry| entry.alias).collect())
    }
}
