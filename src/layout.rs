//! Filesystem layout for the vault's cache and data trees.

use std::path::{Path, PathBuf};

use crate::errors::{VaultError, VaultResult};

/// Directory and file names used by the vault.
pub mod dirs {
    /// Subtree created under both the cache and data directories.
    pub const VAULT_DIR: &str = "vault";

    /// Prepared images, one directory per image.
    pub const IMAGES_DIR: &str = "images";

    /// Per-instance copies, one directory per instance.
    pub const INSTANCES_DIR: &str = "instances";

    /// Prepared-image record store.
    pub const IMAGE_DB: &str = "multipassd-image-records.json";

    /// Instance-image record store.
    pub const INSTANCE_DB: &str = "multipassd-instance-image-records.json";
}

/// Path layout rooted at a cache directory (shared prepared images) and a
/// data directory (private instance copies).
///
/// ```text
/// <cache_dir>/vault/
/// ├── images/<release>-<version>/...         # prepared images
/// └── multipassd-image-records.json
/// <data_dir>/vault/
/// ├── instances/<name>/...                   # per-instance copies
/// └── multipassd-instance-image-records.json
/// ```
#[derive(Clone, Debug)]
pub struct VaultLayout {
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl VaultLayout {
    pub fn new(cache_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into().join(dirs::VAULT_DIR),
            data_dir: data_dir.into().join(dirs::VAULT_DIR),
        }
    }

    /// Prepared images directory: `<cache_dir>/vault/images`
    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir.join(dirs::IMAGES_DIR)
    }

    /// Instances directory: `<data_dir>/vault/instances`
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join(dirs::INSTANCES_DIR)
    }

    /// Prepared-image record store: `<cache_dir>/vault/multipassd-image-records.json`
    pub fn image_records_path(&self) -> PathBuf {
        self.cache_dir.join(dirs::IMAGE_DB)
    }

    /// Instance record store: `<data_dir>/vault/multipassd-instance-image-records.json`
    pub fn instance_records_path(&self) -> PathBuf {
        self.data_dir.join(dirs::INSTANCE_DB)
    }

    /// Directory holding one instance's private copies.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir().join(name)
    }

    /// Create (if needed) and return the directory for one prepared image.
    pub fn make_image_dir(&self, name: &str) -> VaultResult<PathBuf> {
        let dir = self.images_dir().join(name);
        create_dir(&dir)?;
        Ok(dir)
    }

    /// Create (if needed) and return the directory for one instance.
    pub fn make_instance_dir(&self, name: &str) -> VaultResult<PathBuf> {
        let dir = self.instance_dir(name);
        create_dir(&dir)?;
        Ok(dir)
    }

    /// Initialize the directory structure.
    pub fn prepare(&self) -> VaultResult<()> {
        create_dir(&self.images_dir())?;
        create_dir(&self.instances_dir())?;
        Ok(())
    }
}

fn create_dir(dir: &Path) -> VaultResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| VaultError::Storage(format!("failed to create {}: {e}", dir.display())))
}
