//! Vault core: request dispatch, in-flight deduplication, and lifecycle of
//! cached images.
//!
//! Architecture:
//! - `ImageVault` is a cheap-clone facade over `Arc<VaultInner>`
//! - one `tokio::sync::Mutex` guards the two record maps and the in-flight
//!   fetch map; it is released across downloads, decodes, and `prepare`
//! - alias fetches run as spawned tasks shared through
//!   `futures::future::Shared`, so concurrent callers join one download and
//!   an abandoned caller still gets its result installed

mod guard;
mod records;

pub use guard::FileGuard;
pub use records::{RecordStore, VaultRecord};

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::errors::{VaultError, VaultResult};
use crate::fetch::{Fetcher, XzDecoder};
use crate::hosts::{HostRegistry, ImageHost};
use crate::image::{ImageInfo, PrepareAction, ProgressMonitor, ProgressPhase, VMImage};
use crate::layout::VaultLayout;
use crate::query::{FetchType, Query, QueryType};

// ============================================================================
// PLATFORM GATES
// ============================================================================

/// Platform policy for which image sources may be used.
pub trait Platform: Send + Sync {
    /// Whether http and file based image sources are allowed.
    fn supports_url_images(&self) -> bool {
        true
    }

    /// Whether images from `remote` may be used.
    fn supports_remote(&self, _remote: &str) -> bool {
        true
    }

    /// Whether `alias` from `remote` may be used.
    fn supports_alias(&self, _alias: &str, _remote: &str) -> bool {
        true
    }
}

/// Permits every source.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPlatform;

impl Platform for DefaultPlatform {}

// ============================================================================
// VAULT STATE
// ============================================================================

/// A pending alias fetch, joinable by any number of callers. The error side
/// is `Arc`ed so every joiner observes the same failure.
type SharedFetch = Shared<BoxFuture<'static, Result<VMImage, Arc<VaultError>>>>;

/// Mutable vault state. One lock guards all three maps so a cache decision
/// and the matching in-flight bookkeeping are atomic.
struct VaultState {
    /// Prepared images, keyed by content id, shared across instances.
    prepared: RecordStore,
    /// Private instance copies, keyed by instance name.
    instances: RecordStore,
    in_flight: HashMap<String, SharedFetch>,
}

struct VaultInner {
    registry: HostRegistry,
    fetcher: Arc<dyn Fetcher>,
    platform: Arc<dyn Platform>,
    layout: VaultLayout,
    days_to_expire: i64,
    state: Mutex<VaultState>,
}

/// Content-addressed cache and lifecycle manager for VM images.
///
/// Every request to materialize an image resolves to a ready-to-boot image
/// on disk: catalog aliases and URLs are downloaded, verified, decompressed,
/// and transformed by a caller-supplied `prepare` step, then published as a
/// shared prepared image; named requests additionally get a private copy
/// under an instance directory. Both record maps are persisted as JSON and
/// survive restarts.
///
/// Cloning is cheap; all clones share the same state and may be used from
/// any task or thread.
#[derive(Clone)]
pub struct ImageVault {
    inner: Arc<VaultInner>,
}

impl std::fmt::Debug for ImageVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageVault").finish()
    }
}

impl ImageVault {
    /// Create a vault over the given image hosts and fetcher.
    ///
    /// `cache_dir` holds shared prepared images, `data_dir` holds private
    /// instance copies; both get a `vault/` subtree. Existing record stores
    /// are loaded leniently (a malformed store starts empty). Prepared
    /// records not accessed for `days_to_expire` days become eligible for
    /// [`prune_expired`].
    ///
    /// [`prune_expired`]: ImageVault::prune_expired
    pub fn new(
        hosts: Vec<Arc<dyn ImageHost>>,
        fetcher: Arc<dyn Fetcher>,
        platform: Arc<dyn Platform>,
        cache_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        days_to_expire: u32,
    ) -> VaultResult<Self> {
        let layout = VaultLayout::new(cache_dir, data_dir);
        layout.prepare()?;

        let prepared = RecordStore::load(layout.image_records_path());
        let instances = RecordStore::load(layout.instance_records_path());

        Ok(Self {
            inner: Arc::new(VaultInner {
                registry: HostRegistry::new(hosts),
                fetcher,
                platform,
                layout,
                days_to_expire: i64::from(days_to_expire),
                state: Mutex::new(VaultState {
                    prepared,
                    instances,
                    in_flight: HashMap::new(),
                }),
            }),
        })
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Resolve a query to a ready-to-boot image.
    ///
    /// Dispatch order:
    /// 1. an existing instance record for `query.name` is returned as-is
    /// 2. URL and local-file queries go through the custom-image path
    /// 3. alias queries resolve through the image hosts and share one
    ///    in-flight download per content id
    pub async fn fetch_image(
        &self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<VMImage> {
        {
            let state = self.inner.state.lock().await;
            if let Some(record) = state.instances.records.get(&query.name) {
                return Ok(record.image.clone());
            }
        }

        match query.query_type {
            QueryType::Alias => self.fetch_alias_image(fetch_type, query, prepare, monitor).await,
            QueryType::LocalFile => {
                if !self.inner.platform.supports_url_images() {
                    return Err(VaultError::UnsupportedSource);
                }
                self.fetch_local_image(fetch_type, query, prepare, monitor).await
            }
            QueryType::HttpUrl => {
                if !self.inner.platform.supports_url_images() {
                    return Err(VaultError::UnsupportedSource);
                }
                self.fetch_url_image(fetch_type, query, prepare, monitor).await
            }
        }
    }

    /// Whether an instance record exists for `name`.
    pub async fn has_record_for(&self, name: &str) -> bool {
        self.inner.state.lock().await.instances.records.contains_key(name)
    }

    /// Delete the instance `name`: its directory, its record, and the
    /// persisted entry. Unknown names are a no-op.
    pub async fn remove(&self, name: &str) -> VaultResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.instances.records.contains_key(name) {
            return Ok(());
        }

        let instance_dir = self.inner.layout.instance_dir(name);
        if instance_dir.exists() {
            std::fs::remove_dir_all(&instance_dir).map_err(|e| {
                VaultError::Storage(format!(
                    "failed to remove {}: {e}",
                    instance_dir.display()
                ))
            })?;
        }

        state.instances.records.remove(name);
        state.instances.save()
    }

    /// Remove prepared alias images that are not persistent and have not
    /// been handed out within the expiry window. Instance copies are never
    /// touched.
    pub async fn prune_expired(&self) -> VaultResult<()> {
        let mut state = self.inner.state.lock().await;
        let expiry = Duration::days(self.inner.days_to_expire);
        let now = Utc::now();

        let expired: Vec<String> = state
            .prepared
            .records
            .iter()
            .filter(|(_, record)| {
                record.query.query_type == QueryType::Alias
                    && !record.query.persistent
                    && record.last_accessed + expiry <= now
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(record) = state.prepared.records.remove(&key) {
                tracing::info!(
                    release = %record.query.release,
                    "source image expired, removing it from the cache"
                );
                if record.image.image_path.exists() {
                    if let Some(dir) = record.image.image_path.parent() {
                        let _ = std::fs::remove_dir_all(dir);
                    }
                }
            }
        }

        state.prepared.save()
    }

    /// Re-resolve every prepared alias record against its catalog and fetch
    /// fresh copies of those whose upstream id changed. New images land under
    /// the new id; superseded records age out through [`prune_expired`].
    ///
    /// [`prune_expired`]: ImageVault::prune_expired
    pub async fn update_images(
        &self,
        fetch_type: FetchType,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<()> {
        let stale_queries: Vec<Query> = {
            let state = self.inner.state.lock().await;
            let mut stale = Vec::new();
            for (key, record) in &state.prepared.records {
                if record.query.query_type != QueryType::Alias {
                    continue;
                }
                let info = self.inner.registry.info_for(&record.query)?;
                if info.id != *key {
                    stale.push(Query {
                        // Refresh queries must not carry an instance name; a
                        // name would short-circuit to the instance record.
                        name: String::new(),
                        ..record.query.clone()
                    });
                }
            }
            stale
        };

        for query in stale_queries {
            tracing::info!(release = %query.release, "updating source image to latest");
            self.fetch_image(fetch_type, &query, prepare, monitor).await?;
        }

        Ok(())
    }

    // ========================================================================
    // ALIAS PATH
    // ========================================================================

    async fn fetch_alias_image(
        &self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<VMImage> {
        let info = self.inner.registry.info_for(query)?;

        if !self.inner.platform.supports_remote(&query.remote_name) {
            return Err(VaultError::UnsupportedRemote(query.remote_name.clone()));
        }
        if !self.inner.platform.supports_alias(&query.release, &query.remote_name) {
            return Err(VaultError::UnsupportedAlias(query.release.clone()));
        }

        let id = info.id.clone();

        let pending = {
            let mut state = self.inner.state.lock().await;

            // Someone is already fetching this id: join their result.
            if let Some(pending) = state.in_flight.get(&id) {
                let pending = pending.clone();
                monitor(ProgressPhase::Waiting, -1);
                drop(state);
                return self.join_fetch(&id, pending, query).await;
            }

            // Unnamed queries (catalog refreshes) bypass the cached record
            // and always fetch fresh.
            if !query.name.is_empty() {
                // An id match takes precedence over an alias match, so a
                // superseded record cannot shadow its replacement.
                let records = &state.prepared.records;
                let hit = records
                    .get(&id)
                    .filter(|record| record.query.remote_name == query.remote_name)
                    .map(|record| (id.clone(), record.image.clone()))
                    .or_else(|| {
                        records.iter().find_map(|(key, record)| {
                            if record.query.remote_name == query.remote_name
                                && record.image.aliases.iter().any(|alias| *alias == query.release)
                            {
                                Some((key.clone(), record.image.clone()))
                            } else {
                                None
                            }
                        })
                    });

                if let Some((key, prepared_image)) = hit {
                    tracing::info!(release = %query.release, "using cached image");
                    if let Some(record) = state.prepared.records.get_mut(&key) {
                        record.last_accessed = Utc::now();
                    }
                    match self.finalize_image_records(&mut state, query, &prepared_image) {
                        Ok(vm_image) => return Ok(vm_image),
                        Err(e) => {
                            // Materialization from the cache failed; fall
                            // through to a fresh fetch.
                            tracing::warn!("cannot create instance image: {e}");
                        }
                    }
                }
            }

            let pending = self.spawn_fetch(fetch_type, query, &info, prepare, monitor)?;
            state.in_flight.insert(id.clone(), pending.clone());
            pending
        };

        self.join_fetch(&id, pending, query).await
    }

    /// Await a shared fetch and, on success, hand out the result: bump
    /// `last_accessed`, materialize an instance copy for named queries, and
    /// persist.
    async fn join_fetch(
        &self,
        id: &str,
        pending: SharedFetch,
        query: &Query,
    ) -> VaultResult<VMImage> {
        let result = pending.await;

        let mut state = self.inner.state.lock().await;
        match result {
            Ok(prepared_image) => {
                if let Some(record) = state.prepared.records.get_mut(id) {
                    record.last_accessed = Utc::now();
                }
                self.finalize_image_records(&mut state, query, &prepared_image)
            }
            Err(e) => Err(shared_failure(&e)),
        }
    }

    /// Install a fetch task for `info` and return its shareable handle.
    ///
    /// The task itself publishes the prepared record and retires the
    /// in-flight entry when it completes, so the outcome is installed even
    /// if every caller abandons its future.
    fn spawn_fetch(
        &self,
        fetch_type: FetchType,
        query: &Query,
        info: &ImageInfo,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<SharedFetch> {
        let image_dir = self
            .inner
            .layout
            .make_image_dir(&format!("{}-{}", info.release, info.version))?;

        let source_image = VMImage {
            image_path: image_dir.join(url_file_name(&info.image_location)),
            id: info.id.clone(),
            original_release: info.release_title.clone(),
            aliases: info.aliases.clone(),
            ..Default::default()
        };

        let inner = self.inner.clone();
        let info = info.clone();
        let record_query = query.clone();
        let prepare = prepare.clone();
        let monitor = monitor.clone();

        let task = tokio::spawn(async move {
            let id = info.id.clone();
            let result = fetch_pipeline(
                &inner,
                fetch_type,
                &info,
                source_image,
                &image_dir,
                &prepare,
                &monitor,
            )
            .await
            .map_err(|e| VaultError::CreateImageFailed(e.to_string()));

            let mut state = inner.state.lock().await;
            state.in_flight.remove(&id);
            match result {
                Ok(prepared_image) => {
                    state.prepared.records.insert(
                        id,
                        VaultRecord {
                            image: prepared_image.clone(),
                            query: record_query,
                            last_accessed: Utc::now(),
                        },
                    );
                    if let Err(e) = state.prepared.save() {
                        return Err(Arc::new(VaultError::CreateImageFailed(e.to_string())));
                    }
                    Ok(prepared_image)
                }
                Err(e) => Err(Arc::new(e)),
            }
        });

        Ok(async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(VaultError::CreateImageFailed(format!(
                    "image fetch task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared())
    }

    // ========================================================================
    // CUSTOM IMAGE PATHS (URL and local file)
    // ========================================================================

    async fn fetch_url_image(
        &self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<VMImage> {
        let url = query.release.clone();
        // The URL string itself is the content identity of the download.
        let id = sha256_hex(url.as_bytes());
        let last_modified = self.inner.fetcher.last_modified(&url).await?;
        let release_date = last_modified.map(|lm| lm.to_rfc2822()).unwrap_or_default();

        let mut state = self.inner.state.lock().await;

        let unchanged = state
            .prepared
            .records
            .get(&id)
            .is_some_and(|record| !release_date.is_empty() && release_date == record.image.release_date);
        if unchanged {
            tracing::info!(url = %url, "image unchanged upstream, using cached copy");
            if let Some(record) = state.prepared.records.get_mut(&id) {
                record.last_accessed = Utc::now();
            }
            let prepared_image = state.prepared.records[&id].image.clone();
            return self.finalize_image_records(&mut state, query, &prepared_image);
        }

        let mut source_image = match state.prepared.records.get(&id) {
            // Upstream changed: refresh the existing files in place.
            Some(record) => record.image.clone(),
            None => {
                let file_name = url_file_name(&url);
                let date_suffix = last_modified.unwrap_or_else(Utc::now).format("%Y%m%d");
                let image_dir = self.inner.layout.make_image_dir(&format!(
                    "{}-{}",
                    image_dir_stem(&file_name),
                    date_suffix
                ))?;
                VMImage {
                    image_path: image_dir.join(file_name),
                    id: id.clone(),
                    ..Default::default()
                }
            }
        };
        drop(state);

        let image_dir = source_image
            .image_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut guards = vec![FileGuard::new(&source_image.image_path)];
        self.inner
            .fetcher
            .download_to(&url, &source_image.image_path, 0, ProgressPhase::Image, monitor)
            .await?;

        if fetch_type == FetchType::ImageKernelAndInitrd {
            let info = self.inner.registry.info_for(&kernel_query(&query.name))?;
            source_image = fetch_kernel_and_initrd(
                &*self.inner.fetcher,
                &info,
                source_image,
                &image_dir,
                &mut guards,
                monitor,
            )
            .await?;
        }

        if has_xz_suffix(&source_image.image_path) {
            source_image = decode_downloaded_image(source_image, &mut guards, monitor)?;
        }

        let mut vm_image = run_prepare(prepare, source_image.clone())?;
        vm_image.release_date = release_date;
        remove_source_images(&source_image, &vm_image);
        for guard in guards {
            guard.commit();
        }

        let mut state = self.inner.state.lock().await;
        state.prepared.records.insert(
            id,
            VaultRecord {
                image: vm_image.clone(),
                query: query.clone(),
                last_accessed: Utc::now(),
            },
        );
        state.prepared.save()?;
        self.finalize_image_records(&mut state, query, &vm_image)
    }

    async fn fetch_local_image(
        &self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &PrepareAction,
        monitor: &ProgressMonitor,
    ) -> VaultResult<VMImage> {
        let source_path = local_path_of(&query.release);
        if !source_path.exists() {
            return Err(VaultError::SourceMissing(source_path));
        }

        let instance_dir = self.inner.layout.make_instance_dir(&query.name)?;
        let mut guards = Vec::new();

        let mut source_image = VMImage::default();
        if has_xz_suffix(&source_path) {
            let dest = instance_dir.join(decoded_file_name(&source_path));
            guards.push(FileGuard::new(&dest));
            XzDecoder::decode_to(&source_path, &dest, monitor)?;
            source_image.image_path = dest;
        } else {
            let dest = copy_into(&source_path, &instance_dir)?;
            guards.push(FileGuard::new(&dest));
            source_image.image_path = dest;
        }

        if fetch_type == FetchType::ImageKernelAndInitrd {
            let info = self.inner.registry.info_for(&kernel_query(&query.name))?;
            source_image = fetch_kernel_and_initrd(
                &*self.inner.fetcher,
                &info,
                source_image,
                &instance_dir,
                &mut guards,
                monitor,
            )
            .await?;
        }

        let vm_image = run_prepare(prepare, source_image.clone())?;
        remove_source_images(&source_image, &vm_image);
        for guard in guards {
            guard.commit();
        }

        if query.name.is_empty() {
            return Ok(vm_image);
        }

        let mut state = self.inner.state.lock().await;
        state.instances.records.insert(
            query.name.clone(),
            VaultRecord {
                image: vm_image.clone(),
                query: query.clone(),
                last_accessed: Utc::now(),
            },
        );
        state.instances.save()?;
        Ok(vm_image)
    }

    // ========================================================================
    // FINALIZATION
    // ========================================================================

    /// Hand a prepared image out to the caller and persist both stores.
    ///
    /// Named queries get a private copy under the instance directory and an
    /// instance record; unnamed queries get the prepared image itself.
    fn finalize_image_records(
        &self,
        state: &mut VaultState,
        query: &Query,
        prepared_image: &VMImage,
    ) -> VaultResult<VMImage> {
        let vm_image = if query.name.is_empty() {
            prepared_image.clone()
        } else {
            let instance_image = self.image_instance_from(&query.name, prepared_image)?;
            state.instances.records.insert(
                query.name.clone(),
                VaultRecord {
                    image: instance_image.clone(),
                    query: query.clone(),
                    last_accessed: Utc::now(),
                },
            );
            instance_image
        };

        state.instances.save()?;
        state.prepared.save()?;

        Ok(vm_image)
    }

    /// Copy a prepared image's files into the instance directory for `name`.
    /// The copy does not carry the prepared image's aliases.
    fn image_instance_from(&self, name: &str, prepared_image: &VMImage) -> VaultResult<VMImage> {
        let instance_dir = self.inner.layout.make_instance_dir(name)?;

        Ok(VMImage {
            image_path: copy_into(&prepared_image.image_path, &instance_dir)?,
            kernel_path: copy_into(&prepared_image.kernel_path, &instance_dir)?,
            initrd_path: copy_into(&prepared_image.initrd_path, &instance_dir)?,
            id: prepared_image.id.clone(),
            original_release: prepared_image.original_release.clone(),
            current_release: prepared_image.current_release.clone(),
            release_date: prepared_image.release_date.clone(),
            aliases: Vec::new(),
        })
    }
}

// ============================================================================
// FETCH PIPELINE (runs outside the lock)
// ============================================================================

/// Download, verify, decode, and prepare one alias image. Every file written
/// stays under a guard until the whole pipeline has succeeded.
async fn fetch_pipeline(
    inner: &Arc<VaultInner>,
    fetch_type: FetchType,
    info: &ImageInfo,
    mut source_image: VMImage,
    image_dir: &Path,
    prepare: &PrepareAction,
    monitor: &ProgressMonitor,
) -> VaultResult<VMImage> {
    let mut guards = vec![FileGuard::new(&source_image.image_path)];

    inner
        .fetcher
        .download_to(
            &info.image_location,
            &source_image.image_path,
            info.size,
            ProgressPhase::Image,
            monitor,
        )
        .await?;

    monitor(ProgressPhase::Verify, -1);
    verify_image_hash(&source_image.image_path, &source_image.id)?;

    if fetch_type == FetchType::ImageKernelAndInitrd {
        source_image = fetch_kernel_and_initrd(
            &*inner.fetcher,
            info,
            source_image,
            image_dir,
            &mut guards,
            monitor,
        )
        .await?;
    }

    if has_xz_suffix(&source_image.image_path) {
        source_image = decode_downloaded_image(source_image, &mut guards, monitor)?;
    }

    let prepared_image = run_prepare(prepare, source_image.clone())?;
    remove_source_images(&source_image, &prepared_image);

    for guard in guards {
        guard.commit();
    }
    Ok(prepared_image)
}

async fn fetch_kernel_and_initrd(
    fetcher: &dyn Fetcher,
    info: &ImageInfo,
    mut image: VMImage,
    dir: &Path,
    guards: &mut Vec<FileGuard>,
    monitor: &ProgressMonitor,
) -> VaultResult<VMImage> {
    image.kernel_path = dir.join(url_file_name(&info.kernel_location));
    image.initrd_path = dir.join(url_file_name(&info.initrd_location));
    guards.push(FileGuard::new(&image.kernel_path));
    guards.push(FileGuard::new(&image.initrd_path));

    fetcher
        .download_to(
            &info.kernel_location,
            &image.kernel_path,
            -1,
            ProgressPhase::Kernel,
            monitor,
        )
        .await?;
    fetcher
        .download_to(
            &info.initrd_location,
            &image.initrd_path,
            -1,
            ProgressPhase::Initrd,
            monitor,
        )
        .await?;

    Ok(image)
}

/// Decode a downloaded `.xz` image next to itself and drop the archive.
fn decode_downloaded_image(
    image: VMImage,
    guards: &mut Vec<FileGuard>,
    monitor: &ProgressMonitor,
) -> VaultResult<VMImage> {
    let source_path = image.image_path.clone();
    let dest = source_path.with_file_name(decoded_file_name(&source_path));
    guards.push(FileGuard::new(&dest));

    XzDecoder::decode_to(&source_path, &dest, monitor)?;
    let _ = std::fs::remove_file(&source_path);

    let mut decoded = image;
    decoded.image_path = dest;
    Ok(decoded)
}

fn run_prepare(prepare: &PrepareAction, source_image: VMImage) -> VaultResult<VMImage> {
    prepare(source_image).map_err(|e| match e {
        VaultError::PrepareFailed(_) => e,
        other => VaultError::PrepareFailed(other.to_string()),
    })
}

/// Delete source files the prepare step replaced.
fn remove_source_images(source_image: &VMImage, prepared_image: &VMImage) {
    let pairs = [
        (&source_image.image_path, &prepared_image.image_path),
        (&source_image.kernel_path, &prepared_image.kernel_path),
        (&source_image.initrd_path, &prepared_image.initrd_path),
    ];
    for (source, prepared) in pairs {
        if !source.as_os_str().is_empty() && source != prepared {
            let _ = std::fs::remove_file(source);
        }
    }
}

fn verify_image_hash(path: &Path, expected: &str) -> VaultResult<()> {
    let mut file = File::open(path).map_err(|e| {
        VaultError::Storage(format!("cannot open {} for hashing: {e}", path.display()))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| VaultError::Storage(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    if format!("{:x}", hasher.finalize()) != expected {
        return Err(VaultError::HashMismatch);
    }
    Ok(())
}

// ============================================================================
// HELPERS
// ============================================================================

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn shared_failure(error: &Arc<VaultError>) -> VaultError {
    match error.as_ref() {
        VaultError::CreateImageFailed(reason) => VaultError::CreateImageFailed(reason.clone()),
        other => VaultError::CreateImageFailed(other.to_string()),
    }
}

/// The `"default"` alias lookup used to locate kernel and initrd for custom
/// (URL and local file) images.
fn kernel_query(name: &str) -> Query {
    Query {
        name: name.to_string(),
        release: "default".to_string(),
        persistent: false,
        remote_name: String::new(),
        query_type: QueryType::Alias,
    }
}

fn local_path_of(release: &str) -> PathBuf {
    PathBuf::from(release.strip_prefix("file://").unwrap_or(release))
}

fn url_file_name(location: &str) -> String {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
        .to_string()
}

fn has_xz_suffix(path: &Path) -> bool {
    path.extension().map(|ext| ext == "xz").unwrap_or(false)
}

fn decoded_file_name(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    name.strip_suffix(".xz").unwrap_or(name).to_string()
}

/// Directory stem for a URL image: the file name with `.xz` and one more
/// extension stripped (`disk.img.xz` becomes `disk`).
fn image_dir_stem(file_name: &str) -> &str {
    let base = file_name.strip_suffix(".xz").unwrap_or(file_name);
    match base.rfind('.') {
        Some(index) => &base[..index],
        None => base,
    }
}

/// Copy `source` into `dir`, keeping its file name. Empty sources stay
/// empty; missing sources are an error.
fn copy_into(source: &Path, dir: &Path) -> VaultResult<PathBuf> {
    if source.as_os_str().is_empty() {
        return Ok(PathBuf::new());
    }
    if !source.exists() {
        return Err(VaultError::Storage(format!("{} missing", source.display())));
    }

    let file_name = source.file_name().ok_or_else(|| {
        VaultError::Storage(format!("{} has no file name", source.display()))
    })?;
    let dest = dir.join(file_name);
    std::fs::copy(source, &dest).map_err(|e| {
        VaultError::Storage(format!(
            "failed to copy {} to {}: {e}",
            source.display(),
            dest.display()
        ))
    })?;
    Ok(dest)
}
