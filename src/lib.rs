//! Content-addressed cache and lifecycle manager for VM disk images,
//! kernels, and initrds.
//!
//! The vault mediates between upstream image catalogs ([`ImageHost`]
//! adapters describing named releases with URLs and expected hashes) and the
//! local filesystem where instances consume prepared images. Every
//! [`ImageVault::fetch_image`] call resolves to a ready-to-boot image on
//! disk, deduplicated across concurrent requests, verified against upstream
//! hashes, and recoverable across process restarts.
//!
//! Two tiers of cache are kept: shared *prepared* images keyed by content
//! id, and private per-instance copies keyed by instance name. Both are
//! persisted as JSON record stores rewritten atomically on every mutation.

pub mod errors;
pub mod fetch;
pub mod hosts;
pub mod image;
pub mod layout;
pub mod query;
pub mod vault;

pub use errors::{VaultError, VaultResult};
pub use fetch::{Fetcher, UrlFetcher, XzDecoder};
pub use hosts::{HostRegistry, ImageHost};
pub use image::{ImageInfo, PrepareAction, ProgressMonitor, ProgressPhase, VMImage};
pub use layout::VaultLayout;
pub use query::{FetchType, Query, QueryType};
pub use vault::{DefaultPlatform, FileGuard, ImageVault, Platform, VaultRecord};
