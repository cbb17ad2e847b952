//! Artifetch - Fetch, cache and extract external build inputs
//!
//! This library materializes the third-party pieces a workspace needs before it
//! can build: sample asset files, release archives of native dependencies and
//! vendored git subtrees. Each artifact is described by a manifest entry and is
//! fetched at most once; a populated destination directory is the cache.
//!
//! # Features
//!
//! - **Idempotent Runs**: Populated destinations are skipped without touching the network
//! - **Staged Downloads**: Content lands in a private temp directory and is committed only when complete
//! - **Archive Normalization**: zip and tar (gzip, xz, bzip2, zstd) with `strip_components`
//! - **Directory Listings**: First-level files of a GitHub tree URL
//! - **Failure Isolation**: One broken artifact never stops the rest of the run
//! - **Progress Tracking**: Per-artifact progress bars
//!
//! # Example
//!
//! ```no_run
//! use artifetch::{load_manifest, provision, FetchConfig, ManifestFlavor};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manifest = load_manifest(
//!     Path::new("external_deps.toml"),
//!     ManifestFlavor::Dependencies,
//!     Path::new("external"),
//! )?;
//!
//! let summary = provision(&FetchConfig::default(), &manifest).await?;
//! println!("{}/{} succeeded", summary.succeeded, summary.total);
//! # Ok(())
//! # }
//! ```

pub mod download;
pub mod error;
pub mod extract;
pub mod gate;
pub mod listing;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod staging;
pub mod subtree;
pub mod types;

pub use download::Fetcher;
pub use error::{
    ArtifactError, ExternalToolError, ExtractError, FetchError, ManifestError, ValidationError,
};
pub use extract::{extract, extract_until, strip_member_path, ArchiveFormat, ExtractStats};
pub use gate::should_acquire;
pub use manifest::{load_manifest, parse_manifest, Manifest, ManifestEntry, ManifestFlavor};
pub use orchestrator::{provision, Pipeline};
pub use progress::Progress;
pub use subtree::{load_or_create_default, sync_subtrees, GitTool, SubtreeConfig, SubtreeMode};
pub use types::{
    ArtifactKind, ArtifactSpec, FetchConfig, OutcomeRecord, OutcomeStatus, RunSummary,
};
