//! Data structures shared by the pipeline stages.

use crate::error::ValidationError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a provisioning run.
///
/// Passed by reference into every component; nothing in the crate reads
/// process-wide state.
///
/// # Example
///
/// ```
/// use artifetch::FetchConfig;
/// use std::time::Duration;
///
/// let config = FetchConfig {
///     workspace_root: "/tmp/workspace".into(),
///     max_concurrent: 4,
///     fetch_timeout: Some(Duration::from_secs(60)),
///     ..FetchConfig::default()
/// };
/// assert_eq!(config.retry_attempts, 0);
/// ```
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Root that every artifact destination is resolved against.
    pub workspace_root: PathBuf,
    /// Maximum number of artifacts processed at the same time (default: 1).
    ///
    /// With the default of 1 artifacts are handled strictly in manifest order.
    pub max_concurrent: usize,
    /// Deadline for a single HTTP request, body included (default: none).
    pub fetch_timeout: Option<Duration>,
    /// Deadline for establishing a connection (default: 30s).
    pub connect_timeout: Duration,
    /// Extra attempts after a failed transfer (default: 0, no retry).
    pub retry_attempts: usize,
    /// Pause between retry attempts (default: 5s).
    pub retry_interval: Duration,
    /// Compare the streamed MD5 against simple ETags (default: false).
    ///
    /// Only S3-style servers publish MD5 ETags, so this is off unless asked for.
    pub verify_etag: bool,
    /// Draw progress bars on stderr (default: true).
    pub show_progress: bool,
    /// Base URL of the repository contents API used for directory listings.
    pub listing_api_base: String,
    /// Base URL raw file contents are served from.
    pub raw_content_base: String,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            max_concurrent: 1,
            fetch_timeout: None,
            connect_timeout: Duration::from_secs(30),
            retry_attempts: 0,
            retry_interval: Duration::from_secs(5),
            verify_etag: false,
            show_progress: true,
            listing_api_base: "https://api.github.com".to_string(),
            raw_content_base: "https://raw.githubusercontent.com".to_string(),
            user_agent: concat!("artifetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// How an artifact is acquired and committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// One file copied into the destination directory.
    SingleFile,
    /// A zip or tar archive extracted into the destination directory.
    Archive,
    /// A remote directory whose first-level files are copied.
    DirectoryListing,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::SingleFile => "single-file",
            ArtifactKind::Archive => "archive",
            ArtifactKind::DirectoryListing => "directory-listing",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "single-file" | "single_file" | "glb" => Ok(ArtifactKind::SingleFile),
            "archive" | "generic-archive" | "zip" | "tar" => Ok(ArtifactKind::Archive),
            "listing" | "directory" | "directory-listing" | "remote-directory-listing"
            | "gltf" => Ok(ArtifactKind::DirectoryListing),
            other => Err(other.to_string()),
        }
    }
}

/// One artifact to materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Unique name within the manifest.
    pub name: String,
    /// Download URL, or directory locator for [`ArtifactKind::DirectoryListing`].
    pub source: Option<String>,
    pub kind: ArtifactKind,
    /// Destination directory, relative to [`FetchConfig::workspace_root`].
    pub destination: PathBuf,
    /// Leading path segments dropped from every archive member.
    pub strip_components: usize,
    pub enabled: bool,
    /// Name of the committed file for [`ArtifactKind::SingleFile`].
    pub file_name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl ArtifactSpec {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        kind: ArtifactKind,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source: Some(source.into()),
            kind,
            destination: destination.into(),
            strip_components: 0,
            enabled: true,
            file_name: None,
            version: None,
            description: None,
        }
    }

    pub fn with_strip_components(mut self, strip_components: usize) -> Self {
        self.strip_components = strip_components;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Returns the source URL, or a validation error if it is missing or blank.
    pub fn validated_source(&self) -> Result<&str, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                name: self.name.clone(),
                field: "name",
            });
        }
        if self.destination.as_os_str().is_empty() {
            return Err(ValidationError::MissingField {
                name: self.name.clone(),
                field: "destination",
            });
        }
        match self.source.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => Ok(source),
            _ => Err(ValidationError::MissingField {
                name: self.name.clone(),
                field: "URL",
            }),
        }
    }
}

/// What happened to one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Content was fetched and committed.
    Acquired { bytes: u64 },
    /// The destination was already populated; nothing was fetched.
    Skipped,
    /// An external tool brought the destination up to date; no bytes were
    /// transferred by this crate.
    Synced,
    /// Processing failed; the text is the reported cause.
    Failed { detail: String },
}

/// Per-artifact result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub name: String,
    pub status: OutcomeStatus,
}

impl OutcomeRecord {
    pub fn acquired(name: impl Into<String>, bytes: u64) -> Self {
        Self {
            name: name.into(),
            status: OutcomeStatus::Acquired { bytes },
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: OutcomeStatus::Skipped,
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            status: OutcomeStatus::Failed {
                detail: detail.to_string(),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed { .. })
    }

    pub fn error_detail(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Failed { detail } => Some(detail),
            _ => None,
        }
    }
}

/// Terminal output of one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Names of failed artifacts, in manifest order.
    pub failed: Vec<String>,
    pub outcomes: Vec<OutcomeRecord>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: Vec<OutcomeRecord>, elapsed: Duration) -> Self {
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.name.clone())
            .collect();
        Self {
            total: outcomes.len(),
            succeeded: outcomes.len() - failed.len(),
            failed,
            outcomes,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Process exit status for this run: 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, name: &str) -> Option<&OutcomeRecord> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Total bytes transferred by acquired artifacts.
    pub fn bytes_acquired(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                OutcomeStatus::Acquired { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }
}
