//! Error types for provisioning operations.
//!
//! Each stage of the pipeline has its own error type. They are collected into
//! [`ArtifactError`] at the per-artifact boundary, where the orchestrator turns
//! them into a failed outcome instead of aborting the run. [`ManifestError`] is
//! the only kind that is fatal to a whole invocation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A manifest entry that cannot be processed as written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent or empty.
    #[error("No {field} specified for '{name}'")]
    MissingField { name: String, field: &'static str },

    /// The `type`/`kind` value is not one of the supported kinds.
    #[error("Unknown artifact type '{kind}' for '{name}'")]
    UnknownKind { name: String, kind: String },
}

/// Errors raised while transferring remote content into a staging area.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Connection, TLS, timeout or body streaming failure.
    #[error("Failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status.
    #[error("Failed to fetch {url}: HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The directory listing was not a JSON array of entries.
    #[error("Unexpected listing response from {url}: {detail}")]
    MalformedListing { url: String, detail: String },

    /// The listing locator does not have the `owner/repo/tree/branch/path` shape.
    #[error("Invalid directory locator: {0}")]
    InvalidLocator(String),

    /// Some members of a directory listing could not be fetched.
    #[error("Failed to fetch {} of the files listed at {url}: {}", .failed.len(), .failed.join(", "))]
    PartialListing { url: String, failed: Vec<String> },

    /// Body length does not match the advertised Content-Length.
    #[error("File size mismatch for {url}: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    /// Body digest does not match the server's ETag.
    #[error("MD5 mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Local I/O failure while writing staged content.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while materializing an archive.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The archive name carries a suffix no supported container uses.
    #[error("Unsupported archive format: {suffix}")]
    UnsupportedFormat { suffix: String },

    /// A member would land outside the destination directory.
    #[error("Archive contains unsafe path: {0}")]
    UnsafePath(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// Extraction was stopped because the caller went away.
    #[error("Extraction cancelled")]
    Cancelled,

    /// The blocking extraction task did not complete.
    #[error("Extraction task failed: {0}")]
    Worker(String),
}

/// Errors raised by the delegated version-control tool.
#[derive(Error, Debug)]
pub enum ExternalToolError {
    /// The tool could not be started at all.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tool exited with a non-zero status.
    #[error("`{command}` failed ({status}): {}", .stderr.trim())]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// The tool succeeded but the workspace is not in the expected state.
    #[error("{0}")]
    Precondition(String),
}

/// Everything that can fail while processing a single artifact.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    /// Staging or commit I/O.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fatal errors that stop an invocation before any artifact is processed.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest not found at: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse TOML in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Attaches a path to an [`io::Error`] for the error type at hand.
pub(crate) trait IoContext<T> {
    fn fetch_ctx(self, path: impl Into<PathBuf>) -> Result<T, FetchError>;
    fn extract_ctx(self, path: impl Into<PathBuf>) -> Result<T, ExtractError>;
    fn artifact_ctx(self, path: impl Into<PathBuf>) -> Result<T, ArtifactError>;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn fetch_ctx(self, path: impl Into<PathBuf>) -> Result<T, FetchError> {
        self.map_err(|source| FetchError::Io {
            path: path.into(),
            source,
        })
    }

    fn extract_ctx(self, path: impl Into<PathBuf>) -> Result<T, ExtractError> {
        self.map_err(|source| ExtractError::Io {
            path: path.into(),
            source,
        })
    }

    fn artifact_ctx(self, path: impl Into<PathBuf>) -> Result<T, ArtifactError> {
        self.map_err(|source| ArtifactError::Io {
            path: path.into(),
            source,
        })
    }
}
