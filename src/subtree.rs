//! Vendored sources managed as git subtrees.
//!
//! The subtree list lives in `subtrees.json` at the repository root. All
//! version-control work is delegated to the `git` executable; this module only
//! sequences the commands and records one outcome per subtree.

use crate::error::{ArtifactError, ExternalToolError, ManifestError, ValidationError};
use crate::types::{OutcomeRecord, OutcomeStatus, RunSummary};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Contents of `subtrees.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeConfig {
    #[serde(default)]
    pub subtrees: Vec<SubtreeEntry>,
}

/// One configured subtree, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A subtree entry with every required field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtree {
    pub name: String,
    pub remote: String,
    pub prefix: String,
    pub branch: String,
}

impl SubtreeEntry {
    /// Label used in outcomes, falling back to the position in the file.
    pub fn label(&self, index: usize) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("subtree_{}", index),
        }
    }

    pub fn validate(&self, index: usize) -> Result<Subtree, ValidationError> {
        let label = self.label(index);
        let required = |value: &Option<String>, field: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ValidationError::MissingField {
                    name: label.clone(),
                    field,
                })
        };

        Ok(Subtree {
            name: required(&self.name, "name")?,
            remote: required(&self.remote, "remote")?,
            prefix: required(&self.prefix, "prefix")?,
            branch: self.branch.clone(),
        })
    }
}

impl SubtreeConfig {
    /// Configuration written when none exists yet: a single disabled example.
    pub fn example() -> Self {
        Self {
            subtrees: vec![SubtreeEntry {
                name: Some("example-lib".to_string()),
                remote: Some("https://github.com/example/example-lib.git".to_string()),
                prefix: Some("external/example-lib".to_string()),
                branch: default_branch(),
                enabled: false,
            }],
        }
    }
}

/// Reads the subtree config at `path`, writing [`SubtreeConfig::example`]
/// there first if the file does not exist.
pub fn load_or_create_default(path: &Path) -> Result<SubtreeConfig, ManifestError> {
    if !path.exists() {
        warn!("Configuration file not found: {}", path.display());
        let config = SubtreeConfig::example();
        let json = serde_json::to_string_pretty(&config).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json + "\n").map_err(|source| ManifestError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Created example configuration at {}; edit it to add subtrees",
            path.display()
        );
        return Ok(config);
    }

    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether existing subtrees are created or refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeMode {
    /// `git subtree add` for prefixes that do not exist yet.
    Add,
    /// `git subtree pull` for prefixes that already exist.
    Update,
}

/// Runs `git` inside a repository.
#[derive(Debug, Clone)]
pub struct GitTool {
    program: OsString,
    leading_args: Vec<OsString>,
    repo_root: PathBuf,
}

impl GitTool {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self::with_command("git", Vec::<OsString>::new(), repo_root)
    }

    /// Uses `program leading_args...` in place of `git`.
    pub fn with_command(
        program: impl Into<OsString>,
        leading_args: impl IntoIterator<Item = impl Into<OsString>>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut parts = vec![Path::new(&self.program)
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()];
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }

    /// Runs one command, returning its stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, ExternalToolError> {
        let command = self.command_line(args);
        debug!("Running: {}", command);

        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .current_dir(&self.repo_root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExternalToolError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExternalToolError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fails unless the working directory is inside a git repository.
    pub async fn ensure_repository(&self) -> Result<(), ExternalToolError> {
        match self.run(&["rev-parse", "--git-dir"]).await {
            Ok(_) => Ok(()),
            Err(ExternalToolError::Failed { .. }) => Err(ExternalToolError::Precondition(
                format!(
                    "Not a git repository: {} (initialize one with `git init`)",
                    self.repo_root.display()
                ),
            )),
            Err(e) => Err(e),
        }
    }

    /// Adds `subtree` under its prefix. An existing prefix is left alone.
    pub async fn add(&self, subtree: &Subtree) -> Result<OutcomeStatus, ExternalToolError> {
        info!(
            "Adding subtree {} from {} ({}) at {}",
            subtree.name, subtree.remote, subtree.branch, subtree.prefix
        );

        if self.repo_root.join(&subtree.prefix).exists() {
            warn!(
                "Directory already exists: {}; use update mode to refresh it",
                subtree.prefix
            );
            return Ok(OutcomeStatus::Skipped);
        }

        match self
            .run(&["remote", "add", &subtree.name, &subtree.remote])
            .await
        {
            Ok(_) => {}
            Err(ExternalToolError::Failed { stderr, .. }) if stderr.contains("already exists") => {
                debug!("Remote {} already configured", subtree.name);
            }
            Err(e) => return Err(e),
        }

        self.run(&["fetch", &subtree.name, &subtree.branch]).await?;
        self.run(&[
            "subtree",
            "add",
            "--prefix",
            &subtree.prefix,
            &subtree.name,
            &subtree.branch,
            "--squash",
        ])
        .await?;

        info!("✅ Added subtree {}", subtree.name);
        Ok(OutcomeStatus::Synced)
    }

    /// Pulls upstream changes into an existing subtree.
    pub async fn update(&self, subtree: &Subtree) -> Result<OutcomeStatus, ExternalToolError> {
        info!(
            "Updating subtree {} ({}) at {}",
            subtree.name, subtree.branch, subtree.prefix
        );

        if !self.repo_root.join(&subtree.prefix).exists() {
            return Err(ExternalToolError::Precondition(format!(
                "Directory does not exist: {}; use add mode to create the subtree first",
                subtree.prefix
            )));
        }

        self.run(&["fetch", &subtree.name, &subtree.branch]).await?;
        self.run(&[
            "subtree",
            "pull",
            "--prefix",
            &subtree.prefix,
            &subtree.name,
            &subtree.branch,
            "--squash",
        ])
        .await?;

        info!("✅ Updated subtree {}", subtree.name);
        Ok(OutcomeStatus::Synced)
    }
}

async fn sync_one(
    git: &GitTool,
    entry: &SubtreeEntry,
    index: usize,
    mode: SubtreeMode,
) -> Result<OutcomeStatus, ArtifactError> {
    let subtree = entry.validate(index)?;
    let status = match mode {
        SubtreeMode::Add => git.add(&subtree).await?,
        SubtreeMode::Update => git.update(&subtree).await?,
    };
    Ok(status)
}

/// Processes every enabled subtree of `config` in order.
pub async fn sync_subtrees(git: &GitTool, config: &SubtreeConfig, mode: SubtreeMode) -> RunSummary {
    let start_time = Instant::now();
    let enabled: Vec<(usize, &SubtreeEntry)> = config
        .subtrees
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.enabled)
        .map(|(i, entry)| (i + 1, entry))
        .collect();

    if config.subtrees.is_empty() {
        warn!("No subtrees defined in configuration");
    } else if enabled.is_empty() {
        info!("No enabled subtrees in configuration");
    } else {
        info!("Found {} enabled subtree(s) to process", enabled.len());
    }

    let total = enabled.len();
    let mut outcomes = Vec::with_capacity(total);
    for (position, (index, entry)) in enabled.into_iter().enumerate() {
        let label = entry.label(index);
        info!("--- {}/{}: {} ---", position + 1, total, label);

        let result = sync_one(git, entry, index, mode).await;

        outcomes.push(match result {
            Ok(status) => OutcomeRecord {
                name: label,
                status,
            },
            Err(e) => {
                error!("❌ Subtree {} failed: {}", label, e);
                OutcomeRecord::failed(label, e)
            }
        });
    }

    let summary = RunSummary::from_outcomes(outcomes, start_time.elapsed());
    info!(
        "Processed {}/{} subtree(s) successfully",
        summary.succeeded, summary.total
    );
    summary
}
