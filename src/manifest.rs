//! Manifest loading.
//!
//! Two TOML layouts are understood. Asset listings hold `[[assets]]` tables
//! that default to single `.glb` files grouped by category; dependency
//! listings hold `[[dependencies]]` tables that default to release archives.
//! Both accept the same keys, so either flavor can describe any artifact kind.
//!
//! ```toml
//! [[assets]]
//! name = "box"
//! url = "https://github.com/KhronosGroup/glTF-Sample-Assets/tree/main/Models/Box/glTF"
//! type = "gltf"
//! category = "basic"
//!
//! [[dependencies]]
//! name = "glfw"
//! url = "https://github.com/glfw/glfw/releases/download/3.4/glfw-3.4.zip"
//! version = "3.4"
//! strip_components = 1
//! ```

use crate::error::{ManifestError, ValidationError};
use crate::types::{ArtifactKind, ArtifactSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which manifest layout to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFlavor {
    /// `asset_listing.toml` with `[[assets]]` entries.
    Assets,
    /// `external_deps.toml` with `[[dependencies]]` entries.
    Dependencies,
}

impl ManifestFlavor {
    /// Manifest file name relative to the workspace root.
    pub fn default_manifest(&self) -> &'static str {
        match self {
            ManifestFlavor::Assets => "asset_listing.toml",
            ManifestFlavor::Dependencies => "external_deps.toml",
        }
    }

    /// Directory artifacts are placed under, relative to the workspace root.
    pub fn default_output(&self) -> &'static str {
        match self {
            ManifestFlavor::Assets => "sample_assets",
            ManifestFlavor::Dependencies => "external",
        }
    }

    /// Singular noun used in log output.
    pub fn noun(&self) -> &'static str {
        match self {
            ManifestFlavor::Assets => "asset",
            ManifestFlavor::Dependencies => "dependency",
        }
    }

    fn default_kind(&self) -> &'static str {
        match self {
            ManifestFlavor::Assets => "glb",
            ManifestFlavor::Dependencies => "archive",
        }
    }

    fn default_name(&self, index: usize) -> String {
        match self {
            ManifestFlavor::Assets => format!("asset_{}", index),
            ManifestFlavor::Dependencies => format!("dep_{}", index),
        }
    }
}

/// One manifest entry as it will be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Valid(ArtifactSpec),
    /// An entry that cannot be turned into an [`ArtifactSpec`]; it is reported
    /// as a failure without any network activity.
    Invalid { name: String, error: ValidationError },
}

impl ManifestEntry {
    pub fn name(&self) -> &str {
        match self {
            ManifestEntry::Valid(spec) => &spec.name,
            ManifestEntry::Invalid { name, .. } => name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            ManifestEntry::Valid(spec) => spec.enabled,
            ManifestEntry::Invalid { .. } => true,
        }
    }
}

/// The parsed list of artifacts driving one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_specs(specs: impl IntoIterator<Item = ArtifactSpec>) -> Self {
        Self {
            entries: specs.into_iter().map(ManifestEntry::Valid).collect(),
        }
    }

    /// Entries that take part in a run, in manifest order.
    pub fn enabled(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.is_enabled())
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    assets: Vec<RawEntry>,
    #[serde(default)]
    dependencies: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    name: Option<String>,
    #[serde(alias = "url")]
    source: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
    category: Option<String>,
    destination: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    strip_components: usize,
    version: Option<String>,
    description: Option<String>,
    file_name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl RawEntry {
    fn into_entry(self, index: usize, flavor: ManifestFlavor, output_dir: &Path) -> ManifestEntry {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| flavor.default_name(index));
        let kind_name = self
            .kind
            .unwrap_or_else(|| flavor.default_kind().to_string());

        let kind = match kind_name.parse::<ArtifactKind>() {
            Ok(kind) => kind,
            Err(kind) => {
                let error = ValidationError::UnknownKind {
                    name: name.clone(),
                    kind,
                };
                return ManifestEntry::Invalid { name, error };
            }
        };

        let destination = self.destination.unwrap_or_else(|| match flavor {
            ManifestFlavor::Assets => output_dir
                .join(self.category.as_deref().unwrap_or("uncategorized"))
                .join(&name),
            ManifestFlavor::Dependencies => output_dir.join(&name),
        });

        let file_name = self.file_name.or_else(|| {
            (kind_name.eq_ignore_ascii_case("glb")).then(|| format!("{}.glb", name))
        });

        ManifestEntry::Valid(ArtifactSpec {
            name,
            source: self.source,
            kind,
            destination,
            strip_components: self.strip_components,
            enabled: self.enabled,
            file_name,
            version: self.version,
            description: self.description,
        })
    }
}

/// Parses manifest text. `origin` is only used in error messages.
pub fn parse_manifest(
    text: &str,
    flavor: ManifestFlavor,
    output_dir: &Path,
    origin: &Path,
) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = toml::from_str(text).map_err(|source| ManifestError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;

    let raw_entries = match flavor {
        ManifestFlavor::Assets => raw.assets,
        ManifestFlavor::Dependencies => raw.dependencies,
    };

    let entries = raw_entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| entry.into_entry(i + 1, flavor, output_dir))
        .collect::<Vec<_>>();

    debug!(
        "Parsed {} {} entries from {}",
        entries.len(),
        flavor.noun(),
        origin.display()
    );
    Ok(Manifest { entries })
}

/// Reads and parses the manifest at `path`.
///
/// A missing or unparsable manifest is fatal for the invocation.
pub fn load_manifest(
    path: &Path,
    flavor: ManifestFlavor,
    output_dir: &Path,
) -> Result<Manifest, ManifestError> {
    if !path.exists() {
        return Err(ManifestError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&text, flavor, output_dir, path)
}
