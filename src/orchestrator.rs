//! Main orchestration logic for provisioning a manifest.

use crate::download::{url_file_name, Fetcher};
use crate::error::{ArtifactError, FetchError, IoContext};
use crate::extract::{extract_blocking, ArchiveFormat};
use crate::gate::should_acquire;
use crate::manifest::{Manifest, ManifestEntry};
use crate::progress::Progress;
use crate::staging::{
    commit_dir, commit_dir_files, commit_file, rollback_destination, StagingArea,
};
use crate::types::{ArtifactKind, ArtifactSpec, FetchConfig, OutcomeRecord, OutcomeStatus, RunSummary};
use futures_util::future::join_all;
use std::path::Path;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Fetches, caches and extracts every artifact of a manifest.
///
/// Artifacts are independent: a failure is recorded in the [`RunSummary`] and
/// the run moves on to the next entry. Destinations that are already populated
/// are left alone, so running the same manifest twice fetches nothing the
/// second time.
pub struct Pipeline {
    config: FetchConfig,
    fetcher: Fetcher,
    progress: Progress,
}

impl Pipeline {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Self::with_progress(config, Progress::new(config.show_progress))
    }

    pub fn with_progress(config: &FetchConfig, progress: Progress) -> Result<Self, FetchError> {
        let fetcher = Fetcher::new(config, progress.clone())?;
        Ok(Self {
            config: config.clone(),
            fetcher,
            progress,
        })
    }

    /// Processes every enabled entry of `manifest`.
    ///
    /// At most `max_concurrent` artifacts are in flight at once. Outcomes are
    /// reported in manifest order regardless of completion order. Dropping the
    /// returned future cancels outstanding transfers and removes their staging
    /// directories.
    pub async fn run(&self, manifest: &Manifest) -> RunSummary {
        let start_time = Instant::now();
        let entries: Vec<&ManifestEntry> = manifest.enabled().collect();
        let total = entries.len();

        let skipped_disabled = manifest.entries.len() - total;
        if skipped_disabled > 0 {
            info!("Ignoring {} disabled entries", skipped_disabled);
        }
        info!("📦 Processing {} artifact(s)", total);

        // Limit how many artifacts are in flight
        let semaphore = Semaphore::new(self.config.max_concurrent.max(1));

        let tasks = entries.into_iter().enumerate().map(|(index, entry)| {
            let semaphore = &semaphore;
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return OutcomeRecord::failed(entry.name(), e),
                };
                info!("--- {}/{}: {} ---", index + 1, total, entry.name());
                self.process_entry(entry).await
            }
        });
        let outcomes = join_all(tasks).await;

        let summary = RunSummary::from_outcomes(outcomes, start_time.elapsed());
        if summary.is_success() {
            info!(
                "✅ {}/{} artifact(s) ready in {:.2?}",
                summary.succeeded, summary.total, summary.elapsed
            );
        } else {
            warn!(
                "{}/{} artifact(s) ready, failed: {}",
                summary.succeeded,
                summary.total,
                summary.failed.join(", ")
            );
        }
        summary
    }

    async fn process_entry(&self, entry: &ManifestEntry) -> OutcomeRecord {
        match entry {
            ManifestEntry::Invalid { name, error } => {
                error!("❌ {}", error);
                OutcomeRecord::failed(name.as_str(), error)
            }
            ManifestEntry::Valid(spec) => match self.acquire(spec).await {
                Ok(status) => OutcomeRecord {
                    name: spec.name.clone(),
                    status,
                },
                Err(e) => {
                    error!("❌ Failed to acquire {}: {}", spec.name, e);
                    OutcomeRecord::failed(spec.name.as_str(), e)
                }
            },
        }
    }

    /// Acquires one artifact: cache gate, staged fetch, commit.
    ///
    /// On failure the destination is returned to the state the cache gate saw
    /// and the staging directory is removed.
    pub async fn acquire(&self, spec: &ArtifactSpec) -> Result<OutcomeStatus, ArtifactError> {
        let source = spec.validated_source()?;
        let destination = self.config.workspace_root.join(&spec.destination);

        if !should_acquire(&destination) {
            info!(
                "✓ {} already exists at {}, skipping",
                spec.name,
                destination.display()
            );
            return Ok(OutcomeStatus::Skipped);
        }

        match &spec.version {
            Some(version) => info!("Acquiring {} {} ({})", spec.name, version, spec.kind),
            None => info!("Acquiring {} ({})", spec.name, spec.kind),
        }

        let existed = destination.exists();
        let staging = StagingArea::create(&spec.name, &destination)?;

        let result = self
            .stage_and_commit(spec, source, staging.path(), &destination)
            .await;

        if result.is_err() {
            if let Err(e) = rollback_destination(&destination, existed) {
                warn!(
                    "Failed to roll back {} after error: {}",
                    destination.display(),
                    e
                );
            }
        }
        staging.close();

        let bytes = result?;
        info!("✅ {} ready at {}", spec.name, destination.display());
        Ok(OutcomeStatus::Acquired { bytes })
    }

    async fn stage_and_commit(
        &self,
        spec: &ArtifactSpec,
        source: &str,
        staging: &Path,
        destination: &Path,
    ) -> Result<u64, ArtifactError> {
        match spec.kind {
            ArtifactKind::SingleFile => {
                let file_name = spec
                    .file_name
                    .clone()
                    .or_else(|| url_file_name(source))
                    .unwrap_or_else(|| spec.name.clone());
                let staged = staging.join(&file_name);

                let bytes = self.fetcher.fetch_file(source, &staged).await?;
                commit_file(&staged, &destination.join(&file_name))?;
                Ok(bytes)
            }
            ArtifactKind::Archive => {
                let archive_name =
                    url_file_name(source).unwrap_or_else(|| format!("{}.zip", spec.name));
                let archive_path = staging.join(&archive_name);

                // Refuse unknown containers before spending bandwidth on them
                ArchiveFormat::detect(&archive_path)?;

                let bytes = self.fetcher.fetch_file(source, &archive_path).await?;

                // Unpack beside the archive so an interrupted extraction never
                // leaves a populated destination behind
                let unpacked = staging.join("unpacked");
                info!("📂 Extracting {} to {}", archive_name, destination.display());
                let pb = self.progress.entries(format!("📂 Extracting {}", spec.name));
                let result = extract_blocking(
                    archive_path,
                    unpacked.clone(),
                    spec.strip_components,
                    pb.clone(),
                )
                .await;
                pb.finish_and_clear();

                let stats = result?;
                commit_dir(&unpacked, destination)?;
                info!(
                    "Extracted {} files, {} directories into {}",
                    stats.files,
                    stats.directories,
                    destination.display()
                );
                Ok(bytes)
            }
            ArtifactKind::DirectoryListing => {
                let listing_dir = staging.join("listing");
                tokio::fs::create_dir_all(&listing_dir)
                    .await
                    .artifact_ctx(&listing_dir)?;

                let bytes = self.fetcher.fetch_listing(source, &listing_dir).await?;
                let moved = commit_dir_files(&listing_dir, destination)?;
                info!("Copied {} file(s) into {}", moved, destination.display());
                Ok(bytes)
            }
        }
    }
}

/// Runs `manifest` with a freshly built [`Pipeline`].
///
/// # Example
///
/// ```no_run
/// use artifetch::{provision, ArtifactKind, ArtifactSpec, FetchConfig, Manifest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manifest = Manifest::from_specs([ArtifactSpec::new(
///     "glfw",
///     "https://github.com/glfw/glfw/releases/download/3.4/glfw-3.4.zip",
///     ArtifactKind::Archive,
///     "external/glfw",
/// )
/// .with_strip_components(1)]);
///
/// let summary = provision(&FetchConfig::default(), &manifest).await?;
/// std::process::exit(summary.exit_code());
/// # }
/// ```
pub async fn provision(config: &FetchConfig, manifest: &Manifest) -> Result<RunSummary, FetchError> {
    let pipeline = Pipeline::new(config)?;
    Ok(pipeline.run(manifest).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use std::io::Write;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(root: &Path, server: Option<&MockServer>) -> Pipeline {
        let mut config = FetchConfig {
            workspace_root: root.to_path_buf(),
            show_progress: false,
            ..FetchConfig::default()
        };
        if let Some(server) = server {
            config.listing_api_base = server.uri();
            config.raw_content_base = format!("{}/raw", server.uri());
        }
        Pipeline::with_progress(&config, Progress::hidden()).unwrap()
    }

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn tar_gz_of_many_files(count: usize) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for i in 0..count {
            let mut header = tar::Header::new_gnu();
            header.set_size(1);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("pkg/f{}.txt", i), &b"x"[..])
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// True once some staging directory under `parent` holds unpacked members.
    fn extraction_started(parent: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(parent) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry.file_name().to_string_lossy().starts_with(".pkg_download")
                && std::fs::read_dir(entry.path().join("unpacked"))
                    .map(|mut members| members.next().is_some())
                    .unwrap_or(false)
        })
    }

    async fn serve(server: &MockServer, route: &str, body: Vec<u8>, hits: u64) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(hits)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_single_file_is_acquired() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/logo.glb", vec![7u8; 10240], 1).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "logo",
            format!("{}/logo.glb", mock_server.uri()),
            ArtifactKind::SingleFile,
            "assets/logo",
        )]);

        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(
            summary.outcome("logo").map(|o| &o.status),
            Some(&OutcomeStatus::Acquired { bytes: 10240 })
        );

        let committed = temp_dir.path().join("assets/logo/logo.glb");
        assert_eq!(std::fs::metadata(&committed).unwrap().len(), 10240);
        assert_eq!(names_in(&temp_dir.path().join("assets")), vec!["logo"]);
    }

    #[tokio::test]
    async fn test_second_run_fetches_nothing() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/Duck.glb", b"glTF".to_vec(), 1).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "duck",
            format!("{}/Duck.glb", mock_server.uri()),
            ArtifactKind::SingleFile,
            "sample_assets/basic/duck",
        )
        .with_file_name("duck.glb")]);
        let pipeline = pipeline(temp_dir.path(), None);

        let first = pipeline.run(&manifest).await;
        let second = pipeline.run(&manifest).await;

        assert_eq!(
            first.outcomes[0].status,
            OutcomeStatus::Acquired { bytes: 4 }
        );
        assert_eq!(second.outcomes[0].status, OutcomeStatus::Skipped);
        assert_eq!(second.exit_code(), 0);
        assert!(temp_dir
            .path()
            .join("sample_assets/basic/duck/duck.glb")
            .is_file());
    }

    #[tokio::test]
    async fn test_populated_destination_is_not_fetched() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/glfw-3.4.zip", Vec::new(), 0).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("external/glfw");
        std::fs::create_dir_all(&destination).unwrap();
        std::fs::write(destination.join("CMakeLists.txt"), b"local edits").unwrap();

        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "glfw",
            format!("{}/glfw-3.4.zip", mock_server.uri()),
            ArtifactKind::Archive,
            "external/glfw",
        )]);
        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.outcomes[0].status, OutcomeStatus::Skipped);
        assert_eq!(
            std::fs::read(destination.join("CMakeLists.txt")).unwrap(),
            b"local edits"
        );
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_reported_in_order() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/a.bin", b"a".to_vec(), 1).await;
        serve(&mock_server, "/c.bin", b"c".to_vec(), 1).await;
        // b.bin and d.bin are not mounted and answer 404

        let temp_dir = tempfile::tempdir().unwrap();
        let specs = ["a", "b", "c", "d"].map(|name| {
            ArtifactSpec::new(
                name,
                format!("{}/{}.bin", mock_server.uri(), name),
                ArtifactKind::SingleFile,
                format!("assets/{}", name),
            )
        });

        let config = FetchConfig {
            workspace_root: temp_dir.path().to_path_buf(),
            max_concurrent: 3,
            show_progress: false,
            ..FetchConfig::default()
        };
        let pipeline = Pipeline::with_progress(&config, Progress::hidden()).unwrap();
        let summary = pipeline.run(&Manifest::from_specs(specs)).await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, vec!["b", "d"]);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(
            summary.outcomes.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
        assert!(summary
            .outcome("b")
            .and_then(|o| o.error_detail())
            .unwrap()
            .contains("404"));

        // No staging directories and no destinations for the failures
        assert_eq!(names_in(&temp_dir.path().join("assets")), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_network() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut spec = ArtifactSpec::new("nourl", "", ArtifactKind::SingleFile, "assets/nourl");
        spec.source = None;

        let summary = pipeline(temp_dir.path(), None)
            .run(&Manifest::from_specs([spec]))
            .await;

        assert_eq!(summary.failed, vec!["nourl"]);
        assert_eq!(
            summary.outcomes[0].error_detail(),
            Some("No URL specified for 'nourl'")
        );
        assert!(!temp_dir.path().join("assets").exists());
    }

    #[tokio::test]
    async fn test_invalid_and_disabled_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut disabled = ArtifactSpec::new(
            "off",
            "https://example.invalid/off.zip",
            ArtifactKind::Archive,
            "external/off",
        );
        disabled.enabled = false;

        let manifest = Manifest {
            entries: vec![
                ManifestEntry::Invalid {
                    name: "mesh".to_string(),
                    error: ValidationError::UnknownKind {
                        name: "mesh".to_string(),
                        kind: "obj".to_string(),
                    },
                },
                ManifestEntry::Valid(disabled),
            ],
        };

        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed, vec!["mesh"]);
        assert_eq!(
            summary.outcomes[0].error_detail(),
            Some("Unknown artifact type 'obj' for 'mesh'")
        );
    }

    #[tokio::test]
    async fn test_archive_is_extracted_with_strip() {
        let mock_server = MockServer::start().await;
        let body = zip_bytes(&[
            ("glfw-3.4/CMakeLists.txt", b"project(glfw)"),
            ("glfw-3.4/include/GLFW/glfw3.h", b"#pragma once"),
        ]);
        let len = body.len() as u64;
        serve(&mock_server, "/releases/glfw-3.4.zip", body, 1).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "glfw",
            format!("{}/releases/glfw-3.4.zip", mock_server.uri()),
            ArtifactKind::Archive,
            "external/glfw",
        )
        .with_strip_components(1)]);

        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.outcomes[0].status, OutcomeStatus::Acquired { bytes: len });
        let destination = temp_dir.path().join("external/glfw");
        assert_eq!(
            std::fs::read(destination.join("CMakeLists.txt")).unwrap(),
            b"project(glfw)"
        );
        assert!(destination.join("include/GLFW/glfw3.h").is_file());
        assert!(!destination.join("glfw-3.4").exists());
        assert_eq!(names_in(&temp_dir.path().join("external")), vec!["glfw"]);
    }

    #[tokio::test]
    async fn test_unsupported_archive_is_rejected_before_download() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/pkg.rar", b"Rar!".to_vec(), 0).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "pkg",
            format!("{}/pkg.rar", mock_server.uri()),
            ArtifactKind::Archive,
            "external/pkg",
        )]);

        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.failed, vec!["pkg"]);
        assert!(summary.outcomes[0]
            .error_detail()
            .unwrap()
            .contains("Unsupported archive format"));
        assert!(!temp_dir.path().join("external/pkg").exists());
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_destination_empty() {
        let mock_server = MockServer::start().await;
        let body = zip_bytes(&[
            ("pkg/ok.txt", b"fine"),
            ("pkg/../../escape.txt", b"nope"),
        ]);
        serve(&mock_server, "/pkg.zip", body, 1).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("external/pkg");
        std::fs::create_dir_all(&destination).unwrap();

        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "pkg",
            format!("{}/pkg.zip", mock_server.uri()),
            ArtifactKind::Archive,
            "external/pkg",
        )
        .with_strip_components(1)]);

        let summary = pipeline(temp_dir.path(), None).run(&manifest).await;

        assert_eq!(summary.failed, vec!["pkg"]);
        assert!(destination.is_dir());
        assert!(names_in(&destination).is_empty());
        assert!(!temp_dir.path().join("escape.txt").exists());
        assert_eq!(names_in(&temp_dir.path().join("external")), vec!["pkg"]);
    }

    #[tokio::test]
    async fn test_interrupted_extraction_leaves_no_destination() {
        let mock_server = MockServer::start().await;
        serve(&mock_server, "/pkg.tar.gz", tar_gz_of_many_files(20_000), 2).await;

        let temp_dir = tempfile::tempdir().unwrap();
        let external = temp_dir.path().join("external");
        let destination = external.join("pkg");
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "pkg",
            format!("{}/pkg.tar.gz", mock_server.uri()),
            ArtifactKind::Archive,
            "external/pkg",
        )
        .with_strip_components(1)]);
        let pipeline = pipeline(temp_dir.path(), None);

        let started = async {
            while !extraction_started(&external) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::select! {
            _ = pipeline.run(&manifest) => panic!("run completed before it could be interrupted"),
            _ = started => {}
        }

        // Half-extracted content stays out of the destination
        assert!(!destination.exists());
        assert!(should_acquire(&destination));

        let summary = pipeline.run(&manifest).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(std::fs::read_dir(&destination).unwrap().count(), 20_000);
    }

    #[tokio::test]
    async fn test_directory_listing_is_committed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/KhronosGroup/glTF-Sample-Assets/contents/Models/Box/glTF"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "name": "Box.gltf", "type": "file" },
                { "name": "Box0.bin", "type": "file" },
                { "name": "screenshot", "type": "dir" }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;
        serve(
            &mock_server,
            "/raw/KhronosGroup/glTF-Sample-Assets/main/Models/Box/glTF/Box.gltf",
            b"{}".to_vec(),
            1,
        )
        .await;
        serve(
            &mock_server,
            "/raw/KhronosGroup/glTF-Sample-Assets/main/Models/Box/glTF/Box0.bin",
            vec![0u8; 648],
            1,
        )
        .await;

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "box",
            "https://github.com/KhronosGroup/glTF-Sample-Assets/tree/main/Models/Box/glTF",
            ArtifactKind::DirectoryListing,
            "sample_assets/basic/box",
        )]);

        let summary = pipeline(temp_dir.path(), Some(&mock_server))
            .run(&manifest)
            .await;

        assert_eq!(summary.outcomes[0].status, OutcomeStatus::Acquired { bytes: 650 });
        assert_eq!(
            names_in(&temp_dir.path().join("sample_assets/basic/box")),
            vec!["Box.gltf", "Box0.bin"]
        );
        assert_eq!(
            names_in(&temp_dir.path().join("sample_assets/basic")),
            vec!["box"]
        );
    }

    #[tokio::test]
    async fn test_partial_listing_commits_nothing() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/contents/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "name": "a.gltf", "type": "file" },
                { "name": "a.bin", "type": "file" }
            ])))
            .mount(&mock_server)
            .await;
        serve(&mock_server, "/raw/o/r/main/models/a.gltf", b"{}".to_vec(), 1).await;
        // a.bin answers 404

        let temp_dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_specs([ArtifactSpec::new(
            "a",
            "https://github.com/o/r/tree/main/models",
            ArtifactKind::DirectoryListing,
            "sample_assets/a",
        )]);

        let summary = pipeline(temp_dir.path(), Some(&mock_server))
            .run(&manifest)
            .await;

        assert_eq!(summary.failed, vec!["a"]);
        assert!(summary.outcomes[0].error_detail().unwrap().contains("a.bin"));
        assert!(!temp_dir.path().join("sample_assets/a").exists());
        assert!(names_in(&temp_dir.path().join("sample_assets")).is_empty());
    }
}
