//! Per-artifact staging directories and committing staged files.

use crate::error::{ArtifactError, IoContext};
use std::io;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Private scratch directory for one in-flight artifact.
///
/// Created next to the artifact's destination so staged files can be renamed
/// into place. The directory is removed by [`StagingArea::close`], or on drop
/// when the owning future is cancelled or returns early.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    pub fn create(name: &str, destination: &Path) -> Result<Self, ArtifactError> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).artifact_ctx(parent)?;

        let safe_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let dir = tempfile::Builder::new()
            .prefix(&format!(".{}_download", safe_name))
            .tempdir_in(parent)
            .artifact_ctx(parent)?;

        debug!("Staging {} in {}", name, dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the staging directory, logging instead of failing.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove staging directory {}: {}", path.display(), e);
        }
    }
}

#[cfg(unix)]
const EXDEV: i32 = 18;

#[cfg(windows)]
const EXDEV: i32 = 17;

/// Moves a staged file to its final location, copying when the two paths are
/// on different filesystems.
pub fn commit_file(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).artifact_ctx(parent)?;
    }
    if let Err(e) = std::fs::rename(from, to) {
        if e.raw_os_error() == Some(EXDEV) {
            std::fs::copy(from, to).artifact_ctx(to)?;
            std::fs::remove_file(from).artifact_ctx(from)?;
        } else {
            return Err(ArtifactError::Io {
                path: to.to_path_buf(),
                source: e,
            });
        }
    }
    Ok(())
}

/// Moves every regular file directly inside `from` into `to`.
pub fn commit_dir_files(from: &Path, to: &Path) -> Result<usize, ArtifactError> {
    std::fs::create_dir_all(to).artifact_ctx(to)?;
    let mut moved = 0;
    for entry in std::fs::read_dir(from).artifact_ctx(from)? {
        let entry = entry.artifact_ctx(from)?;
        if entry.file_type().artifact_ctx(entry.path())?.is_file() {
            commit_file(&entry.path(), &to.join(entry.file_name()))?;
            moved += 1;
        }
    }
    Ok(moved)
}

/// Moves a staged directory tree into place as `to`.
///
/// `to` must be missing or an empty directory. Nothing appears at `to` until
/// the tree is complete, unless the move has to fall back to copying across
/// filesystems.
pub fn commit_dir(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    match std::fs::remove_dir(to) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ArtifactError::Io {
                path: to.to_path_buf(),
                source: e,
            })
        }
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).artifact_ctx(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            debug!("{} is on another filesystem, copying", to.display());
            move_tree(from, to)?;
            std::fs::remove_dir_all(from).artifact_ctx(from)
        }
        Err(e) => Err(ArtifactError::Io {
            path: to.to_path_buf(),
            source: e,
        }),
    }
}

fn move_tree(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    std::fs::create_dir_all(to).artifact_ctx(to)?;
    for entry in std::fs::read_dir(from).artifact_ctx(from)? {
        let entry = entry.artifact_ctx(from)?;
        let file_type = entry.file_type().artifact_ctx(entry.path())?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            move_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            commit_file(&entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    let link = std::fs::read_link(from).artifact_ctx(from)?;
    std::os::unix::fs::symlink(&link, to).artifact_ctx(to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    std::fs::copy(from, to).artifact_ctx(to).map(|_| ())
}

/// Restores `destination` to the state the cache gate saw: absent, or an
/// empty directory when it already existed.
pub fn rollback_destination(destination: &Path, existed: bool) -> io::Result<()> {
    match std::fs::remove_dir_all(destination) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if existed {
        std::fs::create_dir_all(destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_staging_lives_next_to_destination() {
        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("external/glfw");

        let staging = StagingArea::create("glfw", &destination).unwrap();
        let staged = staging.path().to_path_buf();

        assert!(staged.is_dir());
        assert_eq!(staged.parent(), Some(temp_dir.path().join("external").as_path()));
        assert!(staged
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".glfw_download"));

        staging.close();
        assert!(!staged.exists());
        assert!(!destination.exists());
    }

    #[test]
    fn test_staging_removed_on_drop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("assets/logo");

        let staged = {
            let staging = StagingArea::create("my logo", &destination).unwrap();
            std::fs::write(staging.path().join("partial.bin"), b"half").unwrap();
            staging.path().to_path_buf()
        };

        assert!(!staged.exists());
        assert!(entries(&temp_dir.path().join("assets")).is_empty());
    }

    #[test]
    fn test_commit_dir_files_moves_files_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from = temp_dir.path().join("stage");
        std::fs::create_dir_all(from.join("nested")).unwrap();
        std::fs::write(from.join("a.bin"), b"a").unwrap();
        std::fs::write(from.join("b.gltf"), b"b").unwrap();

        let to = temp_dir.path().join("dest");
        let moved = commit_dir_files(&from, &to).unwrap();

        assert_eq!(moved, 2);
        assert_eq!(entries(&to), vec!["a.bin", "b.gltf"]);
        assert_eq!(entries(&from), vec!["nested"]);
    }

    #[test]
    fn test_commit_dir_replaces_empty_destination() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from = temp_dir.path().join("stage/unpacked");
        std::fs::create_dir_all(from.join("include/GLFW")).unwrap();
        std::fs::write(from.join("CMakeLists.txt"), b"project(glfw)").unwrap();
        std::fs::write(from.join("include/GLFW/glfw3.h"), b"#pragma once").unwrap();

        let to = temp_dir.path().join("external/glfw");
        std::fs::create_dir_all(&to).unwrap();
        commit_dir(&from, &to).unwrap();

        assert_eq!(entries(&to), vec!["CMakeLists.txt", "include"]);
        assert!(to.join("include/GLFW/glfw3.h").is_file());
        assert!(!from.exists());
    }

    #[test]
    fn test_commit_dir_refuses_populated_destination() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from = temp_dir.path().join("stage");
        std::fs::create_dir_all(&from).unwrap();
        std::fs::write(from.join("new.txt"), b"new").unwrap();

        let to = temp_dir.path().join("dest");
        std::fs::create_dir_all(&to).unwrap();
        std::fs::write(to.join("mine.txt"), b"local").unwrap();

        assert!(commit_dir(&from, &to).is_err());
        assert_eq!(entries(&to), vec!["mine.txt"]);
        assert_eq!(entries(&from), vec!["new.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_move_tree_keeps_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from = temp_dir.path().join("stage");
        std::fs::create_dir_all(from.join("lib")).unwrap();
        std::fs::write(from.join("lib/libfoo.so.1"), b"elf").unwrap();
        std::os::unix::fs::symlink("libfoo.so.1", from.join("lib/libfoo.so")).unwrap();

        let to = temp_dir.path().join("dest");
        move_tree(&from, &to).unwrap();

        let link = to.join("lib/libfoo.so");
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("libfoo.so.1"));
        assert_eq!(std::fs::read(&link).unwrap(), b"elf");
    }

    #[test]
    fn test_rollback_restores_empty_destination() {
        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("dest");
        std::fs::create_dir_all(destination.join("partial/dir")).unwrap();

        rollback_destination(&destination, true).unwrap();
        assert!(destination.is_dir());
        assert!(entries(&destination).is_empty());

        rollback_destination(&destination, false).unwrap();
        assert!(!destination.exists());

        // Nothing to undo
        rollback_destination(&destination, false).unwrap();
    }
}
