//! Archive extraction with leading path segment stripping.
//!
//! Release archives usually wrap their contents in a versioned top directory
//! (`project-1.2.3/`). Extraction drops a configurable number of leading
//! segments from every member path so the contents land flat under the
//! destination. Zip archives and tar archives (plain, gzip, xz, bzip2, zstd)
//! go through the same rewriting rules.

use crate::error::{ExtractError, IoContext};
use indicatif::ProgressBar;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Compression wrapped around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Bzip2,
    Zstd,
}

/// Supported container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar(Compression),
}

impl ArchiveFormat {
    /// Detects the container format from the archive's file name.
    pub fn detect(archive_path: &Path) -> Result<Self, ExtractError> {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let format = if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::Tar(Compression::Gzip)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveFormat::Tar(Compression::Xz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz")
        {
            ArchiveFormat::Tar(Compression::Bzip2)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            ArchiveFormat::Tar(Compression::Zstd)
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar(Compression::None)
        } else {
            let suffix = archive_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or(name);
            return Err(ExtractError::UnsupportedFormat { suffix });
        };
        Ok(format)
    }
}

/// Counts of what an extraction produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: u64,
    pub directories: u64,
    pub links: u64,
    /// Members dropped by stripping or of an unsupported type.
    pub skipped: u64,
}

/// Drops the first `strip` segments of an archive member path.
///
/// Returns `None` when the member has `strip` segments or fewer, or when
/// nothing is left after stripping. A trailing `/` counts as an empty final
/// segment, so with `strip = 1` the wrapper entry `pkg/` disappears while
/// `pkg/sub/` becomes `sub/`.
pub fn strip_member_path(member: &str, strip: usize) -> Option<String> {
    let parts: Vec<&str> = member.split('/').collect();
    if parts.len() <= strip {
        return None;
    }
    let rest = parts[strip..].join("/");
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Resolves a stripped member path under `dest`.
///
/// `Ok(None)` means the path names the destination itself (`.` or `./`).
fn resolve_under(dest: &Path, relative: &str) -> Result<Option<PathBuf>, ExtractError> {
    let path = Path::new(relative);
    let mut normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(relative.to_string()));
            }
        }
    }
    if !normal {
        return Ok(None);
    }
    let target = dest.join(path);
    ensure_no_symlink_ancestor(dest, &target, relative)?;
    Ok(Some(target))
}

/// Rejects `target` when a directory between `dest` and it is a symlink, so
/// a link written by an earlier member cannot redirect later writes.
fn ensure_no_symlink_ancestor(dest: &Path, target: &Path, member: &str) -> Result<(), ExtractError> {
    let relative = target
        .strip_prefix(dest)
        .map_err(|_| ExtractError::UnsafePath(member.to_string()))?;
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        if let Ok(md) = std::fs::symlink_metadata(&current) {
            if md.file_type().is_symlink() {
                return Err(ExtractError::UnsafePath(format!(
                    "{} (through symlink {})",
                    member,
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

/// Resolves `path` through the filesystem as far as it exists, then lexically.
fn resolve_existing(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if let Ok(real) = std::fs::canonicalize(ancestor) {
            let rest = path.strip_prefix(ancestor).unwrap_or_else(|_| Path::new(""));
            return normalize_lexical(&real.join(rest));
        }
    }
    normalize_lexical(path)
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn create_parent(path: &Path) -> Result<(), ExtractError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).extract_ctx(parent)?;
    }
    Ok(())
}

fn write_member<R: Read>(reader: &mut R, target: &Path, mode: Option<u32>) -> Result<(), ExtractError> {
    create_parent(target)?;

    // A previous symlink at this path must not be written through
    if let Ok(md) = std::fs::symlink_metadata(target) {
        if md.file_type().is_symlink() {
            std::fs::remove_file(target).extract_ctx(target)?;
        }
    }

    let mut out = File::create(target).extract_ctx(target)?;
    io::copy(reader, &mut out).extract_ctx(target)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o7777)).ok();
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), ExtractError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(ExtractError::Cancelled);
    }
    Ok(())
}

fn report(pb: &ProgressBar, index: u64, member: &str) {
    pb.set_position(index);
    if index < 10 || index % 100 == 0 {
        pb.set_message(format!("📂 Extracting: {}", member));
    }
}

fn extract_tar<R: Read>(
    reader: R,
    archive_path: &Path,
    dest: &Path,
    strip: usize,
    pb: &ProgressBar,
    cancel: &AtomicBool,
) -> Result<ExtractStats, ExtractError> {
    let mut archive = tar::Archive::new(reader);
    let mut stats = ExtractStats::default();

    for (index, entry) in archive.entries().extract_ctx(archive_path)?.enumerate() {
        check_cancelled(cancel)?;
        let mut entry = entry.extract_ctx(archive_path)?;
        let member = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        report(pb, index as u64 + 1, &member);

        let Some(relative) = strip_member_path(&member, strip) else {
            stats.skipped += 1;
            continue;
        };
        let Some(target) = resolve_under(dest, &relative)? else {
            stats.skipped += 1;
            continue;
        };

        let entry_type = entry.header().entry_type();
        match entry_type {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target).extract_ctx(&target)?;
                stats.directories += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                let mode = entry.header().mode().ok();
                write_member(&mut entry, &target, mode)?;
                stats.files += 1;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .extract_ctx(archive_path)?
                    .map(|l| l.into_owned())
                    .ok_or_else(|| ExtractError::UnsafePath(format!("{member} (no link target)")))?;
                if create_symlink(dest, &target, &link)? {
                    stats.links += 1;
                } else {
                    stats.skipped += 1;
                }
            }
            tar::EntryType::Link => {
                // Hard link targets are member paths, so they get stripped too
                let link = entry
                    .link_name_bytes()
                    .map(|l| String::from_utf8_lossy(&l).into_owned())
                    .ok_or_else(|| ExtractError::UnsafePath(format!("{member} (no link target)")))?;
                let source = strip_member_path(&link, strip)
                    .map(|rel| resolve_under(dest, &rel))
                    .transpose()?
                    .flatten();
                match source {
                    Some(source) if source.is_file() => {
                        create_parent(&target)?;
                        std::fs::copy(&source, &target).extract_ctx(&target)?;
                        stats.links += 1;
                    }
                    _ => {
                        debug!("Skipping hard link {} -> {}", member, link);
                        stats.skipped += 1;
                    }
                }
            }
            other => {
                debug!("Skipping {:?} member {}", other, member);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(unix)]
fn create_symlink(dest: &Path, target: &Path, link: &Path) -> Result<bool, ExtractError> {
    if link.is_absolute() {
        return Err(ExtractError::UnsafePath(format!(
            "{} -> {}",
            target.display(),
            link.display()
        )));
    }
    let parent = target.parent().unwrap_or(dest);
    let real_dest = std::fs::canonicalize(dest).extract_ctx(dest)?;
    let resolved = resolve_existing(&parent.join(link));
    if !resolved.starts_with(&real_dest) {
        return Err(ExtractError::UnsafePath(format!(
            "{} -> {}",
            target.display(),
            link.display()
        )));
    }

    create_parent(target)?;
    if std::fs::symlink_metadata(target).is_ok() {
        std::fs::remove_file(target).extract_ctx(target)?;
    }
    std::os::unix::fs::symlink(link, target).extract_ctx(target)?;
    Ok(true)
}

#[cfg(not(unix))]
fn create_symlink(_dest: &Path, target: &Path, link: &Path) -> Result<bool, ExtractError> {
    debug!("Skipping symlink {} -> {}", target.display(), link.display());
    Ok(false)
}

fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    strip: usize,
    pb: &ProgressBar,
    cancel: &AtomicBool,
) -> Result<ExtractStats, ExtractError> {
    let file = File::open(archive_path).extract_ctx(archive_path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let mut stats = ExtractStats::default();

    for index in 0..archive.len() {
        check_cancelled(cancel)?;
        let mut member = archive.by_index(index)?;
        let name = member.name().to_string();
        report(pb, index as u64 + 1, &name);

        let Some(relative) = strip_member_path(&name, strip) else {
            stats.skipped += 1;
            continue;
        };
        let Some(target) = resolve_under(dest, &relative)? else {
            stats.skipped += 1;
            continue;
        };

        if member.is_dir() {
            std::fs::create_dir_all(&target).extract_ctx(&target)?;
            stats.directories += 1;
        } else {
            let mode = member.unix_mode();
            write_member(&mut member, &target, mode)?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

/// Extracts `archive_path` into `dest`, dropping `strip` leading segments from
/// every member path.
///
/// The format is chosen from the file name; an unsupported suffix fails before
/// anything is written. Members are processed in archive order and existing
/// files are overwritten.
pub fn extract(
    archive_path: &Path,
    dest: &Path,
    strip: usize,
    pb: &ProgressBar,
) -> Result<ExtractStats, ExtractError> {
    extract_until(archive_path, dest, strip, pb, &AtomicBool::new(false))
}

/// Like [`extract`], but stops with [`ExtractError::Cancelled`] before the
/// next member once `cancel` is set.
pub fn extract_until(
    archive_path: &Path,
    dest: &Path,
    strip: usize,
    pb: &ProgressBar,
    cancel: &AtomicBool,
) -> Result<ExtractStats, ExtractError> {
    let format = ArchiveFormat::detect(archive_path)?;
    std::fs::create_dir_all(dest).extract_ctx(dest)?;

    let open = || -> Result<BufReader<File>, ExtractError> {
        let file = File::open(archive_path).extract_ctx(archive_path)?;
        Ok(BufReader::new(file))
    };

    let stats = match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest, strip, pb, cancel)?,
        ArchiveFormat::Tar(Compression::None) => {
            extract_tar(open()?, archive_path, dest, strip, pb, cancel)?
        }
        ArchiveFormat::Tar(Compression::Gzip) => {
            let decoder = flate2::read::GzDecoder::new(open()?);
            extract_tar(decoder, archive_path, dest, strip, pb, cancel)?
        }
        ArchiveFormat::Tar(Compression::Xz) => {
            let decoder = xz2::read::XzDecoder::new(open()?);
            extract_tar(decoder, archive_path, dest, strip, pb, cancel)?
        }
        ArchiveFormat::Tar(Compression::Bzip2) => {
            let decoder = bzip2::read::BzDecoder::new(open()?);
            extract_tar(decoder, archive_path, dest, strip, pb, cancel)?
        }
        ArchiveFormat::Tar(Compression::Zstd) => {
            let decoder =
                zstd::stream::read::Decoder::new(open()?).extract_ctx(archive_path)?;
            extract_tar(decoder, archive_path, dest, strip, pb, cancel)?
        }
    };

    debug!(
        "Extracted {} ({} files, {} directories, {} links, {} skipped)",
        archive_path.display(),
        stats.files,
        stats.directories,
        stats.links,
        stats.skipped
    );
    Ok(stats)
}

/// Sets the flag when the awaiting future goes away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Runs [`extract`] on the blocking thread pool.
///
/// Dropping the returned future tells the worker to stop before its next
/// member.
pub async fn extract_blocking(
    archive_path: PathBuf,
    dest: PathBuf,
    strip: usize,
    pb: ProgressBar,
) -> Result<ExtractStats, ExtractError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let _guard = CancelOnDrop(Arc::clone(&cancel));

    tokio::task::spawn_blocking(move || extract_until(&archive_path, &dest, strip, &pb, &cancel))
        .await
        .map_err(|e| ExtractError::Worker(e.to_string()))?
}
