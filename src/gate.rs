//! Acquisition cache gate: decides whether an artifact needs fetching at all.

use std::path::Path;
use tracing::debug;

/// Returns `false` when `destination` already exists and holds at least one
/// entry, `true` otherwise.
///
/// This is a presence check only. A populated destination is never compared
/// against the manifest, so changing an artifact's source has no effect until
/// the destination is removed. An existing path that is not a directory counts
/// as populated.
pub fn should_acquire(destination: &Path) -> bool {
    let metadata = match std::fs::metadata(destination) {
        Ok(m) => m,
        Err(_) => return true, // Doesn't exist yet
    };

    if !metadata.is_dir() {
        debug!(
            "{} exists and is not a directory, treating as present",
            destination.display()
        );
        return false;
    }

    match std::fs::read_dir(destination) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => {
            debug!("Cannot list {}: {}", destination.display(), e);
            true
        }
    }
}
