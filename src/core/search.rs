//! On-disk search for a pre-located native library

use std::path::{Path, PathBuf};
use tracing::trace;

/// Candidate paths in strict priority order
///
/// 1. `<base>/<arch>/<file>`
/// 2. `<base>/<platform>/<file>`
/// 3. `<base>/<file>` (only when `allow_base_only`)
///
/// A candidate equal to an earlier one is not repeated.
pub fn candidate_paths(
    base: &Path,
    arch: Option<&str>,
    platform: Option<&str>,
    file_name: &str,
    allow_base_only: bool,
) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::with_capacity(3);

    for sub in [arch, platform].into_iter().flatten() {
        let sub = sub.trim();
        if sub.is_empty() {
            continue;
        }
        let path = base.join(sub).join(file_name);
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }

    if allow_base_only {
        candidates.push(base.join(file_name));
    }

    candidates
}

/// First existing candidate file, if any
pub fn find_native_library(
    base: &Path,
    arch: Option<&str>,
    platform: Option<&str>,
    file_name: &str,
    allow_base_only: bool,
) -> Option<PathBuf> {
    candidate_paths(base, arch, platform, file_name, allow_base_only)
        .into_iter()
        .find(|candidate| {
            let exists = candidate.is_file();
            trace!(path = %candidate.display(), exists, "Probed native library candidate");
            exists
        })
}

/// Whether the target normally ships shared objects beside the executable
pub const fn needs_flat_layout() -> bool {
    !cfg!(windows)
}
