//! Per-user cache directory and extraction of packaged binaries
//!
//! Extracted binaries live at `<root>/<key>/<file_name>` where `key` is an
//! xxh3 digest of (module location, API version, platform, file name), so
//! different installs and versions never share a file.
//!
//! Extraction writes to a sibling temp file with a process-unique suffix and
//! renames it into place. Losing the rename to another process is success.

use crate::core::config::{ConfigSource, Setting};
use crate::core::resources::ResourceSource;
use crate::error::{InteropError, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

/// Name of the directory created under the cache root
pub const CACHE_DIR_NAME: &str = "sqlite-interop";

/// Environment lookups used to find the cache root
pub trait EnvLookup {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

impl<F> EnvLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn var(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Cache root candidates in priority order
pub fn cache_root_candidates(config: &dyn ConfigSource, env: &dyn EnvLookup) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(dir) = config.get(Setting::CacheDirectory) {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(dir) = env.var("TEMP") {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(dir) = env.var("TMP") {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(dir) = env.var("LOCALAPPDATA") {
        candidates.push(PathBuf::from(dir).join("Temp"));
    }
    if let Some(dir) = env.var("USERPROFILE") {
        candidates.push(
            PathBuf::from(dir)
                .join("AppData")
                .join("Local")
                .join("Temp"),
        );
    }

    candidates
}

/// Verify a directory accepts writes by creating and removing a probe file
pub fn is_writable_directory(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = tempfile::Builder::new()
        .prefix(".write-probe-")
        .tempfile_in(dir)
        .and_then(|mut file| {
            file.write_all(b"probe")?;
            file.flush()?;
            file.close()
        });

    match probe {
        Ok(()) => true,
        Err(e) => {
            trace!(dir = %dir.display(), error = %e, "Cache root not writable");
            false
        }
    }
}

/// First candidate cache root that passes a real write test
pub fn find_writable_cache_root(
    config: &dyn ConfigSource,
    env: &dyn EnvLookup,
) -> Option<PathBuf> {
    cache_root_candidates(config, env)
        .into_iter()
        .find(|dir| is_writable_directory(dir))
}

/// Cache key for an install / version / platform / file combination
pub fn cache_key(module_location: &str, api_version: &str, platform: &str, file_name: &str) -> String {
    let mut hasher = Xxh3::new();
    for part in [module_location, api_version, platform, file_name] {
        hasher.update(part.as_bytes());
        // Separator keeps ("ab", "c") distinct from ("a", "bc")
        hasher.update(&[0]);
    }
    format!("{:016x}", hasher.digest())
}

/// Full path of a cached binary
pub fn cache_path(root: &Path, key: &str, file_name: &str) -> PathBuf {
    root.join(CACHE_DIR_NAME).join(key).join(file_name)
}

/// Decompress a packaged resource to `target` unless it already exists
///
/// Returns `Ok(true)` when this call wrote the file and `Ok(false)` when an
/// existing file (pre-existing or written by a racing extractor) was reused.
pub fn extract_to_cache(
    resources: &dyn ResourceSource,
    resource_name: &str,
    target: &Path,
) -> Result<bool> {
    if target.is_file() {
        trace!(path = %target.display(), "Cached binary already present");
        return Ok(false);
    }

    let mut compressed = resources
        .open(resource_name)
        .ok_or_else(|| InteropError::ResourceNotFound(resource_name.to_string()))?;

    let dir = target
        .parent()
        .ok_or_else(|| InteropError::Io(io::Error::new(io::ErrorKind::InvalidInput, "target has no parent")))?;
    std::fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("native");
    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}.", file_name))
        .suffix(&format!(".{}.tmp", std::process::id()))
        .tempfile_in(dir)?;

    zstd::stream::copy_decode(&mut compressed, temp.as_file_mut()).map_err(|source| {
        InteropError::Decompression {
            name: resource_name.to_string(),
            source,
        }
    })?;
    temp.as_file().sync_all()?;

    match temp.persist_noclobber(target) {
        Ok(_) => {
            debug!(resource = resource_name, path = %target.display(), "Extracted packaged binary");
            Ok(true)
        }
        Err(e) if target.is_file() => {
            debug!(path = %target.display(), error = %e.error, "Another extractor finished first");
            Ok(false)
        }
        Err(e) => Err(InteropError::Io(e.error)),
    }
}
