//! Packaged native binaries
//!
//! A packaged binary is a zstd-compressed copy of the native library addressed
//! by `<platform>/<file_name>.zst`. The resolver treats each one as an opaque
//! compressed stream that it decompresses into the per-user cache.

use crate::core::fingerprint::sha256_hex_of_reader;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Manifest file optionally found at the root of a package directory
pub const PACKAGE_MANIFEST: &str = "builds.toml";

/// Resource name for a platform and library file name
pub fn resource_name(platform: &str, file_name: &str) -> String {
    format!("{}/{}.zst", platform, file_name)
}

/// Source of packaged native binaries
pub trait ResourceSource: Send + Sync {
    /// Open the compressed stream for a resource, `None` when not packaged
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>>;

    /// Known builds as (sha-256 hex of the decompressed binary, version label)
    fn known_builds(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// No packaged binaries
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

impl ResourceSource for NoResources {
    fn open(&self, _name: &str) -> Option<Box<dyn Read + Send>> {
        None
    }
}

struct EmbeddedEntry {
    bytes: &'static [u8],
    build: Option<(String, String)>,
}

/// Compressed binaries compiled into the application
///
/// ```rust,ignore
/// use sqlite_interop::EmbeddedResources;
///
/// let resources = EmbeddedResources::new().with_labeled(
///     "x64/libsqlite3-interop-64.so.zst",
///     include_bytes!("../native/x64/libsqlite3-interop-64.so.zst"),
///     "3.46.1",
/// );
/// ```
#[derive(Default)]
pub struct EmbeddedResources {
    entries: HashMap<String, EmbeddedEntry>,
}

impl EmbeddedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compressed binary without a version label
    pub fn with(mut self, name: impl Into<String>, bytes: &'static [u8]) -> Self {
        self.entries
            .insert(name.into(), EmbeddedEntry { bytes, build: None });
        self
    }

    /// Register a compressed binary and record its version label
    ///
    /// The fingerprint is taken over the decompressed content, which is what
    /// ends up on disk. A blob that fails to decompress is still registered
    /// but contributes no fingerprint.
    pub fn with_labeled(
        mut self,
        name: impl Into<String>,
        bytes: &'static [u8],
        label: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let build = match zstd::stream::read::Decoder::new(Cursor::new(bytes))
            .and_then(|mut decoder| sha256_hex_of_reader(&mut decoder))
        {
            Ok(hash) => Some((hash, label.into())),
            Err(e) => {
                warn!(resource = %name, error = %e, "Embedded resource does not decompress");
                None
            }
        };
        self.entries.insert(name, EmbeddedEntry { bytes, build });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceSource for EmbeddedResources {
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>> {
        self.entries
            .get(name)
            .map(|entry| Box::new(Cursor::new(entry.bytes)) as Box<dyn Read + Send>)
    }

    fn known_builds(&self) -> Vec<(String, String)> {
        self.entries
            .values()
            .filter_map(|entry| entry.build.clone())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    builds: HashMap<String, String>,
}

/// Compressed binaries shipped in a package directory
///
/// Layout: `<dir>/<platform>/<file_name>.zst`, plus an optional
/// `<dir>/builds.toml` with a `[builds]` table of sha-256 → label.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceSource for DirectoryResources {
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>> {
        let path = self.root.join(name);
        match File::open(&path) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Packaged resource not available");
                None
            }
        }
    }

    fn known_builds(&self) -> Vec<(String, String)> {
        let path = self.root.join(PACKAGE_MANIFEST);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        match toml::from_str::<PackageManifest>(&text) {
            Ok(manifest) => manifest
                .builds
                .into_iter()
                .map(|(hash, label)| (hash.to_ascii_lowercase(), label))
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed package manifest");
                Vec::new()
            }
        }
    }
}
