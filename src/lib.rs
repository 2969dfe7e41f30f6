//! # sqlite-interop - Native SQLite Resolution and Handle Lifecycle
//!
//! `sqlite-interop` finds, extracts and loads the native SQLite library that
//! matches the running process, once, and wraps every raw pointer the library
//! hands out in a handle that releases it at most once.
//!
//! - **Resolution**: architecture-qualified file names, `<arch>`/`<platform>`
//!   directory search, extraction of packaged zstd binaries into a per-user
//!   cache, graceful fallback to the OS loader
//! - **Handles**: connection, statement, backup and blob handles with atomic
//!   swap-to-null release and parent generation counters
//! - **Configuration**: `SQLITE_INTEROP_*` environment variables and an
//!   optional `sqlite-interop.toml` beside the executable
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlite_interop::{Interop, NativeHandle, Result};
//!
//! # fn main() -> Result<()> {
//! // Resolve the native library for this process (idempotent)
//! let interop = Interop::global();
//! println!("{:?}", interop.resolved().outcome());
//!
//! let conn = interop.open("app.db")?;
//! conn.execute_batch("CREATE TABLE IF NOT EXISTS t (x INTEGER)")?;
//!
//! let stmt = conn.prepare("SELECT x FROM t")?;
//! while stmt.step()? {}
//!
//! // Close children first; dropping would release them as well
//! stmt.release();
//! conn.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Resolution
//!
//! ```rust,no_run
//! use sqlite_interop::{Interop, DirectoryResources, Setting, Result};
//!
//! # fn main() -> Result<()> {
//! let interop = Interop::builder()
//!     .setting(Setting::BaseDirectory, "/opt/app/native")
//!     .resources(DirectoryResources::new("/opt/app/packages"))
//!     .build();
//!
//! let conn = interop.open_in_memory()?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;

pub use crate::core::{
    api::{open_flags, select_api, ApiFlavor, DynamicApi, NativeApi, RawPtr, INVALID},
    arch::{default_library_file_name, platform_for},
    cache::{EnvLookup, ProcessEnv},
    config::{ConfigSource, EnvConfig, FileConfig, LayeredConfig, MapConfig, Setting},
    fingerprint::{compute_version_fingerprint, FingerprintTable, VersionFingerprint},
    handle::{
        BackupHandle, BackupStep, BlobHandle, ConnectionHandle, HandleKind, NativeHandle,
        ReleaseOutcome, StatementHandle,
    },
    loader::{DynamicLoader, LoadedModule, SystemLoader},
    resolver::{
        global, initialize, install_global, reset_global, ResolutionOutcome, ResolvedLibrary,
        Resolver, ResolverOptions,
    },
    resources::{DirectoryResources, EmbeddedResources, NoResources, ResourceSource},
};
pub use crate::error::{InteropError, Result};

#[cfg(feature = "bundled")]
pub use crate::core::api::BundledApi;

use crate::core::api::open_flags::{CREATE, READ_WRITE};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

enum ResolverSource {
    Global,
    Owned(Resolver),
}

/// Entry point tying a resolver to the handles it opens
///
/// # Examples
///
/// ```rust,no_run
/// use sqlite_interop::Interop;
///
/// let interop = Interop::global();
/// let version = interop.libversion()?;
/// println!("SQLite {version}");
/// # Ok::<(), sqlite_interop::InteropError>(())
/// ```
pub struct Interop {
    source: ResolverSource,
}

impl Interop {
    /// Use the process-wide resolver
    pub fn global() -> Self {
        Interop {
            source: ResolverSource::Global,
        }
    }

    /// Start configuring a dedicated resolver
    pub fn builder() -> InteropBuilder {
        InteropBuilder::new()
    }

    pub fn resolver(&self) -> &Resolver {
        match &self.source {
            ResolverSource::Global => global(),
            ResolverSource::Owned(resolver) => resolver,
        }
    }

    /// Resolution result, resolving on first call
    pub fn resolved(&self) -> Arc<ResolvedLibrary> {
        self.resolver().resolve()
    }

    /// Native API bound to the resolved library
    pub fn api(&self) -> Result<Arc<dyn NativeApi>> {
        self.resolver().native_api()
    }

    /// `sqlite3_libversion` of the bound library
    pub fn libversion(&self) -> Result<String> {
        Ok(self.api()?.libversion())
    }

    /// Open (creating if needed) a database file for reading and writing
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use sqlite_interop::Interop;
    /// let conn = Interop::global().open("data/app.db")?;
    /// # Ok::<(), sqlite_interop::InteropError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<ConnectionHandle> {
        self.open_with_flags(path, READ_WRITE | CREATE)
    }

    /// Open a database with explicit `sqlite3_open_v2` flags
    pub fn open_with_flags<P: AsRef<Path>>(&self, path: P, flags: i32) -> Result<ConnectionHandle> {
        let path = path.as_ref();
        let filename = path
            .to_str()
            .ok_or_else(|| InteropError::NonUtf8Path(path.to_path_buf()))?;
        info!("Opening database {:?}", path);
        ConnectionHandle::open(self.api()?, filename, flags)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(&self) -> Result<ConnectionHandle> {
        debug!("Opening in-memory database");
        ConnectionHandle::open(self.api()?, ":memory:", READ_WRITE | CREATE)
    }
}

/// Builder for an [`Interop`] with its own resolver
///
/// Settings given here take precedence over the supplied (or default) config.
pub struct InteropBuilder {
    overrides: MapConfig,
    config: Option<Arc<dyn ConfigSource>>,
    loader: Arc<dyn DynamicLoader>,
    resources: Arc<dyn ResourceSource>,
    env: Option<Arc<dyn EnvLookup + Send + Sync>>,
    options: ResolverOptions,
}

impl InteropBuilder {
    /// Process config, the system loader and no packaged binaries
    pub fn new() -> Self {
        InteropBuilder {
            overrides: MapConfig::new(),
            config: None,
            loader: Arc::new(SystemLoader),
            resources: Arc::new(NoResources),
            env: None,
            options: ResolverOptions::default(),
        }
    }

    /// Set one setting, overriding every other source
    pub fn setting<S: Into<String>>(mut self, setting: Setting, value: S) -> Self {
        self.overrides.set(setting, value);
        self
    }

    /// Replace the base configuration (defaults to environment plus file)
    pub fn config<C: ConfigSource + 'static>(mut self, config: C) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    pub fn loader<L: DynamicLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Where packaged binaries are extracted from
    pub fn resources<R: ResourceSource + 'static>(mut self, resources: R) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    /// Environment used for the reported architecture and cache roots
    pub fn env<E: EnvLookup + Send + Sync + 'static>(mut self, env: E) -> Self {
        self.env = Some(Arc::new(env));
        self
    }

    pub fn options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the Interop instance; nothing is resolved until first use
    pub fn build(self) -> Interop {
        let base = self
            .config
            .unwrap_or_else(|| Arc::new(LayeredConfig::process_default()));
        let config = LayeredConfig::new().push(self.overrides).push(base);

        let mut resolver = Resolver::new(Arc::new(config), self.loader, self.resources)
            .with_options(self.options);
        if let Some(env) = self.env {
            resolver = resolver.with_shared_env(env);
        }

        debug!("Built dedicated resolver");
        Interop {
            source: ResolverSource::Owned(resolver),
        }
    }
}

impl Default for InteropBuilder {
    fn default() -> Self {
        Self::new()
    }
}
