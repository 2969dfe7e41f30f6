//! Native library resolution
//!
//! Works out, once per process, which native SQLite library to load and loads
//! it. Every step degrades to the next one:
//!
//! 1. file name (override or architecture-qualified default)
//! 2. architecture (override, reported value corrected for pointer width, OS query)
//! 3. platform directory name from the architecture table
//! 4. on-disk search under the base directory
//! 5. extraction of a packaged binary into the per-user cache
//! 6. the OS loader's own search path, by bare file name
//!
//! Resolution never panics and never returns an error. The only hard failure
//! (a blank file name override) yields an unqualified library name and leaves
//! the OS loader to report the problem at first use.

use crate::core::api::{select_api, NativeApi};
use crate::core::arch::{
    default_library_file_name, detect_architecture, platform_for, process_pointer_width,
    query_native_architecture, unqualified_library_file_name, REPORTED_ARCH_VAR,
};
use crate::core::cache::{
    cache_key, cache_path, extract_to_cache, find_writable_cache_root, EnvLookup, ProcessEnv,
};
use crate::core::config::{executable_directory, ConfigSource, LayeredConfig, Setting};
use crate::core::fingerprint::{compute_version_fingerprint, FingerprintTable, VersionFingerprint};
use crate::core::loader::{DynamicLoader, LoadedModule, SystemLoader};
use crate::core::resources::{resource_name, NoResources, ResourceSource};
use crate::core::search::{find_native_library, needs_flat_layout};
use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Version mixed into cache keys so upgrades never reuse an old extraction
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How resolution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// A file was found or extracted and loaded
    Loaded,
    /// Nothing could be loaded up front; the bare file name is left to the
    /// OS loader's search path
    SystemSearchPath,
    /// No file name could be determined; an unqualified name is used
    Unqualified,
    /// Preloading is switched off by configuration
    Disabled,
}

/// Result of one resolution, cached for the process lifetime
#[derive(Clone)]
pub struct ResolvedLibrary {
    base_directory: Option<PathBuf>,
    architecture: Option<String>,
    platform: Option<String>,
    file_path: PathBuf,
    module: Option<Arc<dyn LoadedModule>>,
    outcome: ResolutionOutcome,
    fingerprint: Option<VersionFingerprint>,
    extracted: bool,
}

impl ResolvedLibrary {
    fn deferred(file_name: &str, outcome: ResolutionOutcome) -> Self {
        Self {
            base_directory: None,
            architecture: None,
            platform: None,
            file_path: PathBuf::from(file_name),
            module: None,
            outcome,
            fingerprint: None,
            extracted: false,
        }
    }

    pub fn base_directory(&self) -> Option<&Path> {
        self.base_directory.as_deref()
    }

    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    /// Absolute path of the loaded file, or the bare name left to the OS loader
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn module(&self) -> Option<&Arc<dyn LoadedModule>> {
        self.module.as_ref()
    }

    pub fn outcome(&self) -> ResolutionOutcome {
        self.outcome
    }

    pub fn fingerprint(&self) -> Option<&VersionFingerprint> {
        self.fingerprint.as_ref()
    }

    /// Whether the file came out of the per-user cache
    pub fn was_extracted(&self) -> bool {
        self.extracted
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }
}

impl fmt::Debug for ResolvedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedLibrary")
            .field("base_directory", &self.base_directory)
            .field("architecture", &self.architecture)
            .field("platform", &self.platform)
            .field("file_path", &self.file_path)
            .field("loaded", &self.is_loaded())
            .field("outcome", &self.outcome)
            .field("fingerprint", &self.fingerprint)
            .field("extracted", &self.extracted)
            .finish()
    }
}

/// Knobs that are not environment settings
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Pin whether the flat `<base>/<file>` candidate is searched; `None`
    /// follows configuration and the target's conventions
    pub allow_base_only: Option<bool>,
    /// Pointer width in bytes used for file naming and architecture correction
    pub pointer_width: usize,
    /// Directory of the module doing the loading; defaults to the executable's
    pub module_location: Option<PathBuf>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            allow_base_only: None,
            pointer_width: process_pointer_width(),
            module_location: None,
        }
    }
}

enum ResolverState {
    Unresolved,
    Resolved(Arc<ResolvedLibrary>),
}

/// Resolves and caches the native library
pub struct Resolver {
    config: Arc<dyn ConfigSource>,
    loader: Arc<dyn DynamicLoader>,
    resources: Arc<dyn ResourceSource>,
    env: Arc<dyn EnvLookup + Send + Sync>,
    fingerprints: FingerprintTable,
    options: ResolverOptions,
    state: Mutex<ResolverState>,
    api: Mutex<Option<Arc<dyn NativeApi>>>,
}

impl Resolver {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        loader: Arc<dyn DynamicLoader>,
        resources: Arc<dyn ResourceSource>,
    ) -> Self {
        let fingerprints = FingerprintTable::from_entries(resources.known_builds());
        debug!(known_builds = fingerprints.len(), "Resolver created");
        Self {
            config,
            loader,
            resources,
            env: Arc::new(ProcessEnv),
            fingerprints,
            options: ResolverOptions::default(),
            state: Mutex::new(ResolverState::Unresolved),
            api: Mutex::new(None),
        }
    }

    /// Process defaults: environment plus `sqlite-interop.toml`, the system
    /// loader and no packaged binaries
    pub fn from_process() -> Self {
        Self::new(
            Arc::new(LayeredConfig::process_default()),
            Arc::new(SystemLoader),
            Arc::new(NoResources),
        )
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the environment used for the reported architecture and cache roots
    pub fn with_env(self, env: impl EnvLookup + Send + Sync + 'static) -> Self {
        self.with_shared_env(Arc::new(env))
    }

    pub fn with_shared_env(mut self, env: Arc<dyn EnvLookup + Send + Sync>) -> Self {
        self.env = env;
        self
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolve on first call; later calls return the cached result
    ///
    /// Concurrent first callers block on the same lock and all observe the
    /// single result.
    pub fn resolve(&self) -> Arc<ResolvedLibrary> {
        let mut state = self.state.lock();
        if let ResolverState::Resolved(resolved) = &*state {
            return Arc::clone(resolved);
        }

        let resolved = Arc::new(self.resolve_uncached());
        info!(
            outcome = ?resolved.outcome,
            path = %resolved.file_path.display(),
            architecture = resolved.architecture.as_deref().unwrap_or("unknown"),
            "Native library resolved"
        );
        *state = ResolverState::Resolved(Arc::clone(&resolved));
        resolved
    }

    /// Cached result without triggering resolution
    pub fn resolved(&self) -> Option<Arc<ResolvedLibrary>> {
        match &*self.state.lock() {
            ResolverState::Resolved(resolved) => Some(Arc::clone(resolved)),
            ResolverState::Unresolved => None,
        }
    }

    /// Forget the cached result so the next call resolves again
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = ResolverState::Unresolved;
        *self.api.lock() = None;
        debug!("Resolver reset");
    }

    /// Native API bound to the resolved library, chosen once
    pub fn native_api(&self) -> Result<Arc<dyn NativeApi>> {
        let resolved = self.resolve();
        let mut api = self.api.lock();
        if let Some(api) = api.as_ref() {
            return Ok(Arc::clone(api));
        }
        let bound = select_api(&resolved, self.loader.as_ref())?;
        info!(api = bound.name(), version = %bound.libversion(), "Native API bound");
        *api = Some(Arc::clone(&bound));
        Ok(bound)
    }

    fn file_name(&self) -> Option<String> {
        match self.config.get(Setting::LibraryFileName) {
            Some(name) if name.trim().is_empty() => None,
            Some(name) => Some(name.trim().to_string()),
            None => Some(default_library_file_name(self.options.pointer_width)),
        }
    }

    fn architecture(&self) -> Option<String> {
        let override_value = self.config.get(Setting::ProcessorArchitecture);
        let reported = self.env.var(REPORTED_ARCH_VAR);
        detect_architecture(
            override_value.as_deref(),
            reported.as_deref(),
            self.options.pointer_width,
            query_native_architecture,
        )
    }

    fn base_directory(&self) -> Option<PathBuf> {
        if let Some(dir) = self
            .config
            .get(Setting::BaseDirectory)
            .filter(|d| !d.trim().is_empty())
        {
            return Some(PathBuf::from(dir.trim()));
        }

        if self.config.flag(Setting::UseExecutableDirectory) {
            if let Some(dir) = executable_directory() {
                return Some(dir);
            }
        }

        self.module_directory()
    }

    fn module_directory(&self) -> Option<PathBuf> {
        self.options
            .module_location
            .clone()
            .or_else(executable_directory)
            .or_else(|| std::env::current_dir().ok())
    }

    fn allow_base_only(&self) -> bool {
        self.options.allow_base_only.unwrap_or_else(|| {
            self.config.flag(Setting::AllowBaseDirectoryOnly) || needs_flat_layout()
        })
    }

    fn try_load(&self, path: &Path) -> Option<Arc<dyn LoadedModule>> {
        match self.loader.load(path) {
            Ok(module) => Some(module),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Native library failed to load");
                None
            }
        }
    }

    /// Cache path for the packaged binary, extracting it when absent
    fn extract(&self, platform: &str, file_name: &str) -> Option<PathBuf> {
        let Some(root) = find_writable_cache_root(self.config.as_ref(), self.env.as_ref()) else {
            debug!("No writable cache directory, skipping extraction");
            return None;
        };

        let location = self
            .module_directory()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let key = cache_key(&location, API_VERSION, platform, file_name);
        let target = cache_path(&root, &key, file_name);
        let name = resource_name(platform, file_name);

        match extract_to_cache(self.resources.as_ref(), &name, &target) {
            Ok(wrote) => {
                debug!(path = %target.display(), wrote, "Packaged binary available in cache");
                Some(target)
            }
            Err(e) => {
                debug!(resource = %name, error = %e, "Extraction skipped");
                None
            }
        }
    }

    fn resolve_uncached(&self) -> ResolvedLibrary {
        let Some(file_name) = self.file_name() else {
            warn!("Library file name override is blank, using the unqualified name");
            return ResolvedLibrary::deferred(
                &unqualified_library_file_name(),
                ResolutionOutcome::Unqualified,
            );
        };

        if self.config.flag(Setting::NoPreload) {
            debug!("Preloading disabled");
            return ResolvedLibrary::deferred(&file_name, ResolutionOutcome::Disabled);
        }

        let architecture = self.architecture();
        let platform = architecture
            .as_deref()
            .and_then(platform_for)
            .map(str::to_string);
        let base_directory = self.base_directory();
        debug!(
            file_name = %file_name,
            architecture = ?architecture,
            platform = ?platform,
            base = ?base_directory,
            "Resolving native library"
        );

        let mut resolved = ResolvedLibrary {
            base_directory,
            architecture,
            platform,
            file_path: PathBuf::from(&file_name),
            module: None,
            outcome: ResolutionOutcome::SystemSearchPath,
            fingerprint: None,
            extracted: false,
        };

        let found = match (&resolved.base_directory, self.config.flag(Setting::NoSearchDirectories)) {
            (Some(base), false) => find_native_library(
                base,
                resolved.architecture.as_deref(),
                resolved.platform.as_deref(),
                &file_name,
                self.allow_base_only(),
            ),
            _ => None,
        };

        let mut located = found.and_then(|path| self.try_load(&path).map(|module| (path, module, false)));

        if located.is_none() && !self.config.flag(Setting::NoExtraction) {
            if let Some(platform) = resolved.platform.clone() {
                located = self
                    .extract(&platform, &file_name)
                    .and_then(|path| self.try_load(&path).map(|module| (path, module, true)));
            }
        }

        match located {
            Some((path, module, extracted)) => {
                resolved.fingerprint = compute_version_fingerprint(&self.fingerprints, &path);
                resolved.file_path = path;
                resolved.module = Some(module);
                resolved.outcome = ResolutionOutcome::Loaded;
                resolved.extracted = extracted;
            }
            None => {
                debug!(file_name = %file_name, "Deferring to the system search path");
            }
        }

        resolved
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("options", &self.options)
            .field("known_builds", &self.fingerprints.len())
            .field("resolved", &self.resolved())
            .finish()
    }
}

static GLOBAL: OnceLock<Resolver> = OnceLock::new();

/// Install a custom process resolver; fails (returning it) once one exists
pub fn install_global(resolver: Resolver) -> std::result::Result<(), Resolver> {
    GLOBAL.set(resolver)
}

/// The process resolver, created from process defaults on first use
pub fn global() -> &'static Resolver {
    GLOBAL.get_or_init(Resolver::from_process)
}

/// Resolve the process library; idempotent, call from startup code
pub fn initialize() -> Arc<ResolvedLibrary> {
    global().resolve()
}

/// Clear the process resolver's cache
pub fn reset_global() {
    if let Some(resolver) = GLOBAL.get() {
        resolver.reset();
    }
}
