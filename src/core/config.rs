//! Environment-style settings lookups
//!
//! Every setting is a named string that is either present or absent. Absence
//! always means "use the default behavior", never an error. Sources:
//!
//! - [`EnvConfig`]: `SQLITE_INTEROP_<KEY>` environment variables
//! - [`FileConfig`]: a TOML file with a `[settings]` table
//! - [`MapConfig`]: in-memory values (tests, embedding applications)
//! - [`LayeredConfig`]: ordered sources, first hit wins

use crate::error::{InteropError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the optional settings file placed next to the executable
pub const CONFIG_FILE_NAME: &str = "sqlite-interop.toml";

/// Prefix for environment variable names
pub const ENV_PREFIX: &str = "SQLITE_INTEROP_";

/// Recognised settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    /// Native library file name override
    LibraryFileName,
    /// Directory searched before the executable's directory
    BaseDirectory,
    /// Processor architecture override (honoured verbatim)
    ProcessorArchitecture,
    /// Skip resolution entirely and defer to the system loader
    NoPreload,
    /// Skip the on-disk directory search
    NoSearchDirectories,
    /// Skip extraction from packaged resources
    NoExtraction,
    /// Permit the flat `<base>/<file>` candidate
    AllowBaseDirectoryOnly,
    /// Use the executable's directory rather than the working directory
    UseExecutableDirectory,
    /// Writable cache root override
    CacheDirectory,
}

impl Setting {
    /// All settings, in declaration order
    pub const ALL: [Setting; 9] = [
        Setting::LibraryFileName,
        Setting::BaseDirectory,
        Setting::ProcessorArchitecture,
        Setting::NoPreload,
        Setting::NoSearchDirectories,
        Setting::NoExtraction,
        Setting::AllowBaseDirectoryOnly,
        Setting::UseExecutableDirectory,
        Setting::CacheDirectory,
    ];

    /// snake_case key used in settings files
    pub fn key(self) -> &'static str {
        match self {
            Setting::LibraryFileName => "library_file_name",
            Setting::BaseDirectory => "base_directory",
            Setting::ProcessorArchitecture => "processor_architecture",
            Setting::NoPreload => "no_preload",
            Setting::NoSearchDirectories => "no_search_directories",
            Setting::NoExtraction => "no_extraction",
            Setting::AllowBaseDirectoryOnly => "allow_base_directory_only",
            Setting::UseExecutableDirectory => "use_executable_directory",
            Setting::CacheDirectory => "cache_directory",
        }
    }

    /// Environment variable name, e.g. `SQLITE_INTEROP_BASE_DIRECTORY`
    pub fn env_var(self) -> String {
        format!("{}{}", ENV_PREFIX, self.key().to_ascii_uppercase())
    }

    /// Look a setting up by its file key
    pub fn from_key(key: &str) -> Option<Self> {
        Setting::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// Interpret a present setting value as a boolean switch
///
/// Presence enables the switch unless the value is an explicit negative.
pub fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// A source of named settings
pub trait ConfigSource: Send + Sync {
    /// Current value of a setting, `None` when absent
    fn get(&self, setting: Setting) -> Option<String>;

    /// Whether a boolean switch is enabled
    fn flag(&self, setting: Setting) -> bool {
        self.get(setting).map(|v| parse_flag(&v)).unwrap_or(false)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for std::sync::Arc<T> {
    fn get(&self, setting: Setting) -> Option<String> {
        (**self).get(setting)
    }
}

/// Settings read from `SQLITE_INTEROP_*` environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn get(&self, setting: Setting) -> Option<String> {
        std::env::var(setting.env_var())
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// In-memory settings
#[derive(Debug, Default, Clone)]
pub struct MapConfig {
    values: HashMap<Setting, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value (builder style)
    pub fn with(mut self, setting: Setting, value: impl Into<String>) -> Self {
        self.values.insert(setting, value.into());
        self
    }

    pub fn set(&mut self, setting: Setting, value: impl Into<String>) {
        self.values.insert(setting, value.into());
    }

    pub fn remove(&mut self, setting: Setting) {
        self.values.remove(&setting);
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, setting: Setting) -> Option<String> {
        self.values.get(&setting).cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    settings: HashMap<String, toml::Value>,
}

/// Settings loaded from a TOML file
///
/// ```toml
/// [settings]
/// base_directory = "/opt/app/native"
/// no_extraction = true
/// ```
#[derive(Debug, Default, Clone)]
pub struct FileConfig {
    path: Option<PathBuf>,
    values: HashMap<Setting, String>,
}

impl FileConfig {
    /// Parse settings from TOML text
    pub fn parse(text: &str) -> Result<Self> {
        let file: SettingsFile =
            toml::from_str(text).map_err(|e| InteropError::Config(e.to_string()))?;

        let mut values = HashMap::new();
        for (key, value) in file.settings {
            let Some(setting) = Setting::from_key(&key) else {
                warn!(key = %key, "Ignoring unknown setting");
                continue;
            };
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Integer(i) => i.to_string(),
                other => {
                    warn!(key = %key, value = %other, "Ignoring non-scalar setting");
                    continue;
                }
            };
            values.insert(setting, text);
        }

        Ok(Self { path: None, values })
    }

    /// Read settings from a file
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&text)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Read settings from a file, treating any failure as an empty source
    pub fn load_or_empty(path: &Path) -> Self {
        if !path.is_file() {
            return Self::default();
        }
        match Self::from_path(path) {
            Ok(config) => {
                debug!(path = %path.display(), count = config.values.len(), "Loaded settings file");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
                Self::default()
            }
        }
    }

    /// Path the settings were read from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ConfigSource for FileConfig {
    fn get(&self, setting: Setting) -> Option<String> {
        self.values.get(&setting).cloned()
    }
}

/// Ordered list of sources; the first source with a value wins
#[derive(Default)]
pub struct LayeredConfig {
    layers: Vec<Box<dyn ConfigSource>>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower-priority source
    pub fn push(mut self, source: impl ConfigSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }

    /// Environment first, then `sqlite-interop.toml` next to the executable
    pub fn process_default() -> Self {
        let mut config = Self::new().push(EnvConfig);
        if let Some(dir) = executable_directory() {
            config = config.push(FileConfig::load_or_empty(&dir.join(CONFIG_FILE_NAME)));
        }
        config
    }
}

impl ConfigSource for LayeredConfig {
    fn get(&self, setting: Setting) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(setting))
    }
}

/// Directory holding the running executable
pub fn executable_directory() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}
