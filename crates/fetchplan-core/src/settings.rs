//! Settings for fetchplan.
//!
//! [`Settings`] holds every recognized option with sensible defaults, and
//! [`LazySettings`] is a globally-accessible, configure-once slot for
//! applications that prefer a process-wide configuration.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Backing store used by the field registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// The store backend: `"file"` (persistent) or `"memory"`.
    pub backend: String,
    /// Backend location; a directory for the file backend.
    pub location: PathBuf,
}

impl RegistrySettings {
    /// A file-backed store in `location`.
    pub fn file(location: impl Into<PathBuf>) -> Self {
        Self {
            backend: "file".to_string(),
            location: location.into(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::file(".fetchplan_field_registry")
    }
}

/// The complete set of optimizer settings.
///
/// # Examples
///
/// ```
/// use fetchplan_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(!settings.disable_optimization);
/// assert_eq!(settings.field_registry.backend, "file");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // ── Core ─────────────────────────────────────────────────────────

    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log level directive (e.g. "info", "fetchplan=debug").
    pub log_level: String,

    // ── Call sites ───────────────────────────────────────────────────

    /// Prefix stripped from captured source paths. Absolute paths outside
    /// this root are treated as library code.
    pub project_root: String,
    /// Relative path prefixes that count as application code. Empty means
    /// every relative path does.
    pub app_roots: Vec<String>,

    // ── Registry ─────────────────────────────────────────────────────

    /// Field registry store configuration.
    pub field_registry: RegistrySettings,
    /// Store for source annotations, used with `offsite_optimization`.
    pub code_registry: RegistrySettings,

    // ── Switches ─────────────────────────────────────────────────────

    /// Skip query plan rewriting entirely.
    pub disable_optimization: bool,
    /// Skip wrapping fetched records, so no field access is learned.
    pub disable_observation: bool,
    /// Record the rewrite applied at each line-numbered call site so it can
    /// later be written into the source as a comment. Has no effect while
    /// optimization is disabled.
    pub offsite_optimization: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: true,
            log_level: "info".to_string(),
            project_root: String::new(),
            app_roots: Vec::new(),
            field_registry: RegistrySettings::default(),
            code_registry: RegistrySettings::file(".fetchplan_code_registry"),
            disable_optimization: false,
            disable_observation: false,
            offsite_optimization: false,
        }
    }
}

/// A lazily-initialized, globally-accessible settings container.
///
/// Call [`configure`](LazySettings::configure) once at startup to set the
/// settings, then use [`get`](LazySettings::get) to access them.
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the global settings. Must be called exactly once.
    ///
    /// # Panics
    ///
    /// Panics if settings have already been configured.
    pub fn configure(&self, settings: Settings) {
        self.inner
            .set(settings)
            .expect("Settings have already been configured");
    }

    /// Returns a reference to the configured settings.
    ///
    /// # Panics
    ///
    /// Panics if settings have not been configured.
    pub fn get(&self) -> &Settings {
        self.inner
            .get()
            .expect("Settings have not been configured. Call SETTINGS.configure() first.")
    }

    /// Returns the configured settings, or `None` before configuration.
    pub fn try_get(&self) -> Option<&Settings> {
        self.inner.get()
    }

    /// Returns `true` if settings have been configured.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();
