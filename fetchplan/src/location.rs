//! Call-site identity.
//!
//! A [`Location`] names the place in application code a query was built
//! from. It is the registry key under which that place's field usage is
//! learned, so two queries built at the same place must produce the same
//! string and queries built elsewhere must not.
//!
//! Identity is captured at compile time: the [`call_site!`](crate::call_site)
//! macro records the source file, line and enclosing function path, and
//! [`CallSite::caller`] records file and line through `#[track_caller]`. A
//! [`Locator`] then turns a [`CallSite`] into a [`Location`], dropping call
//! sites that are not application code.

use std::fmt;

use fetchplan_core::Settings;

/// Captures the current call site: file, line, module and enclosing function.
///
/// ```
/// let site = fetchplan::call_site!();
/// assert_eq!(site.line, line!() - 1);
/// assert!(site.file.ends_with(".rs"));
/// ```
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::location::CallSite::new(file!(), line!(), module_path!(), {
            fn __here() {}
            fn __name_of<T>(_: T) -> &'static str {
                ::std::any::type_name::<T>()
            }
            __name_of(__here)
        })
    };
}

/// A source position captured at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Source file as reported by `file!()`.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
    /// Module path as reported by `module_path!()`. Empty when unknown.
    pub module: &'static str,
    /// Type name of a marker item nested in the enclosing function. Empty
    /// when unknown.
    pub function: &'static str,
}

impl CallSite {
    /// A call site from its raw parts. Prefer [`call_site!`](crate::call_site).
    pub const fn new(
        file: &'static str,
        line: u32,
        module: &'static str,
        function: &'static str,
    ) -> Self {
        Self {
            file,
            line,
            module,
            function,
        }
    }

    /// The caller's file and line, without scope information.
    #[track_caller]
    pub fn caller() -> Self {
        let here = std::panic::Location::caller();
        Self::new(here.file(), here.line(), "", "")
    }

    /// Enclosing function names below the module, outermost first, joined
    /// with `.`. Closure and async-block frames are skipped.
    pub fn scope(&self) -> String {
        let path = self
            .function
            .strip_prefix(self.module)
            .unwrap_or(self.function);
        path.split("::")
            .filter(|seg| !seg.is_empty() && *seg != "__here" && !seg.starts_with("{{"))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// The identity of a call site, used verbatim as a registry key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Location {
    file: String,
    scope: String,
    name: String,
    line: Option<u32>,
}

impl Location {
    /// The empty location: no application code is involved, so nothing may
    /// be read from or written to the registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A location from explicit parts.
    pub fn new(file: impl Into<String>, scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            scope: scope.into(),
            name: name.into().to_lowercase(),
            line: None,
        }
    }

    /// A line-numbered location from explicit parts.
    pub fn numbered(file: impl Into<String>, name: impl Into<String>, line: u32) -> Self {
        Self {
            line: Some(line),
            ..Self::new(file, "", name)
        }
    }

    /// Returns `true` for the empty location.
    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    /// Source file relative to the project root, extension stripped.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Enclosing scopes, `.`-joined.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The discriminating name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source line, for line-numbered locations.
    pub const fn line(&self) -> Option<u32> {
        self.line
    }

    /// The same site with a different name; used for the nested queries a
    /// query issues for its relations. The empty location stays empty.
    pub fn with_name(&self, name: &str) -> Self {
        if self.is_empty() {
            return Self::empty();
        }
        Self {
            name: name.to_lowercase(),
            ..self.clone()
        }
    }

    /// The registry key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        match self.line {
            Some(line) => write!(f, "{}::{}::{line}", self.file, self.name),
            None => write!(f, "{}/{}/{}", self.file, self.scope, self.name),
        }
    }
}

/// Turns call sites into locations relative to the project.
#[derive(Debug, Clone, Default)]
pub struct Locator {
    project_root: String,
    app_roots: Vec<String>,
    numbered: bool,
}

impl Locator {
    /// A locator for the given project root and accepted path prefixes.
    pub fn new(project_root: impl Into<String>, app_roots: Vec<String>) -> Self {
        Self {
            project_root: normalize(&project_root.into()),
            app_roots: app_roots.iter().map(|r| normalize(r)).collect(),
            numbered: false,
        }
    }

    /// A locator configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.project_root.clone(), settings.app_roots.clone())
    }

    /// Produces `file::name::line` locations instead of `file/scope/name`.
    pub fn numbered(mut self, numbered: bool) -> Self {
        self.numbered = numbered;
        self
    }

    /// The location of `site`, discriminated by `name_hint` (usually the
    /// model name). Sites outside application code yield the empty location.
    pub fn locate(&self, site: &CallSite, name_hint: &str) -> Location {
        let Some(file) = self.relative_file(site) else {
            return Location::empty();
        };
        Location {
            file,
            scope: site.scope(),
            name: name_hint.to_lowercase(),
            line: self.numbered.then_some(site.line),
        }
    }

    /// The source file of `site` relative to the project root, extension
    /// kept. `None` for sites outside application code.
    pub fn source_path(&self, site: &CallSite) -> Option<String> {
        let path = normalize(site.file);
        let relative = if self.project_root.is_empty() {
            path.as_str()
        } else if let Some(rest) = path
            .strip_prefix(&self.project_root)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        {
            rest.trim_start_matches('/')
        } else {
            return None;
        };
        if relative.is_empty() || is_library_path(relative) {
            return None;
        }
        if !self.app_roots.is_empty()
            && !self
                .app_roots
                .iter()
                .any(|root| relative.starts_with(root.as_str()))
        {
            return None;
        }
        Some(relative.to_string())
    }

    fn relative_file(&self, site: &CallSite) -> Option<String> {
        let relative = self.source_path(site)?;
        let stem = relative
            .rsplit_once('.')
            .filter(|(_, ext)| !ext.contains('/'))
            .map_or(relative.as_str(), |(stem, _)| stem);
        Some(stem.to_string())
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Absolute paths left after stripping the project root belong to crates
/// outside the project, as do vendored and registry sources.
fn is_library_path(path: &str) -> bool {
    path.starts_with('/')
        || path.contains(":/")
        || path.contains(".cargo/registry")
        || path.contains(".cargo/git")
}
