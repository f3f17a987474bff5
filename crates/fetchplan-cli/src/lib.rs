//! # fetchplan-cli
//!
//! Management commands for the fetchplan registries. The `fetchplan`
//! binary exposes them as subcommands:
//!
//! - `export <path>` - write every entry to a CSV file
//! - `import <path> [--keep]` - load a CSV file written by `export`
//! - `show [key]` - print one entry or a summary of all of them
//! - `clear` - forget everything
//! - `annotate [--root DIR]` - write recorded plans into the source
//!
//! ```rust
//! use fetchplan_cli::command::CommandRegistry;
//! use fetchplan_cli::commands::register_builtin_commands;
//!
//! let mut registry = CommandRegistry::new();
//! register_builtin_commands(&mut registry);
//! assert_eq!(registry.list_commands(), vec!["annotate", "clear", "export", "import", "show"]);
//! ```

// - doc_markdown: backtick requirements for documentation items are too strict
// - missing_const_for_fn: some functions may gain runtime logic later
// - unused_async: command handlers keep a uniform async signature
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::unused_async)]

pub mod command;
pub mod commands;

use std::path::Path;

use fetchplan_core::{settings_loader, OptimizerResult, Settings};

pub use command::{CommandRegistry, ManagementCommand};
pub use commands::register_builtin_commands;

/// Settings file read when `--settings` is not given.
pub const DEFAULT_SETTINGS_FILE: &str = "fetchplan.toml";

/// Loads settings for a command run.
///
/// An explicit path is read as JSON when it ends in `.json` and as TOML
/// otherwise. Without one, `fetchplan.toml` in the working directory is
/// used if it exists. Environment overrides apply in every case.
pub fn load_settings(path: Option<&Path>) -> OptimizerResult<Settings> {
    match path {
        Some(path) if path.extension().is_some_and(|ext| ext == "json") => {
            settings_loader::from_json_file_with_env(path)
        }
        Some(path) => settings_loader::from_toml_file_with_env(path),
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            settings_loader::from_toml_file_with_env(DEFAULT_SETTINGS_FILE)
        }
        None => Ok(settings_loader::from_env()),
    }
}
