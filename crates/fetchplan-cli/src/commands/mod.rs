//! Built-in management commands over the field and code registries.
//!
//! Every command opens the registry store named by
//! `settings.field_registry`, so a file-backed registry written by an
//! application can be inspected and moved between machines. `annotate`
//! opens `settings.code_registry` instead.

pub mod annotate;
pub mod clear;
pub mod export;
pub mod import;
pub mod show;

pub use annotate::AnnotateCommand;
pub use clear::ClearCommand;
pub use export::ExportCommand;
pub use import::ImportCommand;
pub use show::ShowCommand;

use fetchplan::registry::store::store_from_settings;
use fetchplan::{CodeRegistry, FieldRegistry};
use fetchplan_core::{OptimizerResult, Settings};

use crate::command::CommandRegistry;

/// Registers every built-in command.
pub fn register_builtin_commands(registry: &mut CommandRegistry) {
    registry.register(Box::new(ExportCommand));
    registry.register(Box::new(ImportCommand));
    registry.register(Box::new(ShowCommand));
    registry.register(Box::new(ClearCommand));
    registry.register(Box::new(AnnotateCommand));
}

/// The registry configured by `settings`.
pub fn open_registry(settings: &Settings) -> OptimizerResult<FieldRegistry> {
    let store = store_from_settings(&settings.field_registry)?;
    tracing::debug!(
        backend = %settings.field_registry.backend,
        location = %settings.field_registry.location.display(),
        "opened field registry"
    );
    Ok(FieldRegistry::new(store))
}

/// The code registry configured by `settings`.
pub fn open_code_registry(settings: &Settings) -> OptimizerResult<CodeRegistry> {
    let store = store_from_settings(&settings.code_registry)?;
    tracing::debug!(
        backend = %settings.code_registry.backend,
        location = %settings.code_registry.location.display(),
        "opened code registry"
    );
    Ok(CodeRegistry::new(store))
}

/// Prints to stdout without blocking the runtime.
pub(crate) async fn emit(text: String) -> OptimizerResult<()> {
    tokio::task::spawn_blocking(move || println!("{text}"))
        .await
        .map_err(|e| fetchplan_core::OptimizerError::IoError(std::io::Error::other(e)))
}
