//! # fetchplan-core
//!
//! Core types, settings, and error types shared by every fetchplan crate.
//! This crate has no dependency on the ORM layer and provides the foundation
//! for all other crates.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Optimizer settings and the global configuration slot
//! - [`settings_loader`] - Loading settings from TOML, JSON, and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{OptimizerError, OptimizerResult};
pub use settings::{RegistrySettings, Settings, SETTINGS};
