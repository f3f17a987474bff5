//! # fetchplan-db
//!
//! The ORM surface fetch planning works against. Provides [`ModelMeta`]
//! introspection, dynamic [`Record`]s with deferred columns and a related
//! cache, the [`Query`] plan state the optimizer rewrites, the async
//! [`DbExecutor`] bridge to storage, the process-wide [`save`] path with its
//! replaceable hook, and transactions.
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`] trait and [`ModelMeta`]
//! - [`fields`] - Field definitions ([`FieldDef`]) and relation kinds
//! - [`value`] - The backend-agnostic [`Value`] enum
//! - [`record`] - Materialized rows and primary-key slots
//! - [`query`] - Query plan state (joins, column restriction, batch fetches)
//! - [`executor`] - The [`DbExecutor`] trait and batch-fetch execution
//! - [`save`] - The save path and the save hook slot
//! - [`transactions`] - [`atomic`] blocks and savepoints
//! - [`memory`] - An in-memory executor with query counting
//! - [`assert_queries`] - Query count assertions for tests

// - doc_markdown: backtick requirements for documentation items are too strict
// - return_self_not_must_use: builder pattern methods are self-documenting
// - missing_const_for_fn: several accessors may grow non-const bodies
// - significant_drop_tightening: false positives with Mutex guards
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::cast_possible_truncation)]

pub mod assert_queries;
pub mod executor;
pub mod fields;
pub mod memory;
pub mod model;
pub mod query;
pub mod record;
pub mod save;
pub mod transactions;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use executor::{execute, prefetch_related_objects, DbExecutor, TxnOp};
pub use fields::{FieldDef, FieldKind};
pub use memory::MemoryDb;
pub use model::{Model, ModelMeta};
pub use query::{LoadingMode, Prefetch, Projection, Query, SelectRelated};
pub use record::{DeferredPk, KeyResolver, PrimaryKey, Record, Related};
pub use save::{install_save_hook, save, save_immediate, SaveHook, SaveHookGuard};
pub use transactions::{atomic, TransactionManager};
pub use value::Value;
