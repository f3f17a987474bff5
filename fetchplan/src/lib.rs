//! # fetchplan
//!
//! Adaptive fetch-plan optimization. Queries built through an [`Optimizer`]
//! are stamped with the call site they were built at. Reads on the records
//! they return are reported to a [`FieldRegistry`] under that call site, and
//! the next query from the same place is rewritten up front: learned to-one
//! relations are joined, learned to-many relations are batch-fetched and
//! columns are restricted to those actually read.
//!
//! [`deferred_atomic`] gathers every save made inside it and writes them
//! with one bulk insert and one bulk update per model.
//!
//! With offsite optimization on, each applied rewrite is also recorded in a
//! [`CodeRegistry`] under the query's source line, from where it can be
//! written into the source as a comment.
//!
//! ## Module Overview
//!
//! - [`location`] - Call-site capture and registry keys
//! - [`registry`] - Learned field sets, applied plans and their stores
//! - [`rewrite`] - The three plan-rewriting passes
//! - [`queryset`] - [`OptimizerQuerySet`], the optimizing query wrapper
//! - [`observer`] - [`ObservedRecord`], reporting field reads
//! - [`deferred`] - Gathered writes and deferred primary keys
//! - [`optimizer`] - [`Optimizer`], the entry point

// - doc_markdown: backtick requirements for documentation items are too strict
// - return_self_not_must_use: builder pattern methods are self-documenting
// - missing_const_for_fn: several accessors may grow non-const bodies
// - significant_drop_tightening: false positives with Mutex guards
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]

pub mod deferred;
pub mod location;
pub mod observer;
pub mod optimizer;
pub mod queryset;
pub mod registry;
pub mod rewrite;

/// Errors, settings and logging.
pub use fetchplan_core as core;

/// Models, records, query plans and the executor trait.
pub use fetchplan_db as db;

/// Save signals.
pub use fetchplan_signals as signals;

// Re-export the most commonly used types at the crate root.
pub use deferred::{deferred_atomic, Coordinator, FlushSummary};
pub use location::{CallSite, Location, Locator};
pub use observer::{ObservedRecord, Observer};
pub use optimizer::Optimizer;
pub use queryset::OptimizerQuerySet;
pub use registry::store::{FileStore, MemoryStore, RegistryStore};
pub use registry::code::{Annotation, CodeRegistry, CodeSite};
pub use registry::{FieldCategory, FieldRegistry, FieldSets};
pub use rewrite::ChildFetch;
