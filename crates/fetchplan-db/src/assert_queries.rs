//! Query counting assertions for tests.
//!
//! [`assert_num_queries`] counts the statements a [`MemoryDb`] executes
//! during an async closure, which is how convergence of a fetch location is
//! observed: the first run pays for lazy loads, later runs should not.
//!
//! ```rust,no_run
//! use fetchplan_db::assert_queries::assert_num_queries;
//! use fetchplan_db::memory::MemoryDb;
//!
//! async fn example(db: &MemoryDb) {
//!     assert_num_queries(db, 0, || async {}).await;
//! }
//! ```

use std::future::Future;

use crate::memory::MemoryDb;

/// Asserts that exactly `expected_count` queries run during `f`.
///
/// # Panics
///
/// Panics if the number of queries does not match `expected_count`.
pub async fn assert_num_queries<F, Fut, T>(db: &MemoryDb, expected_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert_eq!(
        actual, expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed"
    );
    out
}

/// Asserts that at most `max_count` queries run during `f`.
///
/// # Panics
///
/// Panics if more than `max_count` queries are executed.
pub async fn assert_max_queries<F, Fut, T>(db: &MemoryDb, max_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
    out
}
