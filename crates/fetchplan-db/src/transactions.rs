//! Transaction support.
//!
//! [`TransactionManager`] wraps a [`DbExecutor`], tracks nesting depth and
//! forwards every executor call, so code inside an [`atomic`] block keeps
//! using the plain executor interface. Nested `atomic` calls on the same
//! manager create savepoints.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fetchplan_core::{OptimizerError, OptimizerResult};
use tokio::sync::Mutex;

use crate::executor::{DbExecutor, TxnOp};
use crate::model::ModelMeta;
use crate::query::Query;
use crate::record::Record;
use crate::value::Value;

/// Counter for generating unique savepoint names.
static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Manages transaction state for one executor.
pub struct TransactionManager<'a> {
    db: &'a dyn DbExecutor,
    /// 0 = no transaction, 1 = outermost, 2+ = savepoint.
    depth: Mutex<u32>,
    savepoints: Mutex<Vec<String>>,
}

impl<'a> TransactionManager<'a> {
    /// Creates a new transaction manager for the given executor.
    pub fn new(db: &'a dyn DbExecutor) -> Self {
        Self {
            db,
            depth: Mutex::new(0),
            savepoints: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current nesting depth.
    pub async fn depth(&self) -> u32 {
        *self.depth.lock().await
    }

    /// Returns the underlying executor.
    pub fn executor(&self) -> &dyn DbExecutor {
        self.db
    }

    /// Begins a transaction, or creates a savepoint when already inside one.
    pub async fn begin(&self) -> OptimizerResult<()> {
        let mut depth = self.depth.lock().await;
        if *depth == 0 {
            self.db.transaction(TxnOp::Begin).await?;
        } else {
            let id = SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
            let name = format!("sp_{id}");
            self.db.transaction(TxnOp::Savepoint(name.clone())).await?;
            self.savepoints.lock().await.push(name);
        }
        *depth += 1;
        Ok(())
    }

    /// Commits the transaction or releases the innermost savepoint.
    pub async fn commit(&self) -> OptimizerResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(OptimizerError::DatabaseError(
                    "Cannot commit: not in a transaction".to_string(),
                ))
            }
            1 => self.db.transaction(TxnOp::Commit).await?,
            _ => {
                if let Some(name) = self.savepoints.lock().await.pop() {
                    self.db.transaction(TxnOp::ReleaseSavepoint(name)).await?;
                }
            }
        }
        *depth -= 1;
        Ok(())
    }

    /// Rolls back the transaction or the innermost savepoint.
    pub async fn rollback(&self) -> OptimizerResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(OptimizerError::DatabaseError(
                    "Cannot rollback: not in a transaction".to_string(),
                ))
            }
            1 => self.db.transaction(TxnOp::Rollback).await?,
            _ => {
                if let Some(name) = self.savepoints.lock().await.pop() {
                    self.db.transaction(TxnOp::RollbackToSavepoint(name)).await?;
                }
            }
        }
        *depth -= 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DbExecutor for TransactionManager<'_> {
    async fn fetch(&self, query: &Query) -> OptimizerResult<Vec<Record>> {
        self.db.fetch(query).await
    }

    async fn fetch_values(&self, query: &Query) -> OptimizerResult<Vec<BTreeMap<String, Value>>> {
        self.db.fetch_values(query).await
    }

    async fn count(&self, query: &Query) -> OptimizerResult<u64> {
        self.db.count(query).await
    }

    async fn fetch_related(
        &self,
        parent: &'static ModelMeta,
        relation: &str,
        parent_keys: &[Value],
        inner: &Query,
    ) -> OptimizerResult<Vec<(Value, Record)>> {
        self.db
            .fetch_related(parent, relation, parent_keys, inner)
            .await
    }

    async fn load_columns(
        &self,
        meta: &'static ModelMeta,
        pk: &Value,
        columns: &[String],
    ) -> OptimizerResult<BTreeMap<String, Value>> {
        self.db.load_columns(meta, pk, columns).await
    }

    async fn insert(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<Option<Value>> {
        self.db.insert(meta, record).await
    }

    async fn bulk_insert(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
    ) -> OptimizerResult<Vec<Option<Value>>> {
        self.db.bulk_insert(meta, records).await
    }

    async fn bulk_update(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
        columns: &[String],
    ) -> OptimizerResult<u64> {
        self.db.bulk_update(meta, records, columns).await
    }

    async fn update(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<u64> {
        self.db.update(meta, record).await
    }

    async fn transaction(&self, op: TxnOp) -> OptimizerResult<()> {
        self.db.transaction(op).await
    }
}

/// Executes a closure within a database transaction.
///
/// If the closure returns `Ok`, the transaction is committed. If it returns
/// `Err`, the transaction is rolled back and the original error returned.
///
/// ```ignore
/// use fetchplan_db::transactions::atomic;
///
/// let id = atomic(&db, |txn| async move {
///     let mut order = Record::new(order_meta()).with("total", 10)?;
///     save(&mut order, &*txn).await?;
///     Ok(order.pk())
/// })
/// .await?;
/// ```
pub async fn atomic<'a, F, Fut, T>(db: &'a dyn DbExecutor, f: F) -> OptimizerResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: std::future::Future<Output = OptimizerResult<T>>,
{
    let txn = Arc::new(TransactionManager::new(db));
    txn.begin().await?;

    match f(Arc::clone(&txn)).await {
        Ok(result) => {
            txn.commit().await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDb;

    #[tokio::test]
    async fn test_commit_sequence() {
        let db = MemoryDb::new();
        let result = atomic(&db, |txn| async move {
            assert_eq!(txn.depth().await, 1);
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(db.transaction_log(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let db = MemoryDb::new();
        let result: OptimizerResult<()> = atomic(&db, |_txn| async move {
            Err(OptimizerError::DatabaseError("boom".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(db.transaction_log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_nested_begin_creates_savepoint() {
        let db = MemoryDb::new();
        let txn = TransactionManager::new(&db);
        txn.begin().await.unwrap();
        txn.begin().await.unwrap();
        assert_eq!(txn.depth().await, 2);
        txn.rollback().await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(txn.depth().await, 0);

        let log = db.transaction_log();
        assert_eq!(log[0], "BEGIN");
        assert!(log[1].starts_with("SAVEPOINT sp_"));
        assert!(log[2].starts_with("ROLLBACK TO SAVEPOINT sp_"));
        assert_eq!(log[3], "COMMIT");
    }

    #[tokio::test]
    async fn test_commit_without_transaction_errors() {
        let db = MemoryDb::new();
        let txn = TransactionManager::new(&db);
        assert!(txn.commit().await.is_err());
        assert!(txn.rollback().await.is_err());
    }
}
