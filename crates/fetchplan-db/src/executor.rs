//! Database executor trait and plan execution helpers.
//!
//! [`DbExecutor`] is the async bridge between query plans and a storage
//! backend. It exposes exactly the primitives fetch planning needs: fetch
//! with column restriction and eager joins, batch-fetch of to-many
//! relations, lazy column loads, single and bulk writes, and transaction
//! control. Batch-fetch directives are not run by `fetch`; [`execute`] runs
//! the main fetch and then every directive, so callers can substitute their
//! own handling of individual directives.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use fetchplan_core::{OptimizerError, OptimizerResult};

use crate::model::ModelMeta;
use crate::query::{Prefetch, Query};
use crate::record::{Record, Related};
use crate::value::Value;

/// A boxed, sendable future; used where plan execution recurses.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transaction control statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Start the outermost transaction.
    Begin,
    /// Commit the outermost transaction.
    Commit,
    /// Roll the outermost transaction back.
    Rollback,
    /// Create a named savepoint.
    Savepoint(String),
    /// Release a named savepoint.
    ReleaseSavepoint(String),
    /// Roll back to a named savepoint.
    RollbackToSavepoint(String),
}

/// Minimal async database executor trait.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    /// Runs a plan and returns its records, to-one joins cached. Batch-fetch
    /// directives and projections are ignored.
    async fn fetch(&self, query: &Query) -> OptimizerResult<Vec<Record>>;

    /// Runs a plan with a projection and returns field → value rows.
    async fn fetch_values(&self, query: &Query) -> OptimizerResult<Vec<BTreeMap<String, Value>>>;

    /// Counts the rows a plan matches.
    async fn count(&self, query: &Query) -> OptimizerResult<u64>;

    /// Batch-fetches the to-many `relation` of `parent` for all `parent_keys`
    /// in one round trip, returning `(parent key, related record)` pairs.
    /// `inner` filters, orders and restricts the related rows.
    async fn fetch_related(
        &self,
        parent: &'static ModelMeta,
        relation: &str,
        parent_keys: &[Value],
        inner: &Query,
    ) -> OptimizerResult<Vec<(Value, Record)>>;

    /// Loads the given columns of one row.
    async fn load_columns(
        &self,
        meta: &'static ModelMeta,
        pk: &Value,
        columns: &[String],
    ) -> OptimizerResult<BTreeMap<String, Value>>;

    /// Inserts one row; returns the new key when the backend reports it.
    async fn insert(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<Option<Value>>;

    /// Inserts many rows in one statement; returns the new keys in order
    /// when the backend reports them.
    async fn bulk_insert(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
    ) -> OptimizerResult<Vec<Option<Value>>>;

    /// Updates the given columns of many rows in one statement.
    async fn bulk_update(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
        columns: &[String],
    ) -> OptimizerResult<u64>;

    /// Updates every loaded column of one row.
    async fn update(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<u64>;

    /// Runs a transaction control statement.
    async fn transaction(&self, op: TxnOp) -> OptimizerResult<()>;
}

/// Runs a plan and then every batch-fetch directive on the results.
pub async fn execute(db: &dyn DbExecutor, query: &Query) -> OptimizerResult<Vec<Record>> {
    let mut records = db.fetch(query).await?;
    for prefetch in query.prefetches() {
        prefetch_related_objects(db, &mut records, prefetch).await?;
    }
    Ok(records)
}

/// Batch-fetches one to-many relation for `parents` and caches the results
/// on each parent. Directives nested in the inner query run on the fetched
/// rows before they are distributed.
pub fn prefetch_related_objects<'a>(
    db: &'a dyn DbExecutor,
    parents: &'a mut [Record],
    prefetch: &'a Prefetch,
) -> BoxFuture<'a, OptimizerResult<()>> {
    Box::pin(async move {
        let Some(first) = parents.first() else {
            return Ok(());
        };
        let meta = first.meta();
        let inner = inner_query(meta, prefetch)?;
        let keys: Vec<Value> = parents.iter().filter_map(Record::pk).collect();

        let pairs = db
            .fetch_related(meta, &prefetch.through, &keys, &inner)
            .await?;
        let (owners, mut rows): (Vec<Value>, Vec<Record>) = pairs.into_iter().unzip();
        for nested in inner.prefetches() {
            prefetch_related_objects(db, &mut rows, nested).await?;
        }

        attach_prefetched(parents, &prefetch.through, owners.into_iter().zip(rows));
        Ok(())
    })
}

/// The query for the related side of a directive: its own inner query or a
/// plain query over the relation's target model.
pub fn inner_query(parent: &'static ModelMeta, prefetch: &Prefetch) -> OptimizerResult<Query> {
    let field = parent
        .get_field(&prefetch.through)
        .filter(|f| f.is_to_many())
        .ok_or_else(|| OptimizerError::no_field(parent.label(), &prefetch.through))?;
    Ok(match &prefetch.inner {
        Some(q) => q.clone(),
        None => Query::new(field.related_meta().ok_or_else(|| {
            OptimizerError::no_field(parent.label(), &prefetch.through)
        })?),
    })
}

/// Caches `(owner key, record)` pairs under `relation` on the matching
/// parents. Parents with no match get an empty list.
pub fn attach_prefetched(
    parents: &mut [Record],
    relation: &str,
    pairs: impl IntoIterator<Item = (Value, Record)>,
) {
    let pairs: Vec<(Value, Record)> = pairs.into_iter().collect();
    for parent in parents.iter_mut() {
        let key = parent.pk();
        let children: Vec<Record> = pairs
            .iter()
            .filter(|(owner, _)| key.as_ref() == Some(owner))
            .map(|(_, r)| r.clone())
            .collect();
        parent.cache_related(relation, Related::Many(children));
    }
}

/// Finds the key of a row just inserted by a backend that does not report
/// keys: the last row, in key order, whose columns equal the record's
/// loaded values. Ambiguous when several rows share identical values.
pub async fn locate_inserted(
    db: &dyn DbExecutor,
    meta: &'static ModelMeta,
    record: &Record,
) -> OptimizerResult<Option<Value>> {
    let mut query = Query::new(meta).order_by([meta.pk]).only([meta.pk]);
    for (column, value) in record.values() {
        query = query.filter(column.clone(), value.clone());
    }
    let rows = db.fetch(&query).await?;
    Ok(rows.last().and_then(Record::pk))
}
