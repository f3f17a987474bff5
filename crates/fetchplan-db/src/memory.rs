//! In-memory backend.
//!
//! [`MemoryDb`] stores rows as column maps per table and implements
//! [`DbExecutor`] directly, so plans can be executed and round trips counted
//! without a database server. Every data statement increments the query
//! counter and is appended to a statement log; transaction statements are
//! logged but not counted. `BEGIN` and `SAVEPOINT` snapshot the tables, and
//! rolling back restores the snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use fetchplan_core::{OptimizerError, OptimizerResult};

use crate::executor::{DbExecutor, TxnOp};
use crate::fields::{FieldDef, FieldKind};
use crate::model::ModelMeta;
use crate::query::{Query, SelectRelated};
use crate::record::{Record, Related};
use crate::value::Value;

type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Row>,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: BTreeMap<String, Table>,
    links: BTreeMap<String, Vec<(Value, Value)>>,
}

#[derive(Debug, Default)]
struct DbState {
    data: Snapshot,
    saved: Vec<Snapshot>,
    statements: Vec<String>,
}

/// An in-memory [`DbExecutor`] with query counting.
#[derive(Debug)]
pub struct MemoryDb {
    state: Mutex<DbState>,
    query_count: AtomicUsize,
    returning_keys: bool,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    /// An empty database that reports inserted keys.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DbState::default()),
            query_count: AtomicUsize::new(0),
            returning_keys: true,
        }
    }

    /// An empty database whose inserts do not report the new keys, like a
    /// backend without `RETURNING` support.
    pub fn without_returning() -> Self {
        Self {
            returning_keys: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().expect("memory db lock poisoned")
    }

    fn record_statement(&self, state: &mut DbState, statement: String) {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(statement = %statement, "memory db");
        state.statements.push(statement);
    }

    // ── Fixtures ────────────────────────────────────────────────────

    /// Inserts a row without counting it as a query. Fields are given by
    /// name or attname; a missing primary key is assigned.
    pub fn seed(&self, meta: &'static ModelMeta, fields: &[(&str, Value)]) -> OptimizerResult<Value> {
        let mut row = Row::new();
        let mut pk = None;
        for (name, value) in fields {
            if meta.is_pk(name) {
                pk = Some(value.clone());
                continue;
            }
            let column = meta
                .column_for(name)
                .ok_or_else(|| OptimizerError::no_field(meta.label(), *name))?;
            row.insert(column, value.clone());
        }
        let mut state = self.lock();
        insert_row(&mut state.data, meta, pk, row)
    }

    /// Links two rows through a many-to-many relation declared on `meta`.
    pub fn link(
        &self,
        meta: &'static ModelMeta,
        field: &str,
        left: impl Into<Value>,
        right: impl Into<Value>,
    ) -> OptimizerResult<()> {
        let def = meta
            .get_field(field)
            .filter(|f| matches!(f.kind, FieldKind::ManyToMany { .. }))
            .ok_or_else(|| OptimizerError::no_field(meta.label(), field))?;
        let mut state = self.lock();
        state
            .data
            .links
            .entry(link_table(meta, def))
            .or_default()
            .push((left.into(), right.into()));
        Ok(())
    }

    /// All stored rows of a model, primary key included.
    pub fn rows(&self, meta: &'static ModelMeta) -> Vec<BTreeMap<String, Value>> {
        self.lock()
            .data
            .tables
            .get(&meta.db_table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of stored rows of a model.
    pub fn row_count(&self, meta: &'static ModelMeta) -> usize {
        self.lock()
            .data
            .tables
            .get(&meta.db_table)
            .map_or(0, |t| t.rows.len())
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Number of data statements executed since the last reset.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Resets the query counter to zero.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::SeqCst);
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// The transaction statements executed so far, in order.
    pub fn transaction_log(&self) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .filter(|s| is_transaction_statement(s))
            .cloned()
            .collect()
    }

    /// Clears the statement log.
    pub fn clear_statements(&self) {
        self.lock().statements.clear();
    }
}

#[async_trait::async_trait]
impl DbExecutor for MemoryDb {
    async fn fetch(&self, query: &Query) -> OptimizerResult<Vec<Record>> {
        let mut state = self.lock();
        self.record_statement(&mut state, format!("SELECT {}", query.meta().db_table));
        let rows = select_rows(&state.data, query)?;
        rows.iter()
            .map(|row| materialize(&state.data, query, row))
            .collect()
    }

    async fn fetch_values(&self, query: &Query) -> OptimizerResult<Vec<BTreeMap<String, Value>>> {
        let meta = query.meta();
        let mut state = self.lock();
        self.record_statement(&mut state, format!("SELECT {} (values)", meta.db_table));
        let fields: Vec<String> = match query.projection() {
            Some(p) if !p.fields().is_empty() => p.fields().to_vec(),
            _ => query.loaded_columns(),
        };
        let columns = fields
            .iter()
            .map(|f| {
                meta.column_for(f)
                    .ok_or_else(|| OptimizerError::no_field(meta.label(), f))
            })
            .collect::<OptimizerResult<Vec<_>>>()?;
        let rows = select_rows(&state.data, query)?;
        Ok(rows
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .zip(&columns)
                    .map(|(f, c)| (f.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    async fn count(&self, query: &Query) -> OptimizerResult<u64> {
        let mut state = self.lock();
        self.record_statement(&mut state, format!("SELECT COUNT {}", query.meta().db_table));
        let rows = select_rows(&state.data, query)?;
        Ok(rows.len() as u64)
    }

    async fn fetch_related(
        &self,
        parent: &'static ModelMeta,
        relation: &str,
        parent_keys: &[Value],
        inner: &Query,
    ) -> OptimizerResult<Vec<(Value, Record)>> {
        let field = parent
            .get_field(relation)
            .filter(|f| f.is_to_many())
            .ok_or_else(|| OptimizerError::no_field(parent.label(), relation))?;
        let target = inner.meta();
        let mut state = self.lock();
        self.record_statement(
            &mut state,
            format!("SELECT {} (prefetch {relation})", target.db_table),
        );

        let candidates = select_rows(&state.data, inner)?;
        let mut pairs = Vec::new();
        match field.kind {
            FieldKind::OneToMany { remote_field, .. } => {
                let column = target
                    .column_for(remote_field)
                    .ok_or_else(|| OptimizerError::no_field(target.label(), remote_field))?;
                for row in &candidates {
                    let owner = row.get(&column).cloned().unwrap_or(Value::Null);
                    if parent_keys.contains(&owner) {
                        pairs.push((owner, materialize(&state.data, inner, row)?));
                    }
                }
            }
            FieldKind::ManyToMany { .. } => {
                let links = state
                    .data
                    .links
                    .get(&link_table(parent, field))
                    .cloned()
                    .unwrap_or_default();
                for row in &candidates {
                    let key = row.get(target.pk).cloned().unwrap_or(Value::Null);
                    for (left, right) in &links {
                        if *right == key && parent_keys.contains(left) {
                            pairs.push((left.clone(), materialize(&state.data, inner, row)?));
                        }
                    }
                }
            }
            _ => return Err(OptimizerError::no_field(parent.label(), relation)),
        }
        Ok(pairs)
    }

    async fn load_columns(
        &self,
        meta: &'static ModelMeta,
        pk: &Value,
        columns: &[String],
    ) -> OptimizerResult<BTreeMap<String, Value>> {
        let mut state = self.lock();
        self.record_statement(
            &mut state,
            format!("SELECT {} ({})", meta.db_table, columns.join(", ")),
        );
        let row = find_row(&state.data, meta, pk).ok_or_else(|| {
            OptimizerError::DoesNotExist(format!("{} matching query does not exist.", meta.label()))
        })?;
        columns
            .iter()
            .map(|name| {
                let column = meta
                    .column_for(name)
                    .ok_or_else(|| OptimizerError::no_field(meta.label(), name))?;
                Ok((column.clone(), row.get(&column).cloned().unwrap_or(Value::Null)))
            })
            .collect()
    }

    async fn insert(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<Option<Value>> {
        let mut state = self.lock();
        self.record_statement(&mut state, format!("INSERT {}", meta.db_table));
        let key = insert_row(&mut state.data, meta, record.pk(), record.values().clone())?;
        Ok(self.returning_keys.then_some(key))
    }

    async fn bulk_insert(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
    ) -> OptimizerResult<Vec<Option<Value>>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.lock();
        self.record_statement(
            &mut state,
            format!("BULK INSERT {} ({} rows)", meta.db_table, records.len()),
        );
        let snapshot = state.data.clone();
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            match insert_row(&mut state.data, meta, record.pk(), record.values().clone()) {
                Ok(key) => keys.push(self.returning_keys.then_some(key)),
                Err(e) => {
                    state.data = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(keys)
    }

    async fn bulk_update(
        &self,
        meta: &'static ModelMeta,
        records: &[Record],
        columns: &[String],
    ) -> OptimizerResult<u64> {
        if records.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        self.record_statement(
            &mut state,
            format!("BULK UPDATE {} ({} rows)", meta.db_table, records.len()),
        );
        let mut updated = 0;
        for record in records {
            let Some(pk) = record.pk() else { continue };
            let Some(row) = find_row_mut(&mut state.data, meta, &pk) else {
                continue;
            };
            for column in columns {
                if let Some(value) = record.values().get(column) {
                    row.insert(column.clone(), value.clone());
                }
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn update(&self, meta: &'static ModelMeta, record: &Record) -> OptimizerResult<u64> {
        let pk = record.pk().ok_or_else(|| {
            OptimizerError::DatabaseError(format!("cannot update {} without a primary key", meta.label()))
        })?;
        let mut state = self.lock();
        self.record_statement(&mut state, format!("UPDATE {}", meta.db_table));
        let Some(row) = find_row_mut(&mut state.data, meta, &pk) else {
            return Ok(0);
        };
        for (column, value) in record.values() {
            row.insert(column.clone(), value.clone());
        }
        Ok(1)
    }

    async fn transaction(&self, op: TxnOp) -> OptimizerResult<()> {
        let mut state = self.lock();
        let statement = match &op {
            TxnOp::Begin => "BEGIN".to_string(),
            TxnOp::Commit => "COMMIT".to_string(),
            TxnOp::Rollback => "ROLLBACK".to_string(),
            TxnOp::Savepoint(name) => format!("SAVEPOINT {name}"),
            TxnOp::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {name}"),
            TxnOp::RollbackToSavepoint(name) => format!("ROLLBACK TO SAVEPOINT {name}"),
        };
        state.statements.push(statement);
        match op {
            TxnOp::Begin | TxnOp::Savepoint(_) => {
                let snapshot = state.data.clone();
                state.saved.push(snapshot);
            }
            TxnOp::Commit | TxnOp::ReleaseSavepoint(_) => {
                state.saved.pop().ok_or_else(no_transaction)?;
            }
            TxnOp::Rollback | TxnOp::RollbackToSavepoint(_) => {
                state.data = state.saved.pop().ok_or_else(no_transaction)?;
            }
        }
        Ok(())
    }
}

fn no_transaction() -> OptimizerError {
    OptimizerError::DatabaseError("no active transaction".to_string())
}

fn is_transaction_statement(statement: &str) -> bool {
    ["BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE"]
        .iter()
        .any(|prefix| statement.starts_with(prefix))
}

fn link_table(meta: &ModelMeta, field: &FieldDef) -> String {
    format!("{}_{}", meta.db_table, field.name)
}

fn insert_row(
    data: &mut Snapshot,
    meta: &'static ModelMeta,
    pk: Option<Value>,
    mut row: Row,
) -> OptimizerResult<Value> {
    let table = data.tables.entry(meta.db_table.clone()).or_default();
    let key = match pk {
        Some(key) => {
            if table.rows.iter().any(|r| r.get(meta.pk) == Some(&key)) {
                return Err(OptimizerError::IntegrityError(format!(
                    "UNIQUE constraint failed: {}.{}",
                    meta.db_table, meta.pk
                )));
            }
            if let Some(n) = key.as_int() {
                table.next_id = table.next_id.max(n);
            }
            key
        }
        None => {
            table.next_id += 1;
            Value::Int(table.next_id)
        }
    };
    for column in meta.value_columns() {
        row.entry(column).or_insert(Value::Null);
    }
    row.insert(meta.pk.to_string(), key.clone());
    table.rows.push(row);
    Ok(key)
}

fn find_row<'a>(data: &'a Snapshot, meta: &ModelMeta, pk: &Value) -> Option<&'a Row> {
    data.tables
        .get(&meta.db_table)?
        .rows
        .iter()
        .find(|r| r.get(meta.pk) == Some(pk))
}

fn find_row_mut<'a>(data: &'a mut Snapshot, meta: &ModelMeta, pk: &Value) -> Option<&'a mut Row> {
    data.tables
        .get_mut(&meta.db_table)?
        .rows
        .iter_mut()
        .find(|r| r.get(meta.pk) == Some(pk))
}

/// Filters, orders and limits the rows of the queried table.
fn select_rows(data: &Snapshot, query: &Query) -> OptimizerResult<Vec<Row>> {
    let meta = query.meta();
    let filters = query
        .filters()
        .iter()
        .map(|(field, value)| {
            meta.column_for(field)
                .map(|c| (c, value))
                .ok_or_else(|| OptimizerError::no_field(meta.label(), field))
        })
        .collect::<OptimizerResult<Vec<_>>>()?;
    let ordering = query
        .ordering()
        .iter()
        .map(|key| {
            let (name, descending) = key
                .strip_prefix('-')
                .map_or((key.as_str(), false), |n| (n, true));
            meta.column_for(name)
                .map(|c| (c, descending))
                .ok_or_else(|| OptimizerError::no_field(meta.label(), name))
        })
        .collect::<OptimizerResult<Vec<_>>>()?;

    let mut rows: Vec<Row> = data
        .tables
        .get(&meta.db_table)
        .map(|t| t.rows.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|row| {
            filters
                .iter()
                .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == *value)
        })
        .cloned()
        .collect();

    if !ordering.is_empty() {
        rows.sort_by(|a, b| {
            ordering
                .iter()
                .map(|(column, descending)| {
                    let left = a.get(column).unwrap_or(&Value::Null);
                    let right = b.get(column).unwrap_or(&Value::Null);
                    let ord = left.sort_cmp(right);
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    if let Some(limit) = query.row_limit() {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// The to-one relations a plan joins.
fn joined_relations(query: &Query) -> OptimizerResult<Vec<&'static FieldDef>> {
    let meta = query.meta();
    let loaded: BTreeSet<String> = query.loaded_columns().into_iter().collect();
    match query.select_related_state() {
        SelectRelated::None => Ok(Vec::new()),
        SelectRelated::All => Ok(meta
            .fields
            .iter()
            .filter(|f| f.is_to_one() && !f.null && loaded.contains(&f.attname()))
            .collect()),
        SelectRelated::Fields(names) => names
            .iter()
            .map(|name| {
                let field = meta
                    .get_field(name)
                    .filter(|f| f.is_to_one())
                    .ok_or_else(|| OptimizerError::no_field(meta.label(), name))?;
                if !loaded.contains(&field.attname()) {
                    return Err(OptimizerError::DatabaseError(format!(
                        "Field {}.{} cannot be both deferred and traversed using select_related at the same time.",
                        meta.label(),
                        field.name
                    )));
                }
                Ok(field)
            })
            .collect(),
    }
}

/// Builds a record from a stored row, loading only the plan's columns and
/// caching joined relations.
fn materialize(data: &Snapshot, query: &Query, row: &Row) -> OptimizerResult<Record> {
    let meta = query.meta();
    let loaded: BTreeSet<String> = query.loaded_columns().into_iter().collect();
    let mut values = BTreeMap::new();
    let mut deferred = BTreeSet::new();
    for column in meta.value_columns() {
        if loaded.contains(&column) {
            values.insert(column.clone(), row.get(&column).cloned().unwrap_or(Value::Null));
        } else {
            deferred.insert(column);
        }
    }
    let pk = row.get(meta.pk).cloned().unwrap_or(Value::Null);
    let mut record = Record::from_db(meta, pk, values, deferred);

    for field in joined_relations(query)? {
        let Some(target) = field.related_meta() else {
            continue;
        };
        let key = row.get(&field.attname()).cloned().unwrap_or(Value::Null);
        let related = if key.is_null() {
            None
        } else {
            find_row(data, target, &key)
                .map(|r| materialize(data, &Query::new(target), r))
                .transpose()?
                .map(Box::new)
        };
        record.cache_related(field.name, Related::One(related));
    }
    Ok(record)
}
