//! Materialized rows.
//!
//! A [`Record`] is one row of a model: its primary-key slot, the column
//! values that were loaded, the columns that were deferred by a column
//! restriction, and a cache of related records filled by eager joins, batch
//! fetches or lazy loads.
//!
//! The primary key lives in a [`PrimaryKey`] slot rather than among the
//! plain values because a record saved inside a deferred-write scope has a
//! key that does not exist yet: the slot then holds a [`DeferredPk`] that
//! resolves it on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use fetchplan_core::{OptimizerError, OptimizerResult};

use crate::executor::DbExecutor;
use crate::model::ModelMeta;
use crate::value::Value;

/// Something able to produce the primary key of a record whose insert was
/// postponed.
#[async_trait::async_trait]
pub trait KeyResolver: Send + Sync {
    /// Stable identity of the pending write behind this resolver.
    fn id(&self) -> u64;

    /// The key, if it is already known.
    fn resolved(&self) -> Option<Value>;

    /// Returns the key, writing the record first if that has not happened yet.
    /// Must insert at most once however often it is called.
    async fn resolve(&self, db: &dyn DbExecutor) -> OptimizerResult<Value>;
}

/// A forwarding placeholder for a primary key that is not assigned yet.
#[derive(Clone)]
pub struct DeferredPk {
    resolver: Arc<dyn KeyResolver>,
}

impl DeferredPk {
    /// Wraps a resolver.
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    /// Identity of the pending write.
    pub fn id(&self) -> u64 {
        self.resolver.id()
    }

    /// The key without forcing a write.
    pub fn resolved(&self) -> Option<Value> {
        self.resolver.resolved()
    }

    /// The key, forcing the pending write if needed.
    pub async fn resolve(&self, db: &dyn DbExecutor) -> OptimizerResult<Value> {
        self.resolver.resolve(db).await
    }
}

impl fmt::Debug for DeferredPk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolved() {
            Some(v) => write!(f, "DeferredPk(#{} = {v})", self.id()),
            None => write!(f, "DeferredPk(#{} pending)", self.id()),
        }
    }
}

/// The primary-key slot of a record.
#[derive(Debug, Clone)]
pub enum PrimaryKey {
    /// No key yet; saving inserts.
    Unset,
    /// Insert postponed by a deferred-write scope.
    Deferred(DeferredPk),
    /// A concrete key.
    Set(Value),
}

/// Cached related objects of one relation.
#[derive(Debug, Clone)]
pub enum Related {
    /// A to-one relation; `None` when the foreign key is NULL.
    One(Option<Box<Record>>),
    /// A to-many relation.
    Many(Vec<Record>),
}

/// One row of a model.
#[derive(Debug, Clone)]
pub struct Record {
    meta: &'static ModelMeta,
    pk: PrimaryKey,
    values: BTreeMap<String, Value>,
    deferred: BTreeSet<String>,
    related: BTreeMap<String, Related>,
    adding: bool,
}

impl Record {
    /// A new, unsaved record with no values.
    pub fn new(meta: &'static ModelMeta) -> Self {
        Self {
            meta,
            pk: PrimaryKey::Unset,
            values: BTreeMap::new(),
            deferred: BTreeSet::new(),
            related: BTreeMap::new(),
            adding: true,
        }
    }

    /// A record loaded from storage. `values` are keyed by column name and
    /// `deferred` lists the columns the query did not load.
    pub fn from_db(
        meta: &'static ModelMeta,
        pk: Value,
        values: BTreeMap<String, Value>,
        deferred: BTreeSet<String>,
    ) -> Self {
        Self {
            meta,
            pk: PrimaryKey::Set(pk),
            values,
            deferred,
            related: BTreeMap::new(),
            adding: false,
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> OptimizerResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// The model this record belongs to.
    pub fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    // ── Primary key ─────────────────────────────────────────────────

    /// The primary key, if known. A deferred key that has not been resolved
    /// yet reads as `None`; use [`resolve_pk`](Self::resolve_pk) to force it.
    pub fn pk(&self) -> Option<Value> {
        match &self.pk {
            PrimaryKey::Unset => None,
            PrimaryKey::Deferred(d) => d.resolved(),
            PrimaryKey::Set(v) => Some(v.clone()),
        }
    }

    /// The raw primary-key slot.
    pub const fn pk_slot(&self) -> &PrimaryKey {
        &self.pk
    }

    /// Sets a concrete primary key.
    pub fn set_pk(&mut self, value: Value) {
        self.pk = if value.is_null() {
            PrimaryKey::Unset
        } else {
            PrimaryKey::Set(value)
        };
    }

    /// Replaces the key with a forwarding placeholder.
    pub fn set_deferred_pk(&mut self, pk: DeferredPk) {
        self.pk = PrimaryKey::Deferred(pk);
    }

    /// Resolves a deferred key (inserting the pending copy if it has not been
    /// written yet) and stores the concrete value in the slot.
    pub async fn resolve_pk(&mut self, db: &dyn DbExecutor) -> OptimizerResult<Option<Value>> {
        if let PrimaryKey::Deferred(d) = &self.pk {
            let key = d.resolve(db).await?;
            self.pk = PrimaryKey::Set(key);
            self.adding = false;
        }
        Ok(self.pk())
    }

    /// `true` until the record has been loaded from or written to storage.
    pub const fn is_adding(&self) -> bool {
        self.adding
    }

    /// Records that the row now exists in storage.
    pub fn mark_saved(&mut self) {
        self.adding = false;
    }

    // ── Column values ───────────────────────────────────────────────

    /// Sets a field by name or attname. Setting a to-one relation by value
    /// stores the raw key and drops any cached related record.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> OptimizerResult<()> {
        let value = value.into();
        let meta = self.meta;
        if meta.is_pk(field) {
            self.set_pk(value);
            return Ok(());
        }
        let def = meta
            .get_field(field)
            .filter(|f| f.is_concrete())
            .ok_or_else(|| OptimizerError::no_field(meta.label(), field))?;
        let column = def.attname();
        if def.is_relation() {
            self.related.remove(def.name);
        }
        self.deferred.remove(&column);
        self.values.insert(column, value);
        Ok(())
    }

    /// Points a to-one relation at `target` (or clears it) and caches the
    /// target. The target must already have a key.
    pub fn set_related(&mut self, field: &str, target: Option<&Self>) -> OptimizerResult<()> {
        let meta = self.meta;
        let def = meta
            .get_field(field)
            .filter(|f| f.is_to_one())
            .ok_or_else(|| OptimizerError::no_field(meta.label(), field))?;
        let key = match target {
            Some(t) => t.pk().ok_or_else(|| {
                OptimizerError::IntegrityError(format!(
                    "save() prohibited: related object '{}' of {} has no primary key",
                    def.name,
                    meta.label()
                ))
            })?,
            None => Value::Null,
        };
        let name = def.name;
        let column = def.attname();
        self.deferred.remove(&column);
        self.values.insert(column, key);
        self.related.insert(
            name.to_string(),
            Related::One(target.map(|t| Box::new(t.detached()))),
        );
        Ok(())
    }

    /// Reads a column by field name or attname. To-one relation names read
    /// the raw key.
    pub fn get(&self, field: &str) -> OptimizerResult<Value> {
        if self.meta.is_pk(field) {
            return Ok(self.pk().unwrap_or(Value::Null));
        }
        let column = self
            .meta
            .column_for(field)
            .ok_or_else(|| OptimizerError::no_field(self.meta.label(), field))?;
        if self.deferred.contains(&column) {
            return Err(OptimizerError::FieldDeferred {
                model: self.meta.label(),
                field: field.to_string(),
            });
        }
        Ok(self.values.get(&column).cloned().unwrap_or(Value::Null))
    }

    /// Returns `true` if the column behind `field` was not loaded.
    pub fn is_deferred(&self, field: &str) -> bool {
        self.meta
            .column_for(field)
            .is_some_and(|c| self.deferred.contains(&c))
    }

    /// Columns not loaded by the query that produced this record.
    pub const fn deferred_columns(&self) -> &BTreeSet<String> {
        &self.deferred
    }

    /// Loaded column values, primary key excluded.
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Stores freshly loaded column values and un-defers them.
    pub fn load_values(&mut self, loaded: BTreeMap<String, Value>) {
        for (column, value) in loaded {
            self.deferred.remove(&column);
            self.values.insert(column, value);
        }
    }

    // ── Related cache ───────────────────────────────────────────────

    /// The cached value of a relation, if any.
    pub fn cached(&self, relation: &str) -> Option<&Related> {
        self.related.get(relation)
    }

    /// Returns `true` if a relation value is resident.
    pub fn is_cached(&self, relation: &str) -> bool {
        self.related.contains_key(relation)
    }

    /// Stores a relation value.
    pub fn cache_related(&mut self, relation: &str, related: Related) {
        self.related.insert(relation.to_string(), related);
    }

    /// Mutable access to the cached records of a relation.
    pub fn cached_mut(&mut self, relation: &str) -> Option<&mut Related> {
        self.related.get_mut(relation)
    }

    /// A copy without cached relations, for handing to a writer that must
    /// not see later changes to `self`.
    pub fn detached(&self) -> Self {
        Self {
            meta: self.meta,
            pk: self.pk.clone(),
            values: self.values.clone(),
            deferred: self.deferred.clone(),
            related: BTreeMap::new(),
            adding: self.adding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use std::sync::LazyLock;

    fn author_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new(
                "lib",
                "author",
                "id",
                vec![FieldDef::column("id"), FieldDef::column("name")],
            )
        });
        &META
    }

    fn book_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new(
                "lib",
                "book",
                "id",
                vec![
                    FieldDef::column("id"),
                    FieldDef::column("title"),
                    FieldDef::foreign_key("author", author_meta).nullable(),
                ],
            )
        });
        &META
    }

    #[test]
    fn test_new_record_is_adding() {
        let r = Record::new(book_meta());
        assert!(r.is_adding());
        assert!(r.pk().is_none());
        assert!(matches!(r.pk_slot(), PrimaryKey::Unset));
    }

    #[test]
    fn test_set_and_get() {
        let r = Record::new(book_meta())
            .with("title", "Dune")
            .unwrap()
            .with("author_id", 3)
            .unwrap();
        assert_eq!(r.get("title").unwrap(), Value::from("Dune"));
        assert_eq!(r.get("author").unwrap(), Value::Int(3));
        assert_eq!(r.get("author_id").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_set_unknown_field_fails() {
        let mut r = Record::new(book_meta());
        let err = r.set("isbn", "x").unwrap_err();
        assert!(matches!(err, OptimizerError::FieldDoesNotExist { .. }));
    }

    #[test]
    fn test_pk_alias_and_null() {
        let mut r = Record::new(book_meta());
        r.set("pk", 9).unwrap();
        assert_eq!(r.pk(), Some(Value::Int(9)));
        r.set_pk(Value::Null);
        assert!(r.pk().is_none());
    }

    #[test]
    fn test_deferred_column_read_fails() {
        let mut values = BTreeMap::new();
        values.insert("title".to_string(), Value::from("Dune"));
        let deferred = BTreeSet::from(["author_id".to_string()]);
        let mut r = Record::from_db(book_meta(), Value::Int(1), values, deferred);

        assert!(!r.is_adding());
        assert!(r.is_deferred("author"));
        assert!(matches!(
            r.get("author_id").unwrap_err(),
            OptimizerError::FieldDeferred { .. }
        ));

        r.load_values(BTreeMap::from([("author_id".to_string(), Value::Int(4))]));
        assert!(!r.is_deferred("author"));
        assert_eq!(r.get("author_id").unwrap(), Value::Int(4));
    }

    #[test]
    fn test_set_related_requires_key() {
        let author = Record::new(author_meta());
        let mut book = Record::new(book_meta());
        let err = book.set_related("author", Some(&author)).unwrap_err();
        assert!(matches!(err, OptimizerError::IntegrityError(_)));

        let mut author = author;
        author.set_pk(Value::Int(7));
        book.set_related("author", Some(&author)).unwrap();
        assert_eq!(book.get("author_id").unwrap(), Value::Int(7));
        assert!(book.is_cached("author"));

        // Assigning the raw key drops the stale cache.
        book.set("author", 8).unwrap();
        assert!(!book.is_cached("author"));
    }

    #[test]
    fn test_detached_drops_related_cache() {
        let mut book = Record::new(book_meta());
        book.cache_related("author", Related::One(None));
        let copy = book.detached();
        assert!(book.is_cached("author"));
        assert!(!copy.is_cached("author"));
    }
}
