//! Field-access observation.
//!
//! Records fetched through an optimized query come back as
//! [`ObservedRecord`]s. Every read through one of them reports the field to
//! the registry entry of the location the record was fetched from, then
//! returns the underlying value unchanged. Reads are classified by field
//! kind:
//!
//! - plain column: `only`, but only while that location had no `only`
//!   fields at fetch time
//! - to-one relation: `select` when the related record is not resident
//! - to-many relation: `prefetch` when the query did not batch-fetch it
//!
//! Loading a deferred column reports it to `only` unconditionally, so a
//! location whose column restriction turned out too narrow widens again.

use std::collections::BTreeMap;
use std::sync::Arc;

use fetchplan_core::{OptimizerError, OptimizerResult};
use fetchplan_db::{DbExecutor, FieldDef, ModelMeta, Query, Record, Related, Value};

use crate::location::Location;
use crate::registry::{FieldCategory, FieldRegistry};

/// Reports field reads of records fetched at one location.
#[derive(Debug)]
pub struct Observer {
    registry: Arc<FieldRegistry>,
    location: Location,
    prefetch_lookups: Vec<String>,
    only_was_empty: bool,
}

impl Observer {
    /// An observer for records fetched at `location` by a query that
    /// batch-fetched `prefetch_lookups`.
    pub fn new(
        registry: Arc<FieldRegistry>,
        location: Location,
        prefetch_lookups: Vec<String>,
        only_was_empty: bool,
    ) -> Self {
        Self {
            registry,
            location,
            prefetch_lookups,
            only_was_empty,
        }
    }

    /// The location reads are reported under.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Reports a plain read of `field`.
    pub async fn column_read(&self, meta: &'static ModelMeta, field: &str) -> OptimizerResult<()> {
        if !self.only_was_empty {
            return Ok(());
        }
        let Some(def) = tracked_field(meta, field).filter(|f| !f.is_to_many()) else {
            return Ok(());
        };
        self.registry
            .add_field(&self.location, FieldCategory::Only, def.name)
            .await?;
        Ok(())
    }

    /// Reports traversal of a to-one relation. `cached` tells whether the
    /// related record was resident before the read.
    pub async fn to_one_read(
        &self,
        meta: &'static ModelMeta,
        field: &str,
        cached: bool,
    ) -> OptimizerResult<()> {
        let Some(def) = tracked_field(meta, field).filter(|f| f.is_to_one()) else {
            return Ok(());
        };
        self.column_read(meta, def.name).await?;
        if !cached {
            self.registry
                .add_field(&self.location, FieldCategory::Select, def.name)
                .await?;
        }
        Ok(())
    }

    /// Reports traversal of a to-many relation.
    pub async fn to_many_read(&self, meta: &'static ModelMeta, field: &str) -> OptimizerResult<()> {
        let Some(def) = tracked_field(meta, field).filter(|f| f.is_to_many()) else {
            return Ok(());
        };
        if self.prefetch_lookups.iter().any(|p| p == def.name) {
            return Ok(());
        }
        self.registry
            .add_field(&self.location, FieldCategory::Prefetch, def.name)
            .await?;
        Ok(())
    }

    /// Reports columns loaded on demand.
    pub async fn refreshed(&self, meta: &'static ModelMeta, fields: &[String]) -> OptimizerResult<()> {
        let names: Vec<&str> = fields
            .iter()
            .filter_map(|f| tracked_field(meta, f))
            .filter(|f| f.is_concrete())
            .map(|f| f.name)
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        self.registry
            .add_fields(&self.location, FieldCategory::Only, names)
            .await?;
        Ok(())
    }
}

/// The definition of a field worth reporting: not internal, not the key.
fn tracked_field(meta: &'static ModelMeta, field: &str) -> Option<&'static FieldDef> {
    if field.starts_with('_') || meta.is_pk(field) {
        return None;
    }
    meta.get_field(field)
}

/// A fetched record whose reads are reported to the registry.
///
/// Records built without an observer (observation disabled, or fetched
/// outside application code) behave the same but report nothing.
#[derive(Debug, Clone)]
pub struct ObservedRecord {
    record: Record,
    observer: Option<Arc<Observer>>,
    children: BTreeMap<String, Vec<ObservedRecord>>,
}

impl ObservedRecord {
    /// Wraps `record`; reads report through `observer` when present.
    pub fn new(record: Record, observer: Option<Arc<Observer>>) -> Self {
        Self {
            record,
            observer,
            children: BTreeMap::new(),
        }
    }

    /// Wraps `record` without observation.
    pub fn unobserved(record: Record) -> Self {
        Self::new(record, None)
    }

    /// Returns `true` if reads are reported.
    pub fn is_observed(&self) -> bool {
        self.observer.is_some()
    }

    /// The location reads are reported under, if observed.
    pub fn location(&self) -> Option<&Location> {
        self.observer.as_deref().map(Observer::location)
    }

    /// The primary key. Key reads are never reported.
    pub fn pk(&self) -> Option<Value> {
        self.record.pk()
    }

    /// The underlying record. Reads through it are not reported.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Mutable access to the underlying record, for assignments and saves.
    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    /// Unwraps the record.
    pub fn into_record(self) -> Record {
        self.record
    }

    /// Reads a column, loading it first if the query deferred it.
    pub async fn value(&mut self, db: &dyn DbExecutor, field: &str) -> OptimizerResult<Value> {
        if self.record.is_deferred(field) {
            self.refresh_from_db(db, &[field]).await?;
        } else if let Some(observer) = &self.observer {
            observer.column_read(self.record.meta(), field).await?;
        }
        self.record.get(field)
    }

    /// Loads the given columns from storage and reports them.
    pub async fn refresh_from_db(&mut self, db: &dyn DbExecutor, fields: &[&str]) -> OptimizerResult<()> {
        let meta = self.record.meta();
        let pk = self.record.pk().ok_or_else(|| {
            OptimizerError::DoesNotExist(format!(
                "{} instance has no primary key to refresh from",
                meta.label()
            ))
        })?;
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let loaded = db.load_columns(meta, &pk, &fields).await?;
        self.record.load_values(loaded);
        if let Some(observer) = &self.observer {
            observer.refreshed(meta, &fields).await?;
        }
        Ok(())
    }

    /// Follows a to-one relation, loading the target if it was not joined.
    /// Returns `None` when the foreign key is NULL.
    pub async fn related(&mut self, db: &dyn DbExecutor, field: &str) -> OptimizerResult<Option<&Record>> {
        let meta = self.record.meta();
        let def = meta
            .get_field(field)
            .filter(|f| f.is_to_one())
            .ok_or_else(|| OptimizerError::no_field(meta.label(), field))?;
        let cached = self.record.is_cached(def.name);
        if let Some(observer) = &self.observer {
            observer.to_one_read(meta, def.name, cached).await?;
        }
        if !cached {
            if self.record.is_deferred(def.name) {
                self.refresh_from_db(db, &[def.name]).await?;
            }
            let target = load_target(db, def, self.record.get(def.name)?).await?;
            self.record
                .cache_related(def.name, Related::One(target.map(Box::new)));
        }
        match self.record.cached(def.name) {
            Some(Related::One(target)) => Ok(target.as_deref()),
            _ => Ok(None),
        }
    }

    /// Follows a to-many relation. Batch-fetched rows are returned as
    /// fetched, observed under the relation's own location; anything else
    /// is loaded with one query and returned unobserved.
    pub async fn related_many(
        &mut self,
        db: &dyn DbExecutor,
        field: &str,
    ) -> OptimizerResult<&mut [ObservedRecord]> {
        let meta = self.record.meta();
        let def = meta
            .get_field(field)
            .filter(|f| f.is_to_many())
            .ok_or_else(|| OptimizerError::no_field(meta.label(), field))?;
        if let Some(observer) = &self.observer {
            observer.to_many_read(meta, def.name).await?;
        }
        if !self.children.contains_key(def.name) {
            let rows = match self.record.cached(def.name) {
                Some(Related::Many(rows)) => rows.clone(),
                _ => {
                    let rows = load_many(db, &self.record, def).await?;
                    self.record.cache_related(def.name, Related::Many(rows.clone()));
                    rows
                }
            };
            self.children.insert(
                def.name.to_string(),
                rows.into_iter().map(Self::unobserved).collect(),
            );
        }
        match self.children.get_mut(def.name) {
            Some(children) => Ok(children.as_mut_slice()),
            None => Ok(&mut []),
        }
    }

    /// Saves the underlying record through the process-wide save path.
    pub async fn save(&mut self, db: &dyn DbExecutor) -> OptimizerResult<()> {
        fetchplan_db::save(&mut self.record, db).await
    }

    /// Attaches batch-fetched, already observed rows of `relation`.
    pub(crate) fn attach(&mut self, relation: &str, children: Vec<Self>) {
        self.record.cache_related(
            relation,
            Related::Many(children.iter().map(|c| c.record.clone()).collect()),
        );
        self.children.insert(relation.to_string(), children);
    }
}

async fn load_target(
    db: &dyn DbExecutor,
    def: &'static FieldDef,
    key: Value,
) -> OptimizerResult<Option<Record>> {
    if key.is_null() {
        return Ok(None);
    }
    let Some(target) = def.related_meta() else {
        return Ok(None);
    };
    let rows = db.fetch(&Query::new(target).filter(target.pk, key)).await?;
    rows.into_iter().next().map(Some).ok_or_else(|| {
        OptimizerError::DoesNotExist(format!("{} matching query does not exist.", target.label()))
    })
}

async fn load_many(
    db: &dyn DbExecutor,
    record: &Record,
    def: &'static FieldDef,
) -> OptimizerResult<Vec<Record>> {
    let meta = record.meta();
    let (Some(pk), Some(target)) = (record.pk(), def.related_meta()) else {
        return Ok(Vec::new());
    };
    let pairs = db
        .fetch_related(meta, def.name, &[pk], &Query::new(target))
        .await?;
    Ok(pairs.into_iter().map(|(_, r)| r).collect())
}
