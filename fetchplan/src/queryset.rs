//! The optimizing queryset.
//!
//! An [`OptimizerQuerySet`] pairs a [`Query`] with the [`Location`] it was
//! built at. Before its first execution it reads the location's learned
//! field sets and rewrites the plan; after execution it wraps the records
//! in [`ObservedRecord`]s that report reads back under the same location.
//!
//! Batch fetches added by the rewriter run as child querysets of their own,
//! each with the child location of its relation, so nested rows learn and
//! are optimized independently of their parents.

use std::collections::BTreeMap;
use std::sync::Arc;

use fetchplan_core::logging::query_span;
use fetchplan_core::{OptimizerError, OptimizerResult};
use fetchplan_db::executor::{inner_query, prefetch_related_objects, BoxFuture};
use fetchplan_db::{
    DbExecutor, FieldKind, LoadingMode, ModelMeta, Prefetch, Projection, Query, Record, Value,
};
use tracing::Instrument;

use crate::location::Location;
use crate::observer::{ObservedRecord, Observer};
use crate::registry::code::{describe_plan, CodeRegistry, CodeSite};
use crate::registry::FieldRegistry;
use crate::rewrite::{self, ChildFetch};

/// A query that rewrites itself from, and reports back to, the registry.
#[derive(Debug, Clone)]
pub struct OptimizerQuerySet {
    query: Query,
    location: Location,
    registry: Arc<FieldRegistry>,
    optimize: bool,
    observe: bool,
    optimized: bool,
    children: Vec<ChildFetch>,
    only_was_empty: bool,
    annotation: Option<(Arc<CodeRegistry>, CodeSite)>,
}

impl OptimizerQuerySet {
    /// A queryset over `query` learning under `location`.
    pub fn new(query: Query, location: Location, registry: Arc<FieldRegistry>) -> Self {
        Self {
            query,
            location,
            registry,
            optimize: true,
            observe: true,
            optimized: false,
            children: Vec::new(),
            only_was_empty: true,
            annotation: None,
        }
    }

    /// Enables or disables plan rewriting.
    pub fn optimization(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    /// Enables or disables wrapping records in observers.
    pub fn observation(mut self, enabled: bool) -> Self {
        self.observe = enabled;
        self
    }

    /// Records the rewritten plan for `site` in `registry`.
    pub fn annotate_into(mut self, registry: Arc<CodeRegistry>, site: CodeSite) -> Self {
        self.annotation = Some((registry, site));
        self
    }

    // ── Builders ────────────────────────────────────────────────────

    /// See [`Query::filter`].
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query = self.query.filter(field, value);
        self
    }

    /// See [`Query::order_by`].
    pub fn order_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.order_by(fields);
        self
    }

    /// See [`Query::limit`].
    pub fn limit(mut self, n: usize) -> Self {
        self.query = self.query.limit(n);
        self
    }

    /// See [`Query::select_related`].
    pub fn select_related<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.select_related(fields);
        self
    }

    /// See [`Query::select_related_all`].
    pub fn select_related_all(mut self) -> Self {
        self.query = self.query.select_related_all();
        self
    }

    /// See [`Query::only`].
    pub fn only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.only(fields);
        self
    }

    /// See [`Query::defer`].
    pub fn defer<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.defer(fields);
        self
    }

    /// See [`Query::prefetch_related`].
    pub fn prefetch_related<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.prefetch_related(fields);
        self
    }

    /// See [`Query::prefetch_with`].
    pub fn prefetch_with(mut self, prefetch: Prefetch) -> Self {
        self.query = self.query.prefetch_with(prefetch);
        self
    }

    // ── Introspection ──────────────────────────────────────────────

    /// The current plan.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The location this queryset learns under.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Returns `true` once the plan has been rewritten (or skipped).
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    // ── Optimization ───────────────────────────────────────────────

    /// Reads the learned field sets and rewrites the plan. Runs at most
    /// once; later calls are no-ops. Skipped for the empty location, for
    /// projections and when both rewriting and observation are disabled.
    pub async fn optimize(&mut self) -> OptimizerResult<()> {
        if self.optimized {
            return Ok(());
        }
        self.optimized = true;
        if self.location.is_empty() || !(self.optimize || self.observe) {
            return Ok(());
        }
        let sets = self.registry.get(&self.location).await?;
        self.only_was_empty = sets.only.is_empty();
        if self.optimize && rewrite::can_rewrite(&self.query, false) {
            let before = describe_plan(&self.query);
            self.children = rewrite::rewrite(&mut self.query, &sets, &self.location);
            if let Some((registry, site)) = &self.annotation {
                let after = describe_plan(&self.query);
                if after != before {
                    registry.record(site, &after).await?;
                }
            }
        }
        Ok(())
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Optimizes, runs the plan and its batch fetches, and returns the
    /// records wrapped for observation.
    pub async fn fetch(mut self, db: &dyn DbExecutor) -> OptimizerResult<Vec<ObservedRecord>> {
        let span = query_span(&self.location.key(), &self.query.meta().label());
        async move {
            self.optimize().await?;
            let records = db.fetch(&self.query).await?;
            self.load(db, records).await
        }
        .instrument(span)
        .await
    }

    /// The first record in key order (or the plan's order), if any.
    pub async fn first(self, db: &dyn DbExecutor) -> OptimizerResult<Option<ObservedRecord>> {
        let pk = self.query.meta().pk;
        let qs = if self.query.ordering().is_empty() {
            self.order_by([pk])
        } else {
            self
        };
        Ok(qs.limit(1).fetch(db).await?.pop())
    }

    /// Exactly one record.
    pub async fn get(self, db: &dyn DbExecutor) -> OptimizerResult<ObservedRecord> {
        let label = self.query.meta().label();
        let mut records = self.fetch(db).await?;
        match records.len() {
            1 => Ok(records.remove(0)),
            0 => Err(OptimizerError::DoesNotExist(format!(
                "{label} matching query does not exist."
            ))),
            n => Err(OptimizerError::MultipleObjectsReturned(format!(
                "get() returned more than one {label} -- it returned {n}!"
            ))),
        }
    }

    /// The number of matching rows.
    pub async fn count(self, db: &dyn DbExecutor) -> OptimizerResult<u64> {
        db.count(&self.query).await
    }

    /// Rows as field → value maps. The plan is optimized first; rows are
    /// not observed.
    pub async fn values(
        mut self,
        db: &dyn DbExecutor,
        fields: &[&str],
    ) -> OptimizerResult<Vec<BTreeMap<String, Value>>> {
        self.optimize().await?;
        self.query.set_projection(Projection::Values(to_strings(fields)));
        db.fetch_values(&self.query).await
    }

    /// Rows as lists in field order, or with `flat` a single column as plain
    /// values. `flat` requires exactly one field.
    pub async fn values_list(
        mut self,
        db: &dyn DbExecutor,
        fields: &[&str],
        flat: bool,
    ) -> OptimizerResult<Vec<Value>> {
        if flat && fields.len() != 1 {
            return Err(OptimizerError::ConfigurationError(
                "'flat' is only valid when values_list is called with exactly one field.".into(),
            ));
        }
        self.optimize().await?;
        let names = if fields.is_empty() {
            self.query.loaded_columns()
        } else {
            to_strings(fields)
        };
        self.query.set_projection(Projection::ValuesList {
            fields: names.clone(),
            flat,
        });
        let rows = db.fetch_values(&self.query).await?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                let mut values: Vec<Value> = names
                    .iter()
                    .map(|n| row.remove(n).unwrap_or(Value::Null))
                    .collect();
                if flat {
                    values.pop().unwrap_or(Value::Null)
                } else {
                    Value::List(values)
                }
            })
            .collect())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn child(&self, query: Query, location: Location) -> Self {
        Self::new(query, location, Arc::clone(&self.registry))
            .optimization(self.optimize)
            .observation(self.observe)
    }

    fn observer(&self) -> Option<Arc<Observer>> {
        (self.observe && !self.location.is_empty()).then(|| {
            Arc::new(Observer::new(
                Arc::clone(&self.registry),
                self.location.clone(),
                self.query.prefetch_lookups(),
                self.only_was_empty,
            ))
        })
    }

    /// Runs the batch fetches of the plan on `records` and wraps them.
    fn load<'a>(
        &'a self,
        db: &'a dyn DbExecutor,
        mut records: Vec<Record>,
    ) -> BoxFuture<'a, OptimizerResult<Vec<ObservedRecord>>> {
        Box::pin(async move {
            let meta = self.query.meta();
            let mut nested: Vec<(String, Vec<(Value, ObservedRecord)>)> = Vec::new();
            for prefetch in self.query.prefetches() {
                match self.children.iter().find(|c| c.through == prefetch.through) {
                    Some(child) if !records.is_empty() => {
                        let keys: Vec<Value> = records.iter().filter_map(Record::pk).collect();
                        let inner = inner_query(meta, prefetch)?;
                        let mut qs = self.child(inner, child.location.clone());
                        let pairs = qs.fetch_related(db, meta, &prefetch.through, &keys).await?;
                        nested.push((prefetch.through.clone(), pairs));
                    }
                    Some(_) => {}
                    None => prefetch_related_objects(db, &mut records, prefetch).await?,
                }
            }

            let observer = self.observer();
            Ok(records
                .into_iter()
                .map(|record| {
                    let key = record.pk();
                    let mut wrapped = ObservedRecord::new(record, observer.clone());
                    for (relation, pairs) in &nested {
                        let children = pairs
                            .iter()
                            .filter(|(owner, _)| key.as_ref() == Some(owner))
                            .map(|(_, child)| child.clone())
                            .collect();
                        wrapped.attach(relation, children);
                    }
                    wrapped
                })
                .collect())
        })
    }

    /// Runs this queryset as the related side of `parent.relation`.
    async fn fetch_related(
        &mut self,
        db: &dyn DbExecutor,
        parent: &'static ModelMeta,
        relation: &str,
        parent_keys: &[Value],
    ) -> OptimizerResult<Vec<(Value, ObservedRecord)>> {
        self.optimize().await?;
        if let Some(remote) = parent
            .get_field(relation)
            .and_then(|f| match f.kind {
                FieldKind::OneToMany { remote_field, .. } => Some(remote_field),
                _ => None,
            })
        {
            keep_column(&mut self.query, remote);
        }
        let pairs = db
            .fetch_related(parent, relation, parent_keys, &self.query)
            .await?;
        let (owners, rows): (Vec<Value>, Vec<Record>) = pairs.into_iter().unzip();
        let observed = self.load(db, rows).await?;
        Ok(owners.into_iter().zip(observed).collect())
    }
}

/// Makes sure an only-restriction keeps `field`, which the batch fetch
/// needs to distribute rows to their parents.
fn keep_column(query: &mut Query, field: &str) {
    let (names, mode) = query.deferred_loading();
    if mode == LoadingMode::Only && !names.contains(field) {
        let mut names = names.clone();
        names.insert(field.to_string());
        query.add_immediate_loading(names);
    }
}

fn to_strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| (*f).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchplan_db::{FieldDef, MemoryDb, SelectRelated};
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
                    FieldDef::column("year"),
                    FieldDef::foreign_key("author", author_meta),
                ],
            )
        });
        &META
    }

    fn loc() -> Location {
        Location::new("src/catalog", "list_books", "book")
    }

    fn fixture() -> MemoryDb {
        let db = MemoryDb::new();
        let author = db.seed(author_meta(), &[("name", Value::from("le guin"))]).unwrap();
        for (title, year) in [("earthsea", 1968), ("dispossessed", 1974)] {
            db.seed(
                book_meta(),
                &[
                    ("title", Value::from(title)),
                    ("year", Value::from(year)),
                    ("author_id", author.clone()),
                ],
            )
            .unwrap();
        }
        db
    }

    fn books(registry: &Arc<FieldRegistry>, location: Location) -> OptimizerQuerySet {
        OptimizerQuerySet::new(Query::new(book_meta()), location, Arc::clone(registry))
    }

    #[tokio::test]
    async fn test_optimize_applies_registry_once() {
        let registry = Arc::new(FieldRegistry::in_memory());
        registry
            .add_field(&loc(), crate::registry::FieldCategory::Select, "author")
            .await
            .unwrap();
        let mut qs = books(&registry, loc());
        qs.optimize().await.unwrap();
        assert!(qs.is_optimized());
        assert!(matches!(qs.query().select_related_state(), SelectRelated::Fields(_)));

        // Learning more after the rewrite does not touch this plan again.
        registry
            .add_field(&loc(), crate::registry::FieldCategory::Only, "title")
            .await
            .unwrap();
        qs.optimize().await.unwrap();
        assert_eq!(qs.query().deferred_loading().1, LoadingMode::Defer);
    }

    #[tokio::test]
    async fn test_empty_location_is_not_observed() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        let mut rows = books(&registry, Location::empty()).fetch(&db).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_observed());
        rows[0].value(&db, "title").await.unwrap();
        assert!(registry.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_optimization_still_observes() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        registry
            .add_field(&loc(), crate::registry::FieldCategory::Select, "author")
            .await
            .unwrap();
        let mut rows = books(&registry, loc())
            .optimization(false)
            .fetch(&db)
            .await
            .unwrap();
        assert!(!rows[0].record().is_cached("author"));
        rows[0].value(&db, "year").await.unwrap();
        assert!(registry.get(&loc()).await.unwrap().only.contains("year"));
    }

    #[tokio::test]
    async fn test_disabled_observation_returns_plain_records() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        let rows = books(&registry, loc())
            .observation(false)
            .fetch(&db)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| !r.is_observed()));
    }

    #[tokio::test]
    async fn test_get_reports_missing_and_multiple() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        let err = books(&registry, loc())
            .filter("title", "lathe")
            .get(&db)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Object does not exist: lib.book matching query does not exist."
        );
        let err = books(&registry, loc()).get(&db).await.unwrap_err();
        assert!(matches!(err, OptimizerError::MultipleObjectsReturned(ref m) if m.ends_with("it returned 2!")));

        let one = books(&registry, loc())
            .filter("year", 1974)
            .get(&db)
            .await
            .unwrap();
        assert_eq!(one.record().get("title").unwrap(), Value::from("dispossessed"));
    }

    #[tokio::test]
    async fn test_first_and_count() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        let first = books(&registry, loc()).first(&db).await.unwrap().unwrap();
        assert_eq!(first.pk(), Some(Value::Int(1)));
        let last = books(&registry, loc())
            .order_by(["-year"])
            .first(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.pk(), Some(Value::Int(2)));
        assert_eq!(books(&registry, loc()).count(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_values_and_values_list() {
        let db = fixture();
        let registry = Arc::new(FieldRegistry::in_memory());
        let rows = books(&registry, loc())
            .order_by(["year"])
            .values(&db, &["title"])
            .await
            .unwrap();
        assert_eq!(rows[0]["title"], Value::from("earthsea"));

        let titles = books(&registry, loc())
            .order_by(["year"])
            .values_list(&db, &["title"], true)
            .await
            .unwrap();
        assert_eq!(titles, vec![Value::from("earthsea"), Value::from("dispossessed")]);

        let pairs = books(&registry, loc())
            .order_by(["year"])
            .values_list(&db, &["title", "year"], false)
            .await
            .unwrap();
        assert_eq!(
            pairs[1],
            Value::List(vec![Value::from("dispossessed"), Value::Int(1974)])
        );

        let err = books(&registry, loc())
            .values_list(&db, &["title", "year"], true)
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::ConfigurationError(_)));
    }
}
