//! Query plan state.
//!
//! A [`Query`] describes what to fetch without touching storage: filters,
//! ordering, which to-one relations to join eagerly, which columns to load,
//! which to-many relations to batch-fetch afterwards, and an optional flat
//! projection. Builder methods consume and return the query so plans read
//! like chained querysets.
//!
//! Column restriction follows the usual defer/only semantics: the plan keeps
//! one set of names plus a [`LoadingMode`] telling whether the set lists the
//! columns to skip or the only columns to load.

use std::collections::BTreeSet;

use crate::model::ModelMeta;
use crate::value::Value;

/// Eager-join configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectRelated {
    /// No joins.
    None,
    /// Join every non-null to-one relation.
    All,
    /// Join exactly these relations.
    Fields(BTreeSet<String>),
}

/// Meaning of the deferred-loading name set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingMode {
    /// The set lists columns NOT to load.
    Defer,
    /// The set lists the only columns to load (primary key implied).
    Only,
}

/// One batch-fetch directive.
#[derive(Debug, Clone)]
pub struct Prefetch {
    /// The relation name the results are attached under.
    pub through: String,
    /// Optional query applied to the related rows.
    pub inner: Option<Query>,
}

impl Prefetch {
    /// A directive with no custom inner query.
    pub fn new(through: impl Into<String>) -> Self {
        Self {
            through: through.into(),
            inner: None,
        }
    }

    /// A directive whose related rows are fetched with `inner`.
    pub fn with_query(through: impl Into<String>, inner: Query) -> Self {
        Self {
            through: through.into(),
            inner: Some(inner),
        }
    }
}

/// A flat projection replacing record materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Rows as field → value maps.
    Values(Vec<String>),
    /// Rows as tuples; `flat` returns a single column as a plain list.
    ValuesList {
        /// Projected fields, in order.
        fields: Vec<String>,
        /// Whether to flatten single-column rows.
        flat: bool,
    },
}

impl Projection {
    /// The projected fields, in order.
    pub fn fields(&self) -> &[String] {
        match self {
            Self::Values(fields) | Self::ValuesList { fields, .. } => fields,
        }
    }
}

/// The fetch plan for one model.
#[derive(Debug, Clone)]
pub struct Query {
    meta: &'static ModelMeta,
    filters: Vec<(String, Value)>,
    ordering: Vec<String>,
    limit: Option<usize>,
    select_related: SelectRelated,
    deferred_loading: (BTreeSet<String>, LoadingMode),
    prefetch: Vec<Prefetch>,
    projection: Option<Projection>,
}

impl Query {
    /// A plan selecting every row and column of `meta`.
    pub fn new(meta: &'static ModelMeta) -> Self {
        Self {
            meta,
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            select_related: SelectRelated::None,
            deferred_loading: (BTreeSet::new(), LoadingMode::Defer),
            prefetch: Vec::new(),
            projection: None,
        }
    }

    // ── Builders ────────────────────────────────────────────────────

    /// Adds an exact-match filter on a field name, attname or `pk`.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Orders by fields; a leading `-` sorts descending.
    pub fn order_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Limits the number of rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Eagerly joins the given to-one relations, adding to any joins
    /// already requested.
    pub fn select_related<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_select_related(fields.into_iter().map(Into::into));
        self
    }

    /// Eagerly joins every to-one relation.
    pub fn select_related_all(mut self) -> Self {
        self.select_related = SelectRelated::All;
        self
    }

    /// Loads only the given columns (primary key implied).
    pub fn only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_immediate_loading(fields.into_iter().map(Into::into));
        self
    }

    /// Skips loading the given columns.
    pub fn defer<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_deferred_loading(fields.into_iter().map(Into::into));
        self
    }

    /// Batch-fetches the given to-many relations.
    pub fn prefetch_related<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for through in fields {
            self.add_prefetch(Prefetch::new(through));
        }
        self
    }

    /// Batch-fetches a relation with a custom inner query.
    pub fn prefetch_with(mut self, prefetch: Prefetch) -> Self {
        self.add_prefetch(prefetch);
        self
    }

    // ── In-place mutation ──────────────────────────────────────────

    /// Adds eager joins. A wildcard join stays a wildcard.
    pub fn add_select_related(&mut self, fields: impl IntoIterator<Item = String>) {
        match &mut self.select_related {
            SelectRelated::All => {}
            SelectRelated::Fields(existing) => existing.extend(fields),
            SelectRelated::None => {
                let set: BTreeSet<String> = fields.into_iter().collect();
                if !set.is_empty() {
                    self.select_related = SelectRelated::Fields(set);
                }
            }
        }
    }

    /// `only()` semantics: with an existing defer set the new set is
    /// `fields - deferred`; otherwise it replaces the existing only set.
    pub fn add_immediate_loading(&mut self, fields: impl IntoIterator<Item = String>) {
        let pk = self.meta.pk;
        let mut names: BTreeSet<String> = fields
            .into_iter()
            .map(|f| if f == "pk" { pk.to_string() } else { f })
            .collect();
        if self.deferred_loading.1 == LoadingMode::Defer {
            names.retain(|f| !self.deferred_loading.0.contains(f));
        }
        self.deferred_loading = (names, LoadingMode::Only);
    }

    /// `defer()` semantics: extends a defer set, or removes the names from
    /// an only set.
    pub fn add_deferred_loading(&mut self, fields: impl IntoIterator<Item = String>) {
        let (existing, mode) = &mut self.deferred_loading;
        match mode {
            LoadingMode::Defer => existing.extend(fields),
            LoadingMode::Only => {
                for f in fields {
                    existing.remove(&f);
                }
            }
        }
    }

    /// Appends a batch-fetch directive unless one with the same `through`
    /// already exists.
    pub fn add_prefetch(&mut self, prefetch: Prefetch) {
        if !self.prefetch.iter().any(|p| p.through == prefetch.through) {
            self.prefetch.push(prefetch);
        }
    }

    /// Sets a flat projection.
    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = Some(projection);
    }

    // ── Introspection ──────────────────────────────────────────────

    /// The queried model.
    pub const fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    /// Exact-match filters.
    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    /// Ordering fields.
    pub fn ordering(&self) -> &[String] {
        &self.ordering
    }

    /// Row limit.
    pub const fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Current eager-join configuration.
    pub const fn select_related_state(&self) -> &SelectRelated {
        &self.select_related
    }

    /// Current column restriction.
    pub const fn deferred_loading(&self) -> (&BTreeSet<String>, LoadingMode) {
        (&self.deferred_loading.0, self.deferred_loading.1)
    }

    /// Current batch-fetch directives.
    pub fn prefetches(&self) -> &[Prefetch] {
        &self.prefetch
    }

    /// Relation names covered by batch-fetch directives.
    pub fn prefetch_lookups(&self) -> Vec<String> {
        self.prefetch.iter().map(|p| p.through.clone()).collect()
    }

    /// The projection, if any.
    pub const fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    /// Column names this plan loads for each row, primary key first.
    pub fn loaded_columns(&self) -> Vec<String> {
        let meta = self.meta;
        let (names, mode) = self.deferred_loading();
        let columns: BTreeSet<String> = names.iter().filter_map(|n| meta.column_for(n)).collect();
        let mut loaded = vec![meta.pk.to_string()];
        loaded.extend(
            meta.value_columns()
                .into_iter()
                .filter(|c| match mode {
                    LoadingMode::Defer => !columns.contains(c),
                    LoadingMode::Only => columns.contains(c),
                }),
        );
        loaded
    }
}
