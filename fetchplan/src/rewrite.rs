//! Plan rewriting.
//!
//! Applies learned [`FieldSets`] to a [`Query`] in three passes whose order
//! matters: eager joins first, then batch fetches, then column restriction,
//! which has to see the final join set because a joined relation's key
//! column must be loaded.

use std::collections::BTreeSet;

use fetchplan_db::{LoadingMode, Prefetch, Query, SelectRelated};

use crate::location::Location;
use crate::registry::FieldSets;

/// A batch-fetch directive added by the rewriter. Its inner query is run as
/// an optimized query of its own, learning under `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFetch {
    /// The relation name.
    pub through: String,
    /// Where the related rows' field usage is recorded.
    pub location: Location,
}

/// Returns `true` if a plan may still be rewritten: it has not produced
/// results and does not project flat values.
pub fn can_rewrite(query: &Query, fetched: bool) -> bool {
    !fetched && query.projection().is_none()
}

/// Applies all three passes and returns the batch fetches it added.
pub fn rewrite(query: &mut Query, sets: &FieldSets, location: &Location) -> Vec<ChildFetch> {
    eager_join_pass(query, &sets.select);
    let children = batch_fetch_pass(query, &sets.prefetch, location);
    column_restriction_pass(query, &sets.only);
    tracing::debug!(
        location = %location,
        select = ?query.select_related_state(),
        prefetch = ?query.prefetch_lookups(),
        only = ?query.deferred_loading(),
        "rewrote plan"
    );
    children
}

/// Joins the learned to-one relations. A wildcard join is left alone, and an
/// empty set adds nothing rather than clearing manual joins.
pub fn eager_join_pass(query: &mut Query, select: &BTreeSet<String>) {
    if matches!(query.select_related_state(), SelectRelated::All) || select.is_empty() {
        return;
    }
    let meta = query.meta();
    let names: Vec<String> = select
        .iter()
        .filter_map(|name| meta.get_field(name))
        .filter(|f| f.is_to_one())
        .map(|f| f.name.to_string())
        .collect();
    query.add_select_related(names);
}

/// Adds a batch fetch for every learned to-many relation the plan does not
/// already fetch, each with its own inner query and child location.
pub fn batch_fetch_pass(
    query: &mut Query,
    prefetch: &BTreeSet<String>,
    location: &Location,
) -> Vec<ChildFetch> {
    let meta = query.meta();
    let existing = query.prefetch_lookups();
    let mut children = Vec::new();
    for name in prefetch {
        if existing.contains(name) {
            continue;
        }
        let Some(field) = meta.get_field(name).filter(|f| f.is_to_many()) else {
            continue;
        };
        let Some(target) = field.related_meta() else {
            continue;
        };
        query.add_prefetch(Prefetch::with_query(field.name, Query::new(target)));
        children.push(ChildFetch {
            through: field.name.to_string(),
            location: location.with_name(target.model_name),
        });
    }
    children
}

/// Restricts loaded columns to `only`, the primary key and the joined
/// relations, reconciled with any restriction already on the plan. Runs only
/// when something was learned or the plan already restricts columns.
pub fn column_restriction_pass(query: &mut Query, only: &BTreeSet<String>) {
    let (existing, mode) = query.deferred_loading();
    if only.is_empty() && mode == LoadingMode::Defer {
        return;
    }
    let meta = query.meta();
    let mut fields: BTreeSet<String> = only
        .iter()
        .filter(|name| meta.column_for(name).is_some())
        .cloned()
        .collect();
    fields.insert(meta.pk.to_string());
    if let SelectRelated::Fields(joined) = query.select_related_state() {
        fields.extend(joined.iter().cloned());
    }
    match mode {
        LoadingMode::Defer => fields.retain(|f| !existing.contains(f)),
        LoadingMode::Only => fields.extend(existing.iter().cloned()),
    }
    query.add_immediate_loading(fields);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchplan_db::{FieldDef, ModelMeta};
    use std::sync::LazyLock;

    fn owner_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new("acct", "owner", "id", vec![FieldDef::column("id")])
        });
        &META
    }

    fn comment_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new(
                "acct",
                "comment",
                "id",
                vec![
                    FieldDef::column("id"),
                    FieldDef::foreign_key("report", report_meta),
                ],
            )
        });
        &META
    }

    fn report_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new(
                "acct",
                "report",
                "id",
                vec![
                    FieldDef::column("id"),
                    FieldDef::column("title"),
                    FieldDef::column("body"),
                    FieldDef::foreign_key("owner", owner_meta),
                    FieldDef::one_to_many("comments", comment_meta, "report"),
                ],
            )
        });
        &META
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn loc() -> Location {
        Location::new("src/models/user", "create_report", "report")
    }

    #[test]
    fn test_eager_join_adds_learned_relations() {
        let mut q = Query::new(report_meta());
        eager_join_pass(&mut q, &set(&["owner", "comments", "missing"]));
        assert_eq!(*q.select_related_state(), SelectRelated::Fields(set(&["owner"])));
    }

    #[test]
    fn test_eager_join_keeps_wildcard() {
        let mut q = Query::new(report_meta()).select_related_all();
        eager_join_pass(&mut q, &set(&["owner"]));
        assert_eq!(*q.select_related_state(), SelectRelated::All);
    }

    #[test]
    fn test_eager_join_empty_keeps_manual_joins() {
        let mut q = Query::new(report_meta()).select_related(["owner"]);
        eager_join_pass(&mut q, &BTreeSet::new());
        assert_eq!(*q.select_related_state(), SelectRelated::Fields(set(&["owner"])));
    }

    #[test]
    fn test_batch_fetch_adds_child_with_location() {
        let mut q = Query::new(report_meta());
        let children = batch_fetch_pass(&mut q, &set(&["comments", "owner"]), &loc());
        assert_eq!(q.prefetch_lookups(), vec!["comments"]);
        assert_eq!(children.len(), 1);
        assert_eq!(
            children[0].location.key(),
            "src/models/user/create_report/comment"
        );
        assert!(q.prefetches()[0].inner.is_some());
    }

    #[test]
    fn test_batch_fetch_skips_existing_directive() {
        let mut q = Query::new(report_meta()).prefetch_related(["comments"]);
        let children = batch_fetch_pass(&mut q, &set(&["comments"]), &loc());
        assert!(children.is_empty());
        assert_eq!(q.prefetches().len(), 1);
        assert!(q.prefetches()[0].inner.is_none());
    }

    #[test]
    fn test_column_restriction_includes_pk_and_joins() {
        let mut q = Query::new(report_meta()).select_related(["owner"]);
        column_restriction_pass(&mut q, &set(&["title"]));
        let (names, mode) = q.deferred_loading();
        assert_eq!(mode, LoadingMode::Only);
        assert_eq!(*names, set(&["id", "owner", "title"]));
    }

    #[test]
    fn test_column_restriction_skipped_when_nothing_learned() {
        let mut q = Query::new(report_meta());
        column_restriction_pass(&mut q, &BTreeSet::new());
        assert_eq!(q.deferred_loading().1, LoadingMode::Defer);
        assert!(q.deferred_loading().0.is_empty());
    }

    #[test]
    fn test_column_restriction_subtracts_existing_defer() {
        let mut q = Query::new(report_meta()).defer(["body"]);
        column_restriction_pass(&mut q, &set(&["title", "body"]));
        assert_eq!(*q.deferred_loading().0, set(&["id", "title"]));
    }

    #[test]
    fn test_column_restriction_unions_existing_only() {
        let mut q = Query::new(report_meta()).only(["body"]);
        column_restriction_pass(&mut q, &set(&["title"]));
        assert_eq!(*q.deferred_loading().0, set(&["body", "id", "title"]));

        // An existing only-restriction is still completed with the key
        // when nothing was learned.
        let mut q = Query::new(report_meta()).only(["body"]);
        column_restriction_pass(&mut q, &BTreeSet::new());
        assert_eq!(*q.deferred_loading().0, set(&["body", "id"]));
    }

    #[test]
    fn test_rewrite_order_lets_only_see_joins() {
        let mut q = Query::new(report_meta());
        let sets = FieldSets {
            select: set(&["owner"]),
            prefetch: set(&["comments"]),
            only: set(&["title"]),
        };
        let children = rewrite(&mut q, &sets, &loc());
        assert_eq!(children.len(), 1);
        assert_eq!(*q.deferred_loading().0, set(&["id", "owner", "title"]));
        assert_eq!(q.loaded_columns(), vec!["id", "title", "owner_id"]);
    }

    #[test]
    fn test_can_rewrite_guards() {
        let mut q = Query::new(report_meta());
        assert!(can_rewrite(&q, false));
        assert!(!can_rewrite(&q, true));
        q.set_projection(fetchplan_db::Projection::Values(vec!["title".into()]));
        assert!(!can_rewrite(&q, false));
    }
}
