//! Model trait and metadata for the ORM.
//!
//! [`ModelMeta`] is the per-model description the optimizer introspects:
//! table name, primary key and field definitions. [`Model`] gives typed
//! entry points (`optimizer.query::<Report>()`) without requiring a struct
//! per row, since records are materialized as dynamic [`Record`](crate::record::Record)s.

use crate::fields::FieldDef;

/// The trait implemented by marker types that name a model.
///
/// # Examples
///
/// ```
/// use fetchplan_db::fields::FieldDef;
/// use fetchplan_db::model::{Model, ModelMeta};
/// use std::sync::LazyLock;
///
/// struct Article;
///
/// impl Model for Article {
///     fn meta() -> &'static ModelMeta {
///         static META: LazyLock<ModelMeta> = LazyLock::new(|| {
///             ModelMeta::new("blog", "article", "id", vec![
///                 FieldDef::column("id"),
///                 FieldDef::column("title"),
///             ])
///         });
///         &META
///     }
/// }
///
/// assert_eq!(Article::meta().label(), "blog.article");
/// assert_eq!(Article::meta().db_table, "blog_article");
/// ```
pub trait Model: Send + Sync + 'static {
    /// Returns the static metadata for this model type.
    fn meta() -> &'static ModelMeta;
}

/// Metadata about a model.
#[derive(Debug)]
pub struct ModelMeta {
    /// The application label (e.g., "blog").
    pub app_label: &'static str,
    /// The model name in lowercase (e.g., "report").
    pub model_name: &'static str,
    /// The database table name.
    pub db_table: String,
    /// Name of the primary key column.
    pub pk: &'static str,
    /// Field definitions, primary key included.
    pub fields: Vec<FieldDef>,
}

impl ModelMeta {
    /// Creates metadata with the conventional `<app>_<model>` table name.
    pub fn new(
        app_label: &'static str,
        model_name: &'static str,
        pk: &'static str,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            app_label,
            model_name,
            db_table: format!("{app_label}_{model_name}"),
            pk,
            fields,
        }
    }

    /// Fully-qualified label, `app_label.model_name`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.model_name)
    }

    /// Looks a field up by name or by attname (`owner` or `owner_id`).
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|f| f.is_to_one() && f.attname() == name)
            })
    }

    /// Returns `true` if `name` is the primary key (or the `pk` alias).
    pub fn is_pk(&self, name: &str) -> bool {
        name == self.pk || name == "pk"
    }

    /// Fields that own a column on this table, primary key included.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Column names (attnames) of every concrete field except the primary key.
    pub fn value_columns(&self) -> Vec<String> {
        self.concrete_fields()
            .filter(|f| f.name != self.pk)
            .map(FieldDef::attname)
            .collect()
    }

    /// Maps a field name or attname to its column name, if concrete.
    pub fn column_for(&self, name: &str) -> Option<String> {
        if self.is_pk(name) {
            return Some(self.pk.to_string());
        }
        self.get_field(name)
            .filter(|f| f.is_concrete())
            .map(FieldDef::attname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    fn owner_meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new("acct", "owner", "id", vec![FieldDef::column("id")])
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
                    FieldDef::foreign_key("owner", owner_meta).nullable(),
                    FieldDef::many_to_many("readers", owner_meta),
                ],
            )
        });
        &META
    }

    #[test]
    fn test_label_and_table() {
        let meta = report_meta();
        assert_eq!(meta.label(), "acct.report");
        assert_eq!(meta.db_table, "acct_report");
    }

    #[test]
    fn test_get_field_by_name_and_attname() {
        let meta = report_meta();
        assert_eq!(meta.get_field("owner").unwrap().name, "owner");
        assert_eq!(meta.get_field("owner_id").unwrap().name, "owner");
        assert!(meta.get_field("title_id").is_none());
        assert!(meta.get_field("missing").is_none());
    }

    #[test]
    fn test_value_columns_skip_pk_and_to_many() {
        assert_eq!(report_meta().value_columns(), vec!["title", "owner_id"]);
    }

    #[test]
    fn test_column_for() {
        let meta = report_meta();
        assert_eq!(meta.column_for("pk").as_deref(), Some("id"));
        assert_eq!(meta.column_for("owner").as_deref(), Some("owner_id"));
        assert_eq!(meta.column_for("title").as_deref(), Some("title"));
        assert!(meta.column_for("readers").is_none());
        assert!(meta.column_for("nope").is_none());
    }
}
