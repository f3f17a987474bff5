//! Field definitions for the ORM.
//!
//! A [`FieldDef`] describes one attribute of a model: a plain column, a
//! forward to-one relation (which owns an `<name>_id` column), or a to-many
//! relation (which owns no column on this table). The optimizer only needs
//! the cardinality of a relation and its target model, so relation targets
//! are resolved lazily through a function pointer to break cycles between
//! model definitions.

use crate::model::ModelMeta;

/// Resolves the target model of a relation.
pub type MetaRef = fn() -> &'static ModelMeta;

/// The kind of a field, as far as fetch planning is concerned.
#[derive(Clone, Copy)]
pub enum FieldKind {
    /// A plain column.
    Column,
    /// Many-to-one relation stored as `<name>_id` on this table.
    ForeignKey {
        /// The target model.
        to: MetaRef,
    },
    /// One-to-one relation stored as `<name>_id` on this table.
    OneToOne {
        /// The target model.
        to: MetaRef,
    },
    /// Reverse side of a foreign key declared on `to`.
    OneToMany {
        /// The model holding the foreign key.
        to: MetaRef,
        /// Name of the foreign key field on `to` pointing back here.
        remote_field: &'static str,
    },
    /// Many-to-many relation through an implicit link table.
    ManyToMany {
        /// The target model.
        to: MetaRef,
    },
}

impl std::fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Column => write!(f, "Column"),
            Self::ForeignKey { to } => write!(f, "ForeignKey({})", to().label()),
            Self::OneToOne { to } => write!(f, "OneToOne({})", to().label()),
            Self::OneToMany { to, remote_field } => {
                write!(f, "OneToMany({}.{remote_field})", to().label())
            }
            Self::ManyToMany { to } => write!(f, "ManyToMany({})", to().label()),
        }
    }
}

/// One field of a model.
///
/// # Examples
///
/// ```
/// use fetchplan_db::fields::FieldDef;
///
/// let title = FieldDef::column("title");
/// assert!(title.is_concrete());
/// assert_eq!(title.attname(), "title");
/// ```
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The attribute name.
    pub name: &'static str,
    /// Column vs relation cardinality.
    pub kind: FieldKind,
    /// Whether the column accepts NULL.
    pub null: bool,
}

impl FieldDef {
    /// A non-null plain column.
    pub const fn column(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Column,
            null: false,
        }
    }

    /// A many-to-one relation to `to`.
    pub const fn foreign_key(name: &'static str, to: MetaRef) -> Self {
        Self {
            name,
            kind: FieldKind::ForeignKey { to },
            null: false,
        }
    }

    /// A one-to-one relation to `to`.
    pub const fn one_to_one(name: &'static str, to: MetaRef) -> Self {
        Self {
            name,
            kind: FieldKind::OneToOne { to },
            null: false,
        }
    }

    /// The reverse side of `to.remote_field`.
    pub const fn one_to_many(name: &'static str, to: MetaRef, remote_field: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::OneToMany { to, remote_field },
            null: true,
        }
    }

    /// A many-to-many relation to `to`.
    pub const fn many_to_many(name: &'static str, to: MetaRef) -> Self {
        Self {
            name,
            kind: FieldKind::ManyToMany { to },
            null: true,
        }
    }

    /// Marks the field as nullable.
    pub const fn nullable(self) -> Self {
        Self { null: true, ..self }
    }

    /// Name of the attribute holding the raw column value: `<name>_id` for
    /// forward to-one relations, the field name otherwise.
    pub fn attname(&self) -> String {
        if self.is_to_one() {
            format!("{}_id", self.name)
        } else {
            self.name.to_string()
        }
    }

    /// Returns `true` for any relation.
    pub const fn is_relation(&self) -> bool {
        !matches!(self.kind, FieldKind::Column)
    }

    /// Returns `true` for many-to-one and one-to-one relations.
    pub const fn is_to_one(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::ForeignKey { .. } | FieldKind::OneToOne { .. }
        )
    }

    /// Returns `true` for one-to-many and many-to-many relations.
    pub const fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::OneToMany { .. } | FieldKind::ManyToMany { .. }
        )
    }

    /// Returns `true` if the field has a column on the owning table.
    pub const fn is_concrete(&self) -> bool {
        !self.is_to_many()
    }

    /// The target model of a relation.
    pub fn related_meta(&self) -> Option<&'static ModelMeta> {
        match self.kind {
            FieldKind::Column => None,
            FieldKind::ForeignKey { to }
            | FieldKind::OneToOne { to }
            | FieldKind::OneToMany { to, .. }
            | FieldKind::ManyToMany { to } => Some(to()),
        }
    }
}
