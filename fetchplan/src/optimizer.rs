//! The optimizer handle.
//!
//! An [`Optimizer`] bundles settings, a [`Locator`] and a shared
//! [`FieldRegistry`], and builds [`OptimizerQuerySet`]s stamped with the
//! location they were built at. With `offsite_optimization` it also holds
//! a [`CodeRegistry`] recording each rewrite under the query's source line.
//!
//! ```
//! use fetchplan::{call_site, Optimizer};
//! use fetchplan_core::Settings;
//! use fetchplan_db::{FieldDef, ModelMeta};
//! use std::sync::LazyLock;
//!
//! fn report() -> &'static ModelMeta {
//!     static META: LazyLock<ModelMeta> = LazyLock::new(|| {
//!         ModelMeta::new("acct", "report", "id", vec![FieldDef::column("id")])
//!     });
//!     &META
//! }
//!
//! let optimizer = Optimizer::in_memory(Settings::default());
//! let qs = optimizer.query_meta(report(), call_site!());
//! assert!(qs.location().key().ends_with("/report"));
//! ```

use std::sync::Arc;

use fetchplan_core::{OptimizerResult, Settings};
use fetchplan_db::{Model, ModelMeta, Query};

use crate::location::{CallSite, Location, Locator};
use crate::queryset::OptimizerQuerySet;
use crate::registry::code::{CodeRegistry, CodeSite};
use crate::registry::store::store_from_settings;
use crate::registry::FieldRegistry;

/// Builds optimized querysets.
#[derive(Debug, Clone)]
pub struct Optimizer {
    settings: Settings,
    locator: Locator,
    registry: Arc<FieldRegistry>,
    code_registry: Option<Arc<CodeRegistry>>,
}

impl Optimizer {
    /// An optimizer over an existing registry.
    pub fn new(settings: Settings, registry: Arc<FieldRegistry>) -> Self {
        Self {
            locator: Locator::from_settings(&settings),
            settings,
            registry,
            code_registry: None,
        }
    }

    /// An optimizer whose registry stores are chosen by
    /// `settings.field_registry` and `settings.code_registry`.
    pub fn from_settings(settings: Settings) -> OptimizerResult<Self> {
        let store = store_from_settings(&settings.field_registry)?;
        let code_registry = if records_plans(&settings) {
            let code_store = store_from_settings(&settings.code_registry)?;
            Some(Arc::new(CodeRegistry::new(code_store)))
        } else {
            None
        };
        let mut optimizer = Self::new(settings, Arc::new(FieldRegistry::new(store)));
        optimizer.code_registry = code_registry;
        Ok(optimizer)
    }

    /// An optimizer with process-local registries.
    pub fn in_memory(settings: Settings) -> Self {
        let code_registry = records_plans(&settings).then(|| Arc::new(CodeRegistry::in_memory()));
        let mut optimizer = Self::new(settings, Arc::new(FieldRegistry::in_memory()));
        optimizer.code_registry = code_registry;
        optimizer
    }

    /// Records applied plans in `registry`, whatever the settings say.
    pub fn with_code_registry(mut self, registry: Arc<CodeRegistry>) -> Self {
        self.code_registry = Some(registry);
        self
    }

    /// Replaces the locator, e.g. to produce line-numbered locations.
    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }

    /// The registry of applied plans, when offsite optimization is on.
    pub fn code_registry(&self) -> Option<&Arc<CodeRegistry>> {
        self.code_registry.as_ref()
    }

    /// The settings this optimizer was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The locator used for call sites.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// The location of `site` for queries over `meta`.
    pub fn locate(&self, meta: &'static ModelMeta, site: &CallSite) -> Location {
        self.locator.locate(site, meta.model_name)
    }

    /// A queryset over every row of `M`, built at `site`.
    pub fn query<M: Model>(&self, site: CallSite) -> OptimizerQuerySet {
        self.query_meta(M::meta(), site)
    }

    /// A queryset over every row of `meta`, built at `site`.
    pub fn query_meta(&self, meta: &'static ModelMeta, site: CallSite) -> OptimizerQuerySet {
        self.wrap(Query::new(meta), site)
    }

    /// Optimizes an existing plan built at `site`.
    pub fn wrap(&self, query: Query, site: CallSite) -> OptimizerQuerySet {
        let meta = query.meta();
        let location = self.locate(meta, &site);
        let qs = OptimizerQuerySet::new(query, location, Arc::clone(&self.registry))
            .optimization(!self.settings.disable_optimization)
            .observation(!self.settings.disable_observation);
        match (&self.code_registry, self.locator.source_path(&site)) {
            (Some(code), Some(path)) => {
                let numbered = self.locator.clone().numbered(true);
                let code_site = CodeSite {
                    location: numbered.locate(&site, meta.model_name),
                    path,
                };
                qs.annotate_into(Arc::clone(code), code_site)
            }
            _ => qs,
        }
    }
}

/// Plans are recorded only while rewriting is on.
fn records_plans(settings: &Settings) -> bool {
    settings.offsite_optimization && !settings.disable_optimization
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_site;
    use fetchplan_db::FieldDef;
    use std::sync::LazyLock;

    struct Tag;

    impl Model for Tag {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new(
                    "blog",
                    "tag",
                    "id",
                    vec![FieldDef::column("id"), FieldDef::column("label")],
                )
            });
            &META
        }
    }

    #[test]
    fn test_query_is_located_at_call_site() {
        let optimizer = Optimizer::in_memory(Settings::default());
        let qs = optimizer.query::<Tag>(call_site!());
        assert_eq!(qs.location().name(), "tag");
        assert_eq!(qs.location().scope(), "test_query_is_located_at_call_site");
        assert!(qs.location().file().ends_with("src/optimizer"));
    }

    #[test]
    fn test_same_site_same_location() {
        let optimizer = Optimizer::in_memory(Settings::default());
        let locations: Vec<String> = (0..2)
            .map(|_| optimizer.query::<Tag>(call_site!()).location().key())
            .collect();
        assert_eq!(locations[0], locations[1]);
    }

    #[test]
    fn test_outside_project_root_is_empty() {
        let settings = Settings {
            project_root: "/nonexistent/project".into(),
            ..Settings::default()
        };
        let optimizer = Optimizer::in_memory(settings);
        assert!(optimizer.query::<Tag>(call_site!()).location().is_empty());
    }

    #[test]
    fn test_from_settings_rejects_unknown_backend() {
        let mut settings = Settings::default();
        settings.field_registry.backend = "redis".into();
        assert!(Optimizer::from_settings(settings).is_err());
    }

    #[test]
    fn test_code_registry_follows_settings() {
        assert!(Optimizer::in_memory(Settings::default()).code_registry().is_none());

        let settings = Settings {
            offsite_optimization: true,
            ..Settings::default()
        };
        assert!(Optimizer::in_memory(settings.clone()).code_registry().is_some());

        let disabled = Settings {
            disable_optimization: true,
            ..settings
        };
        assert!(Optimizer::in_memory(disabled).code_registry().is_none());
    }

    #[test]
    fn test_numbered_locator() {
        let optimizer =
            Optimizer::in_memory(Settings::default()).with_locator(Locator::default().numbered(true));
        let site = CallSite::caller();
        let qs = optimizer.wrap(Query::new(Tag::meta()), site);
        assert_eq!(qs.location().line(), Some(site.line));
    }
}
