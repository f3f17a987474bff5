//! The code registry.
//!
//! With offsite optimization on, every rewrite is also recorded under the
//! line-numbered location of the query (`file::name::line`) as the builder
//! calls that reproduce the rewritten plan. [`CodeRegistry::apply_to_code`]
//! later appends each recorded plan as a comment to its source line, so the
//! learned optimization can be made permanent by hand.
//!
//! Entries are replaced on every run; an annotation always shows the latest
//! plan. Applying twice replaces the earlier comment instead of adding one.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fetchplan_core::{OptimizerError, OptimizerResult};
use fetchplan_db::{LoadingMode, Query, SelectRelated};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::store::{MemoryStore, RegistryStore};
use super::{add_to_index, read_index};
use crate::location::Location;

/// Reserved store key holding the list of annotated locations.
pub const CODE_KEY_INDEX: &str = "__code_registry_key_set";

/// Prefix of every comment written into source files.
pub const MARKER: &str = "// fetchplan";

/// The source position of a query, for annotating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSite {
    /// The line-numbered location; its key names the entry.
    pub location: Location,
    /// Source file relative to the project root, extension kept.
    pub path: String,
}

/// A recorded plan and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Source file relative to the project root.
    pub path: String,
    /// 1-based source line.
    pub line: u32,
    /// The queried model's name.
    pub name: String,
    /// Builder calls reproducing the plan, e.g. `.select_related(["owner"])`.
    pub plan: String,
}

impl Annotation {
    /// The comment appended to the source line.
    pub fn comment(&self) -> String {
        format!("{MARKER} ({}): {}", self.name, self.plan)
    }
}

/// The registry of applied plans.
pub struct CodeRegistry {
    store: Arc<dyn RegistryStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegistry").finish_non_exhaustive()
    }
}

impl CodeRegistry {
    /// A registry over the given store.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// A registry over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Records `plan` for `site`, replacing what was there. Ignored for the
    /// empty location, for locations without a line and for empty plans.
    pub async fn record(&self, site: &CodeSite, plan: &str) -> OptimizerResult<()> {
        let Some(line) = site.location.line() else {
            return Ok(());
        };
        if site.location.is_empty() || plan.is_empty() {
            return Ok(());
        }
        let key = site.location.key();
        let annotation = Annotation {
            path: site.path.clone(),
            line,
            name: site.location.name().to_string(),
            plan: plan.to_string(),
        };

        let _guard = self.write_lock.lock().await;
        if self.get(&key).await?.as_ref() != Some(&annotation) {
            tracing::debug!(location = %key, plan, "recorded applied plan");
            self.store.set(&key, serde_json::to_value(&annotation)?).await?;
        }
        add_to_index(self.store.as_ref(), CODE_KEY_INDEX, &key).await
    }

    /// The annotation stored under `key`.
    pub async fn get(&self, key: &str) -> OptimizerResult<Option<Annotation>> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All annotated keys, sorted.
    pub async fn keys(&self) -> OptimizerResult<Vec<String>> {
        Ok(read_index(self.store.as_ref(), CODE_KEY_INDEX)
            .await?
            .into_iter()
            .collect())
    }

    /// All annotations, sorted by key.
    pub async fn entries(&self) -> OptimizerResult<Vec<Annotation>> {
        let mut entries = Vec::new();
        for key in self.keys().await? {
            if let Some(annotation) = self.get(&key).await? {
                entries.push(annotation);
            }
        }
        Ok(entries)
    }

    /// Removes every annotation and the key index.
    pub async fn clear(&self) -> OptimizerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.clear().await
    }

    /// Appends every recorded plan as a comment to its line, resolving
    /// paths against `root`. Returns the number of lines annotated.
    pub async fn apply_to_code(&self, root: impl AsRef<Path>) -> OptimizerResult<usize> {
        let mut by_file: BTreeMap<String, Vec<Annotation>> = BTreeMap::new();
        for annotation in self.entries().await? {
            by_file
                .entry(annotation.path.clone())
                .or_default()
                .push(annotation);
        }

        let mut applied = 0;
        for (path, annotations) in by_file {
            let file = root.as_ref().join(&path);
            let text = tokio::fs::read_to_string(&file).await?;
            let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
            for annotation in &annotations {
                let index = usize::try_from(annotation.line)
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .filter(|&i| i < lines.len())
                    .ok_or_else(|| {
                        OptimizerError::DoesNotExist(format!(
                            "{path} has no line {}",
                            annotation.line
                        ))
                    })?;
                lines[index] = annotate_line(&lines[index], annotation);
                applied += 1;
            }
            let mut out = lines.join("\n");
            if text.ends_with('\n') {
                out.push('\n');
            }
            tokio::fs::write(&file, out).await?;
            tracing::info!(path = %file.display(), annotations = annotations.len(), "annotated source file");
        }
        Ok(applied)
    }
}

/// The builder calls that reproduce the joins, batch fetches and column
/// restriction of `query`. Empty when it has none.
pub fn describe_plan(query: &Query) -> String {
    let mut calls = Vec::new();
    match query.select_related_state() {
        SelectRelated::All => calls.push("select_related_all()".to_string()),
        SelectRelated::Fields(names) if !names.is_empty() => {
            calls.push(format!("select_related({})", name_list(names)));
        }
        _ => {}
    }
    let prefetch = query.prefetch_lookups();
    if !prefetch.is_empty() {
        calls.push(format!("prefetch_related({})", name_list(&prefetch)));
    }
    let (fields, mode) = query.deferred_loading();
    if mode == LoadingMode::Only && !fields.is_empty() {
        calls.push(format!("only({})", name_list(fields)));
    }
    calls.iter().map(|call| format!(".{call}")).collect()
}

fn name_list<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    let quoted: Vec<String> = names.into_iter().map(|n| format!("{n:?}")).collect();
    format!("[{}]", quoted.join(", "))
}

/// `line` with this annotation's comment appended, replacing an earlier
/// comment for the same model.
fn annotate_line(line: &str, annotation: &Annotation) -> String {
    let own = format!("  {MARKER} ({}):", annotation.name);
    let (code, rest) = match line.find(&own) {
        Some(at) => {
            let after = &line[at + own.len()..];
            let next = after
                .find(&format!("  {MARKER} ("))
                .map_or("", |i| &after[i..]);
            (&line[..at], next)
        }
        None => (line, ""),
    };
    format!("{code}  {}{rest}", annotation.comment())
}
