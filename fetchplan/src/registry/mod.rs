//! The field registry.
//!
//! Maps a call-site key to the three field sets learned for it: relations
//! to join eagerly (`select`), relations to batch-fetch (`prefetch`) and the
//! columns actually read (`only`). Sets only ever grow. Every key that has
//! an entry is also listed in a key index stored under [`KEY_INDEX`], so the
//! registry can be enumerated on backends without native enumeration.
//!
//! Updates are read-modify-write against the store. Writers in this process
//! are serialized; writers in other processes sharing a store may race, in
//! which case a union can be lost and is re-learned on the next run. A
//! writer only ever adds to the category it is touching. The key index is
//! checked again whenever an entry is read, so a key dropped from it by a
//! racing writer is listed again on its next use.

pub mod code;
pub mod store;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use fetchplan_core::{OptimizerError, OptimizerResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::location::Location;
use store::{MemoryStore, RegistryStore};

/// Reserved store key holding the list of all registry keys.
pub const KEY_INDEX: &str = "__field_registry_key_set";

/// One of the three learned field sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    /// To-one relations to join eagerly.
    Select,
    /// To-many relations to batch-fetch.
    Prefetch,
    /// Columns to load.
    Only,
}

impl FieldCategory {
    /// Lowercase category name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Prefetch => "prefetch",
            Self::Only => "only",
        }
    }
}

/// The field sets learned for one location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSets {
    /// To-one relations to join eagerly.
    #[serde(default)]
    pub select: BTreeSet<String>,
    /// To-many relations to batch-fetch.
    #[serde(default)]
    pub prefetch: BTreeSet<String>,
    /// Columns to load.
    #[serde(default)]
    pub only: BTreeSet<String>,
}

impl FieldSets {
    /// The set for `category`.
    pub const fn category(&self, category: FieldCategory) -> &BTreeSet<String> {
        match category {
            FieldCategory::Select => &self.select,
            FieldCategory::Prefetch => &self.prefetch,
            FieldCategory::Only => &self.only,
        }
    }

    fn category_mut(&mut self, category: FieldCategory) -> &mut BTreeSet<String> {
        match category {
            FieldCategory::Select => &mut self.select,
            FieldCategory::Prefetch => &mut self.prefetch,
            FieldCategory::Only => &mut self.only,
        }
    }

    /// Returns `true` when nothing has been learned.
    pub fn is_empty(&self) -> bool {
        self.select.is_empty() && self.prefetch.is_empty() && self.only.is_empty()
    }
}

/// The registry of learned field sets.
pub struct FieldRegistry {
    store: Arc<dyn RegistryStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldRegistry").finish_non_exhaustive()
    }
}

impl FieldRegistry {
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

    /// The field sets for `location`. The first lookup of a key stores an
    /// empty entry and indexes the key. The empty location always reads as
    /// empty and never touches the store.
    pub async fn get(&self, location: &Location) -> OptimizerResult<FieldSets> {
        if location.is_empty() {
            return Ok(FieldSets::default());
        }
        self.get_key(&location.key()).await
    }

    /// The field sets stored under a raw key, initializing it on first use.
    pub async fn get_key(&self, key: &str) -> OptimizerResult<FieldSets> {
        if let Some(sets) = self.read(key).await? {
            if !read_index(self.store.as_ref(), KEY_INDEX).await?.contains(key) {
                let _guard = self.write_lock.lock().await;
                add_to_index(self.store.as_ref(), KEY_INDEX, key).await?;
            }
            return Ok(sets);
        }
        let _guard = self.write_lock.lock().await;
        match self.read(key).await? {
            Some(sets) => {
                add_to_index(self.store.as_ref(), KEY_INDEX, key).await?;
                Ok(sets)
            }
            None => {
                let sets = FieldSets::default();
                self.write(key, &sets).await?;
                Ok(sets)
            }
        }
    }

    /// Adds one name to a category of `location`.
    pub async fn add_field(
        &self,
        location: &Location,
        category: FieldCategory,
        name: &str,
    ) -> OptimizerResult<FieldSets> {
        self.add_fields(location, category, [name]).await
    }

    /// Unions names into a category of `location` and writes the entry back.
    /// A no-op for the empty location.
    pub async fn add_fields<I, S>(
        &self,
        location: &Location,
        category: FieldCategory,
        names: I,
    ) -> OptimizerResult<FieldSets>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if location.is_empty() {
            return Ok(FieldSets::default());
        }
        let key = location.key();
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        let _guard = self.write_lock.lock().await;
        let existing = self.read(&key).await?;
        let mut sets = existing.clone().unwrap_or_default();
        let set = sets.category_mut(category);
        let before = set.len();
        set.extend(names);
        if existing.is_none() || set.len() != before {
            tracing::debug!(
                location = %key,
                category = category.as_str(),
                fields = ?sets.category(category),
                "registry grew"
            );
            self.write(&key, &sets).await?;
        } else {
            add_to_index(self.store.as_ref(), KEY_INDEX, &key).await?;
        }
        Ok(sets)
    }

    /// Replaces the entry under `key`. Used by import.
    pub async fn set_key(&self, key: &str, sets: &FieldSets) -> OptimizerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(key, sets).await
    }

    /// Returns `true` if `key` has an entry.
    pub async fn has_key(&self, key: &str) -> OptimizerResult<bool> {
        Ok(self.index().await?.contains(key))
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> OptimizerResult<Vec<String>> {
        Ok(self.index().await?.into_iter().collect())
    }

    /// All entries, sorted by key.
    pub async fn entries(&self) -> OptimizerResult<Vec<(String, FieldSets)>> {
        let mut entries = Vec::new();
        for key in self.keys().await? {
            let sets = self.read(&key).await?.unwrap_or_default();
            entries.push((key, sets));
        }
        Ok(entries)
    }

    /// Removes `key` and its index entry. Returns `true` if it existed.
    pub async fn remove_key(&self, key: &str) -> OptimizerResult<bool> {
        let _guard = self.write_lock.lock().await;
        let indexed = remove_from_index(self.store.as_ref(), KEY_INDEX, key).await?;
        let stored = self.store.delete(key).await?;
        Ok(indexed || stored)
    }

    /// Removes every entry and the key index.
    pub async fn clear(&self) -> OptimizerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.clear().await
    }

    // ── CSV ─────────────────────────────────────────────────────────

    /// Writes every entry to `path`, one row per key:
    /// `key,select,prefetch,only` with each set as a JSON array.
    /// Returns the number of rows written.
    pub async fn export_csv(&self, path: impl AsRef<Path>) -> OptimizerResult<usize> {
        let entries = self.entries().await?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for (key, sets) in &entries {
            writer
                .write_record([
                    key.clone(),
                    serde_json::to_string(&sets.select)?,
                    serde_json::to_string(&sets.prefetch)?,
                    serde_json::to_string(&sets.only)?,
                ])
                .map_err(csv_error)?;
        }
        let data = writer
            .into_inner()
            .map_err(|e| OptimizerError::SerializationError(e.to_string()))?;
        tokio::fs::write(path.as_ref(), data).await?;
        tracing::info!(path = %path.as_ref().display(), rows = entries.len(), "exported field registry");
        Ok(entries.len())
    }

    /// Loads entries from a file written by [`export_csv`](Self::export_csv).
    /// With `clear`, the registry is emptied first; otherwise imported rows
    /// replace existing entries with the same key. Returns the number of
    /// rows read.
    pub async fn import_csv(&self, path: impl AsRef<Path>, clear: bool) -> OptimizerResult<usize> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(data.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let line = record.position().map_or(0, csv::Position::line);
            rows.push(parse_row(&record).map_err(|e| at_line(line, e))?);
        }

        if clear {
            self.clear().await?;
        }
        for (key, sets) in &rows {
            self.set_key(key, sets).await?;
        }
        tracing::info!(path = %path.as_ref().display(), rows = rows.len(), clear, "imported field registry");
        Ok(rows.len())
    }

    // ── Store access ────────────────────────────────────────────────

    async fn read(&self, key: &str) -> OptimizerResult<Option<FieldSets>> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn index(&self) -> OptimizerResult<BTreeSet<String>> {
        read_index(self.store.as_ref(), KEY_INDEX).await
    }

    /// Writes an entry and makes sure its key is indexed. Callers hold
    /// `write_lock`.
    async fn write(&self, key: &str, sets: &FieldSets) -> OptimizerResult<()> {
        if key == KEY_INDEX {
            return Err(OptimizerError::StoreError(format!(
                "'{KEY_INDEX}' is reserved for the key index"
            )));
        }
        self.store.set(key, serde_json::to_value(sets)?).await?;
        add_to_index(self.store.as_ref(), KEY_INDEX, key).await
    }
}

// ── Key index ───────────────────────────────────────────────────────

/// The keys listed under `index_key`.
pub(crate) async fn read_index(
    store: &dyn RegistryStore,
    index_key: &str,
) -> OptimizerResult<BTreeSet<String>> {
    match store.get(index_key).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(BTreeSet::new()),
    }
}

/// Lists `key` under `index_key`; writes only when it was missing.
pub(crate) async fn add_to_index(
    store: &dyn RegistryStore,
    index_key: &str,
    key: &str,
) -> OptimizerResult<()> {
    let mut index = read_index(store, index_key).await?;
    if index.insert(key.to_string()) {
        store.set(index_key, serde_json::to_value(&index)?).await?;
    }
    Ok(())
}

/// Drops `key` from `index_key`. Returns `true` if it was listed.
pub(crate) async fn remove_from_index(
    store: &dyn RegistryStore,
    index_key: &str,
    key: &str,
) -> OptimizerResult<bool> {
    let mut index = read_index(store, index_key).await?;
    let listed = index.remove(key);
    if listed {
        store.set(index_key, serde_json::to_value(&index)?).await?;
    }
    Ok(listed)
}

fn at_line(line: u64, err: OptimizerError) -> OptimizerError {
    OptimizerError::SerializationError(format!("line {line}: {err}"))
}

fn csv_error(err: csv::Error) -> OptimizerError {
    OptimizerError::SerializationError(err.to_string())
}

fn parse_row(record: &csv::StringRecord) -> OptimizerResult<(String, FieldSets)> {
    let cells: Vec<&str> = record.iter().collect();
    let [key, select, prefetch, only] = cells.as_slice() else {
        return Err(OptimizerError::SerializationError(format!(
            "expected 4 cells, found {}",
            cells.len()
        )));
    };
    Ok((
        (*key).to_string(),
        FieldSets {
            select: serde_json::from_str(select)?,
            prefetch: serde_json::from_str(prefetch)?,
            only: serde_json::from_str(only)?,
        },
    ))
}
