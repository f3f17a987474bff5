//! Deferred writes.
//!
//! Inside [`deferred_atomic`] every [`save`](fetchplan_db::save) in the
//! process is gathered instead of written. New records are queued per model
//! and get a [`DeferredPk`] in place of their key; records that already
//! exist are queued for update. When the body finishes, each model's queue
//! is written with one bulk insert and one bulk update, in the order the
//! models were first saved.
//!
//! Reading a deferred key early forces that one record to be inserted on
//! its own and removed from its queue, so it is never inserted twice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use fetchplan_core::{OptimizerError, OptimizerResult};
use fetchplan_db::executor::locate_inserted;
use fetchplan_db::save::event;
use fetchplan_db::{
    atomic, install_save_hook, DbExecutor, DeferredPk, KeyResolver, ModelMeta, PrimaryKey, Record,
    SaveHook, TransactionManager, Value,
};
use fetchplan_signals::SIGNALS;

/// Where the key of a queued insert stands.
#[derive(Debug, Clone)]
enum KeyState {
    /// Not written yet.
    Pending,
    /// Written by a bulk insert that did not report the key.
    Flushed,
    /// Written; the key is known.
    Resolved(Value),
}

/// One queued insert. Doubles as the resolver behind the [`DeferredPk`] of
/// the record it was queued for.
struct PendingWrite {
    id: u64,
    meta: &'static ModelMeta,
    record: Mutex<Record>,
    state: Mutex<KeyState>,
    resolving: tokio::sync::Mutex<()>,
    queue: Weak<Mutex<Queue>>,
}

impl PendingWrite {
    fn record(&self) -> Record {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_record(&self, record: Record) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }

    fn state(&self) -> KeyState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: KeyState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn is_pending(&self) -> bool {
        matches!(self.state(), KeyState::Pending)
    }

    /// Takes this write out of its model's queue.
    fn dequeue(&self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(batch) = queue.batches.get_mut(&self.meta.label()) {
            batch.creates.retain(|w| w.id != self.id);
        }
    }

    async fn locate(&self, db: &dyn DbExecutor, record: &Record) -> OptimizerResult<Option<Value>> {
        tracing::warn!(
            model = %self.meta.label(),
            "backend did not report the inserted key; matching the row on its column values"
        );
        locate_inserted(db, self.meta, record).await
    }
}

#[async_trait::async_trait]
impl KeyResolver for PendingWrite {
    fn id(&self) -> u64 {
        self.id
    }

    fn resolved(&self) -> Option<Value> {
        match self.state() {
            KeyState::Resolved(key) => Some(key),
            KeyState::Pending | KeyState::Flushed => None,
        }
    }

    async fn resolve(&self, db: &dyn DbExecutor) -> OptimizerResult<Value> {
        if let Some(key) = self.resolved() {
            return Ok(key);
        }
        let _resolving = self.resolving.lock().await;
        let state = self.state();
        let record = self.record();
        let key = match state {
            KeyState::Resolved(key) => return Ok(key),
            KeyState::Flushed => self.locate(db, &record).await?,
            KeyState::Pending => {
                self.dequeue();
                let inserted = db.insert(self.meta, &record).await?;
                self.set_state(KeyState::Flushed);
                match inserted {
                    Some(key) => Some(key),
                    None => self.locate(db, &record).await?,
                }
            }
        };
        let key = key.ok_or_else(|| {
            OptimizerError::DoesNotExist(format!(
                "{} matching query does not exist.",
                self.meta.label()
            ))
        })?;
        self.set_state(KeyState::Resolved(key.clone()));
        tracing::debug!(model = %self.meta.label(), pk = %key, "resolved deferred primary key");
        Ok(key)
    }
}

/// The queued writes of one model.
struct ModelBatch {
    meta: &'static ModelMeta,
    creates: Vec<Arc<PendingWrite>>,
    updates: Vec<Record>,
}

#[derive(Default)]
struct Queue {
    order: Vec<String>,
    batches: BTreeMap<String, ModelBatch>,
}

impl Queue {
    fn batch(&mut self, meta: &'static ModelMeta) -> &mut ModelBatch {
        let label = meta.label();
        if !self.batches.contains_key(&label) {
            self.order.push(label.clone());
        }
        self.batches.entry(label).or_insert_with(|| ModelBatch {
            meta,
            creates: Vec::new(),
            updates: Vec::new(),
        })
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Rows bulk-inserted.
    pub inserted: usize,
    /// Rows bulk-updated.
    pub updated: usize,
}

/// Gathers saves and writes them in bulk.
///
/// Installed as the process-wide save hook by [`deferred_atomic`]; usable
/// directly with [`install_save_hook`] when the transaction is managed
/// elsewhere.
pub struct Coordinator {
    queue: Arc<Mutex<Queue>>,
    next_id: AtomicU64,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pending_creates", &self.pending_creates())
            .field("pending_updates", &self.pending_updates())
            .finish()
    }
}

impl Coordinator {
    /// A coordinator with empty queues.
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(Queue::default())),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts waiting for the flush.
    pub fn pending_creates(&self) -> usize {
        self.lock().batches.values().map(|b| b.creates.len()).sum()
    }

    /// Updates waiting for the flush.
    pub fn pending_updates(&self) -> usize {
        self.lock().batches.values().map(|b| b.updates.len()).sum()
    }

    fn queue_create(&self, record: &Record) -> Arc<PendingWrite> {
        let mut copy = record.detached();
        if matches!(copy.pk_slot(), PrimaryKey::Deferred(_)) {
            copy.set_pk(Value::Null);
        }
        let write = Arc::new(PendingWrite {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            meta: record.meta(),
            record: Mutex::new(copy),
            state: Mutex::new(KeyState::Pending),
            resolving: tokio::sync::Mutex::new(()),
            queue: Arc::downgrade(&self.queue),
        });
        self.lock()
            .batch(record.meta())
            .creates
            .push(Arc::clone(&write));
        write
    }

    fn queue_update(&self, record: &Record) {
        let copy = record.detached();
        let mut queue = self.lock();
        let updates = &mut queue.batch(record.meta()).updates;
        match updates.iter_mut().find(|r| r.pk() == copy.pk()) {
            Some(existing) => *existing = copy,
            None => updates.push(copy),
        }
    }

    fn queued(&self, id: u64) -> Option<Arc<PendingWrite>> {
        self.lock()
            .batches
            .values()
            .flat_map(|b| b.creates.iter())
            .find(|w| w.id == id)
            .cloned()
    }

    /// Gathers an update of an existing row.
    fn gather_update(&self, record: &mut Record) {
        SIGNALS.pre_save.send(&event(record, false).deferred());
        record.mark_saved();
        self.queue_update(record);
        SIGNALS.post_save.send(&event(record, false).deferred());
    }

    /// Writes every queue: per model, one bulk insert of the creates still
    /// waiting and one bulk update.
    pub async fn flush(&self, db: &dyn DbExecutor) -> OptimizerResult<FlushSummary> {
        let batches: Vec<ModelBatch> = {
            let mut queue = self.lock();
            let order = std::mem::take(&mut queue.order);
            let mut batches = std::mem::take(&mut queue.batches);
            order
                .iter()
                .filter_map(|label| batches.remove(label))
                .collect()
        };

        let mut summary = FlushSummary::default();
        for batch in batches {
            let label = batch.meta.label();
            let creates: Vec<Arc<PendingWrite>> =
                batch.creates.into_iter().filter(|w| w.is_pending()).collect();
            if !creates.is_empty() {
                let records: Vec<Record> = creates.iter().map(|w| w.record()).collect();
                let keys = db.bulk_insert(batch.meta, &records).await?;
                for (i, write) in creates.iter().enumerate() {
                    write.set_state(match keys.get(i).cloned().flatten() {
                        Some(key) => KeyState::Resolved(key),
                        None => KeyState::Flushed,
                    });
                }
            }
            if !batch.updates.is_empty() {
                db.bulk_update(batch.meta, &batch.updates, &batch.meta.value_columns())
                    .await?;
            }
            tracing::info!(
                model = %label,
                inserted = creates.len(),
                updated = batch.updates.len(),
                "flushed deferred writes"
            );
            summary.inserted += creates.len();
            summary.updated += batch.updates.len();
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl SaveHook for Coordinator {
    async fn save(&self, record: &mut Record, db: &dyn DbExecutor) -> OptimizerResult<()> {
        match record.pk_slot().clone() {
            PrimaryKey::Deferred(pk) => {
                if let Some(key) = pk.resolved() {
                    record.set_pk(key);
                    self.gather_update(record);
                } else if let Some(write) = self.queued(pk.id()) {
                    // Saved again before the flush: the queued copy follows.
                    SIGNALS.pre_save.send(&event(record, true).deferred());
                    let mut copy = record.detached();
                    copy.set_pk(Value::Null);
                    write.replace_record(copy);
                    SIGNALS.post_save.send(&event(record, true).deferred());
                } else {
                    record.resolve_pk(db).await?;
                    self.gather_update(record);
                }
            }
            PrimaryKey::Set(_) if !record.is_adding() => self.gather_update(record),
            PrimaryKey::Set(_) => {
                SIGNALS.pre_save.send(&event(record, true).deferred());
                self.queue_create(record);
                record.mark_saved();
                SIGNALS.post_save.send(&event(record, true).deferred());
            }
            PrimaryKey::Unset => {
                SIGNALS.pre_save.send(&event(record, true).deferred());
                let write = self.queue_create(record);
                record.set_deferred_pk(DeferredPk::new(write));
                SIGNALS.post_save.send(&event(record, true).deferred());
            }
        }
        Ok(())
    }
}

/// Runs `f` in a transaction with every save gathered, then flushes the
/// gathered writes in bulk before the transaction ends.
///
/// The flush runs whatever `f` returned; an error from `f` is returned in
/// preference to a flush error, and either rolls the transaction back.
///
/// # Panics
///
/// Panics if another deferred scope is active in the process.
pub async fn deferred_atomic<'a, F, Fut, T>(db: &'a dyn DbExecutor, f: F) -> OptimizerResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: std::future::Future<Output = OptimizerResult<T>>,
{
    atomic(db, |txn| async move {
        let coordinator = Arc::new(Coordinator::new());
        let guard = install_save_hook(Arc::clone(&coordinator) as Arc<dyn SaveHook>);
        let outcome = f(Arc::clone(&txn)).await;
        drop(guard);
        let flushed = coordinator.flush(&*txn).await;
        let value = outcome?;
        flushed?;
        Ok(value)
    })
    .await
}
