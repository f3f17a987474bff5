//! The process-wide save path.
//!
//! Every write of a [`Record`] goes through [`save`]. Normally it writes
//! immediately ([`save_immediate`]), firing `pre_save` and `post_save`
//! around the insert or update. A component may redirect all saves in the
//! process for a while by installing a [`SaveHook`]; only one hook can be
//! installed at a time, and the returned [`SaveHookGuard`] restores the
//! immediate path when dropped, including during unwinding.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use fetchplan_core::OptimizerResult;
use fetchplan_signals::{SaveEvent, SIGNALS};

use crate::executor::{locate_inserted, DbExecutor};
use crate::record::{PrimaryKey, Record};

/// A replacement for the immediate save path.
#[async_trait::async_trait]
pub trait SaveHook: Send + Sync {
    /// Handles one save call.
    async fn save(&self, record: &mut Record, db: &dyn DbExecutor) -> OptimizerResult<()>;
}

static SAVE_HOOK: RwLock<Option<Arc<dyn SaveHook>>> = RwLock::new(None);

/// Restores the immediate save path when dropped.
#[must_use = "dropping the guard uninstalls the hook immediately"]
pub struct SaveHookGuard {
    _private: (),
}

impl Drop for SaveHookGuard {
    fn drop(&mut self) {
        let mut slot = SAVE_HOOK.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

/// Redirects every [`save`] in the process to `hook` until the guard drops.
///
/// # Panics
///
/// Panics if a hook is already installed: two scopes cannot share the
/// single process-wide slot.
pub fn install_save_hook(hook: Arc<dyn SaveHook>) -> SaveHookGuard {
    let mut slot = SAVE_HOOK.write().unwrap_or_else(PoisonError::into_inner);
    let occupied = slot.is_some();
    if !occupied {
        *slot = Some(hook);
    }
    drop(slot);
    assert!(
        !occupied,
        "a save hook is already installed; deferred-write scopes cannot be nested or run concurrently"
    );
    SaveHookGuard { _private: () }
}

/// Returns `true` while a hook is installed.
pub fn save_hook_installed() -> bool {
    read_slot().is_some()
}

fn read_slot() -> RwLockReadGuard<'static, Option<Arc<dyn SaveHook>>> {
    SAVE_HOOK.read().unwrap_or_else(PoisonError::into_inner)
}

/// Saves a record through the installed hook, or immediately.
pub async fn save(record: &mut Record, db: &dyn DbExecutor) -> OptimizerResult<()> {
    let hook = read_slot().clone();
    match hook {
        Some(hook) => hook.save(record, db).await,
        None => save_immediate(record, db).await,
    }
}

/// Writes a record now: insert when it has no key (or is new with an
/// explicit key), update otherwise. A deferred key is resolved first, so a
/// record gathered by a finished deferred scope is updated, not re-inserted.
pub async fn save_immediate(record: &mut Record, db: &dyn DbExecutor) -> OptimizerResult<()> {
    if matches!(record.pk_slot(), PrimaryKey::Deferred(_)) {
        record.resolve_pk(db).await?;
    }
    let meta = record.meta();
    let created = record.is_adding() || record.pk().is_none();

    SIGNALS.pre_save.send(&event(record, created));
    if created {
        let key = match db.insert(meta, record).await? {
            Some(key) => Some(key),
            None => locate_inserted(db, meta, record).await?,
        };
        if let Some(key) = key {
            record.set_pk(key);
        }
    } else {
        db.update(meta, record).await?;
    }
    record.mark_saved();
    SIGNALS.post_save.send(&event(record, created));

    tracing::debug!(model = %meta.label(), created, "saved record");
    Ok(())
}

/// The signal payload describing `record`.
pub fn event(record: &Record, created: bool) -> SaveEvent {
    let event = SaveEvent::new(record.meta().label(), created);
    match record.pk() {
        Some(pk) => event.with_pk(pk.to_string()),
        None => event,
    }
}
