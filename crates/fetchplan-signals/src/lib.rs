//! # fetchplan-signals
//!
//! Signal dispatcher for fetchplan. Components send and receive
//! notifications around record writes without depending on each other.
//! Both the immediate save path and the deferred (gathering) save path fire
//! `pre_save` and `post_save`.
//!
//! ## Usage
//!
//! ```
//! use fetchplan_signals::{SaveEvent, Signal};
//! use std::sync::Arc;
//!
//! let signal: Signal<SaveEvent> = Signal::new();
//!
//! signal.connect("audit", Arc::new(|event: &SaveEvent| {
//!     println!("saving {}", event.model);
//!     None
//! }));
//!
//! let results = signal.send(&SaveEvent::new("shop.Order", true));
//! assert_eq!(results.len(), 1);
//! ```

use std::any::Any;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// The type signature for a signal receiver callback.
///
/// Receivers accept a reference to the signal payload and may optionally
/// return a boxed value.
pub type SignalReceiver<T> = Arc<dyn Fn(&T) -> Option<Box<dyn Any + Send>> + Send + Sync>;

/// A signal that can be connected to and dispatched.
///
/// Receivers are called in the order they were connected.
pub struct Signal<T: 'static> {
    receivers: RwLock<Vec<(String, SignalReceiver<T>)>>,
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    /// Creates a new signal with no connected receivers.
    pub fn new() -> Self {
        Self {
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Connects a receiver to this signal.
    ///
    /// If a receiver with the same ID is already connected, it is replaced.
    pub fn connect(&self, receiver_id: impl Into<String>, callback: SignalReceiver<T>) {
        let id = receiver_id.into();
        let mut receivers = self.receivers.write().expect("signal lock poisoned");

        if let Some(entry) = receivers.iter_mut().find(|(rid, _)| *rid == id) {
            entry.1 = callback;
        } else {
            receivers.push((id, callback));
        }
    }

    /// Disconnects the receiver with the given ID.
    ///
    /// Returns `true` if a receiver was found and removed.
    pub fn disconnect(&self, receiver_id: &str) -> bool {
        let mut receivers = self.receivers.write().expect("signal lock poisoned");
        let len_before = receivers.len();
        receivers.retain(|(id, _)| id != receiver_id);
        receivers.len() < len_before
    }

    /// Sends the signal to all connected receivers and collects their
    /// return values in connection order.
    pub fn send(&self, sender: &T) -> Vec<Option<Box<dyn Any + Send>>> {
        let receivers = self.receivers.read().expect("signal lock poisoned");
        receivers
            .iter()
            .map(|(_, callback)| callback(sender))
            .collect()
    }

    /// Returns the number of connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers.read().expect("signal lock poisoned").len()
    }
}

// ── Save payload ─────────────────────────────────────────────────────

/// Payload of `pre_save` / `post_save`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEvent {
    /// Fully-qualified model label, e.g. `shop.Order`.
    pub model: String,
    /// `true` when the record is being inserted rather than updated.
    pub created: bool,
    /// `true` when the write was gathered by a deferred-write scope and has
    /// not reached storage yet.
    pub deferred: bool,
    /// Display form of the primary key, when one is known.
    pub pk: Option<String>,
}

impl SaveEvent {
    /// Creates an event for an immediate write with no known key.
    pub fn new(model: impl Into<String>, created: bool) -> Self {
        Self {
            model: model.into(),
            created,
            deferred: false,
            pk: None,
        }
    }

    /// Marks the event as gathered by a deferred-write scope.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Attaches the primary key's display form.
    #[must_use]
    pub fn with_pk(mut self, pk: impl Into<String>) -> Self {
        self.pk = Some(pk.into());
        self
    }
}

// ── Global signal registry ───────────────────────────────────────────

/// A global registry holding the well-known signals.
pub struct SignalRegistry {
    /// Fired before a record is saved (or gathered).
    pub pre_save: Signal<SaveEvent>,
    /// Fired after a record is saved (or gathered).
    pub post_save: Signal<SaveEvent>,
}

impl SignalRegistry {
    fn new() -> Self {
        Self {
            pre_save: Signal::new(),
            post_save: Signal::new(),
        }
    }
}

/// The global signal registry instance.
///
/// # Examples
///
/// ```
/// use fetchplan_signals::{SaveEvent, SIGNALS};
/// use std::sync::Arc;
///
/// SIGNALS.post_save.connect("doc_handler", Arc::new(|event: &SaveEvent| {
///     println!("{} saved", event.model);
///     None
/// }));
/// SIGNALS.post_save.disconnect("doc_handler");
/// ```
pub static SIGNALS: Lazy<SignalRegistry> = Lazy::new(SignalRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_signal_connect_and_send() {
        let signal: Signal<String> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        signal.connect(
            "counter",
            Arc::new(move |_: &String| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );

        let results = signal.send(&"hello".to_string());
        assert_eq!(results.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_disconnect() {
        let signal: Signal<()> = Signal::new();

        signal.connect("a", Arc::new(|(): &()| None));
        signal.connect("b", Arc::new(|(): &()| None));
        assert_eq!(signal.receiver_count(), 2);

        assert!(signal.disconnect("a"));
        assert_eq!(signal.receiver_count(), 1);
        assert!(!signal.disconnect("nonexistent"));
    }

    #[test]
    fn test_signal_replace_receiver() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        signal.connect("handler", Arc::new(|(): &()| None));
        signal.connect(
            "handler",
            Arc::new(move |(): &()| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );

        assert_eq!(signal.receiver_count(), 1);
        signal.send(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_return_values() {
        let signal: Signal<SaveEvent> = Signal::new();
        signal.connect(
            "created_flag",
            Arc::new(|event: &SaveEvent| Some(Box::new(event.created) as Box<dyn Any + Send>)),
        );

        let results = signal.send(&SaveEvent::new("shop.Order", true));
        let flag = results[0].as_ref().unwrap().downcast_ref::<bool>().unwrap();
        assert!(*flag);
    }

    #[test]
    fn test_save_event_builders() {
        let event = SaveEvent::new("shop.Order", false).deferred().with_pk("7");
        assert_eq!(event.model, "shop.Order");
        assert!(!event.created);
        assert!(event.deferred);
        assert_eq!(event.pk.as_deref(), Some("7"));
    }

    #[test]
    fn test_global_registry_has_save_signals() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        SIGNALS.pre_save.connect(
            "unit_test_pre_save",
            Arc::new(move |event: &SaveEvent| {
                if event.model == "unit.Test" {
                    c.fetch_add(1, Ordering::SeqCst);
                }
                None
            }),
        );

        SIGNALS.pre_save.send(&SaveEvent::new("unit.Test", true));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        SIGNALS.pre_save.disconnect("unit_test_pre_save");
    }
}
