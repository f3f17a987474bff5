//! Integration tests for the signal dispatch system.
//!
//! Tests cover: payload delivery, model filtering inside receivers,
//! disconnect, receiver ordering and the global save signals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fetchplan_signals::{SaveEvent, Signal, SIGNALS};

// ═════════════════════════════════════════════════════════════════════
// 1. Receivers get the full payload
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_receiver_sees_payload() {
    let signal: Signal<SaveEvent> = Signal::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    signal.connect(
        "capture",
        Arc::new(move |event: &SaveEvent| {
            seen_clone.lock().unwrap().push(event.clone());
            None
        }),
    );

    signal.send(&SaveEvent::new("shop.Order", true).deferred());
    signal.send(&SaveEvent::new("shop.Order", false).with_pk("3"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].created && seen[0].deferred);
    assert_eq!(seen[1].pk.as_deref(), Some("3"));
}

// ═════════════════════════════════════════════════════════════════════
// 2. Filtering by model label
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_receivers_filter_by_model() {
    let signal: Signal<SaveEvent> = Signal::new();
    let orders = Arc::new(AtomicUsize::new(0));
    let lines = Arc::new(AtomicUsize::new(0));

    let o = orders.clone();
    signal.connect(
        "orders",
        Arc::new(move |event: &SaveEvent| {
            if event.model == "shop.Order" {
                o.fetch_add(1, Ordering::SeqCst);
            }
            None
        }),
    );
    let l = lines.clone();
    signal.connect(
        "lines",
        Arc::new(move |event: &SaveEvent| {
            if event.model == "shop.OrderLine" {
                l.fetch_add(1, Ordering::SeqCst);
            }
            None
        }),
    );

    signal.send(&SaveEvent::new("shop.Order", true));
    signal.send(&SaveEvent::new("shop.Order", false));
    signal.send(&SaveEvent::new("shop.OrderLine", true));

    assert_eq!(orders.load(Ordering::SeqCst), 2);
    assert_eq!(lines.load(Ordering::SeqCst), 1);
}

// ═════════════════════════════════════════════════════════════════════
// 3. Disconnect stops delivery
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_disconnect_stops_handler() {
    let signal: Signal<()> = Signal::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();

    signal.connect(
        "counter",
        Arc::new(move |(): &()| {
            c.fetch_add(1, Ordering::SeqCst);
            None
        }),
    );

    signal.send(&());
    assert!(signal.disconnect("counter"));
    signal.send(&());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ═════════════════════════════════════════════════════════════════════
// 4. Connection order is call order
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_receivers_called_in_connection_order() {
    let signal: Signal<()> = Signal::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let o = order.clone();
        signal.connect(
            name,
            Arc::new(move |(): &()| {
                o.lock().unwrap().push(name);
                None
            }),
        );
    }

    signal.send(&());
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

// ═════════════════════════════════════════════════════════════════════
// 5. Global pre/post save signals are independent
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_global_pre_and_post_save_are_distinct() {
    let pre = Arc::new(AtomicUsize::new(0));
    let post = Arc::new(AtomicUsize::new(0));

    let p = pre.clone();
    SIGNALS.pre_save.connect(
        "integration_pre",
        Arc::new(move |event: &SaveEvent| {
            if event.model == "integration.Distinct" {
                p.fetch_add(1, Ordering::SeqCst);
            }
            None
        }),
    );
    let p = post.clone();
    SIGNALS.post_save.connect(
        "integration_post",
        Arc::new(move |event: &SaveEvent| {
            if event.model == "integration.Distinct" {
                p.fetch_add(1, Ordering::SeqCst);
            }
            None
        }),
    );

    SIGNALS
        .pre_save
        .send(&SaveEvent::new("integration.Distinct", true));
    assert_eq!(pre.load(Ordering::SeqCst), 1);
    assert_eq!(post.load(Ordering::SeqCst), 0);

    SIGNALS
        .post_save
        .send(&SaveEvent::new("integration.Distinct", true));
    assert_eq!(post.load(Ordering::SeqCst), 1);

    SIGNALS.pre_save.disconnect("integration_pre");
    SIGNALS.post_save.disconnect("integration_post");
}
