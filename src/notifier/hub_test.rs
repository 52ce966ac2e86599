use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use super::*;

/// Delivers numbers to listeners whose filter divides them.
#[derive(Debug, Default)]
struct DivisorPolicy;

impl HubPolicy for DivisorPolicy {
    type Filter = u32;
    type Event = (u32, Option<ListenerHandle>);

    fn matches(
        &self,
        divisor: &u32,
        event: &Self::Event,
    ) -> bool {
        event.0 % divisor == 0
    }

    fn stamp(
        &self,
        event: &mut Self::Event,
        listener: ListenerHandle,
    ) {
        event.1 = Some(listener);
    }
}

fn hub() -> NotificationHub<DivisorPolicy> {
    NotificationHub::new("test", DivisorPolicy, 16)
}

#[test]
fn test_send_without_listeners_is_dropped() {
    let hub = hub();
    hub.send(None, (2, None));
    assert!(!hub.is_running());
    assert!(hub.wait_for_queue(Some(Duration::ZERO)));
}

#[test]
fn test_callback_receives_matching_events_only() {
    let hub = hub();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();
    let handle = hub.add_listener(
        2,
        Arc::new(move |ev: &(u32, Option<ListenerHandle>)| {
            assert_eq!(ev.0 % 2, 0);
            assert!(ev.1.is_some());
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    for n in 1..=10 {
        hub.send(None, (n, None));
    }
    assert!(hub.wait_for_queue(Some(Duration::from_secs(2))));
    assert_eq!(seen.load(Ordering::SeqCst), 5);

    assert!(hub.remove_listener(handle));
    assert!(!hub.remove_listener(handle));
}

#[test]
fn test_targeted_send_reaches_single_listener() {
    let hub = hub();
    let poller = hub.create_poller();
    let a = hub.add_polled_listener(poller, 1).unwrap();
    let _b = hub.add_polled_listener(poller, 1).unwrap();

    hub.send(Some(a), (7, None));
    let polled = hub.poll(poller, Some(Duration::from_secs(2)));
    assert!(!polled.timed_out);
    assert_eq!(polled.events, vec![(7, Some(a))]);
}

#[test]
fn test_poll_times_out_when_nothing_arrives() {
    let hub = hub();
    let poller = hub.create_poller();
    let started = Instant::now();
    let polled = hub.poll(poller, Some(Duration::from_millis(50)));
    assert!(polled.timed_out);
    assert!(polled.events.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_zero_timeout_does_not_block() {
    let hub = hub();
    let poller = hub.create_poller();
    let polled = hub.poll(poller, Some(Duration::ZERO));
    assert!(polled.timed_out);
}

#[test]
fn test_late_cancel_is_remembered() {
    let hub = hub();
    let poller = hub.create_poller();
    hub.cancel_poll(poller);

    let polled = hub.poll(poller, None);
    assert!(!polled.timed_out);
    assert!(polled.events.is_empty());

    // the flag is consumed by one poll
    assert!(hub.poll(poller, Some(Duration::from_millis(10))).timed_out);
}

#[test]
fn test_remove_poller_wakes_blocked_poll_and_drops_listeners() {
    let hub = Arc::new(hub());
    let poller = hub.create_poller();
    hub.add_polled_listener(poller, 1).unwrap();
    assert_eq!(hub.listener_count(), 1);

    let hub_clone = hub.clone();
    let waiter = std::thread::spawn(move || hub_clone.poll(poller, None));
    std::thread::sleep(Duration::from_millis(50));

    hub.remove_poller(poller);
    let polled = waiter.join().unwrap();
    assert!(polled.events.is_empty());
    assert_eq!(hub.listener_count(), 0);
    assert!(hub.add_polled_listener(poller, 1).is_none());
}

#[test]
fn test_callback_may_reenter_hub() {
    let hub = Arc::new(hub());
    let weak = Arc::downgrade(&hub);
    let added = Arc::new(AtomicUsize::new(0));
    let added_clone = added.clone();
    hub.add_listener(
        1,
        Arc::new(move |_ev: &(u32, Option<ListenerHandle>)| {
            if let Some(hub) = weak.upgrade() {
                hub.add_listener(1000, Arc::new(|_: &(u32, Option<ListenerHandle>)| {}));
                added_clone.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    hub.send(None, (1, None));
    assert!(hub.wait_for_queue(Some(Duration::from_secs(2))));
    assert_eq!(added.load(Ordering::SeqCst), 1);
    assert_eq!(hub.listener_count(), 2);
}

#[test]
fn test_poller_queue_drops_oldest_when_full() {
    let hub: NotificationHub<DivisorPolicy> = NotificationHub::new("small", DivisorPolicy, 2);
    let poller = hub.create_poller();
    hub.add_polled_listener(poller, 1).unwrap();
    for n in 1..=3 {
        hub.send(None, (n, None));
    }
    assert!(hub.wait_for_queue(Some(Duration::from_secs(2))));
    let values: Vec<u32> = hub
        .poll(poller, Some(Duration::ZERO))
        .events
        .into_iter()
        .map(|e| e.0)
        .collect();
    assert_eq!(values, vec![2, 3]);
}

#[test]
fn test_listener_handles_are_reused() {
    let hub = hub();
    let cb: Callback<(u32, Option<ListenerHandle>)> = Arc::new(|_| {});
    let a = hub.add_listener(1, cb.clone());
    assert!(hub.remove_listener(a));
    let b = hub.add_listener(1, cb);
    assert_eq!(a, b);
}

#[test]
fn test_stop_wakes_pollers() {
    let hub = Arc::new(hub());
    let poller = hub.create_poller();
    let hub_clone = hub.clone();
    let waiter = std::thread::spawn(move || hub_clone.poll(poller, None));
    std::thread::sleep(Duration::from_millis(30));
    hub.stop();
    assert!(waiter.join().unwrap().events.is_empty());
    assert!(!hub.is_running());
}
