use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::constants::NOTIFY_DELETE;
use crate::constants::NOTIFY_FLAGS;
use crate::constants::NOTIFY_IMMEDIATE;
use crate::constants::NOTIFY_LOCAL;
use crate::constants::NOTIFY_NEW;
use crate::constants::NOTIFY_UPDATE;
use crate::proto::Value;

fn event(
    local_id: usize,
    name: &str,
    flags: u32,
) -> EntryNotification {
    EntryNotification {
        listener: None,
        local_id,
        name: name.to_string(),
        value: Some(Arc::new(Value::Double(1.0))),
        flags,
    }
}

fn prefix_filter(
    prefix: &str,
    flags: u32,
) -> EntryListenerFilter {
    EntryListenerFilter {
        selector: EntrySelector::Prefix(prefix.to_string()),
        flags,
    }
}

#[test]
fn test_prefix_and_flags_must_both_match() {
    let policy = EntryPolicy;
    let filter = prefix_filter("/SmartDashboard/", NOTIFY_NEW | NOTIFY_UPDATE);

    assert!(policy.matches(&filter, &event(0, "/SmartDashboard/speed", NOTIFY_NEW)));
    assert!(policy.matches(&filter, &event(0, "/SmartDashboard/speed", NOTIFY_UPDATE)));
    assert!(!policy.matches(&filter, &event(0, "/SmartDashboard/speed", NOTIFY_DELETE)));
    assert!(!policy.matches(&filter, &event(0, "/LiveWindow/speed", NOTIFY_NEW)));
}

#[test]
fn test_immediate_bit_is_ignored_for_matching() {
    let policy = EntryPolicy;
    let filter = prefix_filter("", NOTIFY_NEW);
    assert!(policy.matches(&filter, &event(3, "x", NOTIFY_IMMEDIATE | NOTIFY_NEW)));
}

#[test]
fn test_combined_update_and_flags_matches_either_listener() {
    let policy = EntryPolicy;
    let both = NOTIFY_UPDATE | NOTIFY_FLAGS;
    assert!(policy.matches(&prefix_filter("", NOTIFY_UPDATE), &event(0, "x", both)));
    assert!(policy.matches(&prefix_filter("", NOTIFY_FLAGS), &event(0, "x", both)));
    assert!(!policy.matches(&prefix_filter("", NOTIFY_NEW), &event(0, "x", both)));
}

#[test]
fn test_local_events_need_local_listener() {
    let policy = EntryPolicy;
    let ev = event(0, "x", NOTIFY_NEW | NOTIFY_LOCAL);
    assert!(!policy.matches(&prefix_filter("", NOTIFY_NEW), &ev));
    assert!(policy.matches(&prefix_filter("", NOTIFY_NEW | NOTIFY_LOCAL), &ev));
}

#[test]
fn test_entry_selector_matches_exact_local_id() {
    let policy = EntryPolicy;
    let filter = EntryListenerFilter {
        selector: EntrySelector::Entry(4),
        flags: NOTIFY_UPDATE,
    };
    assert!(policy.matches(&filter, &event(4, "a", NOTIFY_UPDATE)));
    assert!(!policy.matches(&filter, &event(5, "a", NOTIFY_UPDATE)));
}

#[test]
fn test_events_without_value_never_match() {
    let policy = EntryPolicy;
    let mut ev = event(0, "x", NOTIFY_NEW);
    ev.value = None;
    assert!(!policy.matches(&prefix_filter("", NOTIFY_NEW), &ev));
}

#[test]
fn test_polled_listener_receives_one_event_with_entry_name() {
    let notifier = EntryNotifier::new(16);
    let poller = notifier.create_poller();
    notifier
        .add_polled(
            poller,
            EntrySelector::Prefix("/foo".into()),
            NOTIFY_NEW | NOTIFY_UPDATE,
        )
        .unwrap();

    notifier.notify_entry(0, "/foo/bar", Some(Arc::new(Value::Boolean(true))), NOTIFY_NEW, None);
    notifier.notify_entry(1, "/baz", Some(Arc::new(Value::Boolean(true))), NOTIFY_NEW, None);

    let polled = notifier.poll(poller, Some(Duration::from_secs(2)));
    assert_eq!(polled.events.len(), 1);
    assert_eq!(polled.events[0].name, "/foo/bar");
    assert!(polled.events[0].listener.is_some());
}

#[test]
fn test_local_events_skipped_until_local_listener_exists() {
    let notifier = EntryNotifier::new(16);
    assert!(!notifier.local_notifiers());
    let poller = notifier.create_poller();
    notifier
        .add_polled(poller, EntrySelector::Prefix(String::new()), NOTIFY_NEW)
        .unwrap();
    assert!(!notifier.local_notifiers());

    notifier
        .add_polled(
            poller,
            EntrySelector::Prefix(String::new()),
            NOTIFY_NEW | NOTIFY_LOCAL,
        )
        .unwrap();
    assert!(notifier.local_notifiers());

    notifier.notify_entry(0, "a", Some(Arc::new(Value::Double(2.0))), NOTIFY_NEW | NOTIFY_LOCAL, None);
    let polled = notifier.poll(poller, Some(Duration::from_secs(2)));
    assert_eq!(polled.events.len(), 1, "only the local listener matches");
}
