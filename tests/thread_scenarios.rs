//! End-to-end scenarios grounded in the literal examples given for the
//! thread/hub layer: echo, duplicate-timestamp collapse, fast-forward sync,
//! version-unknown fallback, and invite/leave.

use std::sync::Arc;

use coopfox_core::clock::{SharedClock, TestClock};
use coopfox_core::hub::{Hub, ThreadHandle};
use coopfox_core::stanza::{Node, Stanza, StanzaKind};
use coopfox_core::thread::contact::ContactThread;
use coopfox_core::thread::multiuser::{DestroyReason, MultiUserThread, SyncMode, SyncQuery};
use coopfox_core::thread::ThreadEvent;

fn chat(id: &str, body: &str) -> Stanza {
    let mut s = Stanza::new(StanzaKind::Message);
    s.id = Some(id.into());
    s.r#type = Some("chat".into());
    s.push_child(Node::new("body").with_text(body));
    s
}

#[test]
fn echo_produces_one_history_entry_with_expected_version() {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let clock: SharedClock = Arc::new(TestClock::new(0));
    let mut thread = ContactThread::new("b@h".parse().unwrap(), clock, tx);

    let outgoing = thread.prepare_outgoing(chat("m1", "hi"), "b@h/r".parse().unwrap());
    thread.record_outgoing(&outgoing);

    assert_eq!(thread.store().len(), 1);
    let expected_version = coopfox_core::thread::next_version("", "m1");
    assert_eq!(thread.store().latest_version(), Some(expected_version.as_str()));
}

#[test]
fn duplicate_timestamp_collapses_to_lower_value() {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let clock: SharedClock = Arc::new(TestClock::new(1_000));
    let mut thread = ContactThread::new("b@h".parse().unwrap(), clock.clone(), tx);

    let mut first = chat("m1", "hi");
    first.from = Some("b@h/r".parse().unwrap());
    thread.receive_message(&first);
    clock.set(1_100);

    let mut second = chat("m1", "hi");
    second.from = Some("b@h/r".parse().unwrap());
    thread.receive_message(&second);

    assert_eq!(thread.store().len(), 1);
    assert_eq!(thread.store().get("m1").unwrap().timestamp, 1_000);
}

#[test]
fn fast_forward_sync_converges_bob_to_alice() {
    let (alice_tx, _alice_rx) = tokio::sync::mpsc::unbounded_channel();
    let (bob_tx, _bob_rx) = tokio::sync::mpsc::unbounded_channel();
    let clock: SharedClock = Arc::new(TestClock::new(0));
    let mut alice = MultiUserThread::new("g1", &"a@h".parse().unwrap(), clock.clone(), alice_tx);
    let mut bob = MultiUserThread::new("g1", &"b@h".parse().unwrap(), clock.clone(), bob_tx);

    alice.record_outgoing(&chat("m1", "hi"));
    let v_a = alice.store().latest_version().unwrap().to_owned();

    bob.record_outgoing(&chat("m1", "hi"));
    bob.record_outgoing(&chat("m2", "there"));
    let v_b = bob.store().latest_version().unwrap().to_owned();

    let pull = SyncQuery {
        thread: "g1".into(),
        mode: SyncMode::FastForward,
        version: Some(v_a),
        timestamp_ms: 0,
        diff: Vec::new(),
    };
    let response = bob.handle_pull_request(&pull);
    assert_eq!(response.diff.len(), 1);
    assert_eq!(response.diff[0].id, "m2");

    let follow_up = alice.handle_pull_response(&response).unwrap();
    assert!(follow_up.is_none());
    assert_eq!(alice.store().latest_version(), Some(v_b.as_str()));
    assert_eq!(alice.store().history()[1].message.id, "m2");
}

#[test]
fn version_unknown_fallback_converges_via_complete_pull() {
    let (alice_tx, _alice_rx) = tokio::sync::mpsc::unbounded_channel();
    let (bob_tx, _bob_rx) = tokio::sync::mpsc::unbounded_channel();
    let clock: SharedClock = Arc::new(TestClock::new(0));
    let mut alice = MultiUserThread::new("g1", &"a@h".parse().unwrap(), clock.clone(), alice_tx);
    let mut bob = MultiUserThread::new("g1", &"b@h".parse().unwrap(), clock.clone(), bob_tx);

    alice.record_outgoing(&chat("m3", "alice-only"));
    bob.record_outgoing(&chat("m1", "one"));
    bob.record_outgoing(&chat("m2", "two"));

    let first_pull = SyncQuery {
        thread: "g1".into(),
        mode: SyncMode::FastForward,
        version: alice.store().latest_version().map(|s| s.to_owned()),
        timestamp_ms: 0,
        diff: Vec::new(),
    };
    let first_response = bob.handle_pull_request(&first_pull);
    assert!(first_response.diff.is_empty());

    let complete_query = alice.handle_pull_response(&first_response).unwrap().expect("expected a complete follow-up");
    assert_eq!(complete_query.mode, SyncMode::Complete);

    let complete_response = bob.handle_pull_request(&complete_query);
    assert_eq!(complete_response.diff.len(), 2);
    alice.handle_pull_response(&complete_response).unwrap();

    let ids: Vec<String> = alice.store().history().iter().map(|e| e.message.id.clone()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(alice.store().latest_version(), bob.store().latest_version());
}

#[test]
fn invite_then_leave_flows_through_hub() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let clock: SharedClock = Arc::new(TestClock::new(0));
    let mut hub = Hub::new(clock, tx);
    let alice: coopfox_core::jid::Jid = "a@h".parse().unwrap();
    hub.create_multiuser("g1", &alice);

    let invite = match hub.thread_mut("g1").unwrap() {
        ThreadHandle::MultiUser(t) => t.add_participant("b@h".parse().unwrap(), &alice),
        _ => unreachable!(),
    };
    assert!(invite.is_some());

    let destroy_stanza = match hub.thread_mut("g1").unwrap() {
        ThreadHandle::MultiUser(t) => t.destroy(DestroyReason::Leave, &alice),
        _ => unreachable!(),
    };
    let destroy_stanza = destroy_stanza.expect("leave produces a final message");
    assert_eq!(destroy_stanza.r#type.as_deref(), Some("headline"));
    assert!(destroy_stanza.no_echo);

    match hub.thread("g1").unwrap() {
        ThreadHandle::MultiUser(t) => assert!(t.is_destroyed()),
        _ => unreachable!(),
    }

    drop(rx_drain(&mut rx));
}

fn rx_drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ThreadEvent>) -> Vec<ThreadEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}
