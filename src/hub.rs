//! Thread Hub (§4.6): dispatches inbound messages to the right thread
//! instance and owns the id→thread table plus the strict-thread forest
//! (§9 "Graph ownership": an explicit parent index, not nested ownership).

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::error::ValidationError;
use crate::failsafe::FailsafeClient;
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaKind};
use crate::thread::contact::ContactThread;
use crate::thread::multiuser::MultiUserThread;
use crate::thread::strict::StrictThread;
use crate::thread::ThreadEvent;

/// One of the three thread kinds, kept behind a flat dispatch table rather
/// than a class hierarchy (§9 "Polymorphic thread variants").
pub enum ThreadHandle {
    Contact(ContactThread),
    Strict(StrictThread),
    MultiUser(MultiUserThread),
}

impl ThreadHandle {
    fn receive_message(&mut self, stanza: &Stanza) {
        match self {
            ThreadHandle::Contact(t) => t.receive_message(stanza),
            ThreadHandle::Strict(t) => t.receive_message(stanza),
            ThreadHandle::MultiUser(t) => t.receive_message(stanza),
        }
    }
}

pub struct Hub {
    threads: HashMap<String, ThreadHandle>,
    /// Strict-thread forest: child id → parent id.
    parent_of: HashMap<String, String>,
    /// Contact threads, indexed by peer bare JID.
    contact_index: HashMap<Jid, String>,
    clock: SharedClock,
    events: mpsc::UnboundedSender<ThreadEvent>,
}

impl Hub {
    pub fn new(clock: SharedClock, events: mpsc::UnboundedSender<ThreadEvent>) -> Self {
        Hub {
            threads: HashMap::new(),
            parent_of: HashMap::new(),
            contact_index: HashMap::new(),
            clock,
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn thread(&self, id: &str) -> Option<&ThreadHandle> {
        self.threads.get(id)
    }

    pub fn thread_mut(&mut self, id: &str) -> Option<&mut ThreadHandle> {
        self.threads.get_mut(id)
    }

    pub fn known_ids(&self) -> HashSet<String> {
        self.threads.keys().cloned().collect()
    }

    /// Every live multi-user thread, for broadcasting cross-thread signals
    /// like roster presence changes (a participant may be tracked by more
    /// than one multi-user thread at once).
    pub fn multiuser_threads_mut(&mut self) -> impl Iterator<Item = &mut MultiUserThread> {
        self.threads.values_mut().filter_map(|t| match t {
            ThreadHandle::MultiUser(m) => Some(m),
            _ => None,
        })
    }

    /// Get the contact thread for `peer`, creating it on demand.
    pub fn get_or_create_contact(&mut self, peer: Jid) -> &mut ContactThread {
        let bare = peer.bare();
        let id = self.contact_index.entry(bare).or_insert_with(|| ContactThread::synthetic_id(&peer)).clone();
        self.threads
            .entry(id.clone())
            .or_insert_with(|| ThreadHandle::Contact(ContactThread::new(peer, self.clock.clone(), self.events.clone())));
        match self.threads.get_mut(&id).expect("just inserted") {
            ThreadHandle::Contact(t) => t,
            _ => unreachable!("contact index only ever maps to Contact handles"),
        }
    }

    /// Create a new strict thread, validating its id against the forest
    /// (§4.6, §4.7 duplicate-id / unknown-parent checks).
    pub fn create_strict(&mut self, id: impl Into<String>, parent_id: Option<String>) -> Result<(), ValidationError> {
        let id = id.into();
        let known = self.known_ids();
        StrictThread::validate_id(&id, parent_id.as_deref(), &known)?;
        if let Some(parent) = &parent_id {
            self.parent_of.insert(id.clone(), parent.clone());
        }
        self.threads.insert(
            id.clone(),
            ThreadHandle::Strict(StrictThread::new(id, parent_id, self.clock.clone(), self.events.clone())),
        );
        Ok(())
    }

    pub fn create_multiuser(&mut self, id: impl Into<String>, own_jid: &Jid) {
        let id = id.into();
        self.threads.insert(
            id.clone(),
            ThreadHandle::MultiUser(MultiUserThread::new(id, own_jid, self.clock.clone(), self.events.clone())),
        );
    }

    /// Remove a thread and drop any forest/contact-index entries pointing
    /// at it. Returns whether a thread was actually removed.
    pub fn remove_thread(&mut self, id: &str) -> bool {
        let removed = self.threads.remove(id).is_some();
        self.parent_of.retain(|_, parent| parent != id);
        self.contact_index.retain(|_, tid| tid != id);
        removed
    }

    /// §4.6 "auto-disconnect on last-thread-removed": remove `id`, and if
    /// the hub is now empty, tear down the connection.
    pub fn remove_thread_and_maybe_disconnect(&mut self, id: &str, failsafe: &mut FailsafeClient) {
        if self.remove_thread(id) && self.is_empty() {
            failsafe.disconnect();
        }
    }

    /// §4.6 dispatch algorithm, run as a strict fallback chain:
    /// 1. walk the forest for a wire thread id; route if it resolves. If the
    ///    id itself is unknown but the `<thread>` element declares a
    ///    `parent` attribute naming a thread the hub already knows, register
    ///    the child id as a new subthread of that parent and route to it
    ///    (§4.6 step 1, §4.7 "or declares a known ancestor via `parent`").
    /// 2. otherwise — whether or not a thread id was even present — emit
    ///    `unknownStrictThread` so a listener may spawn a multi-user thread.
    /// 3. look up a contact thread by the sender's bare JID; route if found.
    /// 4. otherwise emit `unknownThread` so a listener may spawn one.
    /// 5. drop.
    ///
    /// The spec lets a listener mark a message `$received` to stop the
    /// chain early; this crate's listeners only observe events over an
    /// async channel and can't synchronously claim a message, so both
    /// `unknownStrictThread` and `unknownThread` may fire for the same
    /// stanza (a listener reacts by creating the thread for *next* time,
    /// not by claiming this one).
    pub fn dispatch_incoming(&mut self, stanza: &Stanza) {
        if stanza.kind != StanzaKind::Message {
            return;
        }
        if let Some(thread_node) = stanza.child("thread") {
            if let Some(thread_id) = thread_node.text.clone().filter(|s| !s.is_empty()) {
                if self.threads.contains_key(&thread_id) {
                    self.threads.get_mut(&thread_id).expect("just checked").receive_message(stanza);
                    return;
                }
                if let Some(parent_id) = thread_node.attr("parent").filter(|p| self.threads.contains_key(*p)) {
                    let parent_id = parent_id.to_owned();
                    self.parent_of.insert(thread_id.clone(), parent_id.clone());
                    self.threads.insert(
                        thread_id.clone(),
                        ThreadHandle::Strict(StrictThread::new(thread_id.clone(), Some(parent_id), self.clock.clone(), self.events.clone())),
                    );
                    self.threads.get_mut(&thread_id).expect("just inserted").receive_message(stanza);
                    return;
                }
            }
        }
        let _ = self.events.send(ThreadEvent::UnknownStrictThread(stanza.clone()));
        if let Some(from) = &stanza.from {
            if let Some(contact_id) = self.contact_index.get(&from.bare()).cloned() {
                self.threads.get_mut(&contact_id).expect("contact index entry must exist").receive_message(stanza);
                return;
            }
        }
        let _ = self.events.send(ThreadEvent::UnknownThread(stanza.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, TestClock};
    use crate::stanza::Node;
    use std::sync::Arc;

    fn hub() -> (Hub, mpsc::UnboundedReceiver<ThreadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Hub::new(Arc::new(TestClock::new(0)), tx), rx)
    }

    fn chat_from(from: &str, thread_id: Option<&str>) -> Stanza {
        let mut s = Stanza::new(StanzaKind::Message);
        s.id = Some("m1".into());
        s.from = Some(from.parse().unwrap());
        s.r#type = Some("chat".into());
        s.push_child(Node::new("body").with_text("hi"));
        if let Some(id) = thread_id {
            s.push_child(Node::new("thread").with_text(id));
        }
        s
    }

    #[test]
    fn routes_to_existing_contact_thread() {
        let (mut h, _rx) = hub();
        h.get_or_create_contact("b@h".parse().unwrap());
        h.dispatch_incoming(&chat_from("b@h/phone", None));
        let id = ContactThread::synthetic_id(&"b@h".parse().unwrap());
        match h.thread(&id).unwrap() {
            ThreadHandle::Contact(t) => assert_eq!(t.store().len(), 1),
            _ => panic!("expected contact thread"),
        }
    }

    #[test]
    fn unknown_message_with_no_thread_and_no_contact_emits_both_fallback_events() {
        let (mut h, mut rx) = hub();
        h.dispatch_incoming(&chat_from("stranger@h", None));
        assert!(matches!(rx.try_recv(), Ok(ThreadEvent::UnknownStrictThread(_))));
        assert!(matches!(rx.try_recv(), Ok(ThreadEvent::UnknownThread(_))));
    }

    #[test]
    fn unresolvable_wire_thread_id_emits_unknown_strict_thread() {
        let (mut h, mut rx) = hub();
        h.dispatch_incoming(&chat_from("stranger@h", Some("ghost-thread")));
        let mut saw_unknown_strict = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ThreadEvent::UnknownStrictThread(_)) {
                saw_unknown_strict = true;
            }
        }
        assert!(saw_unknown_strict);
    }

    #[test]
    fn known_contact_after_unresolvable_thread_id_still_routes() {
        let (mut h, mut rx) = hub();
        h.get_or_create_contact("b@h".parse().unwrap());
        h.dispatch_incoming(&chat_from("b@h/phone", Some("ghost-thread")));
        assert!(matches!(rx.try_recv(), Ok(ThreadEvent::UnknownStrictThread(_))));
        assert!(matches!(rx.try_recv(), Err(_)));
        let id = ContactThread::synthetic_id(&"b@h".parse().unwrap());
        match h.thread(&id).unwrap() {
            ThreadHandle::Contact(t) => assert_eq!(t.store().len(), 1),
            _ => panic!("expected contact thread"),
        }
    }

    #[test]
    fn unknown_id_with_known_parent_registers_subthread_and_routes() {
        let (mut h, _rx) = hub();
        h.create_strict("parent-1", None).unwrap();

        let mut s = Stanza::new(StanzaKind::Message);
        s.id = Some("m1".into());
        s.from = Some("b@h".parse().unwrap());
        s.r#type = Some("chat".into());
        s.push_child(Node::new("body").with_text("hi"));
        s.push_child(Node::new("thread").with_text("child-1").with_attr("parent", "parent-1"));

        h.dispatch_incoming(&s);

        match h.thread("child-1").unwrap() {
            ThreadHandle::Strict(t) => {
                assert_eq!(t.parent_id(), Some("parent-1"));
                assert_eq!(t.store().len(), 1);
            }
            _ => panic!("expected strict thread"),
        }
    }

    #[test]
    fn create_strict_rejects_duplicate_id() {
        let (mut h, _rx) = hub();
        h.create_strict("t1", None).unwrap();
        assert_eq!(h.create_strict("t1", None), Err(ValidationError::DuplicateStrictThreadId("t1".into())));
    }

    #[test]
    fn removing_last_thread_disconnects() {
        let (mut h, _rx) = hub();
        h.get_or_create_contact("b@h".parse().unwrap());
        let id = ContactThread::synthetic_id(&"b@h".parse().unwrap());
        let (fs_tx, _fs_rx) = mpsc::unbounded_channel();
        let mut failsafe = FailsafeClient::new(system_clock(), fs_tx);
        h.remove_thread_and_maybe_disconnect(&id, &mut failsafe);
        assert!(h.is_empty());
        assert!(!failsafe.is_connected());
    }
}
