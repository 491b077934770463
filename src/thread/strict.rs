//! Strict thread (§4.7): identified by an explicit thread id rather than
//! peer identity, optionally nested under a parent thread. Owned by a
//! forest the Hub maintains; this module validates candidate ids against
//! that forest but does not store it itself (§9 "Graph ownership").

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::error::ValidationError;
use crate::jid::Jid;
use crate::stanza::{Node, Stanza, StanzaKind};

use super::{build_message, Message, ReceiveOutcome, ThreadEvent, ThreadStore};

/// A conversation keyed by an explicit, caller- or peer-assigned thread id.
pub struct StrictThread {
    store: ThreadStore,
    parent_id: Option<String>,
    clock: SharedClock,
    events: mpsc::UnboundedSender<ThreadEvent>,
}

impl StrictThread {
    /// Validate a candidate id before creating a thread (§4.6, §4.7): must
    /// not collide with an id already known to the hub, and any declared
    /// parent must already exist.
    pub fn validate_id(id: &str, parent: Option<&str>, known_ids: &HashSet<String>) -> Result<(), ValidationError> {
        if known_ids.contains(id) {
            return Err(ValidationError::DuplicateStrictThreadId(id.to_owned()));
        }
        if let Some(parent) = parent {
            if !known_ids.contains(parent) {
                return Err(ValidationError::UnknownParentThread(parent.to_owned()));
            }
        }
        Ok(())
    }

    pub fn new(id: impl Into<String>, parent_id: Option<String>, clock: SharedClock, events: mpsc::UnboundedSender<ThreadEvent>) -> Self {
        StrictThread {
            store: ThreadStore::new(id),
            parent_id,
            clock,
            events,
        }
    }

    /// Adopt the id carried by the first received message, for a thread
    /// created reactively rather than by an explicit local call.
    pub fn from_first_message(stanza: &Stanza, clock: SharedClock, events: mpsc::UnboundedSender<ThreadEvent>) -> Option<Self> {
        let id = stanza.child("thread")?.text.clone().filter(|s| !s.is_empty())?;
        Some(Self::new(id, None, clock, events))
    }

    pub fn id(&self) -> &str {
        self.store.id()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ThreadStore {
        &mut self.store
    }

    /// §4.7: a stanza belongs to this thread if its `<thread>` id matches
    /// this thread's own id, or names one of the subthread ids registered
    /// under it (the hub's forest, passed in since this module doesn't own
    /// it — §9 "Graph ownership").
    pub fn owns(&self, stanza: &Stanza, descendants: &HashSet<String>) -> bool {
        let Some(id) = stanza.child("thread").and_then(|t| t.text.as_deref()) else {
            return false;
        };
        id == self.store.id() || descendants.contains(id)
    }

    pub fn receive_message(&mut self, stanza: &Stanza) {
        let Some(message) = build_message(stanza, &self.clock) else {
            return;
        };
        let _ = self.events.send(ThreadEvent::BeforeIncomingMessage(message.clone()));
        match self.store.receive(message.clone()) {
            ReceiveOutcome::Ignored => return,
            ReceiveOutcome::Stored { rewritten } | ReceiveOutcome::Duplicate { rewritten } => {
                if rewritten {
                    let _ = self.events.send(ThreadEvent::HistoryRewritten);
                }
            }
        }
        let _ = self.events.send(ThreadEvent::IncomingMessage(message.clone()));
        let _ = self.events.send(ThreadEvent::AfterIncomingMessage(message));
    }

    pub fn prepare_outgoing(&self, mut stanza: Stanza, to: Jid) -> Stanza {
        stanza.kind = StanzaKind::Message;
        stanza.to = Some(to);
        if stanza.r#type.is_none() {
            stanza.r#type = Some("chat".into());
        }
        stanza.children.retain(|c| c.name != "thread");
        stanza.push_child(Node::new("thread").with_text(self.store.id().to_owned()));
        stanza
    }

    pub fn record_outgoing(&mut self, stanza: &Stanza) {
        let Some(message) = build_message(stanza, &self.clock) else {
            return;
        };
        let _ = self.events.send(ThreadEvent::BeforeSendMessage(message.clone()));
        self.store.receive(message.clone());
        let _ = self.events.send(ThreadEvent::AfterSendMessage(message));
    }

    /// Import history carried over from another thread (e.g. a contact
    /// thread being promoted to strict): each imported message's `<thread>`
    /// element is stamped with an `original` attribute recording where it
    /// came from, without disturbing ids already tagged by an earlier import.
    pub fn import_with_provenance(&mut self, messages: Vec<Message>, origin_thread_id: &str, replace: bool) -> bool {
        let stamped: Vec<Message> = messages
            .into_iter()
            .map(|mut m| {
                match m.stanza.children.iter_mut().find(|c| c.name == "thread") {
                    Some(thread_node) if thread_node.attr("original").is_none() => {
                        thread_node.attrs.push(("original".into(), origin_thread_id.to_owned()));
                    }
                    None => {
                        m.stanza.push_child(
                            Node::new("thread")
                                .with_text(self.store.id().to_owned())
                                .with_attr("original", origin_thread_id.to_owned()),
                        );
                    }
                    Some(_) => {}
                }
                m
            })
            .collect();
        let rewritten = self.store.import_messages(stamped, replace);
        if rewritten {
            let _ = self.events.send(ThreadEvent::HistoryRewritten);
        }
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use std::sync::Arc;

    #[test]
    fn validate_id_rejects_duplicate() {
        let mut known = HashSet::new();
        known.insert("t1".to_owned());
        assert_eq!(
            StrictThread::validate_id("t1", None, &known),
            Err(ValidationError::DuplicateStrictThreadId("t1".into()))
        );
    }

    #[test]
    fn validate_id_rejects_unknown_parent() {
        let known = HashSet::new();
        assert_eq!(
            StrictThread::validate_id("t2", Some("missing-parent"), &known),
            Err(ValidationError::UnknownParentThread("missing-parent".into()))
        );
    }

    #[test]
    fn owns_matches_own_id_and_registered_descendants() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let thread = StrictThread::new("parent-1", None, clock, tx);

        let mut own = Stanza::new(StanzaKind::Message);
        own.push_child(Node::new("thread").with_text("parent-1"));
        assert!(thread.owns(&own, &HashSet::new()));

        let mut unrelated = Stanza::new(StanzaKind::Message);
        unrelated.push_child(Node::new("thread").with_text("other"));
        assert!(!thread.owns(&unrelated, &HashSet::new()));

        let mut descendants = HashSet::new();
        descendants.insert("child-1".to_owned());
        let mut child = Stanza::new(StanzaKind::Message);
        child.push_child(Node::new("thread").with_text("child-1"));
        assert!(thread.owns(&child, &descendants));
    }

    #[test]
    fn from_first_message_adopts_wire_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.push_child(Node::new("thread").with_text("abc123"));
        let thread = StrictThread::from_first_message(&stanza, clock, tx).unwrap();
        assert_eq!(thread.id(), "abc123");
    }

    #[test]
    fn import_with_provenance_tags_original_thread() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let mut thread = StrictThread::new("t-new", None, clock.clone(), tx);

        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.id = Some("m1".into());
        stanza.r#type = Some("chat".into());
        stanza.push_child(Node::new("body").with_text("hi"));
        let message = build_message(&stanza, &clock).unwrap();

        thread.import_with_provenance(vec![message], "contact:b@h", false);
        let stored = thread.store().get("m1").unwrap();
        let thread_node = stored.stanza.child("thread").unwrap();
        assert_eq!(thread_node.attr("original"), Some("contact:b@h"));
    }
}
