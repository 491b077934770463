//! Contact thread (§4.7): one thread per peer bare JID, routed by peer
//! identity rather than by the wire `<thread>` element — the synthetic id
//! is adopted from the peer, never the reverse.

use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::jid::Jid;
use crate::stanza::{Node, Stanza, StanzaKind};

use super::{build_message, ReceiveOutcome, ThreadEvent, ThreadStore};

/// A one-to-one conversation keyed by the peer's bare JID.
pub struct ContactThread {
    store: ThreadStore,
    peer: Jid,
    clock: SharedClock,
    events: mpsc::UnboundedSender<ThreadEvent>,
}

impl ContactThread {
    pub fn synthetic_id(peer: &Jid) -> String {
        format!("contact:{}", peer.bare())
    }

    pub fn new(peer: Jid, clock: SharedClock, events: mpsc::UnboundedSender<ThreadEvent>) -> Self {
        let id = Self::synthetic_id(&peer);
        ContactThread {
            store: ThreadStore::new(id),
            peer,
            clock,
            events,
        }
    }

    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ThreadStore {
        &mut self.store
    }

    /// Whether this thread owns `stanza`, i.e. its `from`/`to` bare JID is
    /// this thread's peer. The Hub uses this for contact-map dispatch.
    pub fn owns(&self, stanza: &Stanza) -> bool {
        stanza
            .from
            .as_ref()
            .or(stanza.to.as_ref())
            .is_some_and(|j| j.bare_eq(&self.peer))
    }

    /// `receiveMessage` (§4.7). The wire `<thread>` id, if any, is stored
    /// verbatim in the message but never consulted for routing: this
    /// thread was already selected by peer identity.
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

    /// `sendMessage` (§4.7): stamps `to` and a `<thread>` element carrying
    /// this thread's synthetic id, if the caller didn't already set one.
    pub fn prepare_outgoing(&self, mut stanza: Stanza, to: Jid) -> Stanza {
        stanza.kind = StanzaKind::Message;
        stanza.to = Some(to);
        if stanza.r#type.is_none() {
            stanza.r#type = Some("chat".into());
        }
        if stanza.child("thread").is_none() {
            stanza.push_child(Node::new("thread").with_text(self.store.id().to_owned()));
        }
        stanza
    }

    /// Record a just-sent message in history (the "echo" half of
    /// `beforeSendMessage → send → echo → receive` per §5).
    pub fn record_outgoing(&mut self, stanza: &Stanza) {
        let Some(message) = build_message(stanza, &self.clock) else {
            return;
        };
        let _ = self.events.send(ThreadEvent::BeforeSendMessage(message.clone()));
        self.store.receive(message.clone());
        let _ = self.events.send(ThreadEvent::AfterSendMessage(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::stanza::Node as StanzaNode;
    use std::sync::Arc;

    fn channel() -> (mpsc::UnboundedSender<ThreadEvent>, mpsc::UnboundedReceiver<ThreadEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn owns_matches_peer_bare_jid_regardless_of_resource() {
        let (tx, _rx) = channel();
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let thread = ContactThread::new("b@h".parse().unwrap(), clock, tx);
        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.from = Some("b@h/phone".parse().unwrap());
        assert!(thread.owns(&stanza));
    }

    #[test]
    fn echo_roundtrip_stores_one_history_entry() {
        let (tx, mut rx) = channel();
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let mut thread = ContactThread::new("b@h".parse().unwrap(), clock, tx);

        let mut outgoing = Stanza::new(StanzaKind::Message);
        outgoing.id = Some("m1".into());
        outgoing.r#type = Some("chat".into());
        outgoing.push_child(StanzaNode::new("body").with_text("hi"));
        let outgoing = thread.prepare_outgoing(outgoing, "b@h/r".parse().unwrap());
        thread.record_outgoing(&outgoing);

        assert_eq!(thread.store().len(), 1);
        assert!(matches!(rx.try_recv(), Ok(ThreadEvent::BeforeSendMessage(_))));
        assert!(matches!(rx.try_recv(), Ok(ThreadEvent::AfterSendMessage(_))));
    }
}
