//! Top-level composition (§1 "four tightly coupled subsystems"): owns the
//! [`FailsafeClient`] and the [`Hub`] together and drives one from the
//! other's event stream, mirroring the teacher's `xmpp::Agent` +
//! `event_loop::wait_for_events` split — `Agent` holds the low-level
//! client, `wait_for_events` translates its stanza/presence events into
//! higher-level handling (`presence::receive::handle_presence`,
//! `message::receive::handle_message`). Here the higher-level handling is
//! routing a message to its owning thread and feeding presence into
//! participant tracking.

use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::client::ClientEvent;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::failsafe::{FailsafeClient, FailsafeEvent, Operation};
use crate::hub::Hub;
use crate::jid::Jid;
use crate::session::Credentials;
use crate::thread::ThreadEvent;

/// Everything the embedder can observe: forwarded Failsafe/Client events,
/// plus every thread's events, merged onto one channel (§9 "Event system").
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Client(FailsafeEvent),
    Thread(ThreadEvent),
}

/// Drives [`Hub::dispatch_incoming`] from the wire and [`Hub`]'s
/// multi-user threads from roster presence, so a caller only has to poll
/// one thing and create/destroy threads in reaction to its events.
pub struct Agent {
    failsafe: FailsafeClient,
    failsafe_events: mpsc::UnboundedReceiver<FailsafeEvent>,
    hub: Hub,
    hub_events: mpsc::UnboundedReceiver<ThreadEvent>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl Agent {
    pub fn new(clock: SharedClock, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        let (failsafe_tx, failsafe_events) = mpsc::unbounded_channel();
        let (hub_tx, hub_events) = mpsc::unbounded_channel();
        Agent {
            failsafe: FailsafeClient::new(clock.clone(), failsafe_tx),
            failsafe_events,
            hub: Hub::new(clock, hub_tx),
            hub_events,
            events,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut Hub {
        &mut self.hub
    }

    pub fn is_connected(&self) -> bool {
        self.failsafe.is_connected()
    }

    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        domain: &str,
        config: ClientConfig,
        creds: Option<Credentials>,
        quiet: bool,
    ) -> Result<(), Error> {
        self.failsafe.connect(host, port, domain, config, creds, quiet).await
    }

    pub fn disconnect(&mut self) {
        self.failsafe.disconnect();
    }

    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.failsafe.reconnect().await
    }

    pub async fn call(&mut self, op: Operation) -> Result<(), Error> {
        self.failsafe.call(op).await
    }

    /// Poll once: drive the inner client, then route whatever that
    /// produced — an inbound message goes to [`Hub::dispatch_incoming`], a
    /// roster presence change goes to every multi-user thread tracking
    /// that peer, and everything else is forwarded to the embedder
    /// untouched. Finally drains the Hub's own thread events.
    pub async fn poll(&mut self) -> Result<(), Error> {
        let result = self.failsafe.poll().await;
        while let Ok(event) = self.failsafe_events.try_recv() {
            self.route_client_event(&event);
            let _ = self.events.send(AgentEvent::Client(event));
        }
        while let Ok(event) = self.hub_events.try_recv() {
            let _ = self.events.send(AgentEvent::Thread(event));
        }
        result
    }

    fn route_client_event(&mut self, event: &FailsafeEvent) {
        let FailsafeEvent::Inner(client_event) = event else {
            return;
        };
        match client_event {
            ClientEvent::IncomingMessage(stanza) => self.hub.dispatch_incoming(stanza),
            ClientEvent::RosterItemUpdate { jid, reason: "presence" } => self.route_presence(jid),
            _ => {}
        }
    }

    /// §4.8.1 "roster presence changes": a contact's overall availability
    /// (any resource with a selected primary presence) is broadcast to
    /// every multi-user thread, which no-ops for peers it isn't tracking.
    fn route_presence(&mut self, jid: &Jid) {
        let available = self
            .failsafe
            .client()
            .and_then(|c| c.roster().get(jid))
            .is_some_and(|item| item.primary_presence().is_some());
        for thread in self.hub.multiuser_threads_mut() {
            thread.note_presence(jid, available);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::roster::Presence;
    use crate::stanza::{Node, Stanza, StanzaKind};
    use std::sync::Arc;

    fn agent() -> (Agent, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Agent::new(Arc::new(TestClock::new(0)), tx), rx)
    }

    #[tokio::test]
    async fn incoming_message_routes_to_strict_thread_via_hub() {
        let (mut a, _rx) = agent();
        a.hub_mut().create_strict("t1", None).unwrap();

        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.id = Some("m1".into());
        stanza.from = Some("b@h/r".parse().unwrap());
        stanza.r#type = Some("chat".into());
        stanza.push_child(Node::new("body").with_text("hi"));
        stanza.push_child(Node::new("thread").with_text("t1"));

        a.route_client_event(&FailsafeEvent::Inner(ClientEvent::IncomingMessage(Box::new(stanza))));

        match a.hub().thread("t1").unwrap() {
            crate::hub::ThreadHandle::Strict(t) => assert_eq!(t.store().len(), 1),
            _ => panic!("expected strict thread"),
        }
    }

    #[tokio::test]
    async fn presence_update_demotes_active_participant_to_inactive() {
        let (mut a, _rx) = agent();
        let alice: Jid = "a@h".parse().unwrap();
        a.hub_mut().create_multiuser("g1", &alice);
        let bob: Jid = "b@h".parse().unwrap();
        let join = crate::coopfox_ext::ParticipantAction {
            jid: bob.clone(),
            action: crate::coopfox_ext::ParticipantActionKind::Join,
            thread_info: None,
        };
        match a.hub_mut().thread_mut("g1").unwrap() {
            crate::hub::ThreadHandle::MultiUser(t) => t.handle_participant_action(&join),
            _ => unreachable!(),
        }
        match a.hub().thread("g1").unwrap() {
            crate::hub::ThreadHandle::MultiUser(t) => {
                assert_eq!(t.participant_status(&bob), crate::thread::ParticipantStatus::Active)
            }
            _ => unreachable!(),
        }

        a.route_presence(&bob);
        match a.hub().thread("g1").unwrap() {
            crate::hub::ThreadHandle::MultiUser(t) => {
                assert_eq!(t.participant_status(&bob), crate::thread::ParticipantStatus::Inactive)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn connect_without_credentials_is_forwarded_as_login_required() {
        let (mut a, mut rx) = agent();
        a.connect("localhost", 5222, "localhost", ClientConfig::default(), None, false)
            .await
            .unwrap();
        a.poll().await.unwrap();
        let mut saw_login_required = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, AgentEvent::Client(FailsafeEvent::LoginRequired)) {
                saw_login_required = true;
            }
        }
        assert!(saw_login_required);
    }

    #[test]
    fn presence_availability_reads_through_roster() {
        // Exercises the `Roster::get` accessor `route_presence` relies on
        // without needing a live connection.
        let mut roster = crate::roster::Roster::new();
        roster.set_own_jid("me@h/r".parse().unwrap());
        let bob: Jid = "b@h".parse().unwrap();
        assert!(roster.get(&bob).is_none());
        roster.merge_item(bob.clone(), None, "both".into());
        let item = roster.get_contact_mut(&bob).unwrap();
        item.apply_presence(Presence::available("r"), None);
        assert!(roster.get(&bob).unwrap().primary_presence().is_some());
    }
}
