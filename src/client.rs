//! Domain layer on top of [`Session`] (§4.4): roster lifecycle, presence,
//! entity capabilities, pub-sub (PEP), and per-stanza validation.
//!
//! Grounded on `xmpp::agent`/`xmpp::presence`/`xmpp::pubsub` for the shape of
//! this layer (roster request + initial presence on connect, a typed event
//! stream fed to the caller), generalized around this crate's own
//! [`crate::roster::Roster`]/[`crate::caps::CapsProfile`] instead of
//! `xmpp_parsers` structs.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::caps::CapsProfile;
use crate::clock::SharedClock;
use crate::config::ClientConfig;
use crate::error::{Error, ValidationError};
use crate::jid::Jid;
use crate::roster::{Presence, Roster};
use crate::session::{Credentials, DispatchResult, Session};
use crate::stanza::{make_id, Node, Stanza, StanzaKind};

const NS_ROSTER: &str = "jabber:iq:roster";
const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
const NS_PING: &str = "urn:xmpp:ping";
const NS_MULTICAST: &str = "http://jabber.org/protocol/address";
const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";
const DECLOAK_NS: &str = "urn:xmpp:decloak:0";

/// Events exposed to collaborators (§6, non-exhaustive list scoped to the
/// Client layer).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    XmppConnected,
    XmppDisconnected(Option<String>),
    RosterUpdate,
    RosterItemUpdate { jid: Jid, reason: &'static str },
    ClientOnline,
    IncomingMessage(Box<Stanza>),
    BeforeSendMessage(Box<Stanza>),
    AfterSendMessage(Box<Stanza>),
    PubsubEvent { from: Jid, node: String, item: Box<Node> },
}

/// Domain layer on top of [`Session`] (§4.4).
pub struct Client {
    session: Session,
    roster: Roster,
    caps: CapsProfile,
    config: ClientConfig,
    clock: SharedClock,
    events: mpsc::UnboundedSender<ClientEvent>,
    last_presence_at: Option<Instant>,
    declared_online: bool,
    last_directed_presence: std::collections::HashMap<Jid, Instant>,
}

impl Client {
    pub async fn connect(
        host: &str,
        port: u16,
        domain: &str,
        creds: Credentials,
        clock: SharedClock,
        config: ClientConfig,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<Self, Error> {
        let session = Session::connect(host, port, domain, creds, clock.clone(), config.clone()).await?;
        let mut caps = CapsProfile::default();
        caps.identities.push(crate::caps::Identity::new("client", "pc", "CoopFox"));
        caps.features.push(NS_DISCO_INFO.to_owned());
        caps.features.push(NS_PING.to_owned());

        let mut client = Client {
            session,
            roster: Roster::new(),
            caps,
            config,
            clock,
            events,
            last_presence_at: None,
            declared_online: false,
            last_directed_presence: std::collections::HashMap::new(),
        };
        if let Some(jid) = client.session.own_jid().cloned() {
            client.roster.set_own_jid(jid);
        }
        let _ = client.events.send(ClientEvent::XmppConnected);
        client.request_roster().await?;
        client.send_presence(Presence::available(String::new())).await?;
        Ok(client)
    }

    /// **Roster lifecycle** (§4.4): request the roster after
    /// `session-active`.
    async fn request_roster(&mut self) -> Result<(), Error> {
        let iq = Stanza {
            kind: StanzaKind::Iq,
            id: Some(make_id()),
            from: None,
            to: None,
            r#type: Some("get".into()),
            children: vec![Node::new("query").with_ns(NS_ROSTER)],
            is_echo: false,
            no_echo: false,
        };
        self.session.send_stanza(iq, None, None).await?;
        Ok(())
    }

    /// Merge an inbound roster push/result (§4.4 "Incoming roster items are
    /// merged"). `subscription="remove"` is deleted only after one final
    /// unavailable-presence event, so any multi-user thread tracking the
    /// peer sees it leave before the roster item disappears.
    fn handle_roster_query(&mut self, query: &Node) {
        for item in query.children_named("item") {
            let Some(jid_str) = item.attr("jid") else { continue };
            let Ok(jid) = jid_str.parse::<Jid>() else { continue };
            let name = item.attr("name").map(|s| s.to_owned());
            let subscription = item.attr("subscription").unwrap_or("none").to_owned();
            if subscription == "remove" {
                self.apply_unavailable_presence(&jid);
            }
            let removed = self.roster.merge_item(jid.clone(), name, subscription);
            let reason = if removed { "removed" } else { "updated" };
            let _ = self.events.send(ClientEvent::RosterItemUpdate { jid, reason });
        }
        let _ = self.events.send(ClientEvent::RosterUpdate);
    }

    /// Synthesize the one final unavailable-presence event a
    /// `subscription="remove"` roster push owes its contact (§4.4), routed
    /// through [`Roster::apply_unavailable`] so participant-status
    /// listeners see the departure before `handle_roster_query` deletes
    /// the roster item.
    fn apply_unavailable_presence(&mut self, jid: &Jid) {
        let preferred = self.config.preferred_multicast_caps_node.clone();
        self.roster.apply_unavailable(jid, Some(preferred.as_str()));
        let _ = self.events.send(ClientEvent::RosterItemUpdate {
            jid: jid.clone(),
            reason: "presence",
        });
    }

    /// **Entity capabilities** (§4.4): `c.node`/`c.hash`/`c.ver` on every
    /// non-special presence.
    fn caps_node(&self) -> Node {
        Node::new("c")
            .with_ns("http://jabber.org/protocol/caps")
            .with_attr("node", self.config.caps_node.clone())
            .with_attr("hash", "sha-1")
            .with_attr("ver", self.caps.ver())
    }

    /// Respond to an inbound disco#info query with computed
    /// identities/features (§4.4, §11).
    fn disco_info_response(&self) -> Node {
        let mut query = Node::new("query").with_ns(NS_DISCO_INFO);
        for identity in &self.caps.identities {
            query = query.with_child(
                Node::new("identity")
                    .with_attr("category", identity.category.clone())
                    .with_attr("type", identity.kind.clone())
                    .with_attr("name", identity.name.clone()),
            );
        }
        for feature in &self.caps.features {
            query = query.with_child(Node::new("feature").with_attr("var", feature.clone()));
        }
        query
    }

    /// **Message/presence/iq validation** (§4.4): reject invalid `type`,
    /// reject a non-JID `to`, auto-add own full JID and a random id.
    fn validate_and_prepare(&self, mut stanza: Stanza) -> Result<Stanza, ValidationError> {
        const VALID_MESSAGE_TYPES: &[&str] = &["chat", "error", "groupchat", "headline", "normal"];
        const VALID_PRESENCE_TYPES: &[&str] =
            &["error", "probe", "subscribe", "subscribed", "unavailable", "unsubscribe", "unsubscribed"];
        const VALID_IQ_TYPES: &[&str] = &["error", "get", "result", "set"];

        if let Some(t) = &stanza.r#type {
            let valid = match stanza.kind {
                StanzaKind::Message => VALID_MESSAGE_TYPES.contains(&t.as_str()),
                StanzaKind::Presence => VALID_PRESENCE_TYPES.contains(&t.as_str()),
                StanzaKind::Iq => VALID_IQ_TYPES.contains(&t.as_str()),
            };
            if !valid {
                return Err(ValidationError::InvalidStanzaType(t.clone()));
            }
        }
        if stanza.to.is_none() && stanza.kind != StanzaKind::Presence {
            return Err(ValidationError::InvalidJid("missing to".into()));
        }
        if stanza.id.is_none() {
            stanza.id = Some(make_id());
        }
        if stanza.from.is_none() {
            stanza.from = self.roster.own_jid().cloned();
        }
        Ok(stanza)
    }

    /// **Outgoing multicast** (§4.4, §4.8.2): if an `<addresses>` subtree is
    /// present, either forward with `to=own hostname` (server multicast
    /// feature), or emulate with one stanza per recipient.
    async fn send_with_multicast(&mut self, stanza: Stanza) -> Result<(), Error> {
        let Some(addresses) = stanza.child("addresses").cloned() else {
            return self.send_raw(stanza).await;
        };
        if self.session.server_info().supports_feature(NS_MULTICAST) {
            let mut forwarded = stanza;
            forwarded.to = self.session.own_jid().map(|j| j.bare());
            return self.send_raw(forwarded).await;
        }
        for address in addresses.children_named("address") {
            let Some(jid_str) = address.attr("jid") else { continue };
            let Ok(jid) = jid_str.parse::<Jid>() else { continue };
            let mut copy = stanza.clone();
            copy.id = Some(make_id());
            copy.to = Some(jid);
            self.send_raw(copy).await?;
        }
        Ok(())
    }

    async fn send_raw(&mut self, stanza: Stanza) -> Result<(), Error> {
        self.session.send_stanza(stanza, None, None).await?;
        Ok(())
    }

    /// `sendMessage`-level entry point used by threads above (§4.7): sends
    /// then echoes locally with `$isEcho=true` so upper layers see a single
    /// history (§4.4 "Echo of one-to-one messages").
    pub async fn send_message(&mut self, mut message: Stanza) -> Result<(), Error> {
        message.kind = StanzaKind::Message;
        if message.r#type.is_none() {
            message.r#type = Some("chat".into());
        }
        let message = self.validate_and_prepare(message)?;

        let _ = self.events.send(ClientEvent::BeforeSendMessage(Box::new(message.clone())));
        self.send_with_multicast(message.clone()).await?;
        let _ = self.events.send(ClientEvent::AfterSendMessage(Box::new(message.clone())));

        let mut echo = message;
        echo.is_echo = true;
        let _ = self.events.send(ClientEvent::IncomingMessage(Box::new(echo)));
        Ok(())
    }

    pub async fn send_presence(&mut self, mut presence: Presence) -> Result<(), Error> {
        let mut node = Node::new("presence");
        if let Some(t) = &presence.r#type {
            node = node.with_attr("type", t.clone());
        }
        if let Some(show) = &presence.show {
            node = node.with_child(Node::new("show").with_text(show.clone()));
        }
        if let Some(status) = &presence.status {
            node = node.with_child(Node::new("status").with_text(status.clone()));
        }
        node = node.with_child(Node::new("priority").with_text(presence.priority.to_string()));
        node = node.with_child(self.caps_node());
        presence.resource = self
            .session
            .own_jid()
            .and_then(|j| j.resource())
            .unwrap_or_default()
            .to_owned();

        let stanza = Stanza {
            kind: StanzaKind::Presence,
            id: None,
            from: self.session.own_jid().cloned(),
            to: None,
            r#type: presence.r#type.clone(),
            children: node.children,
            is_echo: false,
            no_echo: false,
        };
        self.session.send_stanza(stanza, None, None).await?;
        Ok(())
    }

    /// **XEP-0276 decloak directed presence** (§11): used by the multi-user
    /// thread's `unknown` → `contacted` transition (§4.8.1), rate-limited
    /// to once per 5 s per peer (§9 open question, treated as binding).
    pub async fn send_directed_presence(&mut self, to: Jid) -> Result<bool, Error> {
        let now = Instant::now();
        if let Some(last) = self.last_directed_presence.get(&to) {
            if now.duration_since(*last) < self.config.directed_presence_rate_limit {
                return Ok(false);
            }
        }
        let stanza = Stanza {
            kind: StanzaKind::Presence,
            id: Some(make_id()),
            from: self.session.own_jid().cloned(),
            to: Some(to.clone()),
            r#type: None,
            children: vec![Node::new("decloak").with_ns(DECLOAK_NS), self.caps_node()],
            is_echo: false,
            no_echo: false,
        };
        self.session.send_stanza(stanza, None, None).await?;
        self.last_directed_presence.insert(to, now);
        Ok(true)
    }

    /// **Pub-sub (PEP)** (§4.4): publish an item to a namespaced node.
    pub async fn publish(&mut self, node_name: &str, item: Node) -> Result<(), Error> {
        let publish = Node::new("publish").with_attr("node", node_name).with_child(
            Node::new("item").with_child(item),
        );
        let pubsub = Node::new("pubsub").with_ns(NS_PUBSUB).with_child(publish);
        let stanza = Stanza {
            kind: StanzaKind::Iq,
            id: Some(make_id()),
            from: self.session.own_jid().cloned(),
            to: self.session.own_jid().map(|j| j.bare()),
            r#type: Some("set".into()),
            children: vec![pubsub],
            is_echo: false,
            no_echo: false,
        };
        self.session.send_stanza(stanza, None, None).await?;
        Ok(())
    }

    fn handle_pubsub_event(&mut self, event: &Node) {
        let Some(items) = event.child("items") else { return };
        let Some(node_name) = items.attr("node") else { return };
        let Some(from) = self.session.own_jid() else { return };
        for item in items.children_named("item") {
            let _ = self.events.send(ClientEvent::PubsubEvent {
                from: from.clone(),
                node: node_name.to_owned(),
                item: Box::new(item.clone()),
            });
        }
    }

    /// `getContact(jid)` (§4.4).
    pub fn get_contact(&mut self, jid: &Jid, suppress_create: bool) -> Option<&crate::roster::RosterItem> {
        self.roster.get_contact(jid, suppress_create)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn own_jid(&self) -> Option<&Jid> {
        self.session.own_jid()
    }

    /// Drives Session's dispatch loop for one inbound stanza, answering
    /// disco#info/ping (§11) and routing the rest to roster/pubsub handling
    /// or emitting `incomingMessage` (§4.4, §6).
    pub async fn poll(&mut self) -> Result<(), Error> {
        self.session.expire_callbacks();
        let Some(stanza) = self.session.poll_stanza().await? else {
            return Ok(());
        };

        match stanza.kind {
            StanzaKind::Iq => self.handle_iq(stanza).await?,
            StanzaKind::Presence => self.handle_presence(stanza),
            StanzaKind::Message => self.handle_message(stanza),
        }
        Ok(())
    }

    fn handle_message(&mut self, stanza: Stanza) {
        if let Some(event) = stanza.child("event") {
            if event.ns.as_deref() == Some(NS_PUBSUB_EVENT) {
                self.handle_pubsub_event(&event.clone());
                return;
            }
        }
        let _ = self.events.send(ClientEvent::IncomingMessage(Box::new(stanza)));
    }

    async fn handle_iq(&mut self, stanza: Stanza) -> Result<(), Error> {
        if stanza.r#type.as_deref() == Some("get") {
            if stanza.child("query").is_some_and(|q| q.ns.as_deref() == Some(NS_DISCO_INFO)) {
                let mut result = stanza.clone();
                result.r#type = Some("result".into());
                result.to = stanza.from.clone();
                result.children = vec![self.disco_info_response()];
                self.session.send_stanza(result, None, None).await?;
                return Ok(());
            }
            if stanza.child("ping").is_some() {
                self.session.reply(&stanza, DispatchResult::Ack).await?;
                return Ok(());
            }
            self.session.reply(&stanza, DispatchResult::ServiceUnavailable).await?;
            return Ok(());
        }
        if stanza.r#type.as_deref() == Some("set") {
            if let Some(query) = stanza.child("query") {
                if query.ns.as_deref() == Some(NS_ROSTER) {
                    self.handle_roster_query(&query.clone());
                }
            }
            self.session.reply(&stanza, DispatchResult::Ack).await?;
        }
        Ok(())
    }

    fn handle_presence(&mut self, stanza: Stanza) {
        let Some(from) = stanza.from.clone() else { return };
        let resource = from.resource().unwrap_or_default().to_owned();
        let mut presence = Presence::available(resource);
        presence.r#type = stanza.r#type.clone();
        presence.show = stanza.child("show").and_then(|n| n.text.clone());
        presence.status = stanza.child("status").and_then(|n| n.text.clone());
        presence.priority = stanza
            .child("priority")
            .and_then(|n| n.text.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if let Some(c) = stanza.children.iter().find(|c| c.name == "c") {
            presence.caps_node = c.attr("node").map(|s| s.to_owned());
            presence.caps_ver = c.attr("ver").map(|s| s.to_owned());
        }

        let preferred = self.config.preferred_multicast_caps_node.clone();
        self.roster.get_contact(&from, false);
        if let Some(item) = self.roster.get_contact_mut(&from) {
            item.apply_presence(presence, Some(preferred.as_str()));
        }
        let _ = self.events.send(ClientEvent::RosterItemUpdate {
            jid: from,
            reason: "presence",
        });

        self.note_presence_activity();
    }

    /// §4.4 "waits up to 500 ms of inactivity after receiving presence
    /// stanzas to declare itself online".
    fn note_presence_activity(&mut self) {
        self.last_presence_at = Some(Instant::now());
    }

    /// Caller-driven settle check: emits `clientOnline` once presence
    /// traffic has been quiet for the configured window (§4.4).
    pub fn check_online_settle(&mut self) {
        if self.declared_online {
            return;
        }
        let Some(last) = self.last_presence_at else { return };
        if last.elapsed() >= self.config.online_settle_window {
            self.declared_online = true;
            let _ = self.events.send(ClientEvent::ClientOnline);
        }
    }

    pub fn online_settle_window(&self) -> Duration {
        self.config.online_settle_window
    }

    pub fn disconnect(mut self) {
        self.session.close();
        let _ = self.events.send(ClientEvent::XmppDisconnected(None));
    }
}
