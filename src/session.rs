//! XMPP handshake and stanza dispatch (§4.3).
//!
//! Grounded on `tokio-xmpp::client::login`/`bind` for the handshake sequence
//! and on `proto::XmppStream`/`event.rs` for the send/dispatch contract,
//! reworked around this crate's generic [`crate::stanza::Node`] tree instead
//! of typed `xmpp_parsers` stanzas, and around [`crate::sasl_digest`] instead
//! of the `sasl` crate (see `DESIGN.md`).

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::clock::SharedClock;
use crate::codec::{self, CodecEvent, StreamCodec};
use crate::config::ClientConfig;
use crate::error::{AuthError, Error, ProtocolError};
use crate::jid::Jid;
use crate::roster::ServerInfo;
use crate::sasl_digest::{self, MechanismKind};
use crate::stanza::{make_id, CallbackStanza, Node, Stanza, StanzaKind};
use crate::transport::tcp::{self, TcpTransport};
use crate::transport::TransportControl;

const NS_JABBER_CLIENT: &str = "jabber:client";
const NS_STREAM: &str = "http://etherx.jabber.org/streams";
const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// State machine terminal/non-terminal states (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    StreamOpen,
    TlsNegotiating,
    SaslNegotiating,
    ResourceBinding,
    SessionRequest,
    ServiceDiscovery,
    Active,
    Error,
    Disconnected,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::StreamOpen => "stream-open",
            SessionState::TlsNegotiating => "tls-negotiating",
            SessionState::SaslNegotiating => "sasl-negotiating",
            SessionState::ResourceBinding => "resource-binding",
            SessionState::SessionRequest => "session-request",
            SessionState::ServiceDiscovery => "service-discovery",
            SessionState::Active => "session-active",
            SessionState::Error => "error",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// Login credentials for SASL negotiation (§4.3).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Result of routing an inbound non-result stanza to the subclass handler
/// (§4.3 "Stanza-receive contract").
pub enum DispatchResult {
    Ack,
    ServiceUnavailable,
    Condition(String, Option<String>),
}

/// Implemented by the layer above Session (Client, §4.4) to receive routed
/// stanzas.
pub trait StanzaHandler: Send {
    fn handle(&mut self, stanza: &Stanza) -> DispatchResult;
}

type SuccessCb = Box<dyn FnOnce(Stanza) + Send>;
type ErrorCb = Box<dyn FnOnce(Stanza) + Send>;

/// Performs the XMPP handshake over a [`TcpTransport`] and exposes
/// `send_stanza`/`dispatch` (§4.3).
pub struct Session {
    transport: TcpTransport,
    codec: StreamCodec,
    pending: std::collections::VecDeque<CodecEvent>,
    state: SessionState,
    callbacks: HashMap<String, CallbackStanza>,
    own_jid: Option<Jid>,
    server_info: ServerInfo,
    clock: SharedClock,
    domain: String,
    config: ClientConfig,
}

impl Session {
    fn new(transport: TcpTransport, domain: &str, clock: SharedClock, config: ClientConfig) -> Self {
        Session {
            transport,
            codec: StreamCodec::new(),
            pending: std::collections::VecDeque::new(),
            state: SessionState::Connecting,
            callbacks: HashMap::new(),
            own_jid: None,
            server_info: ServerInfo::default(),
            clock,
            domain: domain.to_owned(),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn own_jid(&self) -> Option<&Jid> {
        self.own_jid.as_ref()
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    fn assert_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state != expected {
            return Err(ProtocolError::UnexpectedState {
                expected: expected.name(),
                actual: self.state.name(),
            }
            .into());
        }
        Ok(())
    }

    async fn write_node(&mut self, node: &Node) -> Result<(), Error> {
        let bytes = codec::write_element(node);
        self.transport.write_all(&bytes).await.map_err(Error::from)?;
        self.transport.flush().await.map_err(Error::from)?;
        self.transport.note_activity();
        Ok(())
    }

    async fn write_header(&mut self) -> Result<(), Error> {
        let header = format!(
            "<stream:stream xmlns='{NS_JABBER_CLIENT}' xmlns:stream='{NS_STREAM}' to='{}' version='1.0'>",
            self.domain,
        );
        self.transport.write_all(header.as_bytes()).await.map_err(Error::from)?;
        self.transport.flush().await.map_err(Error::from)?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<CodecEvent, Error> {
        if let Some(ev) = self.pending.pop_front() {
            return Ok(ev);
        }
        let mut buf = [0u8; 4096];
        loop {
            let n = self.transport.read(&mut buf).await.map_err(|e| {
                Error::Transport(crate::error::TransportError::Tcp(e.to_string()))
            })?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            self.codec.feed(&buf[..n]);
            self.transport.note_activity();
            let mut events = self.codec.poll_events()?;
            if events.is_empty() {
                continue;
            }
            let first = events.remove(0);
            self.pending.extend(events);
            return Ok(first);
        }
    }

    /// Wait for the next top-level `<stream:stream>` child, skipping any
    /// `streamStart`/`streamEnd` control events.
    async fn next_element(&mut self) -> Result<(Node, String), Error> {
        loop {
            match self.next_event().await? {
                CodecEvent::Element(node, name) => return Ok((node, name)),
                CodecEvent::StreamEnd => return Err(Error::Disconnected),
                CodecEvent::StreamStart(_) => continue,
            }
        }
    }

    async fn expect_stream_start(&mut self) -> Result<(), Error> {
        match self.next_event().await? {
            CodecEvent::StreamStart(_) => Ok(()),
            CodecEvent::Element(_, _) => Err(ProtocolError::InvalidToken.into()),
            CodecEvent::StreamEnd => Err(Error::Disconnected),
        }
    }

    async fn read_features(&mut self) -> Result<Node, Error> {
        loop {
            let (node, name) = self.next_element().await?;
            if name == "features" {
                return Ok(node);
            }
        }
    }

    /// Drive the full handshake state machine (§4.3).
    pub async fn connect(
        host: &str,
        port: u16,
        domain: &str,
        creds: Credentials,
        clock: SharedClock,
        config: ClientConfig,
    ) -> Result<Session, Error> {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = TcpTransport::connect(host, port, domain, config.security_policy, events_tx).await?;
        let mut session = Session::new(transport, domain, clock, config);

        session.write_header().await?;
        session.state = SessionState::StreamOpen;
        session.expect_stream_start().await?;
        let mut features = session.read_features().await?;

        if features.child("starttls").is_some() {
            session.negotiate_starttls().await?;
            session.write_header().await?;
            session.expect_stream_start().await?;
            features = session.read_features().await?;
        } else if session.config.security_policy.requires_starttls() {
            return Err(ProtocolError::StarttlsRequired.into());
        }

        session.state = SessionState::SaslNegotiating;
        session.negotiate_sasl(&features, &creds).await?;
        session.codec.reset_stream();
        session.write_header().await?;
        session.state = SessionState::StreamOpen;
        session.expect_stream_start().await?;
        let features = session.read_features().await?;

        session.state = SessionState::ResourceBinding;
        session.bind_resource(&creds.username).await?;

        if features.child("session").is_some() {
            session.state = SessionState::SessionRequest;
            session.request_session().await?;
        }

        session.state = SessionState::ServiceDiscovery;
        session.discover_server_info().await?;

        session.state = SessionState::Active;
        log::debug!("session active as {:?}", session.own_jid);
        Ok(session)
    }

    async fn negotiate_starttls(&mut self) -> Result<(), Error> {
        self.state = SessionState::TlsNegotiating;
        self.write_node(&Node::new("starttls").with_ns(NS_TLS)).await?;
        let (_, name) = self.next_element().await?;
        if name != "proceed" {
            return Err(ProtocolError::NoTls.into());
        }
        tcp::perform_starttls(&mut self.transport).await?;
        Ok(())
    }

    async fn negotiate_sasl(&mut self, features: &Node, creds: &Credentials) -> Result<(), Error> {
        let mechanisms: std::collections::BTreeSet<String> = features
            .child("mechanisms")
            .map(|m| {
                m.children_named("mechanism")
                    .filter_map(|c| c.text.clone())
                    .collect()
            })
            .unwrap_or_default();
        let kind = MechanismKind::negotiate(&mechanisms)?;

        match kind {
            MechanismKind::Plain => {
                let payload = sasl_digest::plain_initial(&creds.username, &creds.password);
                let node = Node::new("auth")
                    .with_ns(NS_SASL)
                    .with_attr("mechanism", kind.name())
                    .with_text(sasl_digest::encode(&payload));
                self.write_node(&node).await?;
            }
            MechanismKind::DigestMd5 => {
                let node = Node::new("auth").with_ns(NS_SASL).with_attr("mechanism", kind.name());
                self.write_node(&node).await?;
                let (challenge_node, name) = self.next_element().await?;
                if name != "challenge" {
                    return Err(self.sasl_failure_or_protocol_error(&challenge_node, name));
                }
                let challenge_text = challenge_node.text.clone().unwrap_or_default();
                let challenge = sasl_digest::decode(&challenge_text)?;
                let digest = sasl_digest::DigestMd5::new(&creds.username, &creds.password);
                let response = digest.respond(&challenge, &self.domain)?;
                let node = Node::new("response")
                    .with_ns(NS_SASL)
                    .with_text(sasl_digest::encode(&response));
                self.write_node(&node).await?;

                let (second_node, second_name) = self.next_element().await?;
                if second_name == "challenge" {
                    // RFC 2831 second round (rspauth verification): reply
                    // with an empty response to complete the exchange.
                    self.write_node(&Node::new("response").with_ns(NS_SASL)).await?;
                } else if second_name != "success" {
                    return Err(self.sasl_failure_or_protocol_error(&second_node, second_name));
                } else {
                    return Ok(());
                }
            }
        }

        let (node, name) = self.next_element().await?;
        if name != "success" {
            return Err(self.sasl_failure_or_protocol_error(&node, name));
        }
        Ok(())
    }

    fn sasl_failure_or_protocol_error(&self, node: &Node, name: String) -> Error {
        if name == "failure" {
            let condition = node
                .children
                .first()
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "not-authorized".into());
            AuthError::Fail(condition).into()
        } else {
            ProtocolError::InvalidToken.into()
        }
    }

    async fn bind_resource(&mut self, _username: &str) -> Result<(), Error> {
        let id = make_id();
        let bind = Node::new("bind")
            .with_ns(NS_BIND)
            .with_child(Node::new("resource").with_text(self.config.resource_hint.clone()));
        let iq = Node::new("iq").with_attr("type", "set").with_attr("id", id.clone()).with_child(bind);
        self.write_node(&iq).await?;

        let (node, name) = self.next_element().await?;
        if name != "iq" || node.attr("id") != Some(id.as_str()) {
            return Err(ProtocolError::InvalidBindResponse.into());
        }
        let jid_text = node
            .child("bind")
            .and_then(|b| b.child("jid"))
            .and_then(|j| j.text.clone())
            .ok_or(ProtocolError::InvalidBindResponse)?;
        self.own_jid = Some(jid_text.parse()?);
        Ok(())
    }

    async fn request_session(&mut self) -> Result<(), Error> {
        let id = make_id();
        let iq = Node::new("iq")
            .with_attr("type", "set")
            .with_attr("id", id.clone())
            .with_child(Node::new("session").with_ns(NS_SESSION));
        self.write_node(&iq).await?;
        let (node, name) = self.next_element().await?;
        if name != "iq" || node.attr("id") != Some(id.as_str()) {
            return Err(ProtocolError::UnexpectedState {
                expected: "session-request",
                actual: "unknown",
            }
            .into());
        }
        Ok(())
    }

    async fn discover_server_info(&mut self) -> Result<(), Error> {
        let id = make_id();
        let iq = Node::new("iq")
            .with_attr("type", "get")
            .with_attr("id", id.clone())
            .with_attr("to", self.domain.clone())
            .with_child(Node::new("query").with_ns(NS_DISCO_INFO));
        self.write_node(&iq).await?;

        let (node, name) = self.next_element().await?;
        if name != "iq" || node.attr("id") != Some(id.as_str()) {
            return Err(ProtocolError::UnexpectedState {
                expected: "service-discovery",
                actual: "unknown",
            }
            .into());
        }
        if let Some(query) = node.child("query") {
            for identity in query.children_named("identity") {
                let category = identity.attr("category").unwrap_or_default().to_owned();
                let kind = identity.attr("type").unwrap_or_default().to_owned();
                let name = identity.attr("name").unwrap_or_default().to_owned();
                self.server_info
                    .identities
                    .entry(category)
                    .or_default()
                    .insert(kind, name);
            }
            for feature in query.children_named("feature") {
                if let Some(var) = feature.attr("var") {
                    self.server_info.features.insert(var.to_owned());
                }
            }
        }
        Ok(())
    }

    /// `sendStanza(kind, tree)` (§4.3): fills `id`/`from`, stores the
    /// callback descriptor if it declares a continuation, writes to the
    /// codec.
    pub async fn send_stanza(
        &mut self,
        mut stanza: Stanza,
        on_success: Option<SuccessCb>,
        on_error: Option<ErrorCb>,
    ) -> Result<String, Error> {
        self.assert_state(SessionState::Active)?;
        let id = stanza.id.clone().unwrap_or_else(make_id);
        stanza.id = Some(id.clone());
        if stanza.from.is_none() {
            stanza.from = self.own_jid.clone();
        }
        let node = stanza.to_node();
        if on_success.is_some() || on_error.is_some() {
            self.callbacks.insert(
                id.clone(),
                CallbackStanza {
                    stanza: stanza.clone(),
                    sent_at_ms: self.clock.now_ms(),
                    on_success,
                    on_error,
                },
            );
        }
        self.write_node(&node).await?;
        Ok(id)
    }

    /// Drop callback entries whose TTL (10 s) has expired (§3, §5, §7
    /// "Callback TTL").
    pub fn expire_callbacks(&mut self) {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .callbacks
            .iter()
            .filter(|(_, cb)| cb.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.callbacks.remove(&id);
            log::warn!("callback {id} expired without a response");
        }
    }

    /// Pull and classify the next inbound stanza: a result/error is matched
    /// against the callback table and consumed; anything else is returned
    /// for the caller to route to a [`StanzaHandler`] (§4.3).
    pub async fn poll_stanza(&mut self) -> Result<Option<Stanza>, Error> {
        let (node, name) = match self.next_event().await {
            Ok(CodecEvent::Element(node, name)) => (node, name),
            Ok(CodecEvent::StreamEnd) | Err(Error::Disconnected) => return Err(Error::Disconnected),
            Ok(CodecEvent::StreamStart(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !matches!(name.as_str(), "iq" | "message" | "presence") {
            return Ok(None);
        }
        let stanza = Stanza::from_node(&node).map_err(ProtocolError::Parser)?;

        if stanza.kind == StanzaKind::Iq {
            if let Some(t) = &stanza.r#type {
                if (t == "result" || t == "error") && stanza.id.is_some() {
                    if let Some(cb) = stanza.id.as_deref().and_then(|id| self.callbacks.remove(id)) {
                        if t == "result" {
                            if let Some(cb) = cb.on_success {
                                cb(stanza);
                            }
                        } else if let Some(cb) = cb.on_error {
                            cb(stanza);
                        }
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(stanza))
    }

    /// Reply to an inbound stanza with the outcome a [`StanzaHandler`]
    /// decided on (§4.3).
    pub async fn reply(&mut self, request: &Stanza, result: DispatchResult) -> Result<(), Error> {
        if request.kind != StanzaKind::Iq {
            return Ok(());
        }
        let Some(id) = &request.id else { return Ok(()) };
        let mut reply = Stanza::new(StanzaKind::Iq);
        reply.id = Some(id.clone());
        reply.to = request.from.clone();
        match result {
            DispatchResult::Ack => {
                reply.r#type = Some("result".into());
            }
            DispatchResult::ServiceUnavailable => {
                reply.r#type = Some("error".into());
                reply.push_child(error_payload("service-unavailable", "cancel", None));
            }
            DispatchResult::Condition(condition, text) => {
                reply.r#type = Some("error".into());
                reply.push_child(error_payload(&condition, "modify", text.as_deref()));
            }
        }
        self.write_node(&reply.to_node()).await
    }

    pub fn close(&mut self) {
        self.state = SessionState::Disconnected;
        self.callbacks.clear();
        self.transport.close();
    }

    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.transport.set_reply_timeout(timeout.as_millis() as u64);
    }
}

fn error_payload(condition: &str, kind: &str, text: Option<&str>) -> Node {
    let mut error = Node::new("error").with_attr("type", kind);
    error = error.with_child(Node::new(condition).with_ns("urn:ietf:params:xml:ns:xmpp-stanzas"));
    if let Some(text) = text {
        error = error.with_child(
            Node::new("text")
                .with_ns("urn:ietf:params:xml:ns:xmpp-stanzas")
                .with_text(text),
        );
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_names_are_distinct() {
        let states = [
            SessionState::Connecting,
            SessionState::StreamOpen,
            SessionState::TlsNegotiating,
            SessionState::SaslNegotiating,
            SessionState::ResourceBinding,
            SessionState::SessionRequest,
            SessionState::ServiceDiscovery,
            SessionState::Active,
            SessionState::Error,
            SessionState::Disconnected,
        ];
        let names: std::collections::HashSet<_> = states.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), states.len());
    }

    #[test]
    fn error_payload_has_condition_child() {
        let node = error_payload("item-not-found", "cancel", Some("no such thread"));
        assert!(node.child("item-not-found").is_some());
        assert_eq!(node.child("text").and_then(|t| t.text.as_deref()), Some("no such thread"));
    }
}
