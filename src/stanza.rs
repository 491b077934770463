//! Stanza: a tagged-tree record for `message|presence|iq` (§3 DATA MODEL).
//!
//! Grounded in the teacher's `tokio_xmpp::Stanza` enum (`event.rs`), which
//! wraps strongly-typed `xmpp_parsers` structs for `Iq`/`Message`/`Presence`.
//! This crate needs the more general "neutral tagged tree" the spec asks
//! for (arbitrary, forward-compatible CoopFox payloads), so `Stanza` here
//! carries a generic child list instead of per-XEP structs, convertible to
//! and from `minidom::Element` the same way `xso::minidom_compat` bridges
//! typed stanzas to `Element`.

use std::fmt;

use minidom::Element;

use crate::clock::Millis;
use crate::jid::Jid;

/// A random stanza id (§4.3 "fills in a random `id` when absent").
pub fn make_id() -> String {
    use rand::Rng;
    let n: u64 = rand::thread_rng().gen();
    format!("{n:016x}")
}

/// Top-level stanza kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }
}

impl std::str::FromStr for StanzaKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(StanzaKind::Message),
            "presence" => Ok(StanzaKind::Presence),
            "iq" => Ok(StanzaKind::Iq),
            _ => Err(()),
        }
    }
}

/// A child subtree, identified by local name and optional namespace. The
/// tagged-tree encoding rule (§4.2): text becomes `$text`, repeated names
/// form a list (callers filter `children` by name), nested elements recurse.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: String,
    pub ns: Option<String>,
    pub attrs: Vec<(String, String)>,
    /// `$text` payload of this leaf, if any.
    pub text: Option<String>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            ns: None,
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.attrs.push((k.into(), v.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child with the given local name, regardless of namespace.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name, in document order (the
    /// "repeated names become a list" rule).
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Whether this subtree has text or at least one nested element
    /// (used by the "persistent message" predicate, §4.7).
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty()) || !self.children.is_empty()
    }

    fn to_element(&self) -> Element {
        node_to_element(self)
    }

    fn from_element(el: &Element) -> Self {
        element_to_node(el)
    }
}

/// Build a [`minidom::Element`] from a [`Node`] subtree. Shared by
/// [`Stanza::to_element`] and the codec's `writeElement`.
pub fn node_to_element(node: &Node) -> Element {
    let ns = node.ns.clone().unwrap_or_default();
    let mut builder = Element::builder(node.name.clone(), ns);
    for (k, v) in &node.attrs {
        builder = builder.attr(k.clone(), v.clone());
    }
    let mut el = builder.build();
    if let Some(text) = &node.text {
        el.append_text_node(text.clone());
    }
    for child in &node.children {
        el.append_child(node_to_element(child));
    }
    el
}

/// Parse a [`minidom::Element`] subtree into a [`Node`]. Shared by
/// [`Stanza::from_element`] and the codec's element event.
pub fn element_to_node(el: &Element) -> Node {
    let mut node = Node::new(el.name().to_owned());
    if !el.ns().is_empty() {
        node.ns = Some(el.ns());
    }
    for (k, v) in el.attrs() {
        node.attrs.push((k.to_owned(), v.to_owned()));
    }
    let text: String = el.texts().collect::<Vec<_>>().join("");
    if !text.is_empty() {
        node.text = Some(text);
    }
    for child in el.children() {
        node.children.push(element_to_node(child));
    }
    node
}

/// A stanza: `{ kind, id?, from?, to?, type?, children }` (§3).
#[derive(Debug, Clone)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub r#type: Option<String>,
    pub children: Vec<Node>,
    /// Transient marker, not serialized: set on the locally re-dispatched
    /// copy of a just-sent message (§4.4 "Echo of one-to-one messages").
    pub is_echo: bool,
    /// Transient marker, not serialized: set when a leave/teardown message
    /// should not be echoed back through the normal receive path (§4.8.5).
    pub no_echo: bool,
}

impl Stanza {
    pub fn new(kind: StanzaKind) -> Self {
        Stanza {
            kind,
            id: None,
            from: None,
            to: None,
            r#type: None,
            children: Vec::new(),
            is_echo: false,
            no_echo: false,
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn push_child(&mut self, node: Node) -> &mut Self {
        self.children.push(node);
        self
    }

    /// Stanza equality for replay/echo detection: by `id` (§3).
    pub fn id_eq(&self, other: &Stanza) -> bool {
        matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b)
    }

    pub fn to_element(&self) -> Element {
        let ns = "jabber:client";
        let mut builder = Element::builder(self.kind.as_str(), ns);
        if let Some(id) = &self.id {
            builder = builder.attr("id", id.clone());
        }
        if let Some(from) = &self.from {
            builder = builder.attr("from", from.to_string());
        }
        if let Some(to) = &self.to {
            builder = builder.attr("to", to.to_string());
        }
        if let Some(t) = &self.r#type {
            builder = builder.attr("type", t.clone());
        }
        let mut el = builder.build();
        for child in &self.children {
            el.append_child(child.to_element());
        }
        el
    }

    /// Convert to the generic tagged tree the codec writes (§4.2), without
    /// going through `minidom::Element`.
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.kind.as_str());
        if let Some(id) = &self.id {
            node = node.with_attr("id", id.clone());
        }
        if let Some(from) = &self.from {
            node = node.with_attr("from", from.to_string());
        }
        if let Some(to) = &self.to {
            node = node.with_attr("to", to.to_string());
        }
        if let Some(t) = &self.r#type {
            node = node.with_attr("type", t.clone());
        }
        node.children = self.children.clone();
        node
    }

    /// Build a [`Stanza`] from a tagged tree produced by the codec (§4.2).
    pub fn from_node(node: &Node) -> Result<Self, String> {
        let kind: StanzaKind = node
            .name
            .parse()
            .map_err(|_| format!("not a stanza: <{}>", node.name))?;
        let from = node
            .attr("from")
            .map(|s| s.parse::<crate::jid::Jid>())
            .transpose()
            .map_err(|e| e.to_string())?;
        let to = node
            .attr("to")
            .map(|s| s.parse::<crate::jid::Jid>())
            .transpose()
            .map_err(|e| e.to_string())?;
        let mut stanza = Stanza::new(kind);
        stanza.id = node.attr("id").map(|s| s.to_owned());
        stanza.from = from;
        stanza.to = to;
        stanza.r#type = node.attr("type").map(|s| s.to_owned());
        stanza.children = node.children.clone();
        Ok(stanza)
    }

    pub fn from_element(el: &Element) -> Result<Self, String> {
        let kind: StanzaKind = el
            .name()
            .parse()
            .map_err(|_| format!("not a stanza: <{}>", el.name()))?;
        let from = el
            .attr("from")
            .map(|s| s.parse::<Jid>())
            .transpose()
            .map_err(|e| e.to_string())?;
        let to = el
            .attr("to")
            .map(|s| s.parse::<Jid>())
            .transpose()
            .map_err(|e| e.to_string())?;
        let mut stanza = Stanza::new(kind);
        stanza.id = el.attr("id").map(|s| s.to_owned());
        stanza.from = from;
        stanza.to = to;
        stanza.r#type = el.attr("type").map(|s| s.to_owned());
        for child in el.children() {
            stanza.children.push(Node::from_element(child));
        }
        Ok(stanza)
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_element())
    }
}

/// An outgoing iq stanza stored with its original payload, a wall-clock
/// timestamp, and at most one success/error continuation (§3 Callback-Stanza).
pub struct CallbackStanza {
    pub stanza: Stanza,
    pub sent_at_ms: Millis,
    pub on_success: Option<Box<dyn FnOnce(Stanza) + Send>>,
    pub on_error: Option<Box<dyn FnOnce(Stanza) + Send>>,
}

impl fmt::Debug for CallbackStanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CallbackStanza")
            .field("stanza_id", &self.stanza.id)
            .field("sent_at_ms", &self.sent_at_ms)
            .finish()
    }
}

/// Callback TTL (§3, §5): 10 seconds.
pub const CALLBACK_TTL_MS: Millis = 10_000;

impl CallbackStanza {
    pub fn is_expired(&self, now_ms: Millis) -> bool {
        now_ms.saturating_sub(self.sent_at_ms) >= CALLBACK_TTL_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_element() {
        let mut s = Stanza::new(StanzaKind::Message);
        s.id = Some("m1".into());
        s.from = Some("a@h/r".parse().unwrap());
        s.to = Some("b@h".parse().unwrap());
        s.r#type = Some("chat".into());
        s.push_child(Node::new("body").with_text("hi"));
        s.push_child(Node::new("thread").with_text("t1"));

        let el = s.to_element();
        let back = Stanza::from_element(&el).unwrap();
        assert_eq!(back.kind, StanzaKind::Message);
        assert_eq!(back.id.as_deref(), Some("m1"));
        assert_eq!(back.child("body").unwrap().text.as_deref(), Some("hi"));
        assert_eq!(back.child("thread").unwrap().text.as_deref(), Some("t1"));
    }

    #[test]
    fn repeated_children_preserved_as_list() {
        let mut s = Stanza::new(StanzaKind::Message);
        s.push_child(Node::new("address").with_attr("jid", "a@h"));
        s.push_child(Node::new("address").with_attr("jid", "b@h"));
        assert_eq!(s.children_named("address").count(), 2);
    }
}
