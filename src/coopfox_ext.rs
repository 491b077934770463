//! CoopFox message extension (§6, §3 "Message Extensions").
//!
//! `<coopfox xmlns=NS timestamp=millis>` inside a `<message>`, carrying
//! `<participant>` and the domain payloads (`highlight`, `chat`, `result`,
//! `location`) that are otherwise opaque to the core. Grounded on the
//! teacher's habit of giving each XEP payload its own small struct
//! (`xmpp_parsers::delay::Delay`, `xmpp_parsers::caps::Caps`) convertible
//! to/from the generic element tree, generalized here to a single
//! extension namespace instead of one struct per XEP.

use crate::clock::Millis;
use crate::jid::Jid;
use crate::stanza::Node;

pub const NS: &str = "coopfox:message";
pub const SYNC_NS: &str = "coopfox:message/sync";

/// `<participant jid=… action=join|leave|reject>` with an optional nested
/// `<thread participants=N creator=true|false>` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAction {
    pub jid: Jid,
    pub action: ParticipantActionKind,
    pub thread_info: Option<ThreadInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantActionKind {
    Join,
    Leave,
    Reject,
}

impl ParticipantActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantActionKind::Join => "join",
            ParticipantActionKind::Leave => "leave",
            ParticipantActionKind::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(ParticipantActionKind::Join),
            "leave" => Some(ParticipantActionKind::Leave),
            "reject" => Some(ParticipantActionKind::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub participants: u32,
    pub creator: bool,
}

impl ParticipantAction {
    pub fn to_node(&self) -> Node {
        let mut node = Node::new("participant")
            .with_attr("jid", self.jid.to_string())
            .with_attr("action", self.action.as_str());
        if let Some(info) = &self.thread_info {
            node = node.with_child(
                Node::new("thread")
                    .with_attr("participants", info.participants.to_string())
                    .with_attr("creator", info.creator.to_string()),
            );
        }
        node
    }

    pub fn from_node(node: &Node) -> Option<Self> {
        let jid: Jid = node.attr("jid")?.parse().ok()?;
        let action = ParticipantActionKind::parse(node.attr("action")?)?;
        let thread_info = node.child("thread").map(|t| ThreadInfo {
            participants: t.attr("participants").and_then(|s| s.parse().ok()).unwrap_or(0),
            creator: t.attr("creator") == Some("true"),
        });
        Some(ParticipantAction {
            jid,
            action,
            thread_info,
        })
    }
}

/// Opaque domain payload kinds carried verbatim by the core (§6): these are
/// preserved but not interpreted beyond routing and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPayload {
    Highlight(Node),
    Chat { action: String, id: String },
    Result { action: String, id: String },
    Location {
        url: String,
        urlhash: String,
        icon: Option<String>,
        title: Option<String>,
        source: Option<String>,
    },
    /// Any other sub-element: preserved verbatim (§6 "Unknown sub-elements
    /// are preserved verbatim").
    Other(Node),
}

impl DomainPayload {
    pub fn from_node(node: &Node) -> Self {
        match node.name.as_str() {
            "highlight" => DomainPayload::Highlight(node.clone()),
            "chat" => DomainPayload::Chat {
                action: node.attr("action").unwrap_or_default().to_owned(),
                id: node.attr("id").unwrap_or_default().to_owned(),
            },
            "result" => DomainPayload::Result {
                action: node.attr("action").unwrap_or_default().to_owned(),
                id: node.attr("id").unwrap_or_default().to_owned(),
            },
            "location" => DomainPayload::Location {
                url: node.attr("url").unwrap_or_default().to_owned(),
                urlhash: node.attr("urlhash").unwrap_or_default().to_owned(),
                icon: node.attr("icon").map(|s| s.to_owned()),
                title: node.attr("title").map(|s| s.to_owned()),
                source: node.attr("source").map(|s| s.to_owned()),
            },
            _ => DomainPayload::Other(node.clone()),
        }
    }

    pub fn to_node(&self) -> Node {
        match self {
            DomainPayload::Highlight(node) | DomainPayload::Other(node) => node.clone(),
            DomainPayload::Chat { action, id } => {
                Node::new("chat").with_attr("action", action.clone()).with_attr("id", id.clone())
            }
            DomainPayload::Result { action, id } => {
                Node::new("result").with_attr("action", action.clone()).with_attr("id", id.clone())
            }
            DomainPayload::Location {
                url,
                urlhash,
                icon,
                title,
                source,
            } => {
                let mut node = Node::new("location")
                    .with_attr("url", url.clone())
                    .with_attr("urlhash", urlhash.clone());
                if let Some(v) = icon {
                    node = node.with_attr("icon", v.clone());
                }
                if let Some(v) = title {
                    node = node.with_attr("title", v.clone());
                }
                if let Some(v) = source {
                    node = node.with_attr("source", v.clone());
                }
                node
            }
        }
    }
}

/// The parsed `<coopfox>` extension of a message (§3, §6).
#[derive(Debug, Clone, Default)]
pub struct CoopfoxExtension {
    pub timestamp: Option<Millis>,
    pub participant: Option<ParticipantAction>,
    pub payloads: Vec<DomainPayload>,
}

impl CoopfoxExtension {
    pub fn to_node(&self) -> Node {
        let mut node = Node::new("coopfox").with_ns(NS);
        if let Some(ts) = self.timestamp {
            node = node.with_attr("timestamp", ts.to_string());
        }
        if let Some(p) = &self.participant {
            node = node.with_child(p.to_node());
        }
        for payload in &self.payloads {
            node = node.with_child(payload.to_node());
        }
        node
    }

    pub fn from_node(node: &Node) -> Self {
        let timestamp = node.attr("timestamp").and_then(|s| s.parse().ok());
        let participant = node.child("participant").and_then(ParticipantAction::from_node);
        let payloads = node
            .children
            .iter()
            .filter(|c| c.name != "participant")
            .map(DomainPayload::from_node)
            .collect();
        CoopfoxExtension {
            timestamp,
            participant,
            payloads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_action_roundtrips() {
        let action = ParticipantAction {
            jid: "b@h".parse().unwrap(),
            action: ParticipantActionKind::Join,
            thread_info: Some(ThreadInfo {
                participants: 2,
                creator: true,
            }),
        };
        let node = action.to_node();
        let back = ParticipantAction::from_node(&node).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn unknown_payload_preserved_verbatim() {
        let custom = Node::new("annotation").with_attr("kind", "sticky-note");
        let payload = DomainPayload::from_node(&custom);
        assert_eq!(payload.to_node(), custom);
    }

    #[test]
    fn extension_roundtrips_with_timestamp_and_payload() {
        let ext = CoopfoxExtension {
            timestamp: Some(12345),
            participant: None,
            payloads: vec![DomainPayload::Chat {
                action: "typing".into(),
                id: "c1".into(),
            }],
        };
        let node = ext.to_node();
        let back = CoopfoxExtension::from_node(&node);
        assert_eq!(back.timestamp, Some(12345));
        assert_eq!(back.payloads, ext.payloads);
    }
}
