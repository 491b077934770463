//! Thread base contract (§4.7, §3 Thread Record): message store, md5
//! version chain, the "persistent message" predicate, and history
//! normalization shared by [`contact`], [`strict`] and [`multiuser`].
//!
//! Grounded on the teacher's plain-struct domain types (`xmpp::presence`)
//! rather than an actor/trait-object model: a thread is data plus
//! `&mut self` methods, and the variants in `contact.rs`/`strict.rs`/
//! `multiuser.rs` each hold one of these by composition (§9 "Polymorphic
//! thread variants").

pub mod contact;
pub mod multiuser;
pub mod strict;

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::clock::{Millis, SharedClock};
use crate::coopfox_ext::{self, CoopfoxExtension};
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaKind};

/// A thread message: the parsed view of a stanza used for storage,
/// ordering, and version chaining (§3, §4.7).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub timestamp: Millis,
    pub stanza: Stanza,
}

/// §4.7 "a message is persistent iff `type=\"chat\"` and it contains at
/// least one non-\"thread\", non-\"addresses\", non-\"delay\" subtree that
/// either has text or a nested element."
pub fn is_persistent(stanza: &Stanza) -> bool {
    if stanza.kind != StanzaKind::Message || stanza.r#type.as_deref() != Some("chat") {
        return false;
    }
    stanza
        .children
        .iter()
        .any(|c| !matches!(c.name.as_str(), "thread" | "addresses" | "delay") && c.has_content())
}

/// §4.7 "$timestamp from (in order): a previously present numeric value
/// [coopfox.timestamp], a delay-extension stamp, or 'now'."
pub fn resolve_timestamp(stanza: &Stanza, clock: &SharedClock) -> Millis {
    if let Some(coopfox) = stanza.children.iter().find(|c| c.name == "coopfox" && c.ns.as_deref() == Some(coopfox_ext::NS)) {
        if let Some(ts) = CoopfoxExtension::from_node(coopfox).timestamp {
            return ts;
        }
    }
    if let Some(delay) = stanza.child("delay") {
        if let Some(stamp) = delay.attr("stamp") {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(stamp) {
                return parsed.timestamp_millis();
            }
        }
    }
    clock.now_ms()
}

/// Build a [`Message`] from an inbound stanza (§4.7 "requires a non-empty
/// `id`, assigns `$from`/`$to` ... if absent").
pub fn build_message(stanza: &Stanza, clock: &SharedClock) -> Option<Message> {
    let id = stanza.id.clone().filter(|s| !s.is_empty())?;
    Some(Message {
        id,
        from: stanza.from.clone(),
        to: stanza.to.clone(),
        timestamp: resolve_timestamp(stanza, clock),
        stanza: stanza.clone(),
    })
}

/// `version(n) = md5(version(n-1) || message.id)`, seed `""` (§3).
pub fn next_version(prev: &str, message_id: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(prev.as_bytes());
    hasher.update(message_id.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub message: Message,
    pub version: String,
}

/// Outcome of [`ThreadStore::receive`] (§4.7, §8 duplicate/idempotence
/// properties).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A new history entry was added.
    Stored { rewritten: bool },
    /// Not a persistent message; nothing stored.
    Ignored,
    /// An existing id was seen again; its timestamp may have been lowered.
    Duplicate { rewritten: bool },
}

/// `{ id, messages: map id→Message, history: ordered list, versions: map
/// version→index, timeOffset }` (§3 Thread Record).
#[derive(Debug, Clone)]
pub struct ThreadStore {
    id: String,
    by_id: HashMap<String, usize>,
    history: Vec<HistoryEntry>,
    versions: HashMap<String, usize>,
    pub time_offset_ms: Millis,
    suspend_normalize: u32,
}

impl ThreadStore {
    pub fn new(id: impl Into<String>) -> Self {
        ThreadStore {
            id: id.into(),
            by_id: HashMap::new(),
            history: Vec::new(),
            versions: HashMap::new(),
            time_offset_ms: 0,
            suspend_normalize: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id).map(|&idx| &self.history[idx].message)
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.history.last().map(|e| e.version.as_str())
    }

    /// Whether `version` appears anywhere in this thread's chain (§4.8.4
    /// fast-forward pull: "if it knows the offered version ... otherwise").
    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// `getMessages(sinceVersion?)` (§4.7): the ordered tail after the given
    /// version, or the full history if unknown/absent.
    pub fn get_messages(&self, since_version: Option<&str>) -> Vec<Message> {
        let start = since_version.and_then(|v| self.versions.get(v)).map(|&idx| idx + 1).unwrap_or(0);
        self.history[start.min(self.history.len())..]
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Canonical ingest path for one message (§4.7). Skips non-persistent
    /// messages entirely; collapses duplicate ids, keeping the lower
    /// timestamp (§8 "the stored m keeps `min(old.timestamp, new.timestamp)`").
    pub fn receive(&mut self, message: Message) -> ReceiveOutcome {
        if !is_persistent(&message.stanza) {
            return ReceiveOutcome::Ignored;
        }
        let is_dup = self.by_id.contains_key(&message.id);
        if is_dup {
            let idx = self.by_id[&message.id];
            if message.timestamp >= self.history[idx].message.timestamp {
                return ReceiveOutcome::Duplicate { rewritten: false };
            }
            self.history[idx].message.timestamp = message.timestamp;
        } else {
            let idx = self.history.len();
            self.by_id.insert(message.id.clone(), idx);
            self.history.push(HistoryEntry {
                message,
                version: String::new(),
            });
        }
        let rewritten = if self.suspend_normalize == 0 { self.normalize() } else { false };
        if is_dup {
            ReceiveOutcome::Duplicate { rewritten }
        } else {
            ReceiveOutcome::Stored { rewritten }
        }
    }

    /// `importMessages(list, replace?, quiet?)` (§4.7): suppresses
    /// normalization for the duration of the batch, then normalizes once.
    /// Returns whether the final order/versions changed (`historyRewritten`).
    pub fn import_messages(&mut self, list: Vec<Message>, replace: bool) -> bool {
        if replace {
            self.history.clear();
            self.by_id.clear();
            self.versions.clear();
        }
        self.suspend_normalize += 1;
        for message in list {
            self.receive(message);
        }
        self.suspend_normalize -= 1;
        if self.suspend_normalize == 0 {
            self.normalize()
        } else {
            false
        }
    }

    /// Sort by `(timestamp asc, id asc)` and recompute the version chain
    /// (§4.7, §8 ordering invariant). Returns whether anything changed.
    fn normalize(&mut self) -> bool {
        let before: Vec<&str> = self.history.iter().map(|e| e.message.id.as_str()).collect();
        self.history
            .sort_by(|a, b| a.message.timestamp.cmp(&b.message.timestamp).then_with(|| a.message.id.cmp(&b.message.id)));
        let after: Vec<&str> = self.history.iter().map(|e| e.message.id.as_str()).collect();
        let order_changed = before != after;

        self.by_id.clear();
        self.versions.clear();
        let mut prev_version = String::new();
        for (idx, entry) in self.history.iter_mut().enumerate() {
            let version = next_version(&prev_version, &entry.message.id);
            entry.version = version.clone();
            self.by_id.insert(entry.message.id.clone(), idx);
            self.versions.insert(version.clone(), idx);
            prev_version = version;
        }
        order_changed
    }

    /// Thread-clock reconciliation helper (§4.8.3): shift every stored
    /// message's timestamp by `delta_ms`. A uniform shift preserves sort
    /// order, so neither the index maps nor the version chain need
    /// recomputation.
    pub fn shift_all_timestamps(&mut self, delta_ms: Millis) {
        for entry in &mut self.history {
            entry.message.timestamp += delta_ms;
        }
    }
}

/// Participant lifecycle state (§3 "Participant Status", §4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    SelfParticipant,
    Unknown,
    Online,
    Contacted,
    Added,
    Active,
    Inactive,
    Rejected,
    Offline,
}

/// Events raised by any thread variant (§6), forwarded by the embedding
/// [`crate::hub::Hub`] on a single typed channel (§9 "Event system").
#[derive(Debug, Clone)]
pub enum ThreadEvent {
    BeforeSendMessage(Message),
    AfterSendMessage(Message),
    BeforeIncomingMessage(Message),
    IncomingMessage(Message),
    AfterIncomingMessage(Message),
    HistoryRewritten,
    ParticipantAdded(Jid),
    ParticipantStatusChanged(Jid, ParticipantStatus),
    ParticipantJoinOrderChange(Vec<Jid>),
    ThreadTimeCorrected { delta_ms: Millis, now_ms: Millis },
    BeforeSyncIdle,
    SyncIdle,
    /// A message carried a `<thread>` id not known to the hub's forest (§4.6).
    UnknownStrictThread(Stanza),
    /// A message matched no strict thread and no contact thread (§4.6).
    UnknownThread(Stanza),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::stanza::Node;

    fn chat(id: &str, body: &str) -> Stanza {
        let mut s = Stanza::new(StanzaKind::Message);
        s.id = Some(id.to_owned());
        s.r#type = Some("chat".into());
        s.push_child(Node::new("body").with_text(body));
        s
    }

    #[test]
    fn non_persistent_message_is_ignored() {
        let mut s = Stanza::new(StanzaKind::Message);
        s.id = Some("m1".into());
        s.r#type = Some("chat".into());
        s.push_child(Node::new("thread").with_text("t1"));
        assert!(!is_persistent(&s));
    }

    #[test]
    fn ordering_invariant_holds_after_out_of_order_inserts() {
        let mut store = ThreadStore::new("t1");
        let clock: SharedClock = std::sync::Arc::new(TestClock::new(0));
        let mut m2 = build_message(&chat("m2", "second"), &clock).unwrap();
        m2.timestamp = 200;
        let mut m1 = build_message(&chat("m1", "first"), &clock).unwrap();
        m1.timestamp = 100;
        store.receive(m2);
        store.receive(m1);

        let ids: Vec<&str> = store.history().iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn version_chain_matches_definition() {
        let mut store = ThreadStore::new("t1");
        let clock: SharedClock = std::sync::Arc::new(TestClock::new(0));
        store.receive(build_message(&chat("m1", "hi"), &clock).unwrap());
        let v0 = next_version("", "m1");
        assert_eq!(store.history()[0].version, v0);
    }

    #[test]
    fn duplicate_id_keeps_lower_timestamp() {
        let mut store = ThreadStore::new("t1");
        let clock: SharedClock = std::sync::Arc::new(TestClock::new(0));
        let mut first = build_message(&chat("m1", "hi"), &clock).unwrap();
        first.timestamp = 200;
        let mut second = first.clone();
        second.timestamp = 100;
        store.receive(first);
        store.receive(second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("m1").unwrap().timestamp, 100);
    }

    #[test]
    fn import_messages_is_idempotent_with_get_messages() {
        let mut store = ThreadStore::new("t1");
        let clock: SharedClock = std::sync::Arc::new(TestClock::new(0));
        let mut m1 = build_message(&chat("m1", "a"), &clock).unwrap();
        m1.timestamp = 10;
        let mut m2 = build_message(&chat("m2", "b"), &clock).unwrap();
        m2.timestamp = 20;
        store.import_messages(vec![m1, m2], false);
        let snapshot = store.get_messages(None);

        let mut replay = ThreadStore::new("t1");
        replay.import_messages(snapshot, false);
        assert_eq!(replay.latest_version(), store.latest_version());
        assert_eq!(replay.len(), store.len());
    }

    #[test]
    fn get_messages_since_unknown_version_returns_all() {
        let mut store = ThreadStore::new("t1");
        let clock: SharedClock = std::sync::Arc::new(TestClock::new(0));
        store.receive(build_message(&chat("m1", "a"), &clock).unwrap());
        assert_eq!(store.get_messages(Some("no-such-version")).len(), 1);
    }
}
