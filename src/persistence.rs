//! Host key/value persistence contract (§6 "Persisted state", §1 Non-goals:
//! "no persistence format beyond a serializable message list").
//!
//! The host owns the actual byte store (opaque per §1); this crate only
//! defines the three key classes it reads/writes and the snapshot shape.
//! Grounded on the teacher's posture toward storage: `tokio-xmpp` never
//! touches disk itself, leaving credential/config persistence entirely to
//! the embedder — this module keeps that boundary and adds `serde`
//! (de)serialization for the one format the spec does own: a thread's
//! message list.

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::jid::Jid;

/// The three key classes the core reads/writes (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// A window-scoped conversation snapshot (`getMessages()` of a thread).
    ConversationSnapshot,
    /// Credential material (delegates to [`CredentialStore`] instead).
    Credential,
    /// Per-module flags (host-defined, opaque to this crate).
    ModuleFlag,
}

/// A host-provided bag from string keys to JSON values (§6).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, class: KeyClass, key: &str) -> Option<serde_json::Value>;
    fn set(&self, class: KeyClass, key: &str, value: serde_json::Value);
    fn remove(&self, class: KeyClass, key: &str);
}

/// Credential store contract (§6, §11): `get`/`set`/`confirm`/`invalidate`,
/// used by the Failsafe Client when a `loginRequired` observer needs to
/// supply or revoke credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, account: &Jid) -> Option<String>;
    fn set(&self, account: &Jid, password: &str);
    /// Called once a credential is known to have worked (e.g. after a
    /// successful SASL negotiation), for stores that keep a pending/
    /// confirmed distinction.
    fn confirm(&self, account: &Jid);
    fn invalidate(&self, account: &Jid);
}

/// One stored message, the serializable unit of a conversation snapshot
/// (§6: "The value for a conversation snapshot is the output of
/// `getMessages()` of a thread").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub from: String,
    pub to: Option<String>,
    pub timestamp: Millis,
    /// Raw XML of the message's children, preserved verbatim so domain
    /// payloads opaque to the core (§1) survive a round trip untouched.
    pub payload_xml: String,
}

/// A thread's persisted conversation snapshot: ordered messages plus enough
/// metadata to resume the version chain without replaying `importMessages`
/// over the whole history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationSnapshot {
    pub thread_id: String,
    pub messages: Vec<StoredMessage>,
    pub latest_version: Option<String>,
    pub participant_join_order: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrips_through_json() {
        let snapshot = ConversationSnapshot {
            thread_id: "t1".into(),
            messages: vec![StoredMessage {
                id: "m1".into(),
                from: "a@h".into(),
                to: Some("b@h".into()),
                timestamp: 1000,
                payload_xml: "<body>hi</body>".into(),
            }],
            latest_version: Some("abc123".into()),
            participant_join_order: vec!["a@h".into(), "b@h".into()],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ConversationSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
