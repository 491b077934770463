//! Multi-user thread (§4.8): participant state machine, multicast
//! addressing, thread-clock reconciliation, and the history sync protocol.
//! The largest thread variant — still a plain struct with `&mut self`
//! methods, matching the base contract in [`super`] rather than an actor.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;

use crate::clock::{Millis, SharedClock};
use crate::coopfox_ext::{self, CoopfoxExtension, ParticipantAction, ParticipantActionKind, ThreadInfo};
use crate::error::SyncError;
use crate::jid::Jid;
use crate::roster::Roster;
use crate::stanza::{make_id, Node, Stanza, StanzaKind};

use super::{build_message, Message, ParticipantStatus, ReceiveOutcome, ThreadEvent, ThreadStore};

const MULTICAST_NS: &str = "http://jabber.org/protocol/address";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    FastForward,
    Complete,
}

impl SyncMode {
    fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FastForward => "fast-forward",
            SyncMode::Complete => "complete",
        }
    }
}

/// `<query thread=ID mode=… version? timestamp=millis><diff>…</diff></query>`
/// (§4.8.4, §6 "Sync iq").
#[derive(Debug, Clone)]
pub struct SyncQuery {
    pub thread: String,
    pub mode: SyncMode,
    pub version: Option<String>,
    pub timestamp_ms: Millis,
    pub diff: Vec<Message>,
}

impl SyncQuery {
    pub fn to_node(&self) -> Node {
        let mut node = Node::new("query")
            .with_ns(coopfox_ext::SYNC_NS)
            .with_attr("thread", self.thread.clone())
            .with_attr("mode", self.mode.as_str())
            .with_attr("timestamp", self.timestamp_ms.to_string());
        if let Some(v) = &self.version {
            node = node.with_attr("version", v.clone());
        }
        if !self.diff.is_empty() {
            let mut diff = Node::new("diff");
            for m in &self.diff {
                diff = diff.with_child(m.stanza.to_node());
            }
            node = node.with_child(diff);
        }
        node
    }

    pub fn from_node(node: &Node, clock: &SharedClock) -> Option<Self> {
        let thread = node.attr("thread")?.to_owned();
        let mode = match node.attr("mode")? {
            "fast-forward" => SyncMode::FastForward,
            "complete" => SyncMode::Complete,
            _ => return None,
        };
        let version = node.attr("version").map(|s| s.to_owned());
        let timestamp_ms = node.attr("timestamp").and_then(|s| s.parse().ok()).unwrap_or_else(|| clock.now_ms());
        let diff = node
            .child("diff")
            .map(|d| {
                d.children
                    .iter()
                    .filter_map(|c| Stanza::from_node(c).ok())
                    .filter_map(|s| build_message(&s, clock))
                    .collect()
            })
            .unwrap_or_default();
        Some(SyncQuery {
            thread,
            mode,
            version,
            timestamp_ms,
            diff,
        })
    }
}

/// Reason passed to [`MultiUserThread::destroy`] (§4.8.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Leave,
    Reject,
    None,
    /// The session is being re-created locally; suppresses the leave message.
    Reload,
}

pub struct MultiUserThread {
    store: ThreadStore,
    clock: SharedClock,
    events: mpsc::UnboundedSender<ThreadEvent>,
    participants: HashMap<Jid, ParticipantStatus>,
    join_order: Vec<Jid>,
    sync_queue: VecDeque<Jid>,
    sync_in_progress: Option<Jid>,
    initial_sync_done: bool,
    was_idle: bool,
    destroyed: bool,
}

impl MultiUserThread {
    pub fn new(id: impl Into<String>, own_jid: &Jid, clock: SharedClock, events: mpsc::UnboundedSender<ThreadEvent>) -> Self {
        let mut participants = HashMap::new();
        participants.insert(own_jid.bare(), ParticipantStatus::SelfParticipant);
        MultiUserThread {
            store: ThreadStore::new(id),
            clock,
            events,
            participants,
            join_order: Vec::new(),
            sync_queue: VecDeque::new(),
            sync_in_progress: None,
            initial_sync_done: false,
            was_idle: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> &str {
        self.store.id()
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ThreadStore {
        &mut self.store
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn join_order(&self) -> &[Jid] {
        &self.join_order
    }

    pub fn participant_status(&self, jid: &Jid) -> ParticipantStatus {
        self.status_of(jid)
    }

    fn status_of(&self, jid: &Jid) -> ParticipantStatus {
        self.participants.get(&jid.bare()).copied().unwrap_or(ParticipantStatus::Unknown)
    }

    fn set_status(&mut self, bare: Jid, status: ParticipantStatus) {
        let changed = self.participants.get(&bare).copied() != Some(status);
        self.participants.insert(bare.clone(), status);
        if changed {
            let _ = self.events.send(ThreadEvent::ParticipantStatusChanged(bare, status));
        }
    }

    /// §4.8.1: sender observed → active if previously added/contacted/online.
    pub fn note_sender(&mut self, jid: &Jid) {
        let bare = jid.bare();
        if matches!(
            self.status_of(&bare),
            ParticipantStatus::Added | ParticipantStatus::Contacted | ParticipantStatus::Online
        ) {
            self.set_status(bare, ParticipantStatus::Active);
        }
    }

    /// §4.8.1: recipient observed → contacted if previously unknown.
    pub fn note_recipient(&mut self, jid: &Jid) {
        let bare = jid.bare();
        if self.status_of(&bare) == ParticipantStatus::Unknown {
            self.set_status(bare, ParticipantStatus::Contacted);
        }
    }

    /// §4.8.1: roster presence changes.
    pub fn note_presence(&mut self, jid: &Jid, available: bool) {
        let bare = jid.bare();
        let cur = self.status_of(&bare);
        if available && matches!(cur, ParticipantStatus::Inactive | ParticipantStatus::Offline | ParticipantStatus::Contacted) {
            self.set_status(bare, ParticipantStatus::Active);
        } else if !available && cur == ParticipantStatus::Active {
            self.set_status(bare, ParticipantStatus::Inactive);
        }
    }

    /// §4.8.1: a join/leave/reject `<participant>` action.
    pub fn handle_participant_action(&mut self, action: &ParticipantAction) {
        let bare = action.jid.bare();
        match action.action {
            ParticipantActionKind::Join => {
                let first_time = !self.join_order.contains(&bare);
                self.set_status(bare.clone(), ParticipantStatus::Active);
                if first_time {
                    self.join_order.push(bare.clone());
                    let _ = self.events.send(ThreadEvent::ParticipantJoinOrderChange(self.join_order.clone()));
                }
                let _ = self.events.send(ThreadEvent::ParticipantAdded(bare));
            }
            ParticipantActionKind::Leave => self.set_status(bare, ParticipantStatus::Inactive),
            ParticipantActionKind::Reject => self.set_status(bare, ParticipantStatus::Rejected),
        }
    }

    /// `addParticipant(jid)` (§4.8.1): only valid when the contact is
    /// `online`, `rejected`, or `inactive` (available again); re-inviting an
    /// inactive peer is a targeted `headline`, otherwise left to the caller
    /// to multicast via [`Self::multicast_node`].
    pub fn add_participant(&mut self, jid: Jid, own_jid: &Jid) -> Option<Stanza> {
        let bare = jid.bare();
        let cur = self.status_of(&bare);
        if !matches!(cur, ParticipantStatus::Online | ParticipantStatus::Rejected | ParticipantStatus::Inactive) {
            return None;
        }
        self.set_status(bare.clone(), ParticipantStatus::Added);

        let ext = CoopfoxExtension {
            timestamp: Some(self.current_thread_time()),
            participant: Some(ParticipantAction {
                jid: bare.clone(),
                action: ParticipantActionKind::Join,
                thread_info: Some(ThreadInfo {
                    participants: self.participants.len() as u32,
                    creator: false,
                }),
            }),
            payloads: Vec::new(),
        };
        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.id = Some(make_id());
        stanza.from = Some(own_jid.clone());
        stanza.push_child(Node::new("thread").with_text(self.store.id().to_owned()));
        stanza.push_child(ext.to_node());
        if cur == ParticipantStatus::Inactive {
            stanza.r#type = Some("headline".into());
            stanza.to = Some(bare);
        } else {
            stanza.r#type = Some("chat".into());
        }
        Some(stanza)
    }

    /// §4.8.2: `<addresses>` for the active/added participants, resolved
    /// via each contact's preferred coopfox-capable resource. `None` when
    /// nothing resolves.
    pub fn multicast_node(&self, roster: &mut Roster, preferred_caps_node: &str) -> Option<Node> {
        let mut addresses = Node::new("addresses").with_ns(MULTICAST_NS);
        let mut any = false;
        for (bare, status) in &self.participants {
            if !matches!(status, ParticipantStatus::Active | ParticipantStatus::Added) {
                continue;
            }
            if let Some(full) = roster.get_contact(bare, true).and_then(|item| item.coopfox_capable_jid(preferred_caps_node)) {
                addresses = addresses.with_child(Node::new("address").with_attr("type", "to").with_attr("jid", full.to_string()));
                any = true;
            }
        }
        any.then_some(addresses)
    }

    /// Wall clock plus the thread's non-decreasing offset (§4.8.3).
    pub fn current_thread_time(&self) -> Millis {
        self.clock.now_ms() + self.store.time_offset_ms
    }

    /// `syncThreadTime(ts)` (§4.8.3): the offset only ever grows, shifting
    /// every stored message's timestamp by the same delta so ordering is
    /// preserved.
    pub fn sync_thread_time(&mut self, ts: Millis) {
        let now = self.current_thread_time();
        if ts > now {
            let delta = ts - now + 50;
            self.store.time_offset_ms += delta;
            self.store.shift_all_timestamps(delta);
            let _ = self.events.send(ThreadEvent::ThreadTimeCorrected {
                delta_ms: delta,
                now_ms: self.current_thread_time(),
            });
        }
    }

    pub fn receive_message(&mut self, stanza: &Stanza) {
        if let Some(from) = &stanza.from {
            self.note_sender(from);
        }
        if let Some(coopfox) = stanza.children.iter().find(|c| c.name == "coopfox" && c.ns.as_deref() == Some(coopfox_ext::NS)) {
            let ext = CoopfoxExtension::from_node(coopfox);
            if let Some(ts) = ext.timestamp {
                self.sync_thread_time(ts);
            }
            if let Some(action) = &ext.participant {
                self.handle_participant_action(action);
            }
        }
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

    pub fn record_outgoing(&mut self, stanza: &Stanza) {
        if let Some(to) = &stanza.to {
            self.note_recipient(to);
        }
        let Some(message) = build_message(stanza, &self.clock) else {
            return;
        };
        let _ = self.events.send(ThreadEvent::BeforeSendMessage(message.clone()));
        self.store.receive(message.clone());
        let _ = self.events.send(ThreadEvent::AfterSendMessage(message));
    }

    /// Responder side of a pull or push (§4.8.4). `mode=complete` always
    /// returns the full history; `mode=fast-forward` returns the diff tail
    /// after `version` only if that version is part of this thread's chain.
    pub fn handle_pull_request(&self, query: &SyncQuery) -> SyncQuery {
        let diff = match query.mode {
            SyncMode::Complete => self.store.get_messages(None),
            SyncMode::FastForward => match &query.version {
                Some(v) if self.store.has_version(v) => self.store.get_messages(Some(v)),
                _ => Vec::new(),
            },
        };
        SyncQuery {
            thread: self.store.id().to_owned(),
            mode: SyncMode::FastForward,
            version: self.store.latest_version().map(|s| s.to_owned()),
            timestamp_ms: self.current_thread_time(),
            diff,
        }
    }

    /// Requester side (§4.8.4 "Fast-forward pull" reactions). Returns a
    /// follow-up `mode=complete` query to send when the responder's version
    /// mismatches without a diff.
    pub fn handle_pull_response(&mut self, response: &SyncQuery) -> Result<Option<SyncQuery>, SyncError> {
        self.sync_thread_time(response.timestamp_ms);
        self.sync_in_progress = None;
        self.check_sync_idle();
        if response.version.as_deref() == self.store.latest_version() {
            return Ok(None);
        }
        if !response.diff.is_empty() {
            self.store.import_messages(response.diff.clone(), false);
            self.check_sync_idle();
            if response.version.as_deref() != self.store.latest_version() {
                return Err(SyncError::VersionDivergence);
            }
            return Ok(None);
        }
        Ok(Some(SyncQuery {
            thread: self.store.id().to_owned(),
            mode: SyncMode::Complete,
            version: self.store.latest_version().map(|s| s.to_owned()),
            timestamp_ms: self.current_thread_time(),
            diff: Vec::new(),
        }))
    }

    /// §4.8.4 "Push": import any diff, queue a reverse pull if the
    /// announced version is unknown locally. Returns the response to send.
    pub fn handle_push(&mut self, peer: Jid, push: &SyncQuery) -> SyncQuery {
        self.sync_thread_time(push.timestamp_ms);
        if !push.diff.is_empty() {
            self.store.import_messages(push.diff.clone(), false);
        }
        let unknown = push.version.as_deref().is_some_and(|v| !self.store.has_version(v));
        if unknown {
            self.queue_pull(peer);
        }
        self.check_sync_idle();
        SyncQuery {
            thread: self.store.id().to_owned(),
            mode: SyncMode::FastForward,
            version: self.store.latest_version().map(|s| s.to_owned()),
            timestamp_ms: self.current_thread_time(),
            diff: Vec::new(),
        }
    }

    /// §4.8.4 "Queueing": at most one pull in flight, queued per peer.
    pub fn queue_pull(&mut self, peer: Jid) {
        let already_active = self.sync_in_progress.as_ref() == Some(&peer);
        if !already_active && !self.sync_queue.contains(&peer) {
            self.sync_queue.push_back(peer);
        }
        self.was_idle = false;
    }

    /// Pop the next queued pull, if none is currently in flight.
    pub fn next_pull(&mut self) -> Option<(Jid, SyncQuery)> {
        if self.sync_in_progress.is_some() {
            return None;
        }
        let peer = self.sync_queue.pop_front()?;
        self.sync_in_progress = Some(peer.clone());
        let query = SyncQuery {
            thread: self.store.id().to_owned(),
            mode: SyncMode::FastForward,
            version: self.store.latest_version().map(|s| s.to_owned()),
            timestamp_ms: self.current_thread_time(),
            diff: Vec::new(),
        };
        Some((peer, query))
    }

    /// Release the in-flight pull after the 10 s watchdog fires with no
    /// response (§4.8.4, §5 "Cancellation/timeouts").
    pub fn release_pull_timeout(&mut self) {
        self.sync_in_progress = None;
        self.check_sync_idle();
    }

    /// §4.8.4 "Idle state": `initialSyncDone ∧ syncQueue.empty ∧
    /// ¬syncInProgress`. Edge-triggers `beforeSyncIdle`/`syncIdle`.
    pub fn is_sync_idle(&self) -> bool {
        self.initial_sync_done && self.sync_queue.is_empty() && self.sync_in_progress.is_none()
    }

    fn check_sync_idle(&mut self) {
        if self.sync_queue.is_empty() && self.sync_in_progress.is_none() {
            self.initial_sync_done = true;
        }
        let idle_now = self.is_sync_idle();
        if idle_now && !self.was_idle {
            let _ = self.events.send(ThreadEvent::BeforeSyncIdle);
            let _ = self.events.send(ThreadEvent::SyncIdle);
        }
        self.was_idle = idle_now;
    }

    /// §4.8.5: wait for sync-idle (checked by the caller via
    /// [`Self::is_sync_idle`]) before calling this. Cancels the sync queue
    /// unconditionally; suppresses the leave message for `reload`.
    pub fn destroy(&mut self, reason: DestroyReason, own_jid: &Jid) -> Option<Stanza> {
        self.destroyed = true;
        self.sync_queue.clear();
        self.sync_in_progress = None;
        if reason == DestroyReason::Reload {
            return None;
        }
        let action = match reason {
            DestroyReason::Reject => ParticipantActionKind::Reject,
            DestroyReason::Leave | DestroyReason::None | DestroyReason::Reload => ParticipantActionKind::Leave,
        };
        let ext = CoopfoxExtension {
            timestamp: Some(self.current_thread_time()),
            participant: Some(ParticipantAction {
                jid: own_jid.bare(),
                action,
                thread_info: None,
            }),
            payloads: Vec::new(),
        };
        let mut stanza = Stanza::new(StanzaKind::Message);
        stanza.id = Some(make_id());
        stanza.from = Some(own_jid.clone());
        stanza.r#type = Some("headline".into());
        stanza.no_echo = reason == DestroyReason::Leave;
        stanza.push_child(Node::new("thread").with_text(self.store.id().to_owned()));
        stanza.push_child(ext.to_node());
        Some(stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use std::sync::Arc;

    fn thread(clock: SharedClock) -> (MultiUserThread, mpsc::UnboundedReceiver<ThreadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MultiUserThread::new("t1", &"a@h".parse().unwrap(), clock, tx), rx)
    }

    #[test]
    fn join_action_appends_join_order_once() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut t, _rx) = thread(clock);
        let action = ParticipantAction {
            jid: "b@h".parse().unwrap(),
            action: ParticipantActionKind::Join,
            thread_info: None,
        };
        t.handle_participant_action(&action);
        t.handle_participant_action(&action);
        assert_eq!(t.join_order(), &["b@h".parse::<Jid>().unwrap()]);
        assert_eq!(t.participant_status(&"b@h".parse().unwrap()), ParticipantStatus::Active);
    }

    #[test]
    fn clock_reconciliation_matches_scenario_3() {
        let clock: SharedClock = Arc::new(TestClock::new(1_000));
        let (mut t, mut rx) = thread(clock);
        t.sync_thread_time(1_000 + 2_000);
        assert_eq!(t.current_thread_time(), 1_000 + 2_050);
        let mut saw_correction = false;
        while let Ok(ev) = rx.try_recv() {
            if let ThreadEvent::ThreadTimeCorrected { delta_ms, now_ms } = ev {
                assert_eq!(delta_ms, 2_050);
                assert_eq!(now_ms, 1_000 + 2_050);
                saw_correction = true;
            }
        }
        assert!(saw_correction);
    }

    #[test]
    fn clock_never_moves_backward() {
        let clock: SharedClock = Arc::new(TestClock::new(1_000));
        let (mut t, _rx) = thread(clock);
        t.sync_thread_time(5_000);
        let after_first = t.current_thread_time();
        t.sync_thread_time(1_200);
        assert_eq!(t.current_thread_time(), after_first);
    }

    #[test]
    fn fast_forward_pull_with_known_version_returns_diff() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut bob, _rx) = thread(clock.clone());
        let mut m1 = Stanza::new(StanzaKind::Message);
        m1.id = Some("m1".into());
        m1.r#type = Some("chat".into());
        m1.push_child(Node::new("body").with_text("a"));
        bob.record_outgoing(&m1);
        let v_a = bob.store().latest_version().unwrap().to_owned();

        let mut m2 = Stanza::new(StanzaKind::Message);
        m2.id = Some("m2".into());
        m2.r#type = Some("chat".into());
        m2.push_child(Node::new("body").with_text("b"));
        bob.record_outgoing(&m2);
        let v_b = bob.store().latest_version().unwrap().to_owned();

        let request = SyncQuery {
            thread: "t1".into(),
            mode: SyncMode::FastForward,
            version: Some(v_a),
            timestamp_ms: 0,
            diff: Vec::new(),
        };
        let response = bob.handle_pull_request(&request);
        assert_eq!(response.version.as_deref(), Some(v_b.as_str()));
        assert_eq!(response.diff.len(), 1);
        assert_eq!(response.diff[0].id, "m2");
    }

    #[test]
    fn version_unknown_fallback_triggers_complete_pull() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut alice, _rx) = thread(clock);
        let response = SyncQuery {
            thread: "t1".into(),
            mode: SyncMode::FastForward,
            version: Some("unknown-version".into()),
            timestamp_ms: 0,
            diff: Vec::new(),
        };
        let follow_up = alice.handle_pull_response(&response).unwrap();
        assert!(matches!(follow_up, Some(q) if q.mode == SyncMode::Complete));
    }

    #[test]
    fn sync_idle_fires_once_queue_drains() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut t, mut rx) = thread(clock);
        t.queue_pull("b@h".parse().unwrap());
        let (_peer, _query) = t.next_pull().unwrap();
        assert!(!t.is_sync_idle());
        t.release_pull_timeout();
        assert!(t.is_sync_idle());
        let mut saw_idle = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ThreadEvent::SyncIdle) {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    #[test]
    fn destroy_with_reload_suppresses_leave_message() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut t, _rx) = thread(clock);
        let own: Jid = "a@h".parse().unwrap();
        assert!(t.destroy(DestroyReason::Reload, &own).is_none());
        assert!(t.is_destroyed());
    }

    #[test]
    fn destroy_with_leave_emits_noecho_headline() {
        let clock: SharedClock = Arc::new(TestClock::new(0));
        let (mut t, _rx) = thread(clock);
        let own: Jid = "a@h".parse().unwrap();
        let stanza = t.destroy(DestroyReason::Leave, &own).unwrap();
        assert_eq!(stanza.r#type.as_deref(), Some("headline"));
        assert!(stanza.no_echo);
    }
}
