//! Roster, presence and server-info (§3, §4.4).
//!
//! Grounded on the teacher's `xmpp::presence`/`event.rs` plain-struct style
//! (no builder macros for this read-mostly domain state) and on
//! `xmpp_parsers::disco` for the identity/feature shapes `ServerInfo` mirrors.

use std::collections::{BTreeSet, HashMap};

use crate::jid::Jid;

/// Roster item subscription state (RFC 6121 §2.1.2.5), as a plain string so
/// unknown values round-trip rather than failing validation.
pub type SubscriptionState = String;

/// `{ type?, show?, status?, priority, resource, capsNode, capsVer }` (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub r#type: Option<String>,
    pub show: Option<String>,
    pub status: Option<String>,
    pub priority: i8,
    pub resource: String,
    pub caps_node: Option<String>,
    pub caps_ver: Option<String>,
}

impl Presence {
    pub fn available(resource: impl Into<String>) -> Self {
        Presence {
            r#type: None,
            show: None,
            status: None,
            priority: 0,
            resource: resource.into(),
            caps_node: None,
            caps_ver: None,
        }
    }

    /// Missing `type` means "available" (§3).
    pub fn is_available(&self) -> bool {
        self.r#type.is_none() || self.r#type.as_deref() == Some("available")
    }
}

/// Total order used to pick the primary resource (§3, §4.4): available beats
/// unavailable; a preferred `capsNode` wins; higher priority wins; stable
/// otherwise (ties keep the existing primary).
fn is_preferred(candidate: &Presence, current: &Presence, preferred_caps_node: Option<&str>) -> bool {
    let c_avail = candidate.is_available();
    let cur_avail = current.is_available();
    if c_avail != cur_avail {
        return c_avail;
    }
    if let Some(node) = preferred_caps_node {
        let c_pref = candidate.caps_node.as_deref() == Some(node);
        let cur_pref = current.caps_node.as_deref() == Some(node);
        if c_pref != cur_pref {
            return c_pref;
        }
    }
    candidate.priority > current.priority
}

/// `{ jid (bare), displayName, subscriptionState, presenceMap, primaryPresence,
/// temporary flag }` (§3).
#[derive(Debug, Clone)]
pub struct RosterItem {
    pub jid: Jid,
    pub display_name: Option<String>,
    pub subscription: SubscriptionState,
    /// Keyed by resource.
    pub presence_map: HashMap<String, Presence>,
    pub primary_resource: Option<String>,
    /// Created on-the-fly for a JID not (yet) present in the real roster.
    pub temporary: bool,
    pub is_self: bool,
}

impl RosterItem {
    pub fn new(jid: Jid) -> Self {
        RosterItem {
            jid,
            display_name: None,
            subscription: "none".into(),
            presence_map: HashMap::new(),
            primary_resource: None,
            temporary: false,
            is_self: false,
        }
    }

    pub fn temporary_for(jid: Jid) -> Self {
        let mut item = RosterItem::new(jid);
        item.temporary = true;
        item
    }

    pub fn rself(jid: Jid) -> Self {
        let mut item = RosterItem::new(jid);
        item.is_self = true;
        item.temporary = false;
        item
    }

    /// The selected presence entry, if any (§3: null iff all entries are
    /// unavailable... actually: null iff the map contains only unavailable
    /// entries, or is empty).
    pub fn primary_presence(&self) -> Option<&Presence> {
        self.primary_resource
            .as_deref()
            .and_then(|r| self.presence_map.get(r))
    }

    /// Apply an inbound presence, re-running primary-resource selection
    /// (§3 invariant: "presence map entries ... only replaced by a more
    /// recent primary selection; `primary.resource` is null iff the map
    /// contains only unavailable entries").
    pub fn apply_presence(&mut self, presence: Presence, preferred_caps_node: Option<&str>) {
        self.presence_map.insert(presence.resource.clone(), presence);
        self.recompute_primary(preferred_caps_node);
    }

    fn recompute_primary(&mut self, preferred_caps_node: Option<&str>) {
        let mut best: Option<&str> = None;
        for (resource, presence) in &self.presence_map {
            if !presence.is_available() {
                continue;
            }
            match best {
                None => best = Some(resource.as_str()),
                Some(cur) => {
                    let current = &self.presence_map[cur];
                    if is_preferred(presence, current, preferred_caps_node) {
                        best = Some(resource.as_str());
                    }
                }
            }
        }
        self.primary_resource = best.map(|s| s.to_owned());
    }

    /// Preferred coopfox-capable full JID, used for multicast address
    /// resolution (§4.8.2): the resource whose `capsNode` equals `node`.
    pub fn coopfox_capable_jid(&self, node: &str) -> Option<Jid> {
        self.presence_map
            .iter()
            .find(|(_, p)| p.is_available() && p.caps_node.as_deref() == Some(node))
            .map(|(resource, _)| self.jid.bare().with_resource(resource))
    }
}

/// `{ saslMechanisms, requireTLS, requireBind, requireSession, identities,
/// features }`, frozen once computed (§3).
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub sasl_mechanisms: BTreeSet<String>,
    pub require_tls: bool,
    pub require_bind: bool,
    pub require_session: bool,
    /// category -> (type -> name)
    pub identities: HashMap<String, HashMap<String, String>>,
    pub features: BTreeSet<String>,
}

impl ServerInfo {
    pub fn supports_feature(&self, ns: &str) -> bool {
        self.features.contains(ns)
    }
}

/// Owns roster state for a Client: the merged set of [`RosterItem`]s plus
/// the distinguished `rosterSelf` entry (§3).
#[derive(Debug, Default)]
pub struct Roster {
    items: HashMap<Jid, RosterItem>,
    own_jid: Option<Jid>,
}

impl Roster {
    pub fn new() -> Self {
        Roster::default()
    }

    pub fn set_own_jid(&mut self, jid: Jid) {
        let bare = jid.bare();
        self.items.insert(bare.clone(), RosterItem::rself(bare));
        self.own_jid = Some(jid);
    }

    /// `getContact(jid)` (§4.4): returns `rosterSelf` when `jid` equals the
    /// own bare JID; auto-creates a temporary item for unknown JIDs unless
    /// `suppress_create` is set.
    pub fn get_contact(&mut self, jid: &Jid, suppress_create: bool) -> Option<&RosterItem> {
        let bare = jid.bare();
        if !self.items.contains_key(&bare) && !suppress_create {
            self.items.insert(bare.clone(), RosterItem::temporary_for(bare.clone()));
        }
        self.items.get(&bare)
    }

    pub fn get_contact_mut(&mut self, jid: &Jid) -> Option<&mut RosterItem> {
        self.items.get_mut(&jid.bare())
    }

    /// Non-creating lookup, for callers that only want to read current
    /// state (e.g. deciding a presence's availability) without the
    /// side effect of materializing a temporary item.
    pub fn get(&self, jid: &Jid) -> Option<&RosterItem> {
        self.items.get(&jid.bare())
    }

    /// §4.4 "an item with `subscription=\"remove\"` is deleted after one
    /// final unavailable-presence event": mark every resource currently
    /// known for `jid` unavailable (or a single nil-resource entry if none
    /// are tracked), so `primaryPresence` becomes `None` and any listener
    /// keyed off presence sees the departure before the item is deleted.
    pub fn apply_unavailable(&mut self, jid: &Jid, preferred_caps_node: Option<&str>) {
        let Some(item) = self.get_contact_mut(jid) else { return };
        let resources: Vec<String> = if item.presence_map.is_empty() {
            vec![String::new()]
        } else {
            item.presence_map.keys().cloned().collect()
        };
        for resource in resources {
            let mut presence = Presence::available(resource);
            presence.r#type = Some("unavailable".into());
            item.apply_presence(presence, preferred_caps_node);
        }
    }

    /// Merge an inbound roster `<item>`: unknown JID creates a non-temporary
    /// item; `subscription="remove"` marks it for removal after one final
    /// unavailable-presence event (§4.4). Returns `true` if an item was
    /// actually removed.
    pub fn merge_item(&mut self, jid: Jid, display_name: Option<String>, subscription: String) -> bool {
        let bare = jid.bare();
        if subscription == "remove" {
            return self.items.remove(&bare).is_some();
        }
        let item = self
            .items
            .entry(bare.clone())
            .or_insert_with(|| RosterItem::new(bare));
        item.temporary = false;
        item.display_name = display_name;
        item.subscription = subscription;
        false
    }

    pub fn items(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.values()
    }

    pub fn own_jid(&self) -> Option<&Jid> {
        self.own_jid.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_resource_prefers_available() {
        let mut item = RosterItem::new("a@h".parse().unwrap());
        let mut unavailable = Presence::available("phone");
        unavailable.r#type = Some("unavailable".into());
        item.apply_presence(unavailable, None);
        item.apply_presence(Presence::available("desktop"), None);
        assert_eq!(item.primary_resource.as_deref(), Some("desktop"));
    }

    #[test]
    fn primary_resource_prefers_caps_node_then_priority() {
        let mut item = RosterItem::new("a@h".parse().unwrap());
        let mut low = Presence::available("low");
        low.priority = 1;
        let mut high_no_caps = Presence::available("high");
        high_no_caps.priority = 5;
        let mut coopfox = Presence::available("coopfox");
        coopfox.priority = 0;
        coopfox.caps_node = Some("coopfox-node".into());

        item.apply_presence(low, Some("coopfox-node"));
        item.apply_presence(high_no_caps, Some("coopfox-node"));
        assert_eq!(item.primary_resource.as_deref(), Some("high"));
        item.apply_presence(coopfox, Some("coopfox-node"));
        assert_eq!(item.primary_resource.as_deref(), Some("coopfox"));
    }

    #[test]
    fn get_contact_autocreates_temporary() {
        let mut roster = Roster::new();
        roster.set_own_jid("me@h/r".parse().unwrap());
        let contact = roster.get_contact(&"stranger@h".parse().unwrap(), false).unwrap();
        assert!(contact.temporary);
    }

    #[test]
    fn get_contact_returns_self_for_own_bare() {
        let mut roster = Roster::new();
        roster.set_own_jid("me@h/r".parse().unwrap());
        let me = roster.get_contact(&"me@h".parse().unwrap(), true).unwrap();
        assert!(me.is_self);
    }

    #[test]
    fn apply_unavailable_clears_primary_presence() {
        let mut roster = Roster::new();
        roster.merge_item("a@h".parse().unwrap(), None, "both".into());
        let jid: Jid = "a@h".parse().unwrap();
        roster.get_contact_mut(&jid).unwrap().apply_presence(Presence::available("phone"), None);
        assert!(roster.get_contact_mut(&jid).unwrap().primary_presence().is_some());

        roster.apply_unavailable(&jid, None);
        assert!(roster.get_contact_mut(&jid).unwrap().primary_presence().is_none());
    }

    #[test]
    fn apply_unavailable_on_untracked_contact_is_a_noop() {
        let mut roster = Roster::new();
        let jid: Jid = "ghost@h".parse().unwrap();
        roster.apply_unavailable(&jid, None);
        assert!(roster.get(&jid).is_none());
    }

    #[test]
    fn merge_remove_deletes_item() {
        let mut roster = Roster::new();
        roster.merge_item("a@h".parse().unwrap(), None, "both".into());
        assert!(roster.merge_item("a@h".parse().unwrap(), None, "remove".into()));
        assert!(roster.get_contact(&"a@h".parse().unwrap(), true).is_none());
    }
}
