//! Identity registry — the only owner of live [`Identity`] records.
//!
//! Records live in a dense arena ([`Slab`]); two index maps point into it:
//! folded nickname → slot and stable id → slot. Callers get an
//! [`IdentityKey`] back from a lookup and use it within the same synchronous
//! handler; nothing holds a key across a removal.
//!
//! No protocol logic lives here. The registry enforces the two uniqueness
//! invariants (one identity per name, one per stable id) and maintains the
//! nick-delay index as names are vacated.

use std::collections::{HashMap, HashSet};

use slab::Slab;

use super::casemap::{irc_eq, irc_lower};
use super::identity::{ConnId, Identity, IdentityRef, RegistrationState, Route, StableId};
use super::nick_delay::NickDelay;

/// Slot handle into the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey(usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// An id already present was inserted again. Unreachable while the
    /// handlers check `lookup_by_id` first; logged as an invariant violation.
    #[error("stable id {0} is already registered")]
    DuplicateId(StableId),
    #[error("nickname {0} is already in use")]
    NameTaken(String),
    #[error("no such identity")]
    NotFound,
}

/// Attributes recorded when a tentative reservation becomes registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub username: String,
    pub hostname: String,
    pub ip: String,
    pub gecos: String,
    pub umodes: String,
}

#[derive(Debug)]
pub struct Registry {
    slots: Slab<Identity>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<StableId, usize>,
    nick_delay: NickDelay,
}

impl Registry {
    pub fn new(nick_delay_secs: u64) -> Self {
        Self {
            slots: Slab::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            nick_delay: NickDelay::new(nick_delay_secs),
        }
    }

    /// Add a new identity under its nickname and (if any) stable id.
    pub fn insert(&mut self, identity: Identity) -> Result<IdentityKey, RegistryError> {
        let name_key = irc_lower(&identity.nickname);
        if let Some(id) = &identity.stable_id {
            if self.by_id.contains_key(id) {
                return Err(RegistryError::DuplicateId(id.clone()));
            }
        }
        if self.by_name.contains_key(&name_key) {
            return Err(RegistryError::NameTaken(identity.nickname));
        }

        let stable_id = identity.stable_id.clone();
        let slot = self.slots.insert(identity);
        self.by_name.insert(name_key.clone(), slot);
        if let Some(id) = stable_id {
            self.by_id.insert(id, slot);
        }
        self.nick_delay.clear(&name_key);
        Ok(IdentityKey(slot))
    }

    pub fn get(&self, key: IdentityKey) -> Option<&Identity> {
        self.slots.get(key.0)
    }

    pub fn find_by_name(&self, name: &str) -> Option<IdentityKey> {
        self.by_name.get(&irc_lower(name)).copied().map(IdentityKey)
    }

    pub fn find_by_id(&self, id: &StableId) -> Option<IdentityKey> {
        self.by_id.get(id).copied().map(IdentityKey)
    }

    pub fn find(&self, r: &IdentityRef) -> Option<IdentityKey> {
        match r {
            IdentityRef::ByName(name) => self.find_by_name(name),
            IdentityRef::ByStableId(id) => self.find_by_id(id),
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&Identity> {
        self.find_by_name(name).and_then(|k| self.get(k))
    }

    pub fn lookup_by_id(&self, id: &StableId) -> Option<&Identity> {
        self.find_by_id(id).and_then(|k| self.get(k))
    }

    /// Re-bind an identity to `new_name`.
    ///
    /// A case-only change keeps `claim_ts`, writes no nick-delay entry, and
    /// only swaps the displayed spelling. Any other change vacates the old
    /// name (quarantining it if the identity was registered) and stamps
    /// `new_ts` as the new claim.
    pub fn rename(
        &mut self,
        key: IdentityKey,
        new_name: &str,
        new_ts: u64,
        now_secs: u64,
    ) -> Result<(), RegistryError> {
        let identity = self.slots.get(key.0).ok_or(RegistryError::NotFound)?;
        let old_name = identity.nickname.clone();
        let registered = identity.state.is_registered();

        if irc_eq(&old_name, new_name) {
            if let Some(identity) = self.slots.get_mut(key.0) {
                identity.nickname = new_name.to_owned();
            }
            return Ok(());
        }

        let new_key = irc_lower(new_name);
        if self.by_name.contains_key(&new_key) {
            return Err(RegistryError::NameTaken(new_name.to_owned()));
        }

        self.by_name.remove(&irc_lower(&old_name));
        if registered {
            self.nick_delay.note(&old_name, now_secs);
        }
        self.by_name.insert(new_key.clone(), key.0);
        self.nick_delay.clear(&new_key);

        if let Some(identity) = self.slots.get_mut(key.0) {
            identity.nickname = new_name.to_owned();
            identity.claim_ts = new_ts;
        }
        Ok(())
    }

    /// Promote a tentative local reservation to a registered identity.
    pub fn commit(
        &mut self,
        key: IdentityKey,
        attrs: Attributes,
        claim_ts: u64,
    ) -> Result<(), RegistryError> {
        let identity = self.slots.get_mut(key.0).ok_or(RegistryError::NotFound)?;
        identity.username = attrs.username;
        identity.hostname = attrs.hostname;
        identity.ip = attrs.ip;
        identity.gecos = attrs.gecos;
        identity.umodes = attrs.umodes;
        identity.claim_ts = claim_ts;
        identity.state = RegistrationState::Registered;
        Ok(())
    }

    /// Flag an identity as KILLed ahead of its removal.
    pub fn mark_killed(&mut self, key: IdentityKey) {
        if let Some(identity) = self.slots.get_mut(key.0) {
            identity.killed = true;
        }
    }

    /// Deregister both indices and free the slot.
    ///
    /// A registered identity leaves its name quarantined; a tentative
    /// reservation never bound the name publicly and leaves nothing behind.
    pub fn remove(&mut self, key: IdentityKey, now_secs: u64) -> Option<Identity> {
        if !self.slots.contains(key.0) {
            return None;
        }
        let identity = self.slots.remove(key.0);
        let name_key = irc_lower(&identity.nickname);
        if self.by_name.get(&name_key) == Some(&key.0) {
            self.by_name.remove(&name_key);
        }
        if let Some(id) = &identity.stable_id {
            if self.by_id.get(id) == Some(&key.0) {
                self.by_id.remove(id);
            }
        }
        if identity.state.is_registered() {
            self.nick_delay.note(&identity.nickname, now_secs);
        }
        Some(identity)
    }

    /// Every identity reached through `link` (netsplit candidates).
    pub fn keys_routed_via(&self, link: ConnId) -> Vec<IdentityKey> {
        self.slots
            .iter()
            .filter(|(_, identity)| identity.route == Route::Link(link))
            .map(|(slot, _)| IdentityKey(slot))
            .collect()
    }

    /// Every identity introduced by one of `servers` (folded names).
    pub fn keys_from_servers(&self, servers: &HashSet<String>) -> Vec<IdentityKey> {
        self.slots
            .iter()
            .filter(|(_, identity)| servers.contains(&irc_lower(&identity.origin_server)))
            .map(|(slot, _)| IdentityKey(slot))
            .collect()
    }

    /// Registered identities, in slot order: the burst set.
    pub fn registered(&self) -> impl Iterator<Item = &Identity> {
        self.slots
            .iter()
            .map(|(_, identity)| identity)
            .filter(|identity| identity.state.is_registered())
    }

    pub fn is_nick_delayed(&self, name: &str, now_secs: u64) -> bool {
        self.nick_delay.is_delayed(name, now_secs)
    }

    pub fn expire_nick_delay(&mut self, now_secs: u64) -> usize {
        self.nick_delay.expire(now_secs)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::identity::ConnId;
    use pretty_assertions::assert_eq;

    fn sid(s: &str) -> StableId {
        StableId::parse(s).unwrap()
    }

    fn remote(nick: &str, id: Option<&str>, ts: u64) -> Identity {
        Identity {
            stable_id: id.map(sid),
            nickname: nick.into(),
            claim_ts: ts,
            username: format!("~{nick}"),
            hostname: "h.example".into(),
            ip: "0".into(),
            gecos: nick.into(),
            umodes: "+i".into(),
            hopcount: 1,
            origin_server: "per.lagun.co".into(),
            route: Route::Link(ConnId(7)),
            state: RegistrationState::Registered,
            killed: false,
        }
    }

    #[test]
    fn insert_indexes_both_handles() {
        let mut reg = Registry::new(60);
        let key = reg.insert(remote("alice", Some("0ABAAAAAA"), 1000)).unwrap();
        assert_eq!(reg.find_by_name("ALICE"), Some(key));
        assert_eq!(reg.find_by_id(&sid("0ABAAAAAA")), Some(key));
        assert_eq!(reg.lookup_by_name("alice").unwrap().claim_ts, 1000);
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut reg = Registry::new(60);
        reg.insert(remote("alice", Some("0ABAAAAAA"), 1000)).unwrap();
        let err = reg
            .insert(remote("other", Some("0ABAAAAAA"), 1000))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(sid("0ABAAAAAA")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn insert_rejects_taken_name_case_insensitively() {
        let mut reg = Registry::new(60);
        reg.insert(remote("alice", None, 1000)).unwrap();
        let err = reg.insert(remote("ALICE", None, 900)).unwrap_err();
        assert_eq!(err, RegistryError::NameTaken("ALICE".into()));
    }

    #[test]
    fn rename_moves_index_and_quarantines_old_name() {
        let mut reg = Registry::new(60);
        let key = reg.insert(remote("carol", Some("0ABAAAAAB"), 1000)).unwrap();
        reg.rename(key, "dave", 1500, 2000).unwrap();

        assert_eq!(reg.find_by_name("carol"), None);
        assert_eq!(reg.find_by_name("dave"), Some(key));
        assert_eq!(reg.find_by_id(&sid("0ABAAAAAB")), Some(key));
        assert_eq!(reg.get(key).unwrap().claim_ts, 1500);
        assert!(reg.is_nick_delayed("carol", 2001));
    }

    #[test]
    fn case_only_rename_keeps_ts_and_writes_no_delay() {
        let mut reg = Registry::new(60);
        let key = reg.insert(remote("carol", Some("0ABAAAAAB"), 1000)).unwrap();
        reg.rename(key, "Carol", 1500, 2000).unwrap();

        let identity = reg.get(key).unwrap();
        assert_eq!(identity.nickname, "Carol");
        assert_eq!(identity.claim_ts, 1000);
        assert!(!reg.is_nick_delayed("carol", 2000));
        assert_eq!(reg.find_by_name("carol"), Some(key));
    }

    #[test]
    fn rename_onto_taken_name_fails_without_side_effects() {
        let mut reg = Registry::new(60);
        let a = reg.insert(remote("a", None, 1)).unwrap();
        reg.insert(remote("b", None, 2)).unwrap();
        assert_eq!(
            reg.rename(a, "B", 5, 10),
            Err(RegistryError::NameTaken("B".into()))
        );
        assert_eq!(reg.get(a).unwrap().nickname, "a");
        assert!(!reg.is_nick_delayed("a", 10));
    }

    #[test]
    fn remove_frees_both_indices_and_quarantines() {
        let mut reg = Registry::new(60);
        let key = reg.insert(remote("alice", Some("0ABAAAAAA"), 1000)).unwrap();
        let gone = reg.remove(key, 3000).unwrap();
        assert_eq!(gone.nickname, "alice");
        assert!(reg.lookup_by_name("alice").is_none());
        assert!(reg.lookup_by_id(&sid("0ABAAAAAA")).is_none());
        assert!(reg.is_nick_delayed("alice", 3000));
        assert!(reg.remove(key, 3000).is_none());
    }

    #[test]
    fn removing_a_reservation_leaves_no_delay() {
        let mut reg = Registry::new(60);
        let key = reg
            .insert(Identity::reservation(
                sid("0AAAAAAAA"),
                "bob",
                ConnId(1),
                "lon.lagun.co",
            ))
            .unwrap();
        reg.remove(key, 100);
        assert!(!reg.is_nick_delayed("bob", 100));
    }

    #[test]
    fn commit_promotes_reservation() {
        let mut reg = Registry::new(60);
        let key = reg
            .insert(Identity::reservation(
                sid("0AAAAAAAA"),
                "bob",
                ConnId(1),
                "lon.lagun.co",
            ))
            .unwrap();
        reg.commit(
            key,
            Attributes {
                username: "~bob".into(),
                hostname: "b.example".into(),
                ip: "192.0.2.7".into(),
                gecos: "Bob".into(),
                umodes: "+i".into(),
            },
            4242,
        )
        .unwrap();
        let identity = reg.get(key).unwrap();
        assert_eq!(identity.state, RegistrationState::Registered);
        assert_eq!(identity.claim_ts, 4242);
        assert_eq!(reg.registered().count(), 1);
    }

    #[test]
    fn netsplit_queries() {
        let mut reg = Registry::new(60);
        reg.insert(remote("a", None, 1)).unwrap();
        reg.insert(remote("b", None, 2)).unwrap();
        let mut other = remote("c", None, 3);
        other.route = Route::Link(ConnId(8));
        other.origin_server = "nyc.lagun.co".into();
        reg.insert(other).unwrap();

        assert_eq!(reg.keys_routed_via(ConnId(7)).len(), 2);
        let servers: HashSet<String> = ["nyc.lagun.co".to_string()].into();
        assert_eq!(reg.keys_from_servers(&servers).len(), 1);
    }
}
