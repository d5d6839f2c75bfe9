//! Identity and server data model.
//!
//! An [`Identity`] is one connected or bursted client. Its [`StableId`] is
//! assigned once by the introducing server and never contested; its nickname
//! is contested mesh-wide and guarded by `claim_ts`.
use std::fmt;

use super::validate::{Field, ValidationError};

/// Handle for one socket: a local client, a server candidate, or a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Three-character server id: a digit, then two digits or uppercase letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(String);

impl ServerId {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let b = s.as_bytes();
        let ok = b.len() == 3
            && b[0].is_ascii_digit()
            && b[1..]
                .iter()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase());
        if ok {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidCharset {
                field: Field::ServerId,
                value: s.to_owned(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self("0AA".to_owned())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length of the per-server suffix of a stable id.
const SUFFIX_LEN: usize = 6;

/// Globally unique client id: [`ServerId`] + `[A-Z][A-Z0-9]{5}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableId(String);

impl StableId {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidCharset {
            field: Field::StableId,
            value: s.to_owned(),
        };
        if s.len() != 3 + SUFFIX_LEN || !s.is_ascii() {
            return Err(invalid());
        }
        ServerId::parse(&s[..3]).map_err(|_| invalid())?;
        let suffix = &s.as_bytes()[3..];
        let ok = suffix[0].is_ascii_uppercase()
            && suffix[1..]
                .iter()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase());
        if ok {
            Ok(Self(s.to_owned()))
        } else {
            Err(invalid())
        }
    }

    /// The introducing server's id.
    pub fn server_id(&self) -> &str {
        &self.0[..3]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap shape test used to tell an id reference from a nickname.
    /// Nicknames can never start with a digit, ids always do.
    pub fn looks_like(s: &str) -> bool {
        s.as_bytes().first().is_some_and(|c| c.is_ascii_digit())
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Suffix alphabet: letters before digits, so ids read `AAAAAA`, `AAAAAB`, ...
const ID_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Hands out locally monotonic stable ids under one [`ServerId`].
#[derive(Debug)]
pub struct UidGenerator {
    sid: ServerId,
    next: u64,
}

impl UidGenerator {
    pub fn new(sid: ServerId) -> Self {
        Self { sid, next: 0 }
    }

    pub fn next_id(&mut self) -> StableId {
        let mut n = self.next;
        self.next = self.next.wrapping_add(1);

        let mut suffix = [b'A'; SUFFIX_LEN];
        for slot in suffix[1..].iter_mut().rev() {
            *slot = ID_ALPHABET[(n % 36) as usize];
            n /= 36;
        }
        // Leading position is letters only so an id never looks numeric.
        suffix[0] = b'A' + (n % 26) as u8;

        let mut id = String::with_capacity(3 + SUFFIX_LEN);
        id.push_str(self.sid.as_str());
        id.extend(suffix.iter().map(|b| *b as char));
        StableId(id)
    }
}

/// Where a connection is in the client handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing useful received yet.
    Unregistered,
    /// NICK accepted and reserved; waiting for USER.
    NickSet,
    /// USER recorded; waiting for NICK.
    UserSet,
    /// Fully registered and introduced to the mesh.
    Registered,
}

impl RegistrationState {
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// How an identity is reached from this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A client socket on this server.
    Local(ConnId),
    /// Somewhere behind this peer link.
    Link(ConnId),
}

impl Route {
    pub fn local(self) -> Option<ConnId> {
        match self {
            Self::Local(conn) => Some(conn),
            Self::Link(_) => None,
        }
    }
}

/// One connected or bursted client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Absent for identities learned from legacy (pre-id) peers.
    pub stable_id: Option<StableId>,
    pub nickname: String,
    /// Epoch seconds of the current nickname claim. `0` for a tentative
    /// local reservation, which always loses a battle.
    pub claim_ts: u64,
    pub username: String,
    pub hostname: String,
    pub ip: String,
    pub gecos: String,
    pub umodes: String,
    /// Hops from this server: `0` for our own clients.
    pub hopcount: u32,
    /// Name of the server that introduced the identity.
    pub origin_server: String,
    pub route: Route,
    pub state: RegistrationState,
    /// Set once a KILL for this identity has been issued, so teardown never
    /// also announces a QUIT.
    pub killed: bool,
}

impl Identity {
    /// A tentative reservation made by a local NICK before USER.
    pub fn reservation(
        stable_id: StableId,
        nickname: &str,
        conn: ConnId,
        server_name: &str,
    ) -> Self {
        Self {
            stable_id: Some(stable_id),
            nickname: nickname.to_owned(),
            claim_ts: 0,
            username: String::new(),
            hostname: String::new(),
            ip: String::new(),
            gecos: String::new(),
            umodes: String::new(),
            hopcount: 0,
            origin_server: server_name.to_owned(),
            route: Route::Local(conn),
            state: RegistrationState::NickSet,
            killed: false,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.route, Route::Local(_))
    }

    /// A local connection still mid-handshake. It has no standing in a
    /// collision and is overridden silently.
    pub fn is_pending_local(&self) -> bool {
        self.is_local() && !self.state.is_registered()
    }

    /// `nick!user@host` for client-facing prefixes.
    pub fn mask(&self) -> String {
        format!("{}!{}@{}", self.nickname, self.username, self.hostname)
    }

    /// Both handles, for addressing this identity on any link.
    pub fn target(&self) -> Target {
        Target {
            stable_id: self.stable_id.clone(),
            nick: self.nickname.clone(),
        }
    }

    /// Same physical user heuristic: exact username and hostname match.
    pub fn same_user_as(&self, username: &str, hostname: &str) -> bool {
        self.username == username && self.hostname == hostname
    }
}

/// How a peer message refers to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRef {
    ByName(String),
    ByStableId(StableId),
}

impl IdentityRef {
    /// Classify a wire token (message source or KILL target).
    ///
    /// Digit-leading tokens must be well-formed ids; they are never nicks.
    pub fn parse(token: &str) -> Result<Self, ValidationError> {
        if StableId::looks_like(token) {
            StableId::parse(token).map(Self::ByStableId)
        } else {
            Ok(Self::ByName(token.to_owned()))
        }
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => f.write_str(name),
            Self::ByStableId(id) => write!(f, "{id}"),
        }
    }
}

/// Both handles of an identity, resolved to one [`IdentityRef`] per link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub stable_id: Option<StableId>,
    pub nick: String,
}

impl Target {
    /// Address by id when the link understands ids and one exists.
    pub fn for_link(&self, caps: Capabilities) -> IdentityRef {
        match (&self.stable_id, caps.stable_ids) {
            (Some(id), true) => IdentityRef::ByStableId(id.clone()),
            _ => IdentityRef::ByName(self.nick.clone()),
        }
    }
}

/// What a peer server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// TS6: `UID` introductions and id-addressed KILL/NICK/QUIT.
    pub stable_ids: bool,
}

/// Which side opened a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Inbound,
    Outbound,
}

/// A mesh peer, as presented during the link handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub sid: Option<ServerId>,
    pub name: String,
    pub description: String,
    pub caps: Capabilities,
    pub direction: LinkDirection,
}
