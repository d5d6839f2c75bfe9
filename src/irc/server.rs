//! Identity server core — shared state and the per-connection dispatch seam.
//!
//! Every inbound line is handled by [`ServerState::dispatch`] under a single
//! write-lock acquisition. Handlers are synchronous; they mutate the registry
//! and queue outbound lines on per-connection channels, so a verdict is fully
//! applied before the next line is looked at.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use super::config::ServerConfig;
use super::identity::{ConnId, Identity, LinkDirection, RegistrationState, Route, ServerId, UidGenerator};
use super::link::ServerMap;
use super::local::LocalSession;
use super::message::Message;
use super::metrics;
use super::propagation::{Introduction, Outbound, Propagator};
use super::registry::{IdentityKey, Registry, RegistryError};

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    /// Every live identity, local and remote.
    pub registry: Registry,
    /// Established peer links.
    pub propagator: Propagator,
    /// Remote servers known through those links.
    pub servers: ServerMap,
    /// Sockets that are not (yet) peer links: clients and server candidates.
    pub(crate) sessions: HashMap<ConnId, LocalSession>,
    uids: UidGenerator,
    next_conn: u64,
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

impl ServerState {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            registry: Registry::new(config.nick_delay_secs),
            uids: UidGenerator::new(config.sid.clone()),
            propagator: Propagator::new(),
            servers: ServerMap::default(),
            sessions: HashMap::new(),
            next_conn: 0,
            config,
        }
    }

    pub fn shared(config: Arc<ServerConfig>) -> SharedState {
        Arc::new(RwLock::new(Self::new(config)))
    }

    pub fn name(&self) -> &str {
        &self.config.server_name
    }

    pub fn sid(&self) -> &ServerId {
        &self.config.sid
    }

    /// Accept a new socket. Every connection starts as a local session and
    /// may later be promoted to a peer link by the server handshake.
    pub fn open_connection(
        &mut self,
        addr: SocketAddr,
        direction: LinkDirection,
        tx: mpsc::UnboundedSender<Message>,
    ) -> ConnId {
        self.next_conn += 1;
        let conn = ConnId(self.next_conn);
        let stable_id = self.uids.next_id();
        self.sessions
            .insert(conn, LocalSession::new(conn, addr, direction, tx, stable_id));
        debug!(%conn, %addr, ?direction, "connection opened");
        conn
    }

    /// Handle one inbound line from `conn`.
    pub fn dispatch(&mut self, conn: ConnId, msg: &Message, now_secs: u64) {
        if self.propagator.contains(conn) {
            if let Err(e) = self.handle_peer(conn, msg, now_secs) {
                if e.is_malformed() {
                    metrics::incr(metrics::MALFORMED_BURST);
                }
                warn!(link = %conn, command = %msg.command, "ignoring peer line: {e}");
            }
        } else {
            self.handle_local(conn, msg, now_secs);
        }
    }

    /// The socket behind `conn` is gone.
    pub fn close_connection(&mut self, conn: ConnId, reason: &str, now_secs: u64) {
        if self.propagator.contains(conn) {
            self.link_lost(conn, reason, now_secs);
            return;
        }
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        match self.registry.find_by_id(&session.stable_id) {
            Some(key) if session.state.is_registered() => {
                self.quit_identity(key, reason, None, now_secs);
            }
            // A reservation leaves nothing behind.
            Some(key) => {
                self.registry.remove(key, now_secs);
            }
            None => {}
        }
        debug!(%conn, "connection closed: {reason}");
        self.publish_sizes();
    }

    /// Periodic housekeeping.
    pub fn tick(&mut self, now_secs: u64) {
        let expired = self.registry.expire_nick_delay(now_secs);
        if expired > 0 {
            debug!(expired, "nick-delay entries expired");
        }
    }

    pub fn is_link(&self, conn: ConnId) -> bool {
        self.propagator.contains(conn)
    }

    pub fn session_state(&self, conn: ConnId) -> Option<RegistrationState> {
        self.sessions.get(&conn).map(|s| s.state)
    }

    /// Queue a line on any connection, session or link.
    pub(crate) fn send_to(&self, conn: ConnId, msg: Message) {
        let tx = match self.sessions.get(&conn) {
            Some(session) => &session.tx,
            None => match self.propagator.get(conn) {
                Some(link) => &link.tx,
                None => return,
            },
        };
        // A closed channel means the connection task is already tearing down.
        let _ = tx.send(msg);
    }

    /// Close a local session with an `ERROR` line. The connection task drops
    /// the socket once it has written it.
    pub(crate) fn evict_session(&mut self, conn: ConnId, reason: &str) {
        if let Some(session) = self.sessions.remove(&conn) {
            let _ = session.tx.send(Message::new(
                "ERROR",
                vec![format!("Closing Link: {} ({reason})", session.host)],
            ));
        }
    }

    /// Remove an identity without telling any link; the caller has already
    /// propagated whatever explains the removal. A local holder is
    /// disconnected with `reason`.
    pub(crate) fn drop_identity(
        &mut self,
        key: IdentityKey,
        now_secs: u64,
        reason: &str,
    ) -> Option<Identity> {
        let identity = self.registry.remove(key, now_secs)?;
        if let Some(conn) = identity.route.local() {
            self.evict_session(conn, reason);
        }
        self.publish_sizes();
        Some(identity)
    }

    /// Remove an identity and announce a QUIT, unless a KILL already
    /// explained its departure.
    pub(crate) fn quit_identity(
        &mut self,
        key: IdentityKey,
        reason: &str,
        origin: Option<ConnId>,
        now_secs: u64,
    ) {
        let Some(identity) = self.registry.get(key) else {
            return;
        };
        if !identity.killed && identity.state.is_registered() {
            let quit = Outbound::Quit {
                target: identity.target(),
                reason: reason.to_owned(),
            };
            self.propagator.forward(origin, &quit);
        }
        self.drop_identity(key, now_secs, reason);
    }

    /// Install a remote identity learned on `origin` and forward it on.
    pub(crate) fn install_remote(
        &mut self,
        intro: Introduction,
        origin: ConnId,
    ) -> Option<IdentityKey> {
        let identity = Identity {
            stable_id: intro.stable_id.clone(),
            nickname: intro.nick.clone(),
            claim_ts: intro.ts,
            username: intro.username.clone(),
            hostname: intro.hostname.clone(),
            ip: intro.ip.clone(),
            gecos: intro.gecos.clone(),
            umodes: intro.umodes.clone(),
            hopcount: intro.hopcount,
            origin_server: intro.server.clone(),
            route: Route::Link(origin),
            state: RegistrationState::Registered,
            killed: false,
        };
        match self.registry.insert(identity) {
            Ok(key) => {
                debug!(link = %origin, nick = %intro.nick, server = %intro.server, "introduced");
                self.propagator
                    .broadcast_except(origin, &Outbound::Introduce(intro));
                metrics::incr(metrics::INTRODUCTIONS);
                self.publish_sizes();
                Some(key)
            }
            Err(e @ RegistryError::DuplicateId(_)) => {
                error!(link = %origin, "invariant violation on introduction: {e}");
                None
            }
            Err(e) => {
                error!(link = %origin, nick = %intro.nick, "introduction not installed: {e}");
                None
            }
        }
    }

    /// Apply a rename that arrived on `origin` and forward it on.
    pub(crate) fn apply_remote_rename(
        &mut self,
        key: IdentityKey,
        new_nick: &str,
        ts: u64,
        origin: ConnId,
        now_secs: u64,
    ) {
        let Some(identity) = self.registry.get(key) else {
            return;
        };
        let old = identity.target();
        if let Err(e) = self.registry.rename(key, new_nick, ts, now_secs) {
            error!(link = %origin, from = %old.nick, to = new_nick, "rename not applied: {e}");
            return;
        }
        let rename = Outbound::Rename {
            target: old,
            new_nick: new_nick.to_owned(),
            ts,
        };
        self.propagator.broadcast_except(origin, &rename);
    }

    pub(crate) fn publish_sizes(&self) {
        metrics::set_sizes(self.registry.len(), self.propagator.len());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Drive a [`ServerState`] directly, one line at a time.
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::ServerState;
    use crate::irc::config::ServerConfig;
    use crate::irc::identity::{ConnId, LinkDirection};
    use crate::irc::message::Message;

    pub fn state(name: &str, sid: &str) -> ServerState {
        state_with(name, sid, &[])
    }

    pub fn state_with(name: &str, sid: &str, extra: &[(&str, &str)]) -> ServerState {
        let env: HashMap<String, String> = [
            ("SERVER_NAME", name),
            ("LAGOON_SID", sid),
            ("LAGOON_LINK_PASSWORD", "linkpw"),
            ("LAGOON_RESERVED_NICKS", "NickServ,ChanServ"),
        ]
        .iter()
        .chain(extra)
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
        ServerState::new(Arc::new(ServerConfig::from_lookup(|k| env.get(k).cloned())))
    }

    pub fn line(raw: &str) -> Message {
        Message::parse(raw).unwrap()
    }

    /// One end of a connection: its id and everything queued for it.
    pub struct Conn {
        pub id: ConnId,
        pub rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Conn {
        pub fn drain(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                lines.push(msg.to_wire());
            }
            lines
        }
    }

    pub fn connect(st: &mut ServerState) -> Conn {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = st.open_connection(
            "127.0.0.1:50000".parse().unwrap(),
            LinkDirection::Inbound,
            tx,
        );
        Conn { id, rx }
    }

    /// A fully registered local client, welcome burst already drained.
    pub fn register(st: &mut ServerState, nick: &str, now_secs: u64) -> Conn {
        let mut c = connect(st);
        st.dispatch(c.id, &line(&format!("NICK {nick}")), now_secs);
        st.dispatch(c.id, &line(&format!("USER {nick} 8 * :{nick}")), now_secs);
        c.drain();
        c
    }

    /// An established inbound link, handshake and burst already drained.
    /// `sid: None` makes it a legacy (pre-id) peer.
    pub fn link(st: &mut ServerState, name: &str, sid: Option<&str>, now_secs: u64) -> Conn {
        let mut c = connect(st);
        let pass = match sid {
            Some(sid) => format!("PASS linkpw TS 6 :{sid}"),
            None => "PASS linkpw :TS".to_owned(),
        };
        st.dispatch(c.id, &line(&pass), now_secs);
        st.dispatch(c.id, &line(&format!("SERVER {name} 1 :{name}")), now_secs);
        assert!(st.is_link(c.id), "{name} was not accepted");
        c.drain();
        c
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn closing_a_registered_client_announces_quit() {
        let mut st = state("lon.lagun.co", "0AA");
        let mut peer = link(&mut st, "per.lagun.co", Some("0PE"), 900);
        let alice = register(&mut st, "alice", 1000);
        peer.drain();

        st.close_connection(alice.id, "Connection reset by peer", 1010);

        assert_eq!(
            peer.drain(),
            vec![":0AAAAAAAB QUIT :Connection reset by peer"]
        );
        assert!(st.registry.lookup_by_name("alice").is_none());
        assert!(st.registry.is_nick_delayed("alice", 1011));
    }

    #[test]
    fn closing_a_pending_client_leaves_nothing_behind() {
        let mut st = state("lon.lagun.co", "0AA");
        let mut peer = link(&mut st, "per.lagun.co", Some("0PE"), 900);
        let c = connect(&mut st);
        st.dispatch(c.id, &line("NICK alice"), 1000);

        st.close_connection(c.id, "Connection reset by peer", 1001);

        assert!(peer.drain().is_empty());
        assert!(st.registry.is_empty());
        assert!(!st.registry.is_nick_delayed("alice", 1002));
        assert_eq!(st.session_state(c.id), None);
    }

    #[test]
    fn tick_lets_delayed_nicks_go() {
        let mut st = state("lon.lagun.co", "0AA");
        let alice = register(&mut st, "alice", 1000);
        st.close_connection(alice.id, "gone", 1000);
        assert!(st.registry.is_nick_delayed("alice", 1030));

        st.tick(1061);

        assert!(!st.registry.is_nick_delayed("alice", 1061));
        register(&mut st, "alice", 1061);
        assert!(st.registry.lookup_by_name("alice").is_some_and(|i| i.is_local()));
    }

    #[test]
    fn peer_lines_never_reach_the_client_handler() {
        let mut st = state("lon.lagun.co", "0AA");
        let mut peer = link(&mut st, "per.lagun.co", Some("0PE"), 900);

        // From a client this would be 421; from a link it is ignored.
        st.dispatch(peer.id, &line(":0PE FROBNICATE x"), 1000);

        assert!(peer.drain().is_empty());
        assert!(st.is_link(peer.id));
    }
}
