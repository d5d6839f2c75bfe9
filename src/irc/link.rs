//! Server links: handshake, burst, remote server map, netsplits.
//!
//! A link starts life as an ordinary session. `PASS <pw> TS <ver> :<sid>`
//! marks it as a server candidate and `SERVER` promotes it, after which all
//! its traffic goes to `remote`. On promotion both sides burst: every server
//! and every registered identity the other side can't already see.
//!
//! Losing a link (socket closed, or `SQUIT`) removes every server behind it
//! and every identity they introduced.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::casemap::{irc_eq, irc_lower};
use super::identity::{Capabilities, ConnId, LinkDirection, Route, ServerId, ServerInfo};
use super::message::Message;
use super::metrics;
use super::propagation::{Introduction, Outbound, PeerLink, ServerIntro};
use super::remote::{parse_hop, ProtocolError};
use super::server::ServerState;

/// Lowest TS protocol version that carries stable ids.
const TS_STABLE_IDS: u32 = 6;

/// A server somewhere behind one of our links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub name: String,
    pub sid: Option<ServerId>,
    /// Hops from us: `1` for a direct peer.
    pub hopcount: u32,
    /// Name of the server it hangs off.
    pub uplink: String,
    /// Our link it is reached through.
    pub via: ConnId,
    pub description: String,
}

impl RemoteServer {
    pub fn intro(&self) -> ServerIntro {
        ServerIntro {
            name: self.name.clone(),
            hopcount: self.hopcount,
            sid: self.sid.clone(),
            uplink: self.uplink.clone(),
            description: self.description.clone(),
        }
    }
}

/// Every remote server we know of, keyed by folded name.
#[derive(Debug, Default)]
pub struct ServerMap {
    by_name: HashMap<String, RemoteServer>,
}

impl ServerMap {
    pub fn insert(&mut self, server: RemoteServer) {
        self.by_name.insert(irc_lower(&server.name), server);
    }

    pub fn get(&self, name: &str) -> Option<&RemoteServer> {
        self.by_name.get(&irc_lower(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&irc_lower(name))
    }

    pub fn find_by_sid(&self, sid: &str) -> Option<&RemoteServer> {
        self.by_name
            .values()
            .find(|s| s.sid.as_ref().is_some_and(|id| id.as_str() == sid))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Servers not reached through `link`, nearest first so an uplink is
    /// always introduced before what hangs off it.
    pub fn not_via(&self, link: ConnId) -> Vec<&RemoteServer> {
        let mut servers: Vec<_> = self.by_name.values().filter(|s| s.via != link).collect();
        servers.sort_by(|a, b| a.hopcount.cmp(&b.hopcount).then_with(|| a.name.cmp(&b.name)));
        servers
    }

    /// Drop everything reached through `link`. Returns the folded names.
    pub fn remove_via(&mut self, link: ConnId) -> HashSet<String> {
        let gone: HashSet<String> = self
            .by_name
            .iter()
            .filter(|(_, s)| s.via == link)
            .map(|(k, _)| k.clone())
            .collect();
        self.by_name.retain(|k, _| !gone.contains(k));
        gone
    }

    /// Drop `name` and everything downstream of it. Returns the folded names.
    pub fn remove_subtree(&mut self, name: &str) -> HashSet<String> {
        let mut gone = HashSet::new();
        let root = irc_lower(name);
        if !self.by_name.contains_key(&root) {
            return gone;
        }
        gone.insert(root);
        loop {
            let next: Vec<String> = self
                .by_name
                .iter()
                .filter(|(k, s)| !gone.contains(*k) && gone.contains(&irc_lower(&s.uplink)))
                .map(|(k, _)| k.clone())
                .collect();
            if next.is_empty() {
                break;
            }
            gone.extend(next);
        }
        self.by_name.retain(|k, _| !gone.contains(k));
        gone
    }
}

impl ServerState {
    /// Our `PASS`/`CAPAB`/`SERVER` triple.
    pub fn credentials(&self) -> Vec<Message> {
        vec![
            Message::new(
                "PASS",
                vec![
                    self.config.link_password.clone(),
                    "TS".into(),
                    TS_STABLE_IDS.to_string(),
                    self.sid().to_string(),
                ],
            ),
            Message::new("CAPAB", vec!["QS ENCAP".into()]),
            Message::new(
                "SERVER",
                vec![
                    self.name().to_owned(),
                    "1".into(),
                    self.config.description.clone(),
                ],
            ),
        ]
    }

    /// Open an outbound link: a session that has already sent our
    /// credentials and waits for the peer's `SERVER`.
    pub fn connect_link(&mut self, addr: SocketAddr, tx: mpsc::UnboundedSender<Message>) -> ConnId {
        for msg in self.credentials() {
            let _ = tx.send(msg);
        }
        self.open_connection(addr, LinkDirection::Outbound, tx)
    }

    /// Display name for a server id, falling back to the id itself.
    pub(crate) fn server_name_for_sid(&self, sid: &str) -> String {
        if sid == self.sid().as_str() {
            return self.name().to_owned();
        }
        self.servers
            .find_by_sid(sid)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| sid.to_owned())
    }

    /// Is `name` (or `sid`) us or something we already see?
    fn server_known(&self, name: &str, sid: Option<&ServerId>) -> bool {
        irc_eq(name, self.name())
            || self.servers.contains(name)
            || sid.is_some_and(|id| id == self.sid() || self.servers.find_by_sid(id.as_str()).is_some())
    }

    /// Vet a candidate's `PASS` and `SERVER`.
    fn check_link(&self, conn: ConnId, name: &str) -> Result<(Option<ServerId>, Capabilities), String> {
        let pass = self
            .sessions
            .get(&conn)
            .and_then(|s| s.pass.as_ref())
            .ok_or("No password")?;
        if self.config.link_password.is_empty() || pass.password != self.config.link_password {
            return Err("Bad password".into());
        }
        let version = pass.ts_version.ok_or("Non-TS server")?;
        if !name.contains('.') {
            return Err("Bogus server name".into());
        }
        let sid = match (&pass.sid, version >= TS_STABLE_IDS) {
            (Some(raw), true) => Some(ServerId::parse(raw).map_err(|e| e.to_string())?),
            _ => None,
        };
        if self.server_known(name, sid.as_ref()) {
            return Err("Server exists".into());
        }
        let caps = Capabilities {
            stable_ids: sid.is_some(),
        };
        Ok((sid, caps))
    }

    /// `SERVER name hop :description` from a session: promote it to a link.
    pub(crate) fn accept_link(&mut self, conn: ConnId, msg: &Message, now_secs: u64) {
        let Some(name) = msg.params.first() else {
            self.evict_session(conn, "Missing server name");
            return;
        };
        let (sid, caps) = match self.check_link(conn, name) {
            Ok(ok) => ok,
            Err(reason) => {
                warn!(%conn, server = %name, "link refused: {reason}");
                if let Some(key) = self
                    .sessions
                    .get(&conn)
                    .and_then(|s| self.registry.find_by_id(&s.stable_id))
                {
                    self.registry.remove(key, now_secs);
                }
                self.evict_session(conn, &reason);
                return;
            }
        };
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        // A candidate never finishes client registration, but it may have
        // sent NICK.
        if let Some(key) = self.registry.find_by_id(&session.stable_id) {
            self.registry.remove(key, now_secs);
        }

        let description = msg.params.get(2).cloned().unwrap_or_default();
        let info = ServerInfo {
            sid: sid.clone(),
            name: name.clone(),
            description: description.clone(),
            caps,
            direction: session.direction,
        };
        if session.direction == LinkDirection::Inbound {
            for line in self.credentials() {
                let _ = session.tx.send(line);
            }
        }
        self.propagator.add(PeerLink {
            conn,
            server: info,
            tx: session.tx,
        });

        let peer = RemoteServer {
            name: name.clone(),
            sid,
            hopcount: 1,
            uplink: self.name().to_owned(),
            via: conn,
            description,
        };
        self.propagator
            .broadcast_except(conn, &Outbound::Server(peer.intro()));
        self.servers.insert(peer);

        self.burst(conn);
        info!(%conn, server = %name, ts6 = caps.stable_ids, "link established");
        self.publish_sizes();
    }

    /// Send `link` everything it can't see through itself.
    pub(crate) fn burst(&self, link: ConnId) {
        let Some(peer) = self.propagator.get(link) else {
            return;
        };
        let servers = self.servers.not_via(link);
        for server in &servers {
            peer.send(&Outbound::Server(server.intro()));
        }
        let mut identities = 0;
        for identity in self
            .registry
            .registered()
            .filter(|i| i.route != Route::Link(link))
        {
            peer.send(&Outbound::Introduce(Introduction::from_identity(identity)));
            identities += 1;
        }
        debug!(%link, servers = servers.len(), identities, "burst sent");
    }

    /// A link is gone: drop everything behind it and tell the others.
    pub(crate) fn link_lost(&mut self, link: ConnId, reason: &str, now_secs: u64) {
        let Some(peer) = self.propagator.remove(link) else {
            return;
        };
        let servers = self.servers.remove_via(link);
        let keys = self.registry.keys_routed_via(link);
        let identities = keys.len();
        for key in keys {
            self.drop_identity(key, now_secs, reason);
        }
        self.propagator.broadcast_all(&Outbound::Squit {
            name: peer.server.name.clone(),
            reason: reason.to_owned(),
        });
        warn!(
            %link,
            server = %peer.server.name,
            servers = servers.len(),
            identities,
            "netsplit: {reason}"
        );
        metrics::incr(metrics::NETSPLITS);
        self.publish_sizes();
    }

    /// `:uplink SID name hop sid :description`.
    pub(crate) fn remote_sid(&mut self, link: ConnId, msg: &Message) -> Result<(), ProtocolError> {
        let p = &msg.params;
        if p.len() < 4 {
            return Err(ProtocolError::MalformedBurst {
                command: "SID",
                expected: "4",
                got: p.len(),
            });
        }
        let hopcount = parse_hop(&p[1])?;
        let sid = ServerId::parse(&p[2]).map_err(|_| ProtocolError::InvalidServerId(p[2].clone()))?;
        self.add_remote_server(link, msg, &p[0], hopcount, Some(sid), &p[3])
    }

    /// `:uplink SERVER name hop :description`.
    pub(crate) fn remote_server(&mut self, link: ConnId, msg: &Message) -> Result<(), ProtocolError> {
        let p = &msg.params;
        if p.len() < 2 {
            return Err(ProtocolError::MalformedBurst {
                command: "SERVER",
                expected: "3",
                got: p.len(),
            });
        }
        let hopcount = parse_hop(&p[1])?;
        let description = p.get(2).map(String::as_str).unwrap_or_default();
        self.add_remote_server(link, msg, &p[0], hopcount, None, description)
    }

    fn add_remote_server(
        &mut self,
        link: ConnId,
        msg: &Message,
        name: &str,
        hopcount: u32,
        sid: Option<ServerId>,
        description: &str,
    ) -> Result<(), ProtocolError> {
        if self.server_known(name, sid.as_ref()) {
            return Err(ProtocolError::ServerExists(name.to_owned()));
        }
        let uplink = match msg.source() {
            Some(source) if ServerId::parse(source).is_ok() => self.server_name_for_sid(source),
            Some(source) => source.to_owned(),
            None => self
                .propagator
                .get(link)
                .map(|l| l.server.name.clone())
                .unwrap_or_default(),
        };
        let server = RemoteServer {
            name: name.to_owned(),
            sid,
            hopcount,
            uplink,
            via: link,
            description: description.to_owned(),
        };
        debug!(%link, server = %server.name, uplink = %server.uplink, "server introduced");
        self.propagator
            .broadcast_except(link, &Outbound::Server(server.intro()));
        self.servers.insert(server);
        Ok(())
    }

    /// `SQUIT name :reason`.
    pub(crate) fn remote_squit(
        &mut self,
        link: ConnId,
        msg: &Message,
        now_secs: u64,
    ) -> Result<(), ProtocolError> {
        let Some(name) = msg.params.first() else {
            return Err(ProtocolError::MalformedBurst {
                command: "SQUIT",
                expected: "2",
                got: 0,
            });
        };
        let reason = msg
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| "Remote SQUIT".to_owned());

        let peer_name = self.propagator.get(link).map(|l| l.server.name.clone());
        if irc_eq(name, self.name()) || peer_name.is_some_and(|p| irc_eq(&p, name)) {
            // The peer is dropping this link.
            self.send_to(
                link,
                Message::new("ERROR", vec![format!("Closing Link: {name} ({reason})")]),
            );
            self.link_lost(link, &reason, now_secs);
            return Ok(());
        }

        match self.servers.get(name) {
            None => return Err(ProtocolError::UnknownServer(name.clone())),
            Some(server) if server.via != link => {
                return Err(ProtocolError::WrongDirection(name.clone()));
            }
            Some(_) => {}
        }
        let gone = self.servers.remove_subtree(name);
        let keys = self.registry.keys_from_servers(&gone);
        let identities = keys.len();
        for key in keys {
            self.drop_identity(key, now_secs, &reason);
        }
        self.propagator.broadcast_except(
            link,
            &Outbound::Squit {
                name: name.clone(),
                reason: reason.clone(),
            },
        );
        warn!(
            %link,
            server = %name,
            servers = gone.len(),
            identities,
            "remote split: {reason}"
        );
        self.publish_sizes();
        Ok(())
    }
}
