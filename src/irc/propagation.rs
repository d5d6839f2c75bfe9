//! Propagation layer — fire-and-forget fan-out to peer links.
//!
//! Every message derived from an inbound line carries the link it arrived on
//! as `origin`, and [`Propagator::broadcast_except`] never sends back across
//! it. Locally originated changes have no origin and go to every link.
//!
//! Messages are typed ([`Outbound`]) and rendered per link: peers that
//! understand stable ids get `UID` and id references, legacy peers get the
//! 8-field `NICK` and nickname references. No acknowledgement, no retry:
//! the link transport is reliable and ordered per link.
use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::debug;

use super::identity::{Capabilities, ConnId, Identity, ServerId, ServerInfo, StableId, Target};
use super::message::Message;
use super::metrics;

/// A client introduction as carried by `UID` or legacy `NICK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub nick: String,
    /// Hops from the server holding this value (our own clients are 0).
    pub hopcount: u32,
    pub ts: u64,
    pub umodes: String,
    pub username: String,
    pub hostname: String,
    pub ip: String,
    pub stable_id: Option<StableId>,
    pub server: String,
    pub gecos: String,
}

impl Introduction {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            nick: identity.nickname.clone(),
            hopcount: identity.hopcount,
            ts: identity.claim_ts,
            umodes: identity.umodes.clone(),
            username: identity.username.clone(),
            hostname: identity.hostname.clone(),
            ip: identity.ip.clone(),
            stable_id: identity.stable_id.clone(),
            server: identity.origin_server.clone(),
            gecos: identity.gecos.clone(),
        }
    }

    pub fn target(&self) -> Target {
        Target {
            stable_id: self.stable_id.clone(),
            nick: self.nick.clone(),
        }
    }
}

/// A server introduction as carried by `SID` or legacy `SERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIntro {
    pub name: String,
    pub hopcount: u32,
    pub sid: Option<ServerId>,
    /// Name of the server it hangs off.
    pub uplink: String,
    pub description: String,
}

/// A message bound for peer links, before per-link rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Introduce(Introduction),
    Rename {
        target: Target,
        new_nick: String,
        ts: u64,
    },
    Kill {
        source: String,
        target: Target,
        /// `path (reason)` text, forwarded untouched.
        reason: String,
    },
    Quit {
        target: Target,
        reason: String,
    },
    Server(ServerIntro),
    Squit {
        name: String,
        reason: String,
    },
}

impl Outbound {
    /// Render for a link with the given capabilities.
    pub fn render(&self, caps: Capabilities) -> Message {
        match self {
            Self::Introduce(intro) => render_introduction(intro, caps),
            Self::Rename {
                target,
                new_nick,
                ts,
            } => Message::with_prefix(
                target.for_link(caps).to_string(),
                "NICK",
                vec![new_nick.clone(), ts.to_string()],
            ),
            Self::Kill {
                source,
                target,
                reason,
            } => Message::with_prefix(
                source.clone(),
                "KILL",
                vec![target.for_link(caps).to_string(), reason.clone()],
            ),
            Self::Quit { target, reason } => Message::with_prefix(
                target.for_link(caps).to_string(),
                "QUIT",
                vec![reason.clone()],
            ),
            Self::Server(server) => match (&server.sid, caps.stable_ids) {
                (Some(sid), true) => Message::with_prefix(
                    server.uplink.clone(),
                    "SID",
                    vec![
                        server.name.clone(),
                        server.hopcount.saturating_add(1).to_string(),
                        sid.to_string(),
                        server.description.clone(),
                    ],
                ),
                _ => Message::with_prefix(
                    server.uplink.clone(),
                    "SERVER",
                    vec![
                        server.name.clone(),
                        server.hopcount.saturating_add(1).to_string(),
                        server.description.clone(),
                    ],
                ),
            },
            Self::Squit { name, reason } => {
                Message::new("SQUIT", vec![name.clone(), reason.clone()])
            }
        }
    }
}

fn render_introduction(intro: &Introduction, caps: Capabilities) -> Message {
    let hop = intro.hopcount.saturating_add(1).to_string();
    let ip = if intro.ip.is_empty() {
        "0".to_owned()
    } else {
        intro.ip.clone()
    };
    match (&intro.stable_id, caps.stable_ids) {
        (Some(id), true) => Message::with_prefix(
            id.server_id(),
            "UID",
            vec![
                intro.nick.clone(),
                hop,
                intro.ts.to_string(),
                intro.umodes.clone(),
                intro.username.clone(),
                intro.hostname.clone(),
                ip,
                id.to_string(),
                intro.gecos.clone(),
            ],
        ),
        _ => Message::new(
            "NICK",
            vec![
                intro.nick.clone(),
                hop,
                intro.ts.to_string(),
                intro.umodes.clone(),
                intro.username.clone(),
                intro.hostname.clone(),
                intro.server.clone(),
                intro.gecos.clone(),
            ],
        ),
    }
}

/// Which links a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    AllExcept(ConnId),
    Only(ConnId),
}

/// An established peer link.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub conn: ConnId,
    pub server: ServerInfo,
    pub tx: mpsc::UnboundedSender<Message>,
}

impl PeerLink {
    pub fn send(&self, msg: &Outbound) {
        let line = msg.render(self.server.caps);
        debug!(link = %self.conn, peer = %self.server.name, "→ {line}");
        // A closed channel means the link task is already tearing down.
        let _ = self.tx.send(line);
        metrics::incr(metrics::LINK_MSGS_SENT);
    }
}

/// All established peer links, in deterministic order.
#[derive(Debug, Default)]
pub struct Propagator {
    links: BTreeMap<ConnId, PeerLink>,
}

impl Propagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, link: PeerLink) {
        self.links.insert(link.conn, link);
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<PeerLink> {
        self.links.remove(&conn)
    }

    pub fn get(&self, conn: ConnId) -> Option<&PeerLink> {
        self.links.get(&conn)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.links.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Send to one link. Returns `false` if it isn't established.
    pub fn send_to(&self, conn: ConnId, msg: &Outbound) -> bool {
        match self.links.get(&conn) {
            Some(link) => {
                link.send(msg);
                true
            }
            None => false,
        }
    }

    /// Send to every link except `origin`. Returns the fan-out count.
    pub fn broadcast_except(&self, origin: ConnId, msg: &Outbound) -> usize {
        let mut sent = 0;
        for link in self.links.values().filter(|l| l.conn != origin) {
            link.send(msg);
            sent += 1;
        }
        sent
    }

    /// Send to every link, the origin included.
    pub fn broadcast_all(&self, msg: &Outbound) -> usize {
        for link in self.links.values() {
            link.send(msg);
        }
        self.links.len()
    }

    /// Send according to `scope`.
    pub fn deliver(&self, scope: Scope, msg: &Outbound) -> usize {
        match scope {
            Scope::All => self.broadcast_all(msg),
            Scope::AllExcept(origin) => self.broadcast_except(origin, msg),
            Scope::Only(conn) => usize::from(self.send_to(conn, msg)),
        }
    }

    /// Send to every link except `origin` when there is one, else to all.
    pub fn forward(&self, origin: Option<ConnId>, msg: &Outbound) -> usize {
        match origin {
            Some(origin) => self.broadcast_except(origin, msg),
            None => self.broadcast_all(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::identity::LinkDirection;
    use pretty_assertions::assert_eq;

    fn link(
        conn: u64,
        stable_ids: bool,
    ) -> (PeerLink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = PeerLink {
            conn: ConnId(conn),
            server: ServerInfo {
                sid: None,
                name: format!("peer{conn}.lagun.co"),
                description: String::new(),
                caps: Capabilities { stable_ids },
                direction: LinkDirection::Inbound,
            },
            tx,
        };
        (peer, rx)
    }

    fn intro() -> Introduction {
        Introduction {
            nick: "alice".into(),
            hopcount: 0,
            ts: 1000,
            umodes: "+i".into(),
            username: "~alice".into(),
            hostname: "a.example".into(),
            ip: "192.0.2.1".into(),
            stable_id: Some(StableId::parse("0AAAAAAAA").unwrap()),
            server: "lon.lagun.co".into(),
            gecos: "Alice Liddell".into(),
        }
    }

    #[test]
    fn introduction_renders_uid_for_ts6_links() {
        let msg = Outbound::Introduce(intro()).render(Capabilities { stable_ids: true });
        assert_eq!(
            msg.to_wire(),
            ":0AA UID alice 1 1000 +i ~alice a.example 192.0.2.1 0AAAAAAAA :Alice Liddell"
        );
    }

    #[test]
    fn introduction_renders_legacy_nick_otherwise() {
        let msg = Outbound::Introduce(intro()).render(Capabilities::default());
        assert_eq!(
            msg.to_wire(),
            "NICK alice 1 1000 +i ~alice a.example lon.lagun.co :Alice Liddell"
        );
    }

    #[test]
    fn kill_addresses_by_link_capability() {
        let kill = Outbound::Kill {
            source: "lon.lagun.co".into(),
            target: intro().target(),
            reason: "lon.lagun.co (Nick collision)".into(),
        };
        assert_eq!(
            kill.render(Capabilities { stable_ids: true }).to_wire(),
            ":lon.lagun.co KILL 0AAAAAAAA :lon.lagun.co (Nick collision)"
        );
        assert_eq!(
            kill.render(Capabilities::default()).to_wire(),
            ":lon.lagun.co KILL alice :lon.lagun.co (Nick collision)"
        );
    }

    #[test]
    fn broadcast_except_skips_origin() {
        let mut p = Propagator::new();
        let (a, mut rx_a) = link(1, true);
        let (b, mut rx_b) = link(2, false);
        let (c, mut rx_c) = link(3, true);
        p.add(a);
        p.add(b);
        p.add(c);

        let sent = p.broadcast_except(ConnId(2), &Outbound::Introduce(intro()));
        assert_eq!(sent, 2);
        assert_eq!(rx_a.try_recv().unwrap().command, "UID");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(rx_c.try_recv().unwrap().command, "UID");
    }

    #[test]
    fn broadcast_all_includes_origin() {
        let mut p = Propagator::new();
        let (a, mut rx_a) = link(1, false);
        let (b, mut rx_b) = link(2, false);
        p.add(a);
        p.add(b);

        let quit = Outbound::Quit {
            target: intro().target(),
            reason: "bye".into(),
        };
        assert_eq!(p.deliver(Scope::All, &quit), 2);
        assert_eq!(rx_a.try_recv().unwrap().to_wire(), ":alice QUIT :bye");
        assert_eq!(rx_b.try_recv().unwrap().to_wire(), ":alice QUIT :bye");
    }

    #[test]
    fn deliver_only_targets_one_link() {
        let mut p = Propagator::new();
        let (a, mut rx_a) = link(1, true);
        let (b, mut rx_b) = link(2, true);
        p.add(a);
        p.add(b);

        let squit = Outbound::Squit {
            name: "nyc.lagun.co".into(),
            reason: "gone".into(),
        };
        assert_eq!(p.deliver(Scope::Only(ConnId(2)), &squit), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().command, "SQUIT");
        assert_eq!(p.deliver(Scope::Only(ConnId(9)), &squit), 0);
    }

    #[test]
    fn server_intro_renders_sid_or_server() {
        let server = Outbound::Server(ServerIntro {
            name: "nyc.lagun.co".into(),
            hopcount: 1,
            sid: Some(ServerId::parse("0NY").unwrap()),
            uplink: "per.lagun.co".into(),
            description: "New York".into(),
        });
        assert_eq!(
            server.render(Capabilities { stable_ids: true }).to_wire(),
            ":per.lagun.co SID nyc.lagun.co 2 0NY :New York"
        );
        assert_eq!(
            server.render(Capabilities::default()).to_wire(),
            ":per.lagun.co SERVER nyc.lagun.co 2 :New York"
        );
    }

    #[test]
    fn hopcount_at_ceiling_does_not_wrap() {
        let intro = Introduction {
            hopcount: u32::MAX,
            ..intro()
        };
        let uid = Outbound::Introduce(intro).render(Capabilities { stable_ids: true });
        assert_eq!(uid.params[1], u32::MAX.to_string());

        let server = Outbound::Server(ServerIntro {
            name: "far.lagun.co".into(),
            hopcount: u32::MAX,
            sid: None,
            uplink: "per.lagun.co".into(),
            description: String::new(),
        });
        assert_eq!(
            server.render(Capabilities::default()).params[1],
            u32::MAX.to_string()
        );
    }
}
