//! Local registration state machine.
//!
//! A fresh socket is a [`LocalSession`]. `NICK` reserves a name tentatively
//! (`claim_ts = 0`), `USER` supplies the rest, and the pair commits a
//! registered identity that is introduced to every link. A `PASS … TS` plus
//! `SERVER` turns the session into a peer link instead (see `link`).
//!
//! Nothing a local client gets wrong ever leaves this server: bad names,
//! taken names and quarantined names are all answered with a numeric.
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::casemap::irc_eq;
use super::identity::{ConnId, Identity, LinkDirection, RegistrationState, StableId};
use super::message::Message;
use super::metrics;
use super::propagation::{Introduction, Outbound};
use super::registry::Attributes;
use super::server::ServerState;
use super::validate::{client_username, truncate_text, validate_nick, validate_username, REALLEN};

/// `PASS <password> [TS [version [sid]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassInfo {
    pub password: String,
    /// Present when the sender announced itself as a TS server.
    pub ts_version: Option<u32>,
    pub sid: Option<String>,
}

impl PassInfo {
    pub fn parse(params: &[String]) -> Option<Self> {
        let password = params.first()?.clone();
        let ts_version = match params.get(1) {
            // Bare `TS` predates version numbers.
            Some(flag) if flag.eq_ignore_ascii_case("TS") => {
                Some(params.get(2).and_then(|v| v.parse().ok()).unwrap_or(1))
            }
            _ => None,
        };
        let sid = ts_version.and(params.get(3).cloned());
        Some(Self {
            password,
            ts_version,
            sid,
        })
    }
}

/// What `USER` told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub gecos: String,
    pub umodes: String,
}

/// A socket that is not a peer link.
#[derive(Debug)]
pub struct LocalSession {
    pub conn: ConnId,
    pub addr: SocketAddr,
    /// Displayed host. No reverse DNS: the textual peer address.
    pub host: String,
    pub direction: LinkDirection,
    pub tx: mpsc::UnboundedSender<Message>,
    pub state: RegistrationState,
    pub nick: Option<String>,
    pub user: Option<UserInfo>,
    pub pass: Option<PassInfo>,
    pub capab: Vec<String>,
    /// Assigned at accept time, kept for the life of the connection.
    pub stable_id: StableId,
}

impl LocalSession {
    pub fn new(
        conn: ConnId,
        addr: SocketAddr,
        direction: LinkDirection,
        tx: mpsc::UnboundedSender<Message>,
        stable_id: StableId,
    ) -> Self {
        Self {
            conn,
            addr,
            host: display_host(addr),
            direction,
            tx,
            state: RegistrationState::Unregistered,
            nick: None,
            user: None,
            pass: None,
            capab: Vec::new(),
            stable_id,
        }
    }
}

/// A host can't start with `:` on the wire, so `::1` becomes `0::1`.
fn display_host(addr: SocketAddr) -> String {
    let ip = addr.ip().to_string();
    if ip.starts_with(':') {
        format!("0{ip}")
    } else {
        ip
    }
}

/// Map the numeric `USER` mode parameter to user modes (bit 3 = +i, bit 2 = +w).
fn umodes_from_user_mode(mode: &str) -> String {
    let bits: u32 = mode.parse().unwrap_or(0);
    let mut umodes = String::from("+");
    if bits & 8 != 0 {
        umodes.push('i');
    }
    if bits & 4 != 0 {
        umodes.push('w');
    }
    umodes
}

impl ServerState {
    /// Handle a line from a socket that is not a peer link.
    pub(crate) fn handle_local(&mut self, conn: ConnId, msg: &Message, now_secs: u64) {
        let Some(registered) = self.sessions.get(&conn).map(|s| s.state.is_registered()) else {
            return;
        };
        let verb = msg.verb();
        match verb.as_str() {
            "PING" => {
                let token = msg.params.first().cloned().unwrap_or_default();
                let pong = Message::with_prefix(
                    self.name(),
                    "PONG",
                    vec![self.name().to_owned(), token],
                );
                self.send_to(conn, pong);
            }
            "PONG" | "CAP" => {}
            "QUIT" => self.local_quit(conn, msg.params.first().map(String::as_str), now_secs),
            "NICK" => match msg.params.first().filter(|n| !n.is_empty()) {
                None => self.reply(conn, "431", &["No nickname given"]),
                Some(nick) if registered => self.local_nick_change(conn, nick, now_secs),
                Some(nick) => self.local_nick(conn, nick, now_secs),
            },
            "USER" | "PASS" if registered => self.reply(conn, "462", &["You may not reregister"]),
            "USER" => self.local_user(conn, msg, now_secs),
            "PASS" => match PassInfo::parse(&msg.params) {
                Some(pass) => {
                    if let Some(session) = self.sessions.get_mut(&conn) {
                        session.pass = Some(pass);
                    }
                }
                None => self.reply(conn, "461", &["PASS", "Not enough parameters"]),
            },
            "CAPAB" => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.capab = msg
                        .params
                        .iter()
                        .flat_map(|p| p.split_whitespace())
                        .map(String::from)
                        .collect();
                }
            }
            "SERVER" if !registered => self.accept_link(conn, msg, now_secs),
            _ if !registered => self.reply(conn, "451", &["You have not registered"]),
            _ => self.reply(conn, "421", &[verb.as_str(), "Unknown command"]),
        }
    }

    /// Numeric reply to a session, addressed to its nick or `*`.
    fn reply(&self, conn: ConnId, code: &str, rest: &[&str]) {
        let target = self
            .sessions
            .get(&conn)
            .and_then(|s| s.nick.as_deref())
            .unwrap_or("*");
        self.send_to(conn, Message::numeric(self.name(), code, target, rest));
    }

    /// Checks every new local claim shares: charset, reserved list.
    fn nick_acceptable(&self, conn: ConnId, nick: &str) -> bool {
        if let Err(e) = validate_nick(nick, self.config.nicklen) {
            debug!(%conn, nick, "rejected: {e}");
            self.reply(conn, "432", &[nick, "Erroneous Nickname"]);
            return false;
        }
        if self.config.is_reserved(nick) {
            self.reply(conn, "432", &[nick, "Nickname is reserved"]);
            return false;
        }
        true
    }

    /// `NICK` before registration completes.
    fn local_nick(&mut self, conn: ConnId, nick: &str, now_secs: u64) {
        let Some(stable_id) = self.sessions.get(&conn).map(|s| s.stable_id.clone()) else {
            return;
        };
        if !self.nick_acceptable(conn, nick) {
            return;
        }

        let own = self.registry.find_by_id(&stable_id);
        match self.registry.find_by_name(nick) {
            // Our own reservation: a case change, or NICK repeated.
            Some(holder) if Some(holder) == own => {}
            // First come, first served between local connections.
            Some(_) => {
                self.reply(conn, "433", &[nick, "Nickname is already in use"]);
                return;
            }
            None if self.registry.is_nick_delayed(nick, now_secs) => {
                self.reply(conn, "437", &[nick, "Nick/channel is temporarily unavailable"]);
                return;
            }
            None => {}
        }

        let held = match own {
            Some(key) => self.registry.rename(key, nick, 0, now_secs),
            None => self
                .registry
                .insert(Identity::reservation(stable_id, nick, conn, self.name()))
                .map(|_| ()),
        };
        if let Err(e) = held {
            error!(%conn, nick, "reservation failed: {e}");
            self.reply(conn, "433", &[nick, "Nickname is already in use"]);
            return;
        }

        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        session.nick = Some(nick.to_owned());
        if session.user.is_some() {
            self.complete_registration(conn, now_secs);
        } else {
            session.state = RegistrationState::NickSet;
        }
    }

    /// `USER <user> <mode> <unused> :<gecos>`.
    fn local_user(&mut self, conn: ConnId, msg: &Message, now_secs: u64) {
        if msg.params.len() < 4 {
            self.reply(conn, "461", &["USER", "Not enough parameters"]);
            return;
        }
        let username = client_username(&msg.params[0]);
        if let Err(e) = validate_username(&username) {
            debug!(%conn, "rejected USER: {e}");
            self.reply(conn, "468", &["Your username is invalid"]);
            return;
        }
        let (gecos, _) = truncate_text(&msg.params[3], REALLEN);

        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        session.user = Some(UserInfo {
            username,
            gecos,
            umodes: umodes_from_user_mode(&msg.params[1]),
        });
        if session.nick.is_some() {
            self.complete_registration(conn, now_secs);
        } else {
            session.state = RegistrationState::UserSet;
        }
    }

    /// NICK and USER are both in: commit, welcome, introduce.
    fn complete_registration(&mut self, conn: ConnId, now_secs: u64) {
        let Some(session) = self.sessions.get(&conn) else {
            return;
        };
        let (Some(nick), Some(user)) = (session.nick.clone(), session.user.clone()) else {
            return;
        };
        let stable_id = session.stable_id.clone();
        let password_ok = match &self.config.client_password {
            Some(expected) => session.pass.as_ref().map(|p| &p.password) == Some(expected),
            None => true,
        };
        let attrs = Attributes {
            username: user.username,
            hostname: session.host.clone(),
            ip: session.addr.ip().to_string(),
            gecos: user.gecos,
            umodes: user.umodes,
        };

        // The reservation may have been overridden by a peer introduction.
        let Some(key) = self.registry.find_by_id(&stable_id) else {
            return;
        };

        if !password_ok {
            self.reply(conn, "464", &["Password incorrect"]);
            self.registry.remove(key, now_secs);
            self.evict_session(conn, "Bad Password");
            return;
        }

        if let Err(e) = self.registry.commit(key, attrs, now_secs) {
            error!(%conn, %nick, "commit failed: {e}");
            return;
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.state = RegistrationState::Registered;
        }

        self.send_welcome(conn, &nick);
        if let Some(identity) = self.registry.get(key) {
            let intro = Outbound::Introduce(Introduction::from_identity(identity));
            self.propagator.broadcast_all(&intro);
        }
        metrics::incr(metrics::LOCAL_REGISTRATIONS);
        self.publish_sizes();
        info!(%conn, %nick, id = %stable_id, "client registered");
    }

    /// `NICK` from a registered client.
    fn local_nick_change(&mut self, conn: ConnId, new_nick: &str, now_secs: u64) {
        let Some(stable_id) = self.sessions.get(&conn).map(|s| s.stable_id.clone()) else {
            return;
        };
        let Some(key) = self.registry.find_by_id(&stable_id) else {
            return;
        };
        let Some(identity) = self.registry.get(key) else {
            return;
        };
        if identity.nickname == new_nick {
            return;
        }
        let old_mask = identity.mask();
        let old_target = identity.target();
        let case_only = irc_eq(&identity.nickname, new_nick);
        let ts = if case_only { identity.claim_ts } else { now_secs };

        if case_only {
            if let Err(e) = validate_nick(new_nick, self.config.nicklen) {
                debug!(%conn, new_nick, "rejected: {e}");
                self.reply(conn, "432", &[new_nick, "Erroneous Nickname"]);
                return;
            }
        } else {
            if !self.nick_acceptable(conn, new_nick) {
                return;
            }
            if self.registry.find_by_name(new_nick).is_some() {
                self.reply(conn, "433", &[new_nick, "Nickname is already in use"]);
                return;
            }
            if self.registry.is_nick_delayed(new_nick, now_secs) {
                self.reply(conn, "437", &[new_nick, "Nick/channel is temporarily unavailable"]);
                return;
            }
        }

        if let Err(e) = self.registry.rename(key, new_nick, ts, now_secs) {
            error!(%conn, new_nick, "rename failed: {e}");
            self.reply(conn, "433", &[new_nick, "Nickname is already in use"]);
            return;
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.nick = Some(new_nick.to_owned());
        }

        self.send_to(
            conn,
            Message::with_prefix(old_mask, "NICK", vec![new_nick.to_owned()]),
        );
        self.propagator.broadcast_all(&Outbound::Rename {
            target: old_target,
            new_nick: new_nick.to_owned(),
            ts,
        });
    }

    fn local_quit(&mut self, conn: ConnId, message: Option<&str>, now_secs: u64) {
        let Some(session) = self.sessions.get(&conn) else {
            return;
        };
        let reason = match message.filter(|m| !m.is_empty()) {
            Some(m) => format!("Quit: {m}"),
            None => "Client Quit".to_owned(),
        };
        let registered = session.state.is_registered();
        match self.registry.find_by_id(&session.stable_id) {
            Some(key) if registered => self.quit_identity(key, &reason, None, now_secs),
            Some(key) => {
                self.registry.remove(key, now_secs);
            }
            None => {}
        }
        self.evict_session(conn, &reason);
    }

    /// Welcome burst (001–005) and MOTD.
    fn send_welcome(&self, conn: ConnId, nick: &str) {
        let name = self.name();
        let network = self.config.network.as_str();
        let nicklen = format!("NICKLEN={}", self.config.nicklen);
        let network_token = format!("NETWORK={network}");
        let welcome = format!("Welcome to the {network} IRC network, {nick}");
        let host = format!("Your host is {name}, running lagoon-ident");
        let burst: [(&str, Vec<&str>); 5] = [
            ("001", vec![welcome.as_str()]),
            ("002", vec![host.as_str()]),
            ("003", vec!["This server was created today"]),
            ("004", vec![name, "lagoon-ident-0.1.0", "iw", "o"]),
            (
                "005",
                vec![
                    nicklen.as_str(),
                    "CASEMAPPING=rfc1459",
                    network_token.as_str(),
                    "are supported by this server",
                ],
            ),
        ];
        for (code, rest) in burst {
            self.send_to(conn, Message::numeric(name, code, nick, &rest));
        }

        let motd_start = format!("- {name} Message of the Day -");
        self.send_to(conn, Message::numeric(name, "375", nick, &[motd_start.as_str()]));
        self.send_to(
            conn,
            Message::numeric(name, "372", nick, &["- Nicknames here are shared mesh-wide."]),
        );
        self.send_to(conn, Message::numeric(name, "376", nick, &["End of /MOTD command"]));
    }
}
