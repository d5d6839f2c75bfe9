//! Peer-link message handling: introductions, renames, KILL, QUIT.
//!
//! Every handler takes the link the line arrived on as `origin` and never
//! sends derived traffic back across it, except where a collision verdict
//! explicitly addresses the origin. Malformed lines are reported as
//! [`ProtocolError`] and dropped; the link stays up.
use tracing::{debug, info, warn};

use super::casemap::irc_eq;
use super::identity::{ConnId, IdentityRef, Route, StableId, Target};
use super::message::Message;
use super::metrics;
use super::propagation::{Introduction, Outbound, Scope};
use super::registry::IdentityKey;
use super::server::ServerState;
use super::validate::{truncate_text, validate_hostname, validate_nick, validate_username, ValidationError, REALLEN};

/// Client-facing reason when a peer introduction overrides a reservation.
const OVERRIDDEN: &str = "Overridden";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {command}: expected {expected} params, got {got}")]
    MalformedBurst {
        command: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("invalid hopcount {0:?}")]
    InvalidHopcount(String),
    #[error("invalid server id {0:?}")]
    InvalidServerId(String),
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("{0} is not routed via this link")]
    WrongDirection(String),
    #[error("server {0} already exists")]
    ServerExists(String),
    #[error("unknown server {0:?}")]
    UnknownServer(String),
}

impl ProtocolError {
    /// Wrong shape, as opposed to a line that parsed but refers to nothing.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedBurst { .. }
                | Self::InvalidTimestamp(_)
                | Self::InvalidHopcount(_)
                | Self::InvalidServerId(_)
        )
    }
}

pub(crate) fn parse_ts(raw: &str) -> Result<u64, ProtocolError> {
    raw.parse()
        .map_err(|_| ProtocolError::InvalidTimestamp(raw.to_owned()))
}

pub(crate) fn parse_hop(raw: &str) -> Result<u32, ProtocolError> {
    raw.parse()
        .map_err(|_| ProtocolError::InvalidHopcount(raw.to_owned()))
}

/// An introduction as it came off the wire, before validation.
#[derive(Debug)]
struct RawIntroduction<'a> {
    nick: &'a str,
    hopcount: u32,
    ts: u64,
    umodes: &'a str,
    username: &'a str,
    hostname: &'a str,
    ip: &'a str,
    stable_id: Option<&'a str>,
    server: String,
    gecos: &'a str,
}

impl ServerState {
    /// Handle a line from an established peer link.
    pub(crate) fn handle_peer(
        &mut self,
        link: ConnId,
        msg: &Message,
        now_secs: u64,
    ) -> Result<(), ProtocolError> {
        match msg.verb().as_str() {
            "UID" => self.remote_uid(link, msg, now_secs),
            "NICK" if msg.prefix.is_none() || msg.params.len() >= 8 => {
                self.remote_legacy_nick(link, msg, now_secs)
            }
            "NICK" => self.remote_rename(link, msg, now_secs),
            "KILL" => self.remote_kill(link, msg, now_secs),
            "QUIT" => self.remote_quit(link, msg, now_secs),
            "SID" => self.remote_sid(link, msg),
            "SERVER" => self.remote_server(link, msg),
            "SQUIT" => self.remote_squit(link, msg, now_secs),
            "PING" => {
                let token = msg.params.first().cloned().unwrap_or_default();
                let pong = Message::with_prefix(
                    self.name(),
                    "PONG",
                    vec![self.name().to_owned(), token],
                );
                self.send_to(link, pong);
                Ok(())
            }
            "ERROR" => {
                warn!(%link, "peer error: {}", msg.params.join(" "));
                Ok(())
            }
            "PONG" | "PASS" | "CAPAB" | "SVINFO" => Ok(()),
            other => {
                debug!(%link, "ignoring {other} from peer");
                Ok(())
            }
        }
    }

    /// `:SID UID nick hop ts umodes user host ip stable_id :gecos`.
    fn remote_uid(&mut self, link: ConnId, msg: &Message, now_secs: u64) -> Result<(), ProtocolError> {
        let p = &msg.params;
        if p.len() != 9 {
            return Err(ProtocolError::MalformedBurst {
                command: "UID",
                expected: "9",
                got: p.len(),
            });
        }
        let sid = msg
            .source()
            .map(str::to_owned)
            .unwrap_or_else(|| p[7].chars().take(3).collect());
        let raw = RawIntroduction {
            nick: &p[0],
            hopcount: parse_hop(&p[1])?,
            ts: parse_ts(&p[2])?,
            umodes: &p[3],
            username: &p[4],
            hostname: &p[5],
            ip: &p[6],
            stable_id: Some(&p[7]),
            server: self.server_name_for_sid(&sid),
            gecos: &p[8],
        };
        self.remote_introduction(link, raw, now_secs);
        Ok(())
    }

    /// `NICK nick hop ts umodes user host server :gecos`.
    fn remote_legacy_nick(
        &mut self,
        link: ConnId,
        msg: &Message,
        now_secs: u64,
    ) -> Result<(), ProtocolError> {
        let p = &msg.params;
        if p.len() != 8 {
            return Err(ProtocolError::MalformedBurst {
                command: "NICK",
                expected: "8",
                got: p.len(),
            });
        }
        let raw = RawIntroduction {
            nick: &p[0],
            hopcount: parse_hop(&p[1])?,
            ts: parse_ts(&p[2])?,
            umodes: &p[3],
            username: &p[4],
            hostname: &p[5],
            ip: "0",
            stable_id: None,
            server: p[6].clone(),
            gecos: &p[7],
        };
        self.remote_introduction(link, raw, now_secs);
        Ok(())
    }

    /// Tell the origin its introduction was refused.
    fn reject_introduction(&mut self, link: ConnId, target: Target, err: &ValidationError) {
        warn!(%link, nick = %target.nick, "rejecting introduction: {err}");
        metrics::incr(metrics::INTRODUCTIONS_REJECTED);
        self.send_kill(&target, Scope::Only(link), &format!("Bad {}", err.field()));
    }

    fn remote_introduction(&mut self, link: ConnId, raw: RawIntroduction<'_>, now_secs: u64) {
        let stable_id = match raw.stable_id.map(StableId::parse).transpose() {
            Ok(id) => id,
            Err(e) => {
                // Address the rejection by the id exactly as it was sent.
                let target = Target {
                    stable_id: None,
                    nick: raw.stable_id.unwrap_or_default().to_owned(),
                };
                self.reject_introduction(link, target, &e);
                return;
            }
        };
        let target = Target {
            stable_id: stable_id.clone(),
            nick: raw.nick.to_owned(),
        };
        let checked = validate_nick(raw.nick, self.config.nicklen)
            .and_then(|()| validate_username(raw.username))
            .and_then(|()| validate_hostname(raw.hostname));
        if let Err(e) = checked {
            self.reject_introduction(link, target, &e);
            return;
        }
        let (gecos, cut) = truncate_text(raw.gecos, REALLEN);
        if cut {
            warn!(%link, nick = raw.nick, "gecos truncated to {REALLEN} bytes");
        }

        let intro = Introduction {
            nick: raw.nick.to_owned(),
            hopcount: raw.hopcount,
            ts: raw.ts,
            umodes: raw.umodes.to_owned(),
            username: raw.username.to_owned(),
            hostname: raw.hostname.to_owned(),
            ip: raw.ip.to_owned(),
            stable_id,
            server: raw.server,
            gecos,
        };

        if let Some(id) = &intro.stable_id {
            if let Some(known) = self.registry.lookup_by_id(id) {
                if irc_eq(&known.nickname, &intro.nick) {
                    debug!(%link, nick = %intro.nick, "re-delivered introduction, ignoring");
                } else {
                    warn!(
                        %link,
                        id = %id,
                        known = %known.nickname,
                        incoming = %intro.nick,
                        "invariant violation: duplicate stable id insert"
                    );
                }
                return;
            }
        }

        let Some(holder_key) = self.registry.find_by_name(&intro.nick) else {
            self.install_remote(intro, link);
            return;
        };
        let Some(holder) = self.registry.get(holder_key) else {
            return;
        };
        if holder.is_pending_local() {
            debug!(%link, nick = %intro.nick, "peer introduction overrides pending local nick");
            self.drop_identity(holder_key, now_secs, OVERRIDDEN);
            self.install_remote(intro, link);
            return;
        }
        let legacy_repeat = holder.stable_id.is_none()
            && intro.stable_id.is_none()
            && holder.claim_ts == intro.ts
            && holder.same_user_as(&intro.username, &intro.hostname)
            && irc_eq(&holder.origin_server, &intro.server);
        if legacy_repeat {
            debug!(%link, nick = %intro.nick, "re-delivered legacy introduction, ignoring");
            return;
        }
        self.resolve_introduction(holder_key, intro, link, now_secs);
    }

    /// Resolve a message source to an identity reached via `link`.
    fn resolve_source(&self, link: ConnId, token: &str) -> Result<IdentityKey, ProtocolError> {
        let unknown = || ProtocolError::UnknownSource(token.to_owned());
        let reference = IdentityRef::parse(token).map_err(|_| unknown())?;
        let key = self.registry.find(&reference).ok_or_else(unknown)?;
        match self.registry.get(key) {
            Some(identity) if identity.route == Route::Link(link) => Ok(key),
            _ => Err(ProtocolError::WrongDirection(token.to_owned())),
        }
    }

    /// `:<uid|nick> NICK newnick :ts`.
    fn remote_rename(&mut self, link: ConnId, msg: &Message, now_secs: u64) -> Result<(), ProtocolError> {
        let (Some(new_nick), Some(raw_ts)) = (msg.params.first(), msg.params.get(1)) else {
            return Err(ProtocolError::MalformedBurst {
                command: "NICK",
                expected: "2",
                got: msg.params.len(),
            });
        };
        let ts = parse_ts(raw_ts)?;
        let source = msg.source().unwrap_or_default();
        let key = self.resolve_source(link, source)?;
        let Some(renamer) = self.registry.get(key) else {
            return Ok(());
        };
        if renamer.nickname == *new_nick {
            return Ok(());
        }

        if let Err(e) = validate_nick(new_nick, self.config.nicklen) {
            // The renamer is already known under its old name everywhere but
            // the origin; remove it mesh-wide. Nothing we admit can hold an
            // invalid name, so a bare-name KILL toward the origin can only
            // reach the renamer.
            warn!(%link, from = %renamer.nickname, to = %new_nick, "rejecting rename: {e}");
            metrics::incr(metrics::INTRODUCTIONS_REJECTED);
            let reason = format!("Bad {}", e.field());
            let old_target = renamer.target();
            let new_target = Target {
                stable_id: renamer.stable_id.clone(),
                nick: new_nick.clone(),
            };
            self.registry.mark_killed(key);
            self.send_kill(&old_target, Scope::AllExcept(link), &reason);
            self.send_kill(&new_target, Scope::Only(link), &reason);
            self.drop_identity(key, now_secs, &reason);
            return Ok(());
        }

        if irc_eq(&renamer.nickname, new_nick) {
            self.apply_remote_rename(key, new_nick, ts, link, now_secs);
            return Ok(());
        }

        match self.registry.find_by_name(new_nick) {
            None => self.apply_remote_rename(key, new_nick, ts, link, now_secs),
            Some(holder) => {
                let pending = self
                    .registry
                    .get(holder)
                    .is_some_and(|h| h.is_pending_local());
                if pending {
                    self.drop_identity(holder, now_secs, OVERRIDDEN);
                    self.apply_remote_rename(key, new_nick, ts, link, now_secs);
                } else {
                    self.resolve_rename(holder, key, new_nick, ts, link, now_secs);
                }
            }
        }
        Ok(())
    }

    /// `:<source> KILL <target> :<path>`.
    fn remote_kill(&mut self, link: ConnId, msg: &Message, now_secs: u64) -> Result<(), ProtocolError> {
        let Some(raw_target) = msg.params.first() else {
            return Err(ProtocolError::MalformedBurst {
                command: "KILL",
                expected: "2",
                got: 0,
            });
        };
        let path = msg
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| "<No reason given>".to_owned());
        let source = match msg.source() {
            Some(source) => source.to_owned(),
            None => self
                .propagator
                .get(link)
                .map(|l| l.server.name.clone())
                .unwrap_or_default(),
        };
        metrics::incr(metrics::KILLS_RECEIVED);

        let found = IdentityRef::parse(raw_target)
            .ok()
            .and_then(|r| self.registry.find(&r));
        let Some(key) = found else {
            // Already removed by the same verdict reached here independently.
            debug!(%link, target = %raw_target, "KILL for unknown target, ignoring");
            return Ok(());
        };
        let Some(victim) = self.registry.get(key) else {
            return Ok(());
        };
        let target = victim.target();
        info!(%link, %source, nick = %victim.nickname, "KILL: {path}");

        self.registry.mark_killed(key);
        self.propagator.broadcast_except(
            link,
            &Outbound::Kill {
                source,
                target,
                reason: path.clone(),
            },
        );
        self.drop_identity(key, now_secs, &format!("Killed ({path})"));
        Ok(())
    }

    /// `:<source> QUIT :reason`.
    fn remote_quit(&mut self, link: ConnId, msg: &Message, now_secs: u64) -> Result<(), ProtocolError> {
        let source = msg.source().unwrap_or_default();
        let key = self.resolve_source(link, source)?;
        let reason = msg.params.first().cloned().unwrap_or_default();
        self.quit_identity(key, &reason, Some(link), now_secs);
        Ok(())
    }
}
