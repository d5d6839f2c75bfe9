//! Server configuration, read once from the environment at startup.
//!
//! Every knob has a default; an unparsable value is logged and replaced by
//! it, never fatal.
use std::net::SocketAddr;

use tracing::warn;

use super::casemap::irc_glob;
use super::identity::ServerId;
use super::validate::DEFAULT_NICKLEN;

const DEFAULT_SERVER_NAME: &str = "ident.lagun.co";
const DEFAULT_NICK_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub sid: ServerId,
    pub description: String,
    /// `NETWORK=` token for ISUPPORT (no spaces).
    pub network: String,
    pub bind: SocketAddr,
    /// Peers we dial out to, `host:port`.
    pub peers: Vec<String>,
    pub link_password: String,
    pub client_password: Option<String>,
    pub nick_delay_secs: u64,
    pub nicklen: usize,
    /// Glob patterns (`*`, `?`) no local client may take.
    pub reserved_nicks: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_name = get("SERVER_NAME")
            .or_else(system_hostname)
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.into());

        let sid = match get("LAGOON_SID") {
            Some(raw) => ServerId::parse(raw.trim()).unwrap_or_else(|e| {
                warn!("LAGOON_SID: {e}, using default");
                ServerId::default()
            }),
            None => ServerId::default(),
        };

        let bind = parsed(&get, "LAGOON_IRC_BIND", || {
            SocketAddr::from(([127, 0, 0, 1], 6667))
        });

        Self {
            network: network_tag(&server_name),
            description: format!("Lagoon identity server ({server_name})"),
            server_name,
            sid,
            bind,
            peers: list(get("LAGOON_PEERS")),
            link_password: get("LAGOON_LINK_PASSWORD").unwrap_or_default(),
            client_password: get("LAGOON_CLIENT_PASSWORD"),
            nick_delay_secs: parsed(&get, "LAGOON_NICK_DELAY_SECS", || DEFAULT_NICK_DELAY_SECS),
            nicklen: parsed(&get, "LAGOON_NICKLEN", || DEFAULT_NICKLEN),
            reserved_nicks: list(get("LAGOON_RESERVED_NICKS")),
        }
    }

    /// Is `nick` covered by a reserved-name pattern?
    pub fn is_reserved(&self, nick: &str) -> bool {
        self.reserved_nicks.iter().any(|pattern| irc_glob(pattern, nick))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Server identity derived from the system hostname, when it is dotted.
fn system_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| h.contains('.'))
}

fn network_tag(server_name: &str) -> String {
    match server_name.split('.').next() {
        Some("lon") => "Lagun-London".into(),
        Some("per") => "Lagun-Perth".into(),
        Some("nyc") => "Lagun-NYC".into(),
        _ => "Lagun".into(),
    }
}

fn parsed<T, F>(get: &F, key: &str, default: impl FnOnce() -> T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("{key}={raw:?} is invalid ({e}), using default");
            default()
        }),
        None => default(),
    }
}

fn list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[("SERVER_NAME", "lon.lagun.co")]);
        assert_eq!(cfg.server_name, "lon.lagun.co");
        assert_eq!(cfg.sid, ServerId::default());
        assert_eq!(cfg.bind.to_string(), "127.0.0.1:6667");
        assert_eq!(cfg.nick_delay_secs, 60);
        assert_eq!(cfg.nicklen, DEFAULT_NICKLEN);
        assert!(cfg.peers.is_empty());
        assert!(cfg.client_password.is_none());
        assert_eq!(cfg.network, "Lagun-London");
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("SERVER_NAME", "per.lagun.co"),
            ("LAGOON_SID", "1PE"),
            ("LAGOON_IRC_BIND", "0.0.0.0:7000"),
            ("LAGOON_PEERS", "lon.lagun.co:7000, nyc.lagun.co:7000"),
            ("LAGOON_LINK_PASSWORD", "hunter2"),
            ("LAGOON_CLIENT_PASSWORD", "letmein"),
            ("LAGOON_NICK_DELAY_SECS", "0"),
            ("LAGOON_NICKLEN", "9"),
            ("LAGOON_RESERVED_NICKS", "NickServ,oper*"),
        ]);
        assert_eq!(cfg.sid.as_str(), "1PE");
        assert_eq!(cfg.bind.port(), 7000);
        assert_eq!(cfg.peers, vec!["lon.lagun.co:7000", "nyc.lagun.co:7000"]);
        assert_eq!(cfg.link_password, "hunter2");
        assert_eq!(cfg.client_password.as_deref(), Some("letmein"));
        assert_eq!(cfg.nick_delay_secs, 0);
        assert_eq!(cfg.nicklen, 9);
        assert!(cfg.is_reserved("nickserv"));
        assert!(cfg.is_reserved("Operator"));
        assert!(!cfg.is_reserved("alice"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("SERVER_NAME", "lon.lagun.co"),
            ("LAGOON_SID", "bad"),
            ("LAGOON_IRC_BIND", "not an addr"),
            ("LAGOON_NICK_DELAY_SECS", "-5"),
            ("LAGOON_NICKLEN", "many"),
        ]);
        assert_eq!(cfg.sid, ServerId::default());
        assert_eq!(cfg.bind.to_string(), "127.0.0.1:6667");
        assert_eq!(cfg.nick_delay_secs, 60);
        assert_eq!(cfg.nicklen, DEFAULT_NICKLEN);
    }
}
