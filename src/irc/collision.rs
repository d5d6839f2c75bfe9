//! Nick collision resolution — the timestamp battle.
//!
//! Two servers that each accepted a claim on the same nickname while they
//! couldn't see each other must independently pick the same survivor. The
//! only inputs are the two claim timestamps and whether both claims look like
//! the same physical user (identical username and hostname). [`decide`] is a
//! pure function of those inputs, so every server that sees the same pair
//! reaches the same verdict without talking to anyone.
//!
//! - Different users: the earlier claim wins (first come, first served).
//! - Same user: the later claim wins; the older session is presumed to be
//!   a half-open leftover from before the split.
//! - Either timestamp zero, or both equal: nobody can be trusted to be first,
//!   so both lose and the user rejoins cleanly.
//!
//! [`plan_introduction`] and [`plan_rename`] turn a verdict into the KILLs
//! and registry edits it implies; [`ServerState`] applies them atomically.
use std::fmt;

use tracing::warn;

use super::identity::{Capabilities, ConnId, Identity, StableId, Target};
use super::metrics;
use super::propagation::{Introduction, Outbound, Scope};
use super::registry::IdentityKey;
use super::server::ServerState;

/// Client-facing reason for every collision KILL.
pub const COLLISION_REASON: &str = "Nick collision";

/// Outcome of one nick battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Unresolvable: both claims are destroyed.
    BothDie,
    /// The claim that just arrived is rejected; the holder stays.
    IncomingLoses,
    /// The current holder is destroyed; the incoming claim takes the name.
    ExistingLoses,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Self::BothDie => "both_die",
            Self::IncomingLoses => "incoming_loses",
            Self::ExistingLoses => "existing_loses",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A contested claim on a nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub ts: u64,
    pub username: String,
    pub hostname: String,
    pub stable_id: Option<StableId>,
}

impl Claim {
    pub fn of_introduction(intro: &Introduction) -> Self {
        Self {
            ts: intro.ts,
            username: intro.username.clone(),
            hostname: intro.hostname.clone(),
            stable_id: intro.stable_id.clone(),
        }
    }

    /// An existing identity re-claiming under a new name at `ts`.
    pub fn of_rename(renamer: &Identity, ts: u64) -> Self {
        Self {
            ts,
            username: renamer.username.clone(),
            hostname: renamer.hostname.clone(),
            stable_id: renamer.stable_id.clone(),
        }
    }
}

/// The decision table, on raw inputs.
pub fn verdict(existing_ts: u64, incoming_ts: u64, same_user: bool) -> Verdict {
    if existing_ts == 0 || incoming_ts == 0 || existing_ts == incoming_ts {
        Verdict::BothDie
    } else if (same_user && incoming_ts < existing_ts) || (!same_user && incoming_ts > existing_ts)
    {
        Verdict::IncomingLoses
    } else {
        Verdict::ExistingLoses
    }
}

/// Decide a battle between the current holder and an incoming claim.
pub fn decide(existing: &Identity, incoming: &Claim) -> Verdict {
    let same_user = existing.same_user_as(&incoming.username, &incoming.hostname);
    verdict(existing.claim_ts, incoming.ts, same_user)
}

/// One KILL to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub target: Target,
    pub scope: Scope,
}

/// Everything a verdict implies, before it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub evictions: Vec<Eviction>,
    /// Destroy the current holder.
    pub remove_existing: bool,
    /// Destroy the incoming side (renames only; an introduction that loses
    /// was never installed).
    pub remove_incoming: bool,
    /// Install the introduction / apply the rename.
    pub accept_incoming: bool,
}

/// Plan the outcome of an introduction (`UID`/`NICK`) arriving on `origin`
/// for a nickname `existing` already holds.
pub fn plan_introduction(existing: &Identity, incoming: &Claim, nick: &str, origin: ConnId) -> Resolution {
    let verdict = decide(existing, incoming);
    // Only the introducing link knows the incoming claim, and only by id can
    // it be told apart from whatever else holds the name over there.
    let reject_incoming = incoming.stable_id.as_ref().map(|id| Eviction {
        target: Target {
            stable_id: Some(id.clone()),
            nick: nick.to_owned(),
        },
        scope: Scope::Only(origin),
    });

    match verdict {
        Verdict::BothDie => {
            let mut evictions = vec![Eviction {
                target: existing.target(),
                scope: Scope::All,
            }];
            evictions.extend(reject_incoming);
            Resolution {
                verdict,
                evictions,
                remove_existing: true,
                remove_incoming: false,
                accept_incoming: false,
            }
        }
        Verdict::IncomingLoses => Resolution {
            verdict,
            // Legacy claims carry no id: the sender runs this same table on
            // the same pair and removes its own loser.
            evictions: reject_incoming.into_iter().collect(),
            remove_existing: false,
            remove_incoming: false,
            accept_incoming: false,
        },
        Verdict::ExistingLoses => Resolution {
            verdict,
            evictions: vec![Eviction {
                target: existing.target(),
                scope: Scope::AllExcept(origin),
            }],
            remove_existing: true,
            remove_incoming: false,
            accept_incoming: true,
        },
    }
}

/// Plan the outcome of `renamer` (already known mesh-wide under its old
/// name) claiming `new_nick` at `new_ts`, arriving on `origin`, while
/// `existing` holds it. `origin_caps` are the capabilities of that link.
pub fn plan_rename(
    existing: &Identity,
    renamer: &Identity,
    new_nick: &str,
    new_ts: u64,
    origin: ConnId,
    origin_caps: Capabilities,
) -> Resolution {
    let verdict = decide(existing, &Claim::of_rename(renamer, new_ts));

    // The rest of the mesh still knows the renamer by its old nick; the
    // origin side already knows it by the new one. A KILL by that new nick
    // alone could land on whoever wins the name over there, so the origin
    // is only told when it can address the renamer by id.
    let mut kill_renamer = vec![Eviction {
        target: renamer.target(),
        scope: Scope::AllExcept(origin),
    }];
    if renamer.stable_id.is_some() && origin_caps.stable_ids {
        kill_renamer.push(Eviction {
            target: Target {
                stable_id: renamer.stable_id.clone(),
                nick: new_nick.to_owned(),
            },
            scope: Scope::Only(origin),
        });
    }

    match verdict {
        Verdict::BothDie => {
            let mut evictions = vec![Eviction {
                target: existing.target(),
                scope: Scope::All,
            }];
            evictions.extend(kill_renamer);
            Resolution {
                verdict,
                evictions,
                remove_existing: true,
                remove_incoming: true,
                accept_incoming: false,
            }
        }
        Verdict::IncomingLoses => Resolution {
            verdict,
            evictions: kill_renamer,
            remove_existing: false,
            remove_incoming: true,
            accept_incoming: false,
        },
        Verdict::ExistingLoses => Resolution {
            verdict,
            evictions: vec![Eviction {
                target: existing.target(),
                scope: Scope::AllExcept(origin),
            }],
            remove_existing: true,
            remove_incoming: false,
            accept_incoming: true,
        },
    }
}

impl ServerState {
    /// Emit a resolution's KILLs and the operator notice.
    fn announce(&self, nick: &str, existing: &Identity, incoming_ts: u64, resolution: &Resolution) {
        warn!(
            nick,
            existing_ts = existing.claim_ts,
            incoming_ts,
            existing_user = %format!("{}@{}", existing.username, existing.hostname),
            verdict = %resolution.verdict,
            "nick collision"
        );
        metrics::record_collision(resolution.verdict.label());
        for eviction in &resolution.evictions {
            self.send_kill(&eviction.target, eviction.scope, COLLISION_REASON);
        }
    }

    /// An introduction for `intro.nick` collided with `existing_key`.
    pub(crate) fn resolve_introduction(
        &mut self,
        existing_key: IdentityKey,
        intro: Introduction,
        origin: ConnId,
        now_secs: u64,
    ) -> Option<Verdict> {
        let existing = self.registry.get(existing_key)?.clone();
        let claim = Claim::of_introduction(&intro);
        let resolution = plan_introduction(&existing, &claim, &intro.nick, origin);
        self.announce(&intro.nick, &existing, intro.ts, &resolution);

        if resolution.remove_existing {
            self.registry.mark_killed(existing_key);
            self.drop_identity(existing_key, now_secs, COLLISION_REASON);
        }
        if resolution.accept_incoming {
            self.install_remote(intro, origin);
        }
        Some(resolution.verdict)
    }

    /// `renamer_key` asked (via `origin`) for a nick `existing_key` holds.
    pub(crate) fn resolve_rename(
        &mut self,
        existing_key: IdentityKey,
        renamer_key: IdentityKey,
        new_nick: &str,
        new_ts: u64,
        origin: ConnId,
        now_secs: u64,
    ) -> Option<Verdict> {
        let existing = self.registry.get(existing_key)?.clone();
        let renamer = self.registry.get(renamer_key)?.clone();
        let origin_caps = self
            .propagator
            .get(origin)
            .map(|link| link.server.caps)
            .unwrap_or_default();
        let resolution = plan_rename(&existing, &renamer, new_nick, new_ts, origin, origin_caps);
        self.announce(new_nick, &existing, new_ts, &resolution);

        if resolution.remove_existing {
            self.registry.mark_killed(existing_key);
            self.drop_identity(existing_key, now_secs, COLLISION_REASON);
        }
        if resolution.remove_incoming {
            self.registry.mark_killed(renamer_key);
            self.drop_identity(renamer_key, now_secs, COLLISION_REASON);
        }
        if resolution.accept_incoming {
            self.apply_remote_rename(renamer_key, new_nick, new_ts, origin, now_secs);
        }
        Some(resolution.verdict)
    }

    /// Send a KILL originated by this server.
    pub(crate) fn send_kill(&self, target: &Target, scope: Scope, reason: &str) {
        let kill = Outbound::Kill {
            source: self.name().to_owned(),
            target: target.clone(),
            reason: format!("{} ({reason})", self.name()),
        };
        self.propagator.deliver(scope, &kill);
        metrics::incr(metrics::KILLS_ISSUED);
    }
}
