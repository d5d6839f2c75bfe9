//! Nick-delay index — short quarantine of freshly vacated nicknames.
//!
//! Written by the registry whenever a registered identity gives up a name
//! (rename, quit, KILL, collision loss, netsplit). Local registration consults
//! it so a name can't be re-grabbed the instant it frees up, which shrinks the
//! window in which a split-side reconnect collides with a new local owner.
//! Peer introductions ignore it: the mesh's view always wins.
//!
//! Timestamps are passed in by the caller (epoch secs), never read here.

use std::collections::HashMap;

use super::casemap::irc_lower;

#[derive(Debug, Clone)]
pub struct NickDelay {
    /// Folded name → expiry (epoch secs).
    entries: HashMap<String, u64>,
    /// Quarantine length in seconds. Zero disables the index entirely.
    window_secs: u64,
}

impl NickDelay {
    pub fn new(window_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            window_secs,
        }
    }

    /// Quarantine `name` starting at `now_secs`. Re-noting extends the expiry.
    pub fn note(&mut self, name: &str, now_secs: u64) {
        if self.window_secs == 0 {
            return;
        }
        self.entries
            .insert(irc_lower(name), now_secs.saturating_add(self.window_secs));
    }

    /// Is `name` still quarantined at `now_secs`?
    pub fn is_delayed(&self, name: &str, now_secs: u64) -> bool {
        self.entries
            .get(&irc_lower(name))
            .is_some_and(|&expiry| now_secs < expiry)
    }

    /// Lift the quarantine on `name` early (e.g. the name was just re-bound).
    pub fn clear(&mut self, name: &str) {
        self.entries.remove(&irc_lower(name));
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn expire(&mut self, now_secs: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, &mut expiry| now_secs < expiry);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
