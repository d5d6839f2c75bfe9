// Copyright (c) 2026 Lagun Project. All rights reserved.
// Released under AGPL-3.0-or-later license.

//! Metric names for the identity core.
//!
//! All metric name constants live here. Call sites use these constants rather
//! than raw strings to prevent typos and keep renaming centralized. Recording
//! goes through the `metrics` facade; with no exporter installed every call is
//! a no-op, so the core never depends on one being present.

use metrics::{counter, gauge};

// ---------------------------------------------------------------------------
// Collision resolution
// ---------------------------------------------------------------------------

/// Nick collisions resolved, labelled by `verdict` (counter).
pub const COLLISIONS: &str = "lagoon_ident_collisions_total";
/// KILL messages originated by this server (counter).
pub const KILLS_ISSUED: &str = "lagoon_ident_kills_issued_total";
/// KILL messages received from peers (counter).
pub const KILLS_RECEIVED: &str = "lagoon_ident_kills_received_total";

// ---------------------------------------------------------------------------
// Introductions & registration
// ---------------------------------------------------------------------------

/// Remote identities installed from NICK/UID (counter).
pub const INTRODUCTIONS: &str = "lagoon_ident_introductions_total";
/// Peer introductions rejected for bad charset or malformed ids (counter).
pub const INTRODUCTIONS_REJECTED: &str = "lagoon_ident_introductions_rejected_total";
/// Peer lines dropped for a wrong parameter count or bad timestamp (counter).
pub const MALFORMED_BURST: &str = "lagoon_ident_malformed_burst_total";
/// Local clients that completed NICK/USER (counter).
pub const LOCAL_REGISTRATIONS: &str = "lagoon_ident_local_registrations_total";
/// Live identities in the registry (gauge).
pub const IDENTITIES: &str = "lagoon_ident_identities";

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// Lines handed to peer links (counter).
pub const LINK_MSGS_SENT: &str = "lagoon_ident_link_messages_sent_total";
/// Established peer links (gauge).
pub const LINKS_ACTIVE: &str = "lagoon_ident_links_active";
/// Links lost (netsplits) (counter).
pub const NETSPLITS: &str = "lagoon_ident_netsplits_total";

/// Count one collision under its verdict label.
pub fn record_collision(verdict: &'static str) {
    counter!(COLLISIONS, "verdict" => verdict).increment(1);
}

/// Bump a plain counter by one.
pub fn incr(name: &'static str) {
    counter!(name).increment(1);
}

/// Publish current registry and link sizes.
pub fn set_sizes(identities: usize, links: usize) {
    gauge!(IDENTITIES).set(identities as f64);
    gauge!(LINKS_ACTIVE).set(links as f64);
}
