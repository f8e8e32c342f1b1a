//! Data model shared by the tracker (C2), classifier (C3), roster cache
//! (C4) and query API (C6): `Event`, `IpObservation`, `UserState`,
//! `RosterEntry`, `BanlistRecord` and the derived `Stage` from spec.md §3.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

/// Result of parsing and tagging one access-log line (spec.md §3).
/// `email` is the user identity; `observed_at` is the server's ingest wall
/// clock, never the agent-reported timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub node_id: String,
    pub observed_at: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub email: String,
    pub protocol: String,
    pub destination: String,
    pub action: String,
}

/// One distinct IP observed for a user, keyed by the (possibly
/// subnet-canonicalized) counting IP.
#[derive(Debug, Clone, PartialEq)]
pub struct IpObservation {
    pub ip: IpAddr,
    pub last_seen: DateTime<Utc>,
    pub node_id: String,
}

/// One entry in a user's bounded `recent_requests` ring, retaining the
/// original (pre-canonicalization) source IP for UI detail views.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentRequest {
    pub observed_at: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub node_id: String,
    pub protocol: String,
    pub destination: String,
    pub action: String,
}

/// Derived classification stage (spec.md §4.3 step 5). Transitions are
/// monotonic within one continuous run: clean -> over_limit -> violator ->
/// banlisted; any full exit resets to clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clean,
    OverLimit,
    Violator,
    Banlisted,
}

/// Per-user tracked state, keyed by email in `UserTracker`.
#[derive(Debug, Clone, Default)]
pub struct UserState {
    pub observations: HashMap<IpAddr, IpObservation>,
    pub recent_requests: VecDeque<RecentRequest>,
    pub trigger_times: Vec<DateTime<Utc>>,
    pub violator_since: Option<DateTime<Utc>>,
    pub banlisted_since: Option<DateTime<Utc>>,
    /// Consecutive ticks observed with `C <= L`, used by the
    /// `CLEAR_HYSTERESIS_TICKS` knob (spec.md §9 Open Question).
    pub sub_limit_streak: u32,
}

impl UserState {
    /// Derive `stage` strictly from fields: banlisted > violator >
    /// over_limit (an unresolved trigger run) > clean (spec.md §4.3 step 5).
    pub fn stage(&self) -> Stage {
        if self.banlisted_since.is_some() {
            Stage::Banlisted
        } else if self.violator_since.is_some() {
            Stage::Violator
        } else if !self.trigger_times.is_empty() {
            Stage::OverLimit
        } else {
            Stage::Clean
        }
    }

    /// A user with no observations left and stage clean is eligible for
    /// eviction (spec.md §3 Lifecycle).
    pub fn is_evictable(&self) -> bool {
        self.observations.is_empty() && self.stage() == Stage::Clean
    }

    pub fn push_recent_request(&mut self, request: RecentRequest, capacity: usize) {
        self.recent_requests.push_back(request);
        while self.recent_requests.len() > capacity {
            self.recent_requests.pop_front();
        }
    }
}

/// Panel roster entry (spec.md §3). `device_limit == 0` means unlimited.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub email: String,
    pub device_limit: u32,
    pub telegram_id: Option<String>,
    pub description: Option<String>,
    pub whitelisted: bool,
    /// Set when this entry was missing from the most recent successful
    /// panel pull; cleared on the next pull that reports it again, and the
    /// entry is dropped entirely if it stays missing for two pulls running.
    pub stale: bool,
}
