//! C2 — User tracker.
//!
//! Owns the per-email `UserState` map behind a single reader-writer lock
//! (spec.md §5, §9): reads (query API, classifier scan) take shared,
//! writes (ingest, classifier updates, prune) take exclusive. A secondary
//! inverted index (`ip -> {emails}`) is maintained incrementally inside
//! the same write critical section as `Record`, per §9's explicit
//! preference for an index over a derived-on-read linear scan.

use crate::model::{Event, IpObservation, RecentRequest, Stage, UserState};
use chrono::{DateTime, Utc};
use metrics::gauge;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Counts of entries removed by a `Prune` pass, surfaced as metrics gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub users_evicted: usize,
    pub observations_evicted: usize,
}

pub struct UserTracker {
    /// Exposed directly (mirrors the teacher's `DynamicRuleState` pattern
    /// in events.rs) so the classifier (C3) can take one write lock for an
    /// entire tick instead of re-entering per user.
    pub users: Arc<RwLock<HashMap<String, UserState>>>,
    ip_index: Arc<RwLock<HashMap<IpAddr, HashSet<String>>>>,
    recent_requests_capacity: usize,
}

impl UserTracker {
    pub fn new(recent_requests_capacity: usize) -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            ip_index: Arc::new(RwLock::new(HashMap::new())),
            recent_requests_capacity,
        }
    }

    /// Upsert the observation for `event`, keyed by `counting_ip` (the
    /// subnet-canonicalized IP when `SUBNET_GROUPING` is enabled; the
    /// original IP is always retained in `recent_requests`).
    pub async fn record(&self, event: &Event, counting_ip: IpAddr) {
        let mut users = self.users.write().await;
        let state = users.entry(event.email.clone()).or_default();

        let is_new_ip = !state.observations.contains_key(&counting_ip);
        state.observations.insert(
            counting_ip,
            IpObservation {
                ip: counting_ip,
                last_seen: event.observed_at,
                node_id: event.node_id.clone(),
            },
        );
        state.push_recent_request(
            RecentRequest {
                observed_at: event.observed_at,
                source_ip: event.source_ip,
                node_id: event.node_id.clone(),
                protocol: event.protocol.clone(),
                destination: event.destination.clone(),
                action: event.action.clone(),
            },
            self.recent_requests_capacity,
        );
        drop(users);

        if is_new_ip {
            let mut ip_index = self.ip_index.write().await;
            ip_index
                .entry(counting_ip)
                .or_default()
                .insert(event.email.clone());
        }
    }

    /// Distinct IPs observed for `email` within `window` of `now`.
    pub async fn recent_ips(&self, email: &str, window: Duration, now: DateTime<Utc>) -> HashSet<IpAddr> {
        let users = self.users.read().await;
        match users.get(email) {
            Some(state) => recent_ip_set(state, window, now),
            None => HashSet::new(),
        }
    }

    /// IPs currently used by more than one email within the retention
    /// window (the index is pruned alongside observations, so any entry
    /// present here is still live).
    pub async fn shared_ips(&self) -> HashMap<IpAddr, Vec<String>> {
        let ip_index = self.ip_index.read().await;
        ip_index
            .iter()
            .filter(|(_, emails)| emails.len() > 1)
            .map(|(ip, emails)| (*ip, emails.iter().cloned().collect()))
            .collect()
    }

    /// Remove observations older than `retention` and drop `UserState`
    /// entries that are empty and clean. Never removes a `violator` or
    /// `banlisted` user even with zero observations (spec.md §3 Lifecycle).
    pub async fn prune(&self, now: DateTime<Utc>, retention: Duration) -> PruneReport {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let cutoff = now - retention;

        let mut users = self.users.write().await;
        let mut ip_index = self.ip_index.write().await;

        let mut observations_evicted = 0usize;
        let mut evicted_users = Vec::new();

        for (email, state) in users.iter_mut() {
            let stale_ips: Vec<IpAddr> = state
                .observations
                .iter()
                .filter(|(_, obs)| obs.last_seen < cutoff)
                .map(|(ip, _)| *ip)
                .collect();

            for ip in &stale_ips {
                state.observations.remove(ip);
                if let Some(emails) = ip_index.get_mut(ip) {
                    emails.remove(email);
                    if emails.is_empty() {
                        ip_index.remove(ip);
                    }
                }
            }
            observations_evicted += stale_ips.len();

            if state.is_evictable() {
                evicted_users.push(email.clone());
            }
        }

        for email in &evicted_users {
            users.remove(email);
        }

        let report = PruneReport {
            users_evicted: evicted_users.len(),
            observations_evicted,
        };

        gauge!("shareguard_users_tracked", users.len() as f64);
        gauge!("shareguard_shared_ip_keys", ip_index.len() as f64);
        if report.users_evicted > 0 || report.observations_evicted > 0 {
            debug!(
                users_evicted = report.users_evicted,
                observations_evicted = report.observations_evicted,
                "tracker prune completed"
            );
        }
        report
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn violator_count(&self) -> usize {
        self.users
            .read()
            .await
            .values()
            .filter(|s| matches!(s.stage(), Stage::Violator | Stage::Banlisted))
            .count()
    }
}

/// Window-filtered IP set, shared by the tracker's `recent_ips` and the
/// classifier's per-tick scan (which already holds the write lock and
/// cannot re-enter `recent_ips`).
pub fn recent_ip_set(state: &UserState, window: Duration, now: DateTime<Utc>) -> HashSet<IpAddr> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    state
        .observations
        .values()
        .filter(|obs| obs.last_seen <= now && now - obs.last_seen <= window)
        .map(|obs| obs.ip)
        .collect()
}

pub fn recent_ip_count(state: &UserState, window: Duration, now: DateTime<Utc>) -> usize {
    recent_ip_set(state, window, now).len()
}
